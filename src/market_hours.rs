use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, Offset, Utc, Weekday};
use std::sync::Mutex;

use crate::config::SessionSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Entries allowed
    Open,
    /// Last minutes before close: exits only, positions get flattened
    FlattenOnly,
    Closed,
}

/// Exchange trading window evaluated in exchange-local time.
#[derive(Debug, Clone)]
pub struct MarketHours {
    open: NaiveTime,
    close: NaiveTime,
    flatten_from: NaiveTime,
    offset: FixedOffset,
}

impl MarketHours {
    pub fn new(settings: &SessionSettings) -> Self {
        let offset = FixedOffset::east_opt(settings.utc_offset_minutes * 60)
            .unwrap_or_else(|| Utc.fix());
        let flatten_from =
            settings.close - Duration::minutes(i64::from(settings.flatten_minutes_before_close));

        Self {
            open: settings.open,
            close: settings.close,
            flatten_from: flatten_from.max(settings.open),
            offset,
        }
    }

    pub fn phase(&self, now: DateTime<Utc>) -> SessionPhase {
        let local = now.with_timezone(&self.offset);
        if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return SessionPhase::Closed;
        }

        let t = local.time();
        if t < self.open || t >= self.close {
            SessionPhase::Closed
        } else if t >= self.flatten_from {
            SessionPhase::FlattenOnly
        } else {
            SessionPhase::Open
        }
    }

    /// Exchange-local calendar date, the boundary for daily limits.
    pub fn trading_day(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.offset).date_naive()
    }

    /// Exchange-local midnight of the trading day containing `now`.
    pub fn day_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.trading_day(now)
            .and_hms_opt(0, 0, 0)
            .and_then(|midnight| midnight.and_local_timezone(self.offset).single())
            .map(|start| start.with_timezone(&Utc))
            .unwrap_or(now)
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }
}

/// Source of "now" for session decisions
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to (replays, tests)
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut guard) = self.now.lock() {
            *guard += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn create_test_hours() -> MarketHours {
        MarketHours::new(&SessionSettings::default())
    }

    // 2024-01-02 was a Tuesday; IST = UTC+05:30
    fn ist(h: u32, m: u32) -> DateTime<Utc> {
        FixedOffset::east_opt(330 * 60)
            .unwrap()
            .with_ymd_and_hms(2024, 1, 2, h, m, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_phases_through_the_day() {
        let hours = create_test_hours();
        assert_eq!(hours.phase(ist(9, 0)), SessionPhase::Closed);
        assert_eq!(hours.phase(ist(9, 15)), SessionPhase::Open);
        assert_eq!(hours.phase(ist(15, 14)), SessionPhase::Open);
        assert_eq!(hours.phase(ist(15, 15)), SessionPhase::FlattenOnly);
        assert_eq!(hours.phase(ist(15, 29)), SessionPhase::FlattenOnly);
        assert_eq!(hours.phase(ist(15, 30)), SessionPhase::Closed);
    }

    #[test]
    fn test_day_start_is_local_midnight() {
        let hours = create_test_hours();
        let start = hours.day_start(ist(10, 30));
        assert_eq!(start, ist(0, 0));
        // 00:10 IST is still the previous evening in UTC
        assert_eq!(hours.day_start(ist(0, 10)), ist(0, 0));
    }

    #[test]
    fn test_weekend_closed() {
        let hours = create_test_hours();
        let saturday = ist(11, 0) + Duration::days(4);
        assert_eq!(hours.phase(saturday), SessionPhase::Closed);
    }

    #[test]
    fn test_trading_day_uses_exchange_date() {
        let hours = create_test_hours();
        // 20:00 UTC on the 1st is already the 2nd in IST
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 20, 0, 0).unwrap();
        assert_eq!(hours.trading_day(now), NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(ist(10, 0));
        clock.advance(Duration::minutes(5));
        assert_eq!(clock.now(), ist(10, 5));
        clock.set(ist(9, 0));
        assert_eq!(clock.now(), ist(9, 0));
    }
}
