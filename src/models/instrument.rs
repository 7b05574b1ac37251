use chrono::{Datelike, Duration, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OptionRight {
    Call,
    Put,
}

impl OptionRight {
    pub fn code(&self) -> &'static str {
        match self {
            OptionRight::Call => "CE",
            OptionRight::Put => "PE",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum InstrumentKind {
    Equity,
    Option {
        underlying: String,
        strike: u32,
        expiry: NaiveDate,
        right: OptionRight,
    },
}

/// A tradable contract: the shared fields plus what kind of contract it is.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Instrument {
    pub symbol: String,
    pub lot_size: u32,
    pub kind: InstrumentKind,
}

impl Instrument {
    pub fn equity(symbol: impl Into<String>, lot_size: u32) -> Self {
        Self {
            symbol: symbol.into(),
            lot_size,
            kind: InstrumentKind::Equity,
        }
    }

    pub fn option(
        underlying: &str,
        strike: u32,
        expiry: NaiveDate,
        right: OptionRight,
        lot_size: u32,
    ) -> Self {
        Self {
            symbol: option_symbol(underlying, expiry, strike, right),
            lot_size,
            kind: InstrumentKind::Option {
                underlying: underlying.to_uppercase(),
                strike,
                expiry,
                right,
            },
        }
    }

    pub fn is_option(&self) -> bool {
        matches!(self.kind, InstrumentKind::Option { .. })
    }

    /// Symbol whose candles drive this contract's signals.
    pub fn underlying(&self) -> &str {
        match &self.kind {
            InstrumentKind::Equity => &self.symbol,
            InstrumentKind::Option { underlying, .. } => underlying,
        }
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.symbol)
    }
}

/// Nearest strike on the chain's grid.
pub fn atm_strike(spot: f64, strike_interval: u32) -> u32 {
    if strike_interval == 0 || !spot.is_finite() || spot <= 0.0 {
        return 0;
    }
    let interval = f64::from(strike_interval);
    ((spot / interval).round() * interval) as u32
}

/// First `weekday` on or after `today`.
pub fn weekly_expiry(today: NaiveDate, weekday: Weekday) -> NaiveDate {
    let ahead = (7 + weekday.num_days_from_monday() - today.weekday().num_days_from_monday()) % 7;
    today + Duration::days(i64::from(ahead))
}

/// Exchange symbol, e.g. `NIFTY27JUL2319800CE`.
pub fn option_symbol(underlying: &str, expiry: NaiveDate, strike: u32, right: OptionRight) -> String {
    format!(
        "{}{}{}{}",
        underlying.to_uppercase(),
        expiry.format("%d%b%y").to_string().to_uppercase(),
        strike,
        right.code()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atm_strike_rounds_to_grid() {
        assert_eq!(atm_strike(19_812.0, 50), 19_800);
        assert_eq!(atm_strike(19_826.0, 50), 19_850);
        assert_eq!(atm_strike(44_130.0, 100), 44_100);
        assert_eq!(atm_strike(0.0, 50), 0);
    }

    #[test]
    fn test_weekly_expiry_same_day() {
        // 2023-07-27 was a Thursday
        let thursday = NaiveDate::from_ymd_opt(2023, 7, 27).unwrap();
        assert_eq!(weekly_expiry(thursday, Weekday::Thu), thursday);
    }

    #[test]
    fn test_weekly_expiry_rolls_forward() {
        let friday = NaiveDate::from_ymd_opt(2023, 7, 28).unwrap();
        let next = NaiveDate::from_ymd_opt(2023, 8, 3).unwrap();
        assert_eq!(weekly_expiry(friday, Weekday::Thu), next);

        let monday = NaiveDate::from_ymd_opt(2023, 7, 24).unwrap();
        let tuesday = NaiveDate::from_ymd_opt(2023, 7, 25).unwrap();
        assert_eq!(weekly_expiry(monday, Weekday::Tue), tuesday);
    }

    #[test]
    fn test_option_symbol_format() {
        let expiry = NaiveDate::from_ymd_opt(2023, 7, 27).unwrap();
        assert_eq!(
            option_symbol("nifty", expiry, 19_800, OptionRight::Call),
            "NIFTY27JUL2319800CE"
        );
        assert_eq!(
            option_symbol("BANKNIFTY", expiry, 44_100, OptionRight::Put),
            "BANKNIFTY27JUL2344100PE"
        );
    }

    #[test]
    fn test_option_instrument_underlying() {
        let expiry = NaiveDate::from_ymd_opt(2023, 7, 27).unwrap();
        let opt = Instrument::option("NIFTY", 19_800, expiry, OptionRight::Call, 50);
        assert!(opt.is_option());
        assert_eq!(opt.underlying(), "NIFTY");
        assert_eq!(opt.symbol, "NIFTY27JUL2319800CE");

        let eq = Instrument::equity("RELIANCE", 1);
        assert!(!eq.is_option());
        assert_eq!(eq.underlying(), "RELIANCE");
    }
}
