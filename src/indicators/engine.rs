use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use super::atr::WilderAtr;
use super::moving_average::Ema;
use super::supertrend::{SuperTrend, TrendDirection};
use crate::config::IndicatorSettings;
use crate::feed::ClosedCandle;

/// Indicator values as of one closed candle. `None` means insufficient history.
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorSnapshot {
    pub instrument: String,
    pub candle_index: u64,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub prev_high: Option<f64>,
    pub prev_low: Option<f64>,
    pub ema_short: Option<f64>,
    pub ema_long: Option<f64>,
    pub atr: Option<f64>,
    pub supertrend: Option<f64>,
    pub supertrend_direction: Option<TrendDirection>,
    /// Rate of change over the momentum period, in percent
    pub momentum: Option<f64>,
    /// Mean volume of the candles before this one
    pub avg_volume: Option<f64>,
}

impl IndicatorSnapshot {
    /// Every indicator has left warm-up.
    pub fn is_ready(&self) -> bool {
        self.prev_high.is_some()
            && self.prev_low.is_some()
            && self.ema_short.is_some()
            && self.ema_long.is_some()
            && self.atr.is_some()
            && self.supertrend.is_some()
            && self.supertrend_direction.is_some()
            && self.momentum.is_some()
            && self.avg_volume.is_some()
    }
}

/// Rate of change against the close `period` candles back
#[derive(Debug, Clone)]
struct Momentum {
    period: usize,
    closes: VecDeque<f64>,
}

impl Momentum {
    fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            closes: VecDeque::with_capacity(period + 1),
        }
    }

    fn update(&mut self, close: f64) -> Option<f64> {
        self.closes.push_back(close);
        if self.closes.len() > self.period + 1 {
            self.closes.pop_front();
        }
        if self.closes.len() < self.period + 1 {
            return None;
        }
        let base = *self.closes.front()?;
        if base == 0.0 {
            return None;
        }
        Some((close - base) / base * 100.0)
    }
}

/// Rolling mean of the previous `period` volumes (current candle excluded)
#[derive(Debug, Clone)]
struct AverageVolume {
    period: usize,
    window: VecDeque<f64>,
    sum: f64,
}

impl AverageVolume {
    fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            window: VecDeque::with_capacity(period),
            sum: 0.0,
        }
    }

    fn update(&mut self, volume: f64) -> Option<f64> {
        let avg = (self.window.len() == self.period).then(|| self.sum / self.period as f64);

        self.window.push_back(volume);
        self.sum += volume;
        if self.window.len() > self.period {
            if let Some(old) = self.window.pop_front() {
                self.sum -= old;
            }
        }
        avg
    }
}

#[derive(Debug, Clone)]
struct InstrumentState {
    ema_short: Ema,
    ema_long: Ema,
    atr: WilderAtr,
    supertrend: SuperTrend,
    momentum: Momentum,
    volume: AverageVolume,
    last_index: u64,
    prev_range: Option<(f64, f64)>,
    latest: Option<Arc<IndicatorSnapshot>>,
}

impl InstrumentState {
    fn new(settings: &IndicatorSettings) -> Self {
        Self {
            ema_short: Ema::new(settings.ema_short),
            ema_long: Ema::new(settings.ema_long),
            atr: WilderAtr::new(settings.atr_period),
            supertrend: SuperTrend::new(settings.supertrend_period, settings.supertrend_multiplier),
            momentum: Momentum::new(settings.momentum_period),
            volume: AverageVolume::new(settings.volume_period),
            last_index: 0,
            prev_range: None,
            latest: None,
        }
    }
}

/// Per-instrument rolling indicator state, updated once per closed candle.
pub struct IndicatorEngine {
    settings: IndicatorSettings,
    states: HashMap<String, InstrumentState>,
}

impl IndicatorEngine {
    pub fn new(settings: IndicatorSettings) -> Self {
        Self {
            settings,
            states: HashMap::new(),
        }
    }

    /// Advance the instrument's indicators by one candle.
    ///
    /// Candles must arrive in index order; a repeated or older index returns
    /// the snapshot already computed without touching state.
    pub fn on_candle(&mut self, closed: &ClosedCandle) -> Arc<IndicatorSnapshot> {
        let candle = &closed.candle;
        let state = self
            .states
            .entry(candle.instrument.clone())
            .or_insert_with(|| InstrumentState::new(&self.settings));

        if closed.index <= state.last_index {
            if let Some(latest) = &state.latest {
                tracing::debug!(
                    instrument = %candle.instrument,
                    index = closed.index,
                    "Ignoring candle already folded into indicators"
                );
                return latest.clone();
            }
        }

        let ema_short = state.ema_short.update(candle.close);
        let ema_long = state.ema_long.update(candle.close);
        let atr = state.atr.update(candle);
        let supertrend = state.supertrend.update(candle);
        let momentum = state.momentum.update(candle.close);
        let avg_volume = state.volume.update(candle.volume);
        let prev_range = state.prev_range.replace((candle.high, candle.low));

        let snapshot = Arc::new(IndicatorSnapshot {
            instrument: candle.instrument.clone(),
            candle_index: closed.index,
            timestamp: candle.timestamp,
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            volume: candle.volume,
            prev_high: prev_range.map(|(h, _)| h),
            prev_low: prev_range.map(|(_, l)| l),
            ema_short,
            ema_long,
            atr,
            supertrend: supertrend.map(|(line, _)| line),
            supertrend_direction: supertrend.map(|(_, d)| d),
            momentum,
            avg_volume,
        });

        state.last_index = closed.index;
        state.latest = Some(snapshot.clone());
        snapshot
    }

    pub fn latest(&self, instrument: &str) -> Option<Arc<IndicatorSnapshot>> {
        self.states.get(instrument).and_then(|s| s.latest.clone())
    }

    pub fn settings(&self) -> &IndicatorSettings {
        &self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::atr::calculate_atr;
    use crate::indicators::moving_average::calculate_ema;
    use crate::models::Candle;
    use chrono::{Duration, TimeZone};

    fn create_test_settings() -> IndicatorSettings {
        IndicatorSettings {
            ema_short: 3,
            ema_long: 9,
            atr_period: 5,
            supertrend_period: 5,
            supertrend_multiplier: 2.0,
            momentum_period: 3,
            volume_period: 5,
        }
    }

    fn create_test_candles(n: usize) -> Vec<ClosedCandle> {
        let start = Utc.with_ymd_and_hms(2024, 1, 2, 4, 0, 0).unwrap();
        (0..n)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.8).sin() * 2.0 + i as f64 * 0.3;
                ClosedCandle {
                    index: i as u64 + 1,
                    candle: Candle {
                        instrument: "NIFTY".to_string(),
                        timestamp: start + Duration::minutes(i as i64),
                        open: base - 0.2,
                        high: base + 0.8,
                        low: base - 0.6,
                        close: base + 0.4,
                        volume: 1000.0 + (i * 37 % 200) as f64,
                        synthetic: false,
                    },
                }
            })
            .collect()
    }

    #[test]
    fn test_each_indicator_defined_after_its_lookback() {
        let mut engine = IndicatorEngine::new(create_test_settings());
        let candles = create_test_candles(12);

        for closed in &candles {
            let snap = engine.on_candle(closed);
            let n = closed.index;
            assert_eq!(snap.ema_short.is_some(), n >= 3, "ema_short at {n}");
            assert_eq!(snap.ema_long.is_some(), n >= 9, "ema_long at {n}");
            assert_eq!(snap.atr.is_some(), n >= 5, "atr at {n}");
            assert_eq!(snap.supertrend.is_some(), n >= 5, "supertrend at {n}");
            assert_eq!(snap.momentum.is_some(), n >= 4, "momentum at {n}");
            assert_eq!(snap.avg_volume.is_some(), n >= 6, "avg_volume at {n}");
            assert_eq!(snap.is_ready(), n >= 9, "ready at {n}");
        }
    }

    #[test]
    fn test_values_match_closed_form() {
        let settings = create_test_settings();
        let mut engine = IndicatorEngine::new(settings.clone());
        let candles = create_test_candles(40);
        let mut snap = None;
        for closed in &candles {
            snap = Some(engine.on_candle(closed));
        }
        let snap = snap.unwrap();

        let series: Vec<Candle> = candles.iter().map(|c| c.candle.clone()).collect();
        let closes: Vec<f64> = series.iter().map(|c| c.close).collect();

        assert!((snap.ema_short.unwrap() - calculate_ema(&closes, 3).unwrap()).abs() < 1e-9);
        assert!((snap.ema_long.unwrap() - calculate_ema(&closes, 9).unwrap()).abs() < 1e-9);
        assert!((snap.atr.unwrap() - calculate_atr(&series, 5).unwrap()).abs() < 1e-9);

        let n = closes.len();
        let roc = (closes[n - 1] - closes[n - 4]) / closes[n - 4] * 100.0;
        assert!((snap.momentum.unwrap() - roc).abs() < 1e-9);

        let prev_volumes: f64 = series[n - 6..n - 1].iter().map(|c| c.volume).sum();
        assert!((snap.avg_volume.unwrap() - prev_volumes / 5.0).abs() < 1e-9);
        assert_eq!(snap.prev_high, Some(series[n - 2].high));
    }

    #[test]
    fn test_replayed_candle_does_not_advance_state() {
        let mut engine = IndicatorEngine::new(create_test_settings());
        let candles = create_test_candles(10);
        for closed in &candles {
            engine.on_candle(closed);
        }
        let before = engine.latest("NIFTY").unwrap();
        let again = engine.on_candle(&candles[9]);
        assert_eq!(*before, *again);
    }

    #[test]
    fn test_instruments_tracked_separately() {
        let mut engine = IndicatorEngine::new(create_test_settings());
        for closed in create_test_candles(10) {
            engine.on_candle(&closed);
        }
        assert!(engine.latest("NIFTY").is_some());
        assert!(engine.latest("BANKNIFTY").is_none());
    }
}
