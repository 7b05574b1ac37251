use crate::config::SignalSettings;
use crate::indicators::{IndicatorSnapshot, TrendDirection};
use crate::models::{Direction, Signal};

pub const TOTAL_CONFIRMATIONS: u8 = 5;

/// Outcome of the five confirmations for one snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Confirmations {
    pub trend: (bool, bool),
    pub momentum: (bool, bool),
    pub band: (bool, bool),
    pub volume: (bool, bool),
    pub structure: (bool, bool),
}

impl Confirmations {
    pub fn bullish(&self) -> u8 {
        self.sides().iter().filter(|(bull, _)| *bull).count() as u8
    }

    pub fn bearish(&self) -> u8 {
        self.sides().iter().filter(|(_, bear)| *bear).count() as u8
    }

    fn sides(&self) -> [(bool, bool); 5] {
        [self.trend, self.momentum, self.band, self.volume, self.structure]
    }
}

/// Score a ready snapshot. Returns `None` while any indicator is warming up.
pub fn confirmations(snapshot: &IndicatorSnapshot, settings: &SignalSettings) -> Option<Confirmations> {
    if !snapshot.is_ready() {
        return None;
    }

    let ema_short = snapshot.ema_short?;
    let ema_long = snapshot.ema_long?;
    let momentum = snapshot.momentum?;
    let direction = snapshot.supertrend_direction?;
    let avg_volume = snapshot.avg_volume?;
    let prev_high = snapshot.prev_high?;
    let prev_low = snapshot.prev_low?;

    let threshold = settings.momentum_threshold_pct;
    let surge = avg_volume > 0.0 && snapshot.volume >= avg_volume * settings.volume_surge_multiplier;

    Some(Confirmations {
        trend: (ema_short > ema_long, ema_short < ema_long),
        momentum: (momentum >= threshold, momentum <= -threshold),
        band: (
            direction == TrendDirection::Up,
            direction == TrendDirection::Down,
        ),
        volume: (
            surge && snapshot.close > snapshot.open,
            surge && snapshot.close < snapshot.open,
        ),
        structure: (
            snapshot.high > prev_high && snapshot.low > prev_low,
            snapshot.high < prev_high && snapshot.low < prev_low,
        ),
    })
}

/// Counts confirmations per side and calls long/short when one side alone
/// reaches the configured minimum.
#[derive(Debug, Clone)]
pub struct SignalEvaluator {
    settings: SignalSettings,
}

impl SignalEvaluator {
    pub fn new(settings: SignalSettings) -> Self {
        Self { settings }
    }

    pub fn evaluate(&self, snapshot: &IndicatorSnapshot) -> Signal {
        let mut signal = Signal::none(&snapshot.instrument, snapshot.candle_index, snapshot.timestamp);

        let Some(checks) = confirmations(snapshot, &self.settings) else {
            return signal;
        };

        let bullish = checks.bullish();
        let bearish = checks.bearish();
        let min = self.settings.min_confirmations;
        signal.bullish = bullish;
        signal.bearish = bearish;

        let (direction, satisfied) = match (bullish >= min, bearish >= min) {
            (true, false) => (Direction::Long, bullish),
            (false, true) => (Direction::Short, bearish),
            (true, true) => {
                tracing::debug!(
                    instrument = %snapshot.instrument,
                    bullish,
                    bearish,
                    "Conflicting confirmations, no signal"
                );
                (Direction::None, 0)
            }
            (false, false) => (Direction::None, 0),
        };

        signal.direction = direction;
        signal.confidence = f64::from(satisfied) / f64::from(TOTAL_CONFIRMATIONS);
        signal
    }

    pub fn settings(&self) -> &SignalSettings {
        &self.settings
    }
}
