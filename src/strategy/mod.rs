// Signal generation
pub mod signals;

use crate::config::{IndicatorSettings, SignalSettings};
use crate::indicators::IndicatorSnapshot;
use crate::models::Signal;

pub use signals::{confirmations, Confirmations, SignalEvaluator};

/// Base trait for signal strategies
pub trait Strategy: Send + Sync {
    /// Directional call for the candle the snapshot was computed on
    fn evaluate(&self, snapshot: &IndicatorSnapshot) -> Signal;

    fn name(&self) -> &str;

    /// Minimum closed candles before the strategy can produce a signal
    fn min_candles_required(&self) -> usize;
}

/// Five-confirmation scalping strategy
pub struct ConfirmationStrategy {
    evaluator: SignalEvaluator,
    warmup: usize,
}

impl ConfirmationStrategy {
    pub fn new(indicators: &IndicatorSettings, signals: SignalSettings) -> Self {
        Self {
            evaluator: SignalEvaluator::new(signals),
            warmup: indicators.warmup_candles(),
        }
    }
}

impl Strategy for ConfirmationStrategy {
    fn evaluate(&self, snapshot: &IndicatorSnapshot) -> Signal {
        self.evaluator.evaluate(snapshot)
    }

    fn name(&self) -> &str {
        "confirmation-scalper"
    }

    fn min_candles_required(&self) -> usize {
        self.warmup
    }
}
