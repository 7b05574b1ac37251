// Technical indicators: incremental EMA, Wilder ATR and SuperTrend,
// combined per instrument by the indicator engine

pub mod atr;
pub mod engine;
pub mod moving_average;
pub mod supertrend;

pub use atr::{calculate_atr, WilderAtr};
pub use engine::{IndicatorEngine, IndicatorSnapshot};
pub use moving_average::{calculate_ema, calculate_sma, Ema};
pub use supertrend::{calculate_supertrend, SuperTrend, TrendDirection};
