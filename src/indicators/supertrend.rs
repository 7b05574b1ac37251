use serde::{Deserialize, Serialize};

use super::atr::WilderAtr;
use crate::models::Candle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrendDirection {
    Up,
    Down,
}

/// SuperTrend: ATR bands around the bar midpoint with hysteresis.
///
/// The upper band may only move down (and the lower band only up) while price
/// stays inside it; the trend flips only when the close crosses the band on
/// the opposite side. The reported line is the lower band in an uptrend and
/// the upper band in a downtrend.
#[derive(Debug, Clone)]
pub struct SuperTrend {
    multiplier: f64,
    atr: WilderAtr,
    prev_close: Option<f64>,
    final_upper: Option<f64>,
    final_lower: Option<f64>,
    direction: Option<TrendDirection>,
}

impl SuperTrend {
    pub fn new(period: usize, multiplier: f64) -> Self {
        Self {
            multiplier,
            atr: WilderAtr::new(period),
            prev_close: None,
            final_upper: None,
            final_lower: None,
            direction: None,
        }
    }

    /// Feed one closed candle. `None` until the ATR is warm.
    pub fn update(&mut self, candle: &Candle) -> Option<(f64, TrendDirection)> {
        let prev_close = self.prev_close.replace(candle.close);
        let atr = self.atr.update(candle)?;

        let mid = (candle.high + candle.low) / 2.0;
        let basic_upper = mid + self.multiplier * atr;
        let basic_lower = mid - self.multiplier * atr;

        let upper = match (self.final_upper, prev_close) {
            (Some(prev), Some(close)) if basic_upper >= prev && close <= prev => prev,
            _ => basic_upper,
        };
        let lower = match (self.final_lower, prev_close) {
            (Some(prev), Some(close)) if basic_lower <= prev && close >= prev => prev,
            _ => basic_lower,
        };

        let direction = match self.direction {
            None if candle.close >= mid => TrendDirection::Up,
            None => TrendDirection::Down,
            Some(TrendDirection::Up) if candle.close < lower => TrendDirection::Down,
            Some(TrendDirection::Down) if candle.close > upper => TrendDirection::Up,
            Some(current) => current,
        };

        self.final_upper = Some(upper);
        self.final_lower = Some(lower);
        self.direction = Some(direction);

        Some(self.current(direction, upper, lower))
    }

    pub fn value(&self) -> Option<(f64, TrendDirection)> {
        match (self.direction, self.final_upper, self.final_lower) {
            (Some(direction), Some(upper), Some(lower)) => Some(self.current(direction, upper, lower)),
            _ => None,
        }
    }

    fn current(&self, direction: TrendDirection, upper: f64, lower: f64) -> (f64, TrendDirection) {
        match direction {
            TrendDirection::Up => (lower, direction),
            TrendDirection::Down => (upper, direction),
        }
    }
}

/// SuperTrend over a full candle series
pub fn calculate_supertrend(
    candles: &[Candle],
    period: usize,
    multiplier: f64,
) -> Option<(f64, TrendDirection)> {
    let mut st = SuperTrend::new(period, multiplier);
    candles.iter().fold(None, |_, c| st.update(c))
}
