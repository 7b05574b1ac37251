//! Average True Range with Wilder's smoothing.
//!
//! True range is the greatest of high - low, |high - prev close| and
//! |low - prev close|; the very first candle has no previous close, so its
//! true range is high - low. The first ATR is the mean of the first `period`
//! true ranges, after which `atr = (atr * (period - 1) + tr) / period`.

use crate::models::Candle;

fn true_range(candle: &Candle, prev_close: Option<f64>) -> f64 {
    let range = candle.high - candle.low;
    match prev_close {
        Some(prev) => range
            .max((candle.high - prev).abs())
            .max((candle.low - prev).abs()),
        None => range,
    }
}

/// ATR over a full candle series, `None` before `period` candles
pub fn calculate_atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period {
        return None;
    }

    let true_ranges: Vec<f64> = candles
        .iter()
        .enumerate()
        .map(|(i, c)| true_range(c, i.checked_sub(1).map(|p| candles[p].close)))
        .collect();

    let mut atr = true_ranges[..period].iter().sum::<f64>() / period as f64;
    for tr in &true_ranges[period..] {
        atr = (atr * (period as f64 - 1.0) + tr) / period as f64;
    }

    Some(atr)
}

/// Incremental Wilder ATR
#[derive(Debug, Clone)]
pub struct WilderAtr {
    period: usize,
    seen: usize,
    prev_close: Option<f64>,
    seed_sum: f64,
    value: Option<f64>,
}

impl WilderAtr {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            seen: 0,
            prev_close: None,
            seed_sum: 0.0,
            value: None,
        }
    }

    pub fn update(&mut self, candle: &Candle) -> Option<f64> {
        let tr = true_range(candle, self.prev_close);
        self.prev_close = Some(candle.close);
        self.seen += 1;

        let period = self.period as f64;
        match self.value {
            Some(atr) => self.value = Some((atr * (period - 1.0) + tr) / period),
            None => {
                self.seed_sum += tr;
                if self.seen == self.period {
                    self.value = Some(self.seed_sum / period);
                }
            }
        }
        self.value
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}
