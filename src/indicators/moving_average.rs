/// Simple moving average of the last `period` values
pub fn calculate_sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }

    let sum: f64 = values.iter().rev().take(period).sum();
    Some(sum / period as f64)
}

/// EMA over a full series, seeded with the SMA of the first `period` values
pub fn calculate_ema(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }

    let k = 2.0 / (period as f64 + 1.0);
    let mut ema = calculate_sma(&values[..period], period)?;
    for value in &values[period..] {
        ema += k * (value - ema);
    }

    Some(ema)
}

/// Incremental EMA.
///
/// Undefined for the first `period - 1` updates, seeded with their SMA on
/// update `period`, then `ema += k * (value - ema)`.
#[derive(Debug, Clone)]
pub struct Ema {
    period: usize,
    k: f64,
    seen: usize,
    seed_sum: f64,
    value: Option<f64>,
}

impl Ema {
    pub fn new(period: usize) -> Self {
        let period = period.max(1);
        Self {
            period,
            k: 2.0 / (period as f64 + 1.0),
            seen: 0,
            seed_sum: 0.0,
            value: None,
        }
    }

    pub fn update(&mut self, value: f64) -> Option<f64> {
        self.seen += 1;
        match self.value {
            Some(ema) => self.value = Some(ema + self.k * (value - ema)),
            None => {
                self.seed_sum += value;
                if self.seen == self.period {
                    self.value = Some(self.seed_sum / self.period as f64);
                }
            }
        }
        self.value
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sma() {
        let prices = vec![100.0, 102.0, 104.0, 106.0, 108.0];
        assert_eq!(calculate_sma(&prices, 5), Some(104.0));
        assert!(calculate_sma(&prices[..2], 5).is_none());
    }

    #[test]
    fn test_ema_undefined_during_warmup() {
        let mut ema = Ema::new(3);
        assert_eq!(ema.update(10.0), None);
        assert_eq!(ema.update(11.0), None);
        assert_eq!(ema.update(12.0), Some(11.0));
    }

    #[test]
    fn test_incremental_ema_matches_closed_form() {
        let prices: Vec<f64> = (0..40)
            .map(|i| 100.0 + (i as f64 * 0.7).sin() * 3.0 + i as f64 * 0.1)
            .collect();
        let mut ema = Ema::new(9);

        for (i, price) in prices.iter().enumerate() {
            let incremental = ema.update(*price);
            let closed_form = calculate_ema(&prices[..=i], 9);
            match (incremental, closed_form) {
                (Some(a), Some(b)) => assert!((a - b).abs() < 1e-9, "candle {}: {} vs {}", i + 1, a, b),
                (None, None) => assert!(i < 8),
                other => panic!("definedness mismatch at candle {}: {:?}", i + 1, other),
            }
        }
    }

    #[test]
    fn test_ema_tracks_rising_prices() {
        let prices = vec![100.0, 102.0, 104.0, 106.0, 108.0, 110.0];
        let ema = calculate_ema(&prices, 5).unwrap();
        assert!(ema > 104.0);
        assert!(ema < 110.0);
    }
}
