use crate::models::Candle;
use std::collections::{HashMap, VecDeque};

/// Finalized candles per instrument, bounded to a lookback window
///
/// Oldest candles are evicted once `max_candles` is exceeded. Owned by the
/// aggregator, which is itself guarded by the session's market-data lock.
#[derive(Debug, Clone)]
pub struct CandleBuffer {
    data: HashMap<String, VecDeque<Candle>>,
    max_candles: usize,
}

impl CandleBuffer {
    pub fn new(max_candles: usize) -> Self {
        Self {
            data: HashMap::new(),
            max_candles: max_candles.max(1),
        }
    }

    /// Append a finalized candle, evicting the oldest if full
    pub fn add_candle(&mut self, candle: Candle) {
        let candles = self
            .data
            .entry(candle.instrument.clone())
            .or_insert_with(VecDeque::new);

        candles.push_back(candle);

        while candles.len() > self.max_candles {
            candles.pop_front();
        }
    }

    pub fn get_candles(&self, instrument: &str) -> Vec<Candle> {
        self.data
            .get(instrument)
            .map(|deque| deque.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The `n` most recent candles, oldest first
    pub fn get_recent_candles(&self, instrument: &str, n: usize) -> Vec<Candle> {
        self.data
            .get(instrument)
            .map(|deque| deque.iter().rev().take(n).rev().cloned().collect())
            .unwrap_or_default()
    }

    pub fn last_candle(&self, instrument: &str) -> Option<&Candle> {
        self.data.get(instrument).and_then(|d| d.back())
    }

    pub fn candle_count(&self, instrument: &str) -> usize {
        self.data.get(instrument).map(|d| d.len()).unwrap_or(0)
    }

    pub fn instruments(&self) -> Vec<String> {
        self.data.keys().cloned().collect()
    }
}
