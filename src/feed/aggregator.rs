use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};

use super::candle_buffer::CandleBuffer;
use crate::models::{Candle, Tick};

/// A finalized candle with its per-instrument sequence number (starting at 1).
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedCandle {
    pub index: u64,
    pub candle: Candle,
}

/// Counters for ticks the aggregator refused and bars it had to invent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedStats {
    pub ticks_accepted: u64,
    pub dropped_unknown: u64,
    pub dropped_late: u64,
    pub dropped_invalid: u64,
    pub synthetic_candles: u64,
}

impl FeedStats {
    pub fn dropped(&self) -> u64 {
        self.dropped_unknown + self.dropped_late + self.dropped_invalid
    }
}

#[derive(Debug, Clone)]
struct Building {
    candle: Candle,
    last_tick_at: Option<DateTime<Utc>>,
}

impl Building {
    fn from_tick(tick: &Tick, start: DateTime<Utc>) -> Self {
        Self {
            candle: Candle {
                instrument: tick.instrument.clone(),
                timestamp: start,
                open: tick.price,
                high: tick.price,
                low: tick.price,
                close: tick.price,
                volume: tick.size,
                synthetic: false,
            },
            last_tick_at: Some(tick.timestamp),
        }
    }

    fn placeholder(instrument: &str, start: DateTime<Utc>, prev_close: f64) -> Self {
        Self {
            candle: Candle::flat(instrument, start, prev_close),
            last_tick_at: None,
        }
    }

    fn apply(&mut self, tick: &Tick) {
        match self.last_tick_at {
            None => {
                // first real tick replaces the flat placeholder
                let start = self.candle.timestamp;
                *self = Building::from_tick(tick, start);
            }
            Some(last) => {
                let c = &mut self.candle;
                c.high = c.high.max(tick.price);
                c.low = c.low.min(tick.price);
                c.volume += tick.size;
                if tick.timestamp >= last {
                    c.close = tick.price;
                    self.last_tick_at = Some(tick.timestamp);
                }
            }
        }
    }
}

/// Turns ticks into fixed-interval OHLCV candles per subscribed instrument.
///
/// Boundaries come from exchange timestamps on ticks and from the wall clock
/// via [`CandleAggregator::advance_to`]. Once an instrument has seen its first
/// tick, every interval produces exactly one candle; intervals without ticks
/// become flat candles at the previous close.
#[derive(Debug)]
pub struct CandleAggregator {
    interval: Duration,
    grace: Duration,
    subscribed: HashSet<String>,
    building: HashMap<String, Building>,
    closed_counts: HashMap<String, u64>,
    last_prices: HashMap<String, (f64, DateTime<Utc>)>,
    buffer: CandleBuffer,
    stats: FeedStats,
}

impl CandleAggregator {
    pub fn new(interval_secs: u64, close_grace_ms: u64, max_history: usize) -> Self {
        Self {
            interval: Duration::seconds(interval_secs.max(1) as i64),
            grace: Duration::milliseconds(close_grace_ms as i64),
            subscribed: HashSet::new(),
            building: HashMap::new(),
            closed_counts: HashMap::new(),
            last_prices: HashMap::new(),
            buffer: CandleBuffer::new(max_history),
            stats: FeedStats::default(),
        }
    }

    pub fn subscribe(&mut self, instrument: &str) {
        self.subscribed.insert(instrument.to_string());
    }

    pub fn is_subscribed(&self, instrument: &str) -> bool {
        self.subscribed.contains(instrument)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start of the interval containing `ts`.
    pub fn interval_start(&self, ts: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let step = self.interval.num_milliseconds();
        let ms = ts.timestamp_millis();
        DateTime::from_timestamp_millis(ms - ms.rem_euclid(step))
    }

    /// Fold one tick in. Returns the candles its timestamp closed, oldest first.
    pub fn on_tick(&mut self, tick: &Tick) -> Vec<ClosedCandle> {
        let mut closed = Vec::new();

        if !self.subscribed.contains(&tick.instrument) {
            self.stats.dropped_unknown += 1;
            tracing::debug!(instrument = %tick.instrument, "Dropped tick for unsubscribed instrument");
            return closed;
        }

        let valid = tick.price.is_finite() && tick.price > 0.0 && tick.size.is_finite() && tick.size >= 0.0;
        let start = match self.interval_start(tick.timestamp) {
            Some(start) if valid => start,
            _ => {
                self.stats.dropped_invalid += 1;
                tracing::debug!(instrument = %tick.instrument, price = tick.price, "Dropped malformed tick");
                return closed;
            }
        };

        if let Some(current) = self.building.get(&tick.instrument) {
            if start < current.candle.timestamp {
                self.stats.dropped_late += 1;
                tracing::debug!(
                    instrument = %tick.instrument,
                    tick_time = %tick.timestamp,
                    "Dropped tick for an already closed interval"
                );
                return closed;
            }
        }

        self.close_through(&tick.instrument, start, &mut closed);

        match self.building.get_mut(&tick.instrument) {
            Some(current) => current.apply(tick),
            None => {
                self.building
                    .insert(tick.instrument.clone(), Building::from_tick(tick, start));
            }
        }

        let newer = self
            .last_prices
            .get(&tick.instrument)
            .map_or(true, |(_, at)| tick.timestamp >= *at);
        if newer {
            self.last_prices
                .insert(tick.instrument.clone(), (tick.price, tick.timestamp));
        }

        self.stats.ticks_accepted += 1;
        closed
    }

    /// Close every interval that ended at least the grace period before `now`.
    pub fn advance_to(&mut self, now: DateTime<Utc>) -> Vec<ClosedCandle> {
        let mut closed = Vec::new();
        let Some(target) = self.interval_start(now - self.grace) else {
            return closed;
        };

        let mut instruments: Vec<String> = self.building.keys().cloned().collect();
        instruments.sort();
        for instrument in instruments {
            self.close_through(&instrument, target, &mut closed);
        }
        closed
    }

    /// Load already-finalized history (warm-up). Returns the candles with
    /// their assigned indices so indicators can be fed the same sequence.
    ///
    /// Each seeded instrument is left building a flat placeholder for the
    /// interval after its last archived candle, so live ticks continue the
    /// series: silence since the archive becomes flat candles and ticks for
    /// archived intervals are dropped as late.
    pub fn seed_history(&mut self, candles: Vec<Candle>) -> Vec<ClosedCandle> {
        let mut closed = Vec::with_capacity(candles.len());
        let mut tails: HashMap<String, (DateTime<Utc>, f64)> = HashMap::new();
        for candle in candles {
            if !candle.is_well_formed() {
                continue;
            }
            let last = self
                .buffer
                .last_candle(&candle.instrument)
                .map(|c| c.timestamp);
            if last.is_some_and(|ts| candle.timestamp <= ts) {
                continue;
            }
            if let Some(current) = self.building.get(&candle.instrument) {
                if candle.timestamp >= current.candle.timestamp {
                    // live data already covers this interval
                    continue;
                }
            }
            self.last_prices
                .insert(candle.instrument.clone(), (candle.close, candle.timestamp));
            tails.insert(candle.instrument.clone(), (candle.timestamp, candle.close));
            self.finalize(candle, &mut closed);
        }

        for (instrument, (start, close)) in tails {
            if !self.building.contains_key(&instrument) {
                let next = Building::placeholder(&instrument, start + self.interval, close);
                self.building.insert(instrument, next);
            }
        }
        closed
    }

    /// Forget the candles being built (trading-day boundary). History stays.
    pub fn reset_session(&mut self) {
        self.building.clear();
    }

    pub fn last_price(&self, instrument: &str) -> Option<f64> {
        self.last_prices.get(instrument).map(|(price, _)| *price)
    }

    pub fn last_prices(&self) -> HashMap<String, f64> {
        self.last_prices
            .iter()
            .map(|(k, (price, _))| (k.clone(), *price))
            .collect()
    }

    /// Candle currently being built, if any.
    pub fn current_candle(&self, instrument: &str) -> Option<&Candle> {
        self.building.get(instrument).map(|b| &b.candle)
    }

    pub fn closed_count(&self, instrument: &str) -> u64 {
        self.closed_counts.get(instrument).copied().unwrap_or(0)
    }

    pub fn buffer(&self) -> &CandleBuffer {
        &self.buffer
    }

    pub fn stats(&self) -> FeedStats {
        self.stats
    }

    fn close_through(&mut self, instrument: &str, target: DateTime<Utc>, out: &mut Vec<ClosedCandle>) {
        loop {
            let finished = match self.building.get_mut(instrument) {
                Some(current) if current.candle.timestamp < target => {
                    let next = Building::placeholder(
                        instrument,
                        current.candle.timestamp + self.interval,
                        current.candle.close,
                    );
                    std::mem::replace(current, next).candle
                }
                _ => return,
            };
            self.finalize(finished, out);
        }
    }

    fn finalize(&mut self, candle: Candle, out: &mut Vec<ClosedCandle>) {
        let index = self
            .closed_counts
            .entry(candle.instrument.clone())
            .or_insert(0);
        *index += 1;
        let index = *index;

        if candle.synthetic {
            self.stats.synthetic_candles += 1;
            tracing::debug!(
                instrument = %candle.instrument,
                start = %candle.timestamp,
                "Synthesized flat candle for empty interval"
            );
        }

        self.buffer.add_candle(candle.clone());
        out.push(ClosedCandle { index, candle });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 4, 0, 0).unwrap()
    }

    fn tick(instrument: &str, secs: i64, price: f64, size: f64) -> Tick {
        Tick {
            instrument: instrument.to_string(),
            price,
            size,
            timestamp: base_time() + Duration::seconds(secs),
        }
    }

    fn create_test_aggregator() -> CandleAggregator {
        let mut agg = CandleAggregator::new(60, 500, 100);
        agg.subscribe("NIFTY");
        agg
    }

    #[test]
    fn test_builds_ohlcv_and_closes_on_boundary() {
        let mut agg = create_test_aggregator();

        assert!(agg.on_tick(&tick("NIFTY", 1, 100.0, 10.0)).is_empty());
        assert!(agg.on_tick(&tick("NIFTY", 20, 103.0, 5.0)).is_empty());
        assert!(agg.on_tick(&tick("NIFTY", 40, 98.0, 5.0)).is_empty());
        assert!(agg.on_tick(&tick("NIFTY", 59, 101.0, 5.0)).is_empty());

        let closed = agg.on_tick(&tick("NIFTY", 61, 102.0, 1.0));
        assert_eq!(closed.len(), 1);
        let c = &closed[0].candle;
        assert_eq!(closed[0].index, 1);
        assert_eq!(c.timestamp, base_time());
        assert_eq!((c.open, c.high, c.low, c.close), (100.0, 103.0, 98.0, 101.0));
        assert_eq!(c.volume, 25.0);
        assert!(!c.synthetic);
    }

    #[test]
    fn test_out_of_order_tick_keeps_open_and_close() {
        let mut agg = create_test_aggregator();

        agg.on_tick(&tick("NIFTY", 10, 100.0, 1.0));
        agg.on_tick(&tick("NIFTY", 30, 101.0, 1.0));
        // arrives late but inside the same interval
        agg.on_tick(&tick("NIFTY", 5, 95.0, 2.0));

        let c = agg.current_candle("NIFTY").unwrap();
        assert_eq!(c.open, 100.0);
        assert_eq!(c.low, 95.0);
        assert_eq!(c.close, 101.0);
        assert_eq!(c.volume, 4.0);
    }

    #[test]
    fn test_gap_produces_flat_candles() {
        let mut agg = create_test_aggregator();

        agg.on_tick(&tick("NIFTY", 0, 100.0, 1.0));
        agg.on_tick(&tick("NIFTY", 30, 104.0, 1.0));
        let closed = agg.on_tick(&tick("NIFTY", 185, 99.0, 1.0));

        assert_eq!(closed.len(), 3);
        assert_eq!(closed.iter().map(|c| c.index).collect::<Vec<_>>(), vec![1, 2, 3]);

        for flat in &closed[1..] {
            assert!(flat.candle.synthetic);
            assert_eq!(flat.candle.volume, 0.0);
            assert_eq!(flat.candle.open, 104.0);
            assert_eq!(flat.candle.close, 104.0);
        }
        assert_eq!(closed[2].candle.timestamp, base_time() + Duration::minutes(2));
        assert_eq!(agg.stats().synthetic_candles, 2);
    }

    #[test]
    fn test_clock_closes_candle_after_grace() {
        let mut agg = create_test_aggregator();
        agg.on_tick(&tick("NIFTY", 10, 100.0, 1.0));

        // inside the grace window nothing closes
        let early = agg.advance_to(base_time() + Duration::milliseconds(60_200));
        assert!(early.is_empty());

        let closed = agg.advance_to(base_time() + Duration::milliseconds(60_600));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].candle.close, 100.0);

        // a tick for the next interval must not re-emit the closed candle
        let again = agg.on_tick(&tick("NIFTY", 70, 101.0, 1.0));
        assert!(again.is_empty());
        assert_eq!(agg.closed_count("NIFTY"), 1);
    }

    #[test]
    fn test_clock_emits_flats_during_silence() {
        let mut agg = create_test_aggregator();
        agg.on_tick(&tick("NIFTY", 10, 100.0, 1.0));

        let closed = agg.advance_to(base_time() + Duration::seconds(241));
        assert_eq!(closed.len(), 4);
        assert!(closed[1..].iter().all(|c| c.candle.synthetic));
    }

    #[test]
    fn test_unknown_instrument_dropped_and_counted() {
        let mut agg = create_test_aggregator();

        let closed = agg.on_tick(&tick("BANKNIFTY", 1, 100.0, 1.0));
        assert!(closed.is_empty());
        assert_eq!(agg.stats().dropped_unknown, 1);
        assert!(agg.current_candle("BANKNIFTY").is_none());
    }

    #[test]
    fn test_late_and_malformed_ticks_dropped() {
        let mut agg = create_test_aggregator();

        agg.on_tick(&tick("NIFTY", 10, 100.0, 1.0));
        agg.on_tick(&tick("NIFTY", 70, 101.0, 1.0));
        agg.on_tick(&tick("NIFTY", 20, 150.0, 1.0));
        agg.on_tick(&tick("NIFTY", 75, f64::NAN, 1.0));
        agg.on_tick(&tick("NIFTY", 75, -1.0, 1.0));

        let stats = agg.stats();
        assert_eq!(stats.dropped_late, 1);
        assert_eq!(stats.dropped_invalid, 2);
        assert_eq!(stats.ticks_accepted, 2);
        assert_eq!(agg.buffer().get_candles("NIFTY")[0].high, 100.0);
    }

    #[test]
    fn test_last_price_follows_exchange_time() {
        let mut agg = create_test_aggregator();

        agg.on_tick(&tick("NIFTY", 30, 101.0, 1.0));
        agg.on_tick(&tick("NIFTY", 20, 99.0, 1.0));
        assert_eq!(agg.last_price("NIFTY"), Some(101.0));
    }

    #[test]
    fn test_random_ticks_give_well_formed_contiguous_candles() {
        let mut agg = create_test_aggregator();
        let mut rng = StdRng::seed_from_u64(7);
        let mut closed = Vec::new();
        let mut secs = 0i64;
        let mut price = 100.0;

        for _ in 0..2_000 {
            secs += rng.gen_range(0..40);
            price *= 1.0 + rng.gen_range(-0.002..0.002);
            // occasional straggler from a few seconds back
            let jitter = if rng.gen_bool(0.1) { rng.gen_range(0..5) } else { 0 };
            closed.extend(agg.on_tick(&tick("NIFTY", secs - jitter, price, rng.gen_range(1.0..10.0))));
        }

        assert!(closed.len() > 100);
        for pair in closed.windows(2) {
            assert_eq!(pair[1].index, pair[0].index + 1);
            assert_eq!(pair[1].candle.timestamp - pair[0].candle.timestamp, Duration::seconds(60));
        }
        assert!(closed.iter().all(|c| c.candle.is_well_formed()));
    }

    #[test]
    fn test_seed_history_assigns_indices() {
        let mut agg = create_test_aggregator();
        let history: Vec<Candle> = (0..3)
            .map(|i| Candle::flat("NIFTY", base_time() + Duration::minutes(i), 100.0 + i as f64))
            .collect();

        let seeded = agg.seed_history(history.clone());
        assert_eq!(seeded.len(), 3);
        assert_eq!(seeded[2].index, 3);
        assert_eq!(agg.last_price("NIFTY"), Some(102.0));

        // replaying the same history is ignored
        assert!(agg.seed_history(history).is_empty());
    }

    fn create_seeded_aggregator() -> CandleAggregator {
        let mut agg = create_test_aggregator();
        let history: Vec<Candle> = (0..3)
            .map(|i| Candle::flat("NIFTY", base_time() + Duration::minutes(i), 100.0 + i as f64))
            .collect();
        agg.seed_history(history);
        agg
    }

    #[test]
    fn test_live_ticks_after_seed_fill_the_gap() {
        let mut agg = create_seeded_aggregator();

        // first live tick arrives at 04:10:05, archive ends at 04:02
        assert_eq!(agg.on_tick(&tick("NIFTY", 605, 110.0, 1.0)).len(), 7);
        let closed = agg.on_tick(&tick("NIFTY", 665, 111.0, 1.0));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].index, 11);
        assert_eq!(closed[0].candle.timestamp, base_time() + Duration::minutes(10));
        assert_eq!(closed[0].candle.open, 110.0);
        assert!(!closed[0].candle.synthetic);

        let candles = agg.buffer().get_candles("NIFTY");
        assert_eq!(candles.len(), 11);
        for pair in candles.windows(2) {
            assert_eq!(pair[1].timestamp - pair[0].timestamp, Duration::seconds(60));
        }
        // 04:03 through 04:09 carry the last archived close
        assert!(candles[3..10].iter().all(|c| c.synthetic && c.close == 102.0));
    }

    #[test]
    fn test_tick_for_archived_interval_dropped_as_late() {
        let mut agg = create_seeded_aggregator();

        assert!(agg.on_tick(&tick("NIFTY", 150, 99.0, 1.0)).is_empty());
        assert_eq!(agg.stats().dropped_late, 1);

        assert!(agg.on_tick(&tick("NIFTY", 185, 103.0, 1.0)).is_empty());
        let closed = agg.on_tick(&tick("NIFTY", 245, 104.0, 1.0));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].index, 4);
        assert_eq!(closed[0].candle.timestamp, base_time() + Duration::minutes(3));

        let stamps: Vec<_> = agg.buffer().get_candles("NIFTY").iter().map(|c| c.timestamp).collect();
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_clock_closes_flats_after_seed() {
        let mut agg = create_seeded_aggregator();

        let closed = agg.advance_to(base_time() + Duration::seconds(301));
        assert_eq!(closed.iter().map(|c| c.index).collect::<Vec<_>>(), vec![4, 5]);
        assert!(closed.iter().all(|c| c.candle.synthetic));
    }
}
