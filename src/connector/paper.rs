use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{Connector, OrderAck, OrderRequest};
use crate::config::{InstrumentSettings, PaperSettings};
use crate::error::ConnectorError;
use crate::execution::OrderEvent;
use crate::models::{Instrument, InstrumentKind, OptionRight, Side, Tick};

const CHANNEL_CAPACITY: usize = 4096;

#[derive(Debug, Default, Clone, Copy)]
struct Holding {
    quantity: i64,
    avg_price: f64,
}

#[derive(Debug, Default)]
struct PaperBook {
    subscribed: HashMap<String, Instrument>,
    last_prices: HashMap<String, f64>,
    holdings: HashMap<String, Holding>,
    realized_pnl: f64,
}

impl PaperBook {
    /// Book a fill and return the P&L it realized
    fn book(&mut self, symbol: &str, side: Side, quantity: u32, price: f64) -> f64 {
        let signed = match side {
            Side::Buy => i64::from(quantity),
            Side::Sell => -i64::from(quantity),
        };
        let holding = self.holdings.entry(symbol.to_string()).or_default();
        let mut realized = 0.0;

        if holding.quantity == 0 || holding.quantity.signum() == signed.signum() {
            let total = holding.quantity + signed;
            holding.avg_price = (holding.avg_price * holding.quantity.abs() as f64
                + price * signed.abs() as f64)
                / total.abs() as f64;
            holding.quantity = total;
        } else {
            let closing = signed.abs().min(holding.quantity.abs());
            realized = (price - holding.avg_price) * closing as f64 * holding.quantity.signum() as f64;
            holding.quantity += signed;
            if holding.quantity.signum() == signed.signum() && holding.quantity != 0 {
                // flipped through zero: the remainder opens at this price
                holding.avg_price = price;
            } else if holding.quantity == 0 {
                holding.avg_price = 0.0;
            }
        }

        self.realized_pnl += realized;
        realized
    }
}

/// Simulated broker: fills market orders at the last seen price plus a
/// random slippage, acknowledging first and filling after a short latency.
pub struct PaperConnector {
    settings: PaperSettings,
    book: Mutex<PaperBook>,
    rng: Mutex<StdRng>,
    tick_tx: mpsc::Sender<Tick>,
    tick_rx: Mutex<Option<mpsc::Receiver<Tick>>>,
    event_tx: mpsc::Sender<OrderEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<OrderEvent>>>,
    order_seq: AtomicU64,
    fail_next: AtomicU32,
    reject_next: AtomicU32,
}

impl PaperConnector {
    pub fn new(settings: PaperSettings) -> Self {
        let (tick_tx, tick_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(settings.seed)),
            settings,
            book: Mutex::new(PaperBook::default()),
            tick_tx,
            tick_rx: Mutex::new(Some(tick_rx)),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            order_seq: AtomicU64::new(0),
            fail_next: AtomicU32::new(0),
            reject_next: AtomicU32::new(0),
        }
    }

    /// Feed side: record the price and forward the tick to the engine
    pub async fn publish_tick(&self, tick: Tick) -> Result<(), ConnectorError> {
        {
            let mut book = self.lock_book()?;
            book.last_prices.insert(tick.instrument.clone(), tick.price);
        }
        self.tick_tx
            .send(tick)
            .await
            .map_err(|_| ConnectorError::Fatal("tick stream closed".to_string()))
    }

    /// Make the next `n` submissions fail with a transient error
    pub fn fail_next_submissions(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` accepted orders come back rejected
    pub fn reject_next_orders(&self, n: u32) {
        self.reject_next.store(n, Ordering::SeqCst);
    }

    pub fn subscribed(&self) -> Vec<Instrument> {
        self.book
            .lock()
            .map(|b| b.subscribed.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.book.lock().ok()?.last_prices.get(symbol).copied()
    }

    pub fn net_quantity(&self, symbol: &str) -> i64 {
        self.book
            .lock()
            .ok()
            .and_then(|b| b.holdings.get(symbol).map(|h| h.quantity))
            .unwrap_or(0)
    }

    fn lock_book(&self) -> Result<std::sync::MutexGuard<'_, PaperBook>, ConnectorError> {
        self.book
            .lock()
            .map_err(|e| ConnectorError::Fatal(format!("paper book poisoned: {e}")))
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn slipped_price(&self, price: f64, side: Side) -> f64 {
        let draw: f64 = match self.rng.lock() {
            Ok(mut rng) => rng.gen(),
            Err(_) => 0.5,
        };
        let slip = self.settings.slippage_bps * draw / 10_000.0;
        match side {
            Side::Buy => price * (1.0 + slip),
            Side::Sell => price * (1.0 - slip),
        }
    }
}

#[async_trait]
impl Connector for PaperConnector {
    async fn subscribe(&self, instruments: &[Instrument]) -> Result<(), ConnectorError> {
        let mut book = self.lock_book()?;
        for instrument in instruments {
            if book
                .subscribed
                .insert(instrument.symbol.clone(), instrument.clone())
                .is_none()
            {
                tracing::info!("Paper feed subscribed to {}", instrument);
            }
        }
        Ok(())
    }

    fn stream_ticks(&self) -> Result<mpsc::Receiver<Tick>, ConnectorError> {
        self.tick_rx
            .lock()
            .map_err(|e| ConnectorError::Fatal(e.to_string()))?
            .take()
            .ok_or(ConnectorError::StreamTaken("tick"))
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderAck, ConnectorError> {
        if Self::take_one(&self.fail_next) {
            return Err(ConnectorError::Transient(
                "simulated gateway timeout".to_string(),
            ));
        }
        if request.quantity == 0 {
            return Err(ConnectorError::Rejected("zero quantity".to_string()));
        }

        let seq = self.order_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let broker_ref = format!("PAPER-{seq:06}");
        let order_id = request.client_order_id;
        let latency = Duration::from_millis(self.settings.fill_latency_ms);

        if Self::take_one(&self.reject_next) {
            let events = self.event_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(latency).await;
                let _ = events
                    .send(OrderEvent::Rejected {
                        order_id,
                        reason: "simulated exchange rejection".to_string(),
                        at: Utc::now(),
                    })
                    .await;
            });
            return Ok(OrderAck {
                client_order_id: order_id,
                broker_ref,
            });
        }

        let market = {
            let book = self.lock_book()?;
            book.last_prices.get(&request.instrument.symbol).copied()
        };
        let Some(market) = market.or((request.reference_price > 0.0).then_some(request.reference_price)) else {
            return Err(ConnectorError::Rejected(format!(
                "no market price for {}",
                request.instrument
            )));
        };

        let price = self.slipped_price(market, request.side);
        {
            let mut book = self.lock_book()?;
            book.book(&request.instrument.symbol, request.side, request.quantity, price);
        }

        tracing::debug!(
            order_id = %order_id,
            broker_ref = %broker_ref,
            "Paper {} {} x{} filling @ {:.2}",
            request.side.as_str(),
            request.instrument,
            request.quantity,
            price
        );

        let events = self.event_tx.clone();
        let quantity = request.quantity;
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            let _ = events
                .send(OrderEvent::Filled {
                    order_id,
                    price,
                    quantity,
                    at: Utc::now(),
                })
                .await;
        });

        Ok(OrderAck {
            client_order_id: order_id,
            broker_ref,
        })
    }

    fn order_events(&self) -> Result<mpsc::Receiver<OrderEvent>, ConnectorError> {
        self.event_rx
            .lock()
            .map_err(|e| ConnectorError::Fatal(e.to_string()))?
            .take()
            .ok_or(ConnectorError::StreamTaken("order event"))
    }

    async fn account_equity(&self) -> Result<f64, ConnectorError> {
        let book = self.lock_book()?;
        Ok(self.settings.starting_equity + book.realized_pnl)
    }
}

/// Seeded random-walk ticks for every configured underlying, plus rough
/// premiums for any option contracts subscribed along the way.
pub struct SyntheticFeed {
    connector: Arc<PaperConnector>,
    prices: Vec<(String, f64)>,
    rng: StdRng,
    tick_every: Duration,
    volatility: f64,
}

impl SyntheticFeed {
    pub fn new(connector: Arc<PaperConnector>, instruments: &[InstrumentSettings], settings: &PaperSettings) -> Self {
        Self {
            connector,
            prices: instruments
                .iter()
                .map(|i| (i.symbol.clone(), i.start_price))
                .collect(),
            rng: StdRng::seed_from_u64(settings.seed.wrapping_add(1)),
            tick_every: Duration::from_millis(settings.tick_interval_ms.max(1)),
            volatility: settings.volatility_bps / 10_000.0,
        }
    }

    /// Option premium: intrinsic value plus a flat time value
    fn premium(spot: f64, strike: u32, right: OptionRight) -> f64 {
        let strike = f64::from(strike);
        let intrinsic = match right {
            OptionRight::Call => (spot - strike).max(0.0),
            OptionRight::Put => (strike - spot).max(0.0),
        };
        intrinsic + spot * 0.004
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = interval(self.tick_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(
            "Synthetic feed started for {} underlyings every {:?}",
            self.prices.len(),
            self.tick_every
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let now = Utc::now();
            let mut ticks = Vec::with_capacity(self.prices.len());
            for (symbol, price) in self.prices.iter_mut() {
                let step = if self.volatility > 0.0 {
                    self.rng.gen_range(-self.volatility..self.volatility)
                } else {
                    0.0
                };
                *price = (*price * (1.0 + step)).max(0.01);
                ticks.push(Tick {
                    instrument: symbol.clone(),
                    price: *price,
                    size: f64::from(self.rng.gen_range(1u32..100)),
                    timestamp: now,
                });
            }

            for instrument in self.connector.subscribed() {
                if let InstrumentKind::Option {
                    underlying,
                    strike,
                    right,
                    ..
                } = &instrument.kind
                {
                    let Some((_, spot)) = self.prices.iter().find(|(s, _)| s == underlying) else {
                        continue;
                    };
                    ticks.push(Tick {
                        instrument: instrument.symbol.clone(),
                        price: Self::premium(*spot, *strike, *right),
                        size: f64::from(self.rng.gen_range(1u32..50)),
                        timestamp: now,
                    });
                }
            }

            for tick in ticks {
                if let Err(e) = self.connector.publish_tick(tick).await {
                    tracing::warn!("Synthetic feed stopping: {}", e);
                    return;
                }
            }
        }

        tracing::info!("Synthetic feed stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;
    use uuid::Uuid;

    fn create_test_connector(slippage_bps: f64) -> PaperConnector {
        PaperConnector::new(PaperSettings {
            starting_equity: 100_000.0,
            slippage_bps,
            fill_latency_ms: 1,
            ..PaperSettings::default()
        })
    }

    fn request(symbol: &str, side: Side, quantity: u32) -> OrderRequest {
        OrderRequest {
            client_order_id: Uuid::new_v4(),
            instrument: Instrument::equity(symbol, 1),
            side,
            quantity,
            order_type: crate::execution::OrderType::Market,
            reference_price: 0.0,
        }
    }

    fn tick(symbol: &str, price: f64) -> Tick {
        Tick {
            instrument: symbol.to_string(),
            price,
            size: 1.0,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_ack_then_fill_at_last_price() {
        let paper = create_test_connector(0.0);
        let mut events = paper.order_events().unwrap();
        assert_ok!(paper.publish_tick(tick("NIFTY", 100.0)).await);

        let req = request("NIFTY", Side::Buy, 10);
        let ack = paper.submit_order(&req).await.unwrap();
        assert_eq!(ack.client_order_id, req.client_order_id);
        assert!(ack.broker_ref.starts_with("PAPER-"));

        match events.recv().await.unwrap() {
            OrderEvent::Filled {
                order_id,
                price,
                quantity,
                ..
            } => {
                assert_eq!(order_id, req.client_order_id);
                assert_eq!(price, 100.0);
                assert_eq!(quantity, 10);
            }
            other => panic!("expected fill, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_slippage_is_adverse() {
        let paper = create_test_connector(20.0);
        paper.publish_tick(tick("NIFTY", 100.0)).await.unwrap();

        for _ in 0..20 {
            assert!(paper.slipped_price(100.0, Side::Buy) >= 100.0);
            assert!(paper.slipped_price(100.0, Side::Buy) <= 100.2);
            assert!(paper.slipped_price(100.0, Side::Sell) <= 100.0);
        }
    }

    #[tokio::test]
    async fn test_equity_tracks_realized_pnl() {
        let paper = create_test_connector(0.0);
        paper.publish_tick(tick("NIFTY", 100.0)).await.unwrap();
        paper.submit_order(&request("NIFTY", Side::Buy, 10)).await.unwrap();

        paper.publish_tick(tick("NIFTY", 105.0)).await.unwrap();
        paper.submit_order(&request("NIFTY", Side::Sell, 10)).await.unwrap();

        assert_eq!(paper.account_equity().await.unwrap(), 100_050.0);
        assert_eq!(paper.net_quantity("NIFTY"), 0);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let paper = create_test_connector(0.0);
        paper.publish_tick(tick("NIFTY", 100.0)).await.unwrap();
        paper.fail_next_submissions(1);

        let err = paper.submit_order(&request("NIFTY", Side::Buy, 1)).await.unwrap_err();
        assert!(err.is_transient());
        assert_ok!(paper.submit_order(&request("NIFTY", Side::Buy, 1)).await);
    }

    #[tokio::test]
    async fn test_no_price_is_rejected() {
        let paper = create_test_connector(0.0);
        let err = paper.submit_order(&request("NIFTY", Side::Buy, 1)).await.unwrap_err();
        assert!(matches!(err, ConnectorError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_streams_taken_once() {
        let paper = create_test_connector(0.0);
        assert_ok!(paper.stream_ticks());
        assert_eq!(
            paper.stream_ticks().unwrap_err(),
            ConnectorError::StreamTaken("tick")
        );
    }

    #[test]
    fn test_option_premium() {
        assert!((SyntheticFeed::premium(100.0, 95, OptionRight::Call) - 5.4).abs() < 1e-9);
        assert!((SyntheticFeed::premium(100.0, 95, OptionRight::Put) - 0.4).abs() < 1e-9);
    }
}
