use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::mpsc;
use tokio::time::Duration;

use crate::config::{InstrumentSettings, Settings};
use crate::connector::Connector;
use crate::error::OrderError;
use crate::execution::{Order, OrderEvent, OrderSubmitter, OrderUpdate, PositionManager, SubmissionResult};
use crate::feed::{CandleAggregator, ClosedCandle};
use crate::indicators::{IndicatorEngine, IndicatorSnapshot};
use crate::ledger::{LedgerStore, TradeLedger};
use crate::market_hours::{Clock, SessionPhase};
use crate::models::{atm_strike, weekly_expiry, Candle, Direction, Instrument, OptionRight, Signal, Tick};
use crate::persistence::CandleArchive;
use crate::risk::{PortfolioState, RiskManager};
use crate::strategy::{ConfirmationStrategy, Strategy};

/// Candles and the indicators computed from them, locked together so a
/// reader never sees a candle without its snapshot.
pub(crate) struct MarketData {
    pub aggregator: CandleAggregator,
    pub indicators: IndicatorEngine,
}

impl MarketData {
    fn fold(&mut self, closed: &[ClosedCandle]) {
        for c in closed {
            if c.candle.synthetic {
                tracing::debug!(
                    instrument = %c.candle.instrument,
                    index = c.index,
                    "Synthetic flat candle @ {:.2}",
                    c.candle.close
                );
            }
            self.indicators.on_candle(c);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Everything one trading session shares between the engine's tasks.
///
/// Lock order where more than one is held: `positions`, then `ledger`.
/// No lock is held across an await.
pub struct Session {
    pub(crate) settings: Settings,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) connector: Arc<dyn Connector>,
    store: Arc<dyn LedgerStore>,
    archive_tx: Option<mpsc::Sender<Candle>>,
    pub(crate) market: RwLock<MarketData>,
    pub(crate) positions: Mutex<PositionManager>,
    pub(crate) ledger: Mutex<TradeLedger>,
    risk: RiskManager,
    strategy: Box<dyn Strategy>,
    kill_switch: AtomicBool,
    session_equity: Mutex<f64>,
    last_evaluated: Mutex<HashMap<String, u64>>,
    contracts: Mutex<HashSet<String>>,
    alerts: Mutex<Vec<String>>,
    pub(crate) submitter: OrderSubmitter,
}

impl Session {
    pub(crate) fn new(
        settings: Settings,
        clock: Arc<dyn Clock>,
        connector: Arc<dyn Connector>,
        store: Arc<dyn LedgerStore>,
        archive_tx: Option<mpsc::Sender<Candle>>,
        submitter: OrderSubmitter,
    ) -> Self {
        let risk = RiskManager::new(&settings.risk, &settings.session);
        let strategy: Box<dyn Strategy> = Box::new(ConfirmationStrategy::new(
            &settings.indicators,
            settings.signals.clone(),
        ));

        let mut aggregator = CandleAggregator::new(
            settings.candles.interval_secs,
            settings.candles.close_grace_ms,
            settings.candles.max_history,
        );
        for inst in &settings.instruments {
            aggregator.subscribe(&inst.symbol);
        }

        let today = risk.hours().trading_day(clock.now());
        let starting_equity = settings.paper.starting_equity;

        tracing::info!(
            "Session for {} using strategy '{}' (warm-up {} candles)",
            today,
            strategy.name(),
            strategy.min_candles_required()
        );

        Self {
            market: RwLock::new(MarketData {
                aggregator,
                indicators: IndicatorEngine::new(settings.indicators.clone()),
            }),
            positions: Mutex::new(PositionManager::new(settings.exits.clone())),
            // floor is set once the connector reports equity
            ledger: Mutex::new(TradeLedger::new(today, f64::NEG_INFINITY)),
            risk,
            strategy,
            kill_switch: AtomicBool::new(false),
            session_equity: Mutex::new(starting_equity),
            last_evaluated: Mutex::new(HashMap::new()),
            contracts: Mutex::new(HashSet::new()),
            alerts: Mutex::new(Vec::new()),
            settings,
            clock,
            connector,
            store,
            archive_tx,
            submitter,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn risk(&self) -> &RiskManager {
        &self.risk
    }

    pub fn set_kill_switch(&self, engaged: bool) -> bool {
        self.kill_switch.swap(engaged, Ordering::SeqCst)
    }

    pub fn kill_switch(&self) -> bool {
        self.kill_switch.load(Ordering::SeqCst)
    }

    pub fn session_equity(&self) -> f64 {
        *lock(&self.session_equity)
    }

    pub fn alerts(&self) -> Vec<String> {
        lock(&self.alerts).clone()
    }

    fn instrument_settings(&self, symbol: &str) -> Option<&InstrumentSettings> {
        self.settings.instruments.iter().find(|i| i.symbol == symbol)
    }

    /// Restore ledger and positions for today, then warm indicators from
    /// the candle archive.
    pub(crate) async fn recover(&self, archive: Option<&CandleArchive>) -> crate::Result<Vec<Instrument>> {
        let now = self.now();
        let today = self.risk.hours().trading_day(now);

        let equity = self.connector.account_equity().await?;
        *lock(&self.session_equity) = equity;
        let floor = self.risk.breakers().daily_loss_floor(equity);

        let state = self.store.load_session_state(today).await?;
        let restored: Vec<Instrument> = state.open_positions.iter().map(|p| p.instrument.clone()).collect();
        {
            let mut positions = lock(&self.positions);
            let mut ledger = lock(&self.ledger);
            ledger.roll_day(today, floor);
            ledger.set_daily_loss_floor(floor);
            positions.restore(state.open_positions.clone(), now);
            ledger.restore(state);
        }

        if !restored.is_empty() {
            let mut market = self.market_write();
            for instrument in &restored {
                market.aggregator.subscribe(&instrument.symbol);
            }
        }

        if let Some(archive) = archive {
            self.warm_up(archive, now).await;
        }

        tracing::info!(
            "Session equity {:.2}, daily loss floor {:.2}",
            equity,
            floor
        );

        Ok(restored)
    }

    async fn warm_up(&self, archive: &CandleArchive, now: DateTime<Utc>) {
        let lookback = self.settings.candles.interval_secs as i64 * self.settings.candles.max_history as i64;
        // yesterday's candles would bridge the overnight gap with flats
        let since = (now - chrono::Duration::seconds(lookback)).max(self.risk.hours().day_start(now));

        for inst in &self.settings.instruments {
            let candles = match archive.load_since(&inst.symbol, since).await {
                Ok(candles) => candles,
                Err(e) => {
                    tracing::warn!("Candle warm-up for {} failed: {}", inst.symbol, e);
                    continue;
                }
            };

            let mut market = self.market_write();
            let closed = market.aggregator.seed_history(candles);
            market.fold(&closed);
            if let Some(last) = closed.last() {
                // history is for indicators only, never a fresh signal
                lock(&self.last_evaluated).insert(inst.symbol.clone(), last.index);
                tracing::info!(
                    "Warmed {} with {} archived candles (through #{})",
                    inst.symbol,
                    closed.len(),
                    last.index
                );
            }
        }
    }

    fn market_write(&self) -> std::sync::RwLockWriteGuard<'_, MarketData> {
        match self.market.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn market_read(&self) -> std::sync::RwLockReadGuard<'_, MarketData> {
        match self.market.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn archive(&self, closed: &[ClosedCandle]) {
        let Some(tx) = &self.archive_tx else {
            return;
        };
        for c in closed {
            if tx.try_send(c.candle.clone()).is_err() {
                tracing::debug!(instrument = %c.candle.instrument, "Candle archive backlog, candle not stored");
            }
        }
    }

    /// Aggregate one tick; folds any candles it closed into the indicators
    pub fn on_tick(&self, tick: &Tick) -> usize {
        let closed = {
            let mut market = self.market_write();
            let closed = market.aggregator.on_tick(tick);
            market.fold(&closed);
            closed
        };
        self.archive(&closed);
        closed.len()
    }

    /// Close intervals the clock has moved past, even without ticks
    pub fn close_due_candles(&self, now: DateTime<Utc>) -> usize {
        let closed = {
            let mut market = self.market_write();
            let closed = market.aggregator.advance_to(now);
            market.fold(&closed);
            closed
        };
        self.archive(&closed);
        closed.len()
    }

    pub fn last_prices(&self) -> HashMap<String, f64> {
        self.market_read().aggregator.last_prices()
    }

    pub fn latest_snapshot(&self, symbol: &str) -> Option<Arc<IndicatorSnapshot>> {
        self.market_read().indicators.latest(symbol)
    }

    pub fn dropped_ticks(&self) -> u64 {
        self.market_read().aggregator.stats().dropped()
    }

    /// Trading-day boundary: reset daily P&L, loss streak and latch
    async fn roll_day_if_needed(&self, now: DateTime<Utc>) {
        let today = self.risk.hours().trading_day(now);
        if lock(&self.ledger).trading_day() == Some(today) {
            return;
        }

        let equity = match self.connector.account_equity().await {
            Ok(equity) => equity,
            Err(e) => {
                tracing::warn!("Equity unavailable at day roll, keeping {:.2}: {}", self.session_equity(), e);
                self.session_equity()
            }
        };
        *lock(&self.session_equity) = equity;
        let floor = self.risk.breakers().daily_loss_floor(equity);

        {
            let mut positions = lock(&self.positions);
            let mut ledger = lock(&self.ledger);
            ledger.roll_day(today, floor);
            positions.prune();
        }
        self.market_write().aggregator.reset_session();
    }

    /// One scheduler tick: close due candles, then signal, risk-check and
    /// submit entries for underlyings with a fresh candle and nothing live.
    pub async fn scheduler_pass(&self) -> usize {
        let now = self.now();
        self.roll_day_if_needed(now).await;

        if self.risk.hours().phase(now) == SessionPhase::Closed {
            return 0;
        }
        self.close_due_candles(now);

        let fresh: Vec<Arc<IndicatorSnapshot>> = {
            let market = self.market_read();
            let mut last_evaluated = lock(&self.last_evaluated);
            self.settings
                .instruments
                .iter()
                .filter_map(|inst| {
                    let snapshot = market.indicators.latest(&inst.symbol)?;
                    let seen = last_evaluated.entry(inst.symbol.clone()).or_insert(0);
                    if snapshot.candle_index <= *seen {
                        return None;
                    }
                    *seen = snapshot.candle_index;
                    Some(snapshot)
                })
                .collect()
        };

        let mut submitted = 0;
        for snapshot in fresh {
            if lock(&self.positions).is_engaged(&snapshot.instrument) {
                tracing::debug!(
                    instrument = %snapshot.instrument,
                    "Skipping signal, position or order already live"
                );
                continue;
            }

            let signal = self.strategy.evaluate(&snapshot);
            if !signal.is_actionable() {
                continue;
            }
            tracing::info!(
                instrument = %signal.instrument,
                candle = signal.candle_index,
                "Signal {:?} (confidence {:.2}, {} bull / {} bear)",
                signal.direction,
                signal.confidence,
                signal.bullish,
                signal.bearish
            );

            let Some(signal) = self.select_variant(signal, now).await else {
                continue;
            };
            if self.enter(&signal, now).await {
                submitted += 1;
            }
        }
        submitted
    }

    /// Attach the contract to trade: the underlying itself, or the ATM
    /// call (long) / put (short) when options are enabled.
    async fn select_variant(&self, signal: Signal, now: DateTime<Utc>) -> Option<Signal> {
        let inst = self.instrument_settings(&signal.instrument)?;
        let stop_loss_pct = self.settings.exits.stop_loss_pct;
        let spot = self.market_read().aggregator.last_price(&inst.symbol)?;

        if !self.settings.options.enabled {
            let variant = Instrument::equity(&inst.symbol, inst.lot_size);
            return Some(signal.with_variant(variant, spot, stop_loss_pct));
        }

        let strike = atm_strike(spot, inst.strike_interval.unwrap_or(0));
        let weekday = self.settings.options.expiry_weekday()?;
        if strike == 0 {
            return None;
        }
        let expiry = weekly_expiry(self.risk.hours().trading_day(now), weekday);
        let right = match signal.direction {
            Direction::Long => OptionRight::Call,
            Direction::Short => OptionRight::Put,
            Direction::None => return None,
        };
        let contract = Instrument::option(
            &inst.symbol,
            strike,
            expiry,
            right,
            inst.option_lot_size.unwrap_or(inst.lot_size),
        );

        let first_use = lock(&self.contracts).insert(contract.symbol.clone());
        if first_use {
            self.market_write().aggregator.subscribe(&contract.symbol);
            if let Err(e) = self.connector.subscribe(std::slice::from_ref(&contract)).await {
                lock(&self.contracts).remove(&contract.symbol);
                tracing::warn!("Subscribing {} failed: {}", contract, e);
                return None;
            }
        }

        let Some(premium) = self.market_read().aggregator.last_price(&contract.symbol) else {
            tracing::debug!(
                instrument = %signal.instrument,
                "No price yet for {}, dropping signal for this candle",
                contract
            );
            return None;
        };
        Some(signal.with_variant(contract, premium, stop_loss_pct))
    }

    /// Risk-gate the signal and submit its entry. Returns true if submitted.
    async fn enter(&self, signal: &Signal, now: DateTime<Utc>) -> bool {
        let equity = match self.connector.account_equity().await {
            Ok(equity) => equity,
            Err(e) => {
                tracing::warn!(instrument = %signal.instrument, "Equity unavailable, skipping entry: {}", e);
                return false;
            }
        };

        let order = {
            let mut positions = lock(&self.positions);
            let ledger = lock(&self.ledger);
            // kill switch read under the positions lock, right before the order exists
            let state = PortfolioState {
                now,
                kill_switch: self.kill_switch(),
                equity,
                trading: ledger.trading_state(positions.exposure_count(), self.session_equity()),
            };
            let decision = self.risk.evaluate(signal, &state);
            if !decision.is_approved() {
                return false;
            }

            let (Some(variant), Some(side), Some(price)) =
                (signal.variant.clone(), signal.entry_side(), signal.reference_price)
            else {
                return false;
            };
            tracing::info!(instrument = %signal.instrument, "Risk approved: {}", decision.reason);

            match positions.open_entry(variant, side, decision.quantity(), price, now) {
                Ok(order) => order,
                Err(e) => {
                    tracing::warn!(instrument = %signal.instrument, "Entry not created: {}", e);
                    return false;
                }
            }
        };

        tracing::info!(
            order_id = %order.id,
            "Submitting entry {} {} x{} @ ~{:.2}",
            order.side.as_str(),
            order.instrument,
            order.quantity,
            order.requested_price
        );
        self.submitter.submit(&order, None);
        true
    }

    /// One exit-monitor pass over every idle open position
    pub fn exit_pass(&self) -> usize {
        let now = self.now();
        let phase = self.risk.hours().phase(now);
        let prices = self.last_prices();
        let exits = lock(&self.positions).check_exits(&prices, now, phase);
        self.submit_all(&exits)
    }

    /// Exit every open position now (manual flatten)
    pub fn flatten_all(&self) -> usize {
        let now = self.now();
        let prices = self.last_prices();
        let exits = lock(&self.positions).flatten_all(&prices, now);
        tracing::warn!("Manual flatten: {} exit orders", exits.len());
        self.submit_all(&exits)
    }

    fn submit_all(&self, orders: &[Order]) -> usize {
        for order in orders {
            self.submitter.submit(order, None);
        }
        orders.len()
    }

    pub async fn handle_order_event(&self, event: OrderEvent) {
        let settled = {
            let mut positions = lock(&self.positions);
            let result = positions.apply_event(&event);
            self.record(event.order_id(), result)
        };
        if let Some((update, trading_day)) = settled {
            self.persist(update, trading_day).await;
        }
    }

    pub async fn handle_submission(&self, result: SubmissionResult) {
        match result {
            SubmissionResult::Accepted { order_id, ack } => {
                self.handle_order_event(OrderEvent::Acknowledged {
                    order_id,
                    broker_ref: ack.broker_ref,
                    at: self.now(),
                })
                .await;
            }
            SubmissionResult::Failed { order_id, error } => {
                let now = self.now();
                let settled = {
                    let mut positions = lock(&self.positions);
                    let result = positions.submit_failed(order_id, &error.to_string(), now);
                    self.record(order_id, result)
                };
                if let Some((update, trading_day)) = settled {
                    self.persist(update, trading_day).await;
                }
            }
        }
    }

    /// Carry a state-machine update into the ledger.
    ///
    /// Must be called with the positions guard still held: a position the
    /// scheduler sees as closed always has its trade counted by the risk gate.
    fn record(
        &self,
        order_id: uuid::Uuid,
        result: Result<OrderUpdate, OrderError>,
    ) -> Option<(OrderUpdate, NaiveDate)> {
        let update = match result {
            Ok(update) => update,
            Err(OrderError::UnknownOrder(_)) => {
                tracing::debug!(order_id = %order_id, "Event for an order no longer tracked");
                return None;
            }
            Err(e) => {
                tracing::warn!(order_id = %order_id, "Order event rejected: {}", e);
                return None;
            }
        };

        let mut ledger = lock(&self.ledger);
        if let Some(order) = update.terminal_order.clone() {
            ledger.record_terminal_order(order);
        }
        if let Some(position) = update.position.clone() {
            ledger.upsert_position(position);
        }
        if let Some(trade) = update.trade.clone() {
            ledger.record_trade(trade);
        }
        let trading_day = ledger
            .trading_day()
            .unwrap_or_else(|| self.risk.hours().trading_day(self.now()));
        Some((update, trading_day))
    }

    /// Store writes, retry submission and alerts; runs with no lock held
    async fn persist(&self, update: OrderUpdate, trading_day: NaiveDate) {
        if let Some(position) = &update.position {
            if let Err(e) = self.store.upsert_position(position).await {
                tracing::error!(position_id = %position.id, "Failed to persist position: {}", e);
            }
        }
        if let Some(trade) = &update.trade {
            if let Err(e) = self.store.append_trade(trading_day, trade).await {
                tracing::error!(position_id = %trade.position_id, "Failed to persist trade: {}", e);
            }
        }
        if let Some(retry) = &update.retry {
            let backoff = Duration::from_millis(self.settings.engine.retry_backoff_ms);
            self.submitter.submit(retry, Some(backoff));
        }
        if let Some(alert) = update.alert {
            lock(&self.alerts).push(alert);
        }
    }

    /// Orders not yet terminal, including those still being submitted
    pub fn in_flight_orders(&self) -> usize {
        lock(&self.positions).in_flight_orders()
    }

    pub fn unrealized_pnl(&self) -> f64 {
        let prices = self.last_prices();
        lock(&self.positions).unrealized_pnl(&prices)
    }
}
