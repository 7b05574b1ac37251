// Trade ledger: closed trades, open positions, daily P&L
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use uuid::Uuid;

use crate::execution::{Order, Position, PositionState};
use crate::models::Trade;
use crate::risk::TradingState;
use crate::Result;

/// What survives a restart within the same trading day
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub trading_day: Option<NaiveDate>,
    pub daily_realized_pnl: f64,
    pub consecutive_losses: u32,
    pub open_positions: Vec<Position>,
}

impl SessionState {
    /// Replay one day's trades (oldest first) into P&L and loss streak
    pub fn from_trades<'a>(
        trading_day: NaiveDate,
        trades: impl IntoIterator<Item = &'a Trade>,
        open_positions: Vec<Position>,
    ) -> Self {
        let mut state = SessionState {
            trading_day: Some(trading_day),
            open_positions,
            ..SessionState::default()
        };
        for trade in trades {
            state.daily_realized_pnl += trade.realized_pnl;
            if trade.is_loss() {
                state.consecutive_losses += 1;
            } else {
                state.consecutive_losses = 0;
            }
        }
        state
    }
}

/// Durable backing for the ledger
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn append_trade(&self, trading_day: NaiveDate, trade: &Trade) -> Result<()>;

    async fn upsert_position(&self, position: &Position) -> Result<()>;

    async fn load_session_state(&self, trading_day: NaiveDate) -> Result<SessionState>;
}

/// Process-local store for paper runs and tests
#[derive(Default)]
pub struct MemoryLedgerStore {
    trades: Mutex<Vec<(NaiveDate, Trade)>>,
    positions: Mutex<HashMap<Uuid, Position>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trades(&self) -> Vec<Trade> {
        self.trades
            .lock()
            .map(|t| t.iter().map(|(_, trade)| trade.clone()).collect())
            .unwrap_or_default()
    }

    pub fn position(&self, id: Uuid) -> Option<Position> {
        self.positions.lock().ok()?.get(&id).cloned()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn append_trade(&self, trading_day: NaiveDate, trade: &Trade) -> Result<()> {
        let mut trades = self.trades.lock().map_err(|e| e.to_string())?;
        if trades.iter().any(|(_, t)| t.position_id == trade.position_id) {
            return Ok(());
        }
        trades.push((trading_day, trade.clone()));
        Ok(())
    }

    async fn upsert_position(&self, position: &Position) -> Result<()> {
        self.positions
            .lock()
            .map_err(|e| e.to_string())?
            .insert(position.id, position.clone());
        Ok(())
    }

    async fn load_session_state(&self, trading_day: NaiveDate) -> Result<SessionState> {
        let open_positions = self
            .positions
            .lock()
            .map_err(|e| e.to_string())?
            .values()
            .filter(|p| p.state != PositionState::Closed)
            .cloned()
            .collect();

        let trades = self.trades.lock().map_err(|e| e.to_string())?;
        let todays = trades
            .iter()
            .filter(|(day, _)| *day == trading_day)
            .map(|(_, trade)| trade);
        Ok(SessionState::from_trades(trading_day, todays, open_positions))
    }
}

/// Authoritative in-memory record the risk gate reads.
///
/// Each closed position is recorded exactly once; recording a second trade
/// for the same position is a no-op.
#[derive(Debug, Default)]
pub struct TradeLedger {
    trading_day: Option<NaiveDate>,
    trades: Vec<Trade>,
    recorded_positions: HashSet<Uuid>,
    terminal_orders: Vec<Order>,
    open_positions: HashMap<Uuid, Position>,
    daily_realized_pnl: f64,
    consecutive_losses: u32,
    daily_loss_floor: f64,
    daily_loss_latched: bool,
}

impl TradeLedger {
    pub fn new(trading_day: NaiveDate, daily_loss_floor: f64) -> Self {
        Self {
            trading_day: Some(trading_day),
            daily_loss_floor,
            ..Self::default()
        }
    }

    /// Record a closed trade. Returns false if this position was already recorded.
    pub fn record_trade(&mut self, trade: Trade) -> bool {
        if !self.recorded_positions.insert(trade.position_id) {
            tracing::warn!(position_id = %trade.position_id, "Duplicate trade for closed position ignored");
            return false;
        }

        self.daily_realized_pnl += trade.realized_pnl;
        if trade.is_loss() {
            self.consecutive_losses += 1;
        } else {
            self.consecutive_losses = 0;
        }
        self.open_positions.remove(&trade.position_id);

        tracing::info!(
            instrument = %trade.instrument,
            exit_reason = trade.exit_reason.as_str(),
            "Trade closed: {} x{} {:.2} -> {:.2}, P&L {:+.2} (day {:+.2}, loss streak {})",
            trade.side.as_str(),
            trade.quantity,
            trade.entry_price,
            trade.exit_price,
            trade.realized_pnl,
            self.daily_realized_pnl,
            self.consecutive_losses
        );

        self.trades.push(trade);
        self.check_daily_floor();
        true
    }

    fn check_daily_floor(&mut self) {
        if !self.daily_loss_latched && self.daily_realized_pnl <= self.daily_loss_floor {
            self.daily_loss_latched = true;
            tracing::error!(
                "Daily loss floor {:.2} breached ({:.2}), entries halted until the next trading day",
                self.daily_loss_floor,
                self.daily_realized_pnl
            );
        }
    }

    /// Keep a read-only copy of an order that reached a terminal state
    pub fn record_terminal_order(&mut self, order: Order) {
        if order.state.is_terminal() {
            self.terminal_orders.push(order);
        }
    }

    pub fn upsert_position(&mut self, position: Position) {
        if position.state == PositionState::Closed {
            self.open_positions.remove(&position.id);
        } else {
            self.open_positions.insert(position.id, position);
        }
    }

    /// Trading-day boundary: P&L, streak and latch start over. Only the
    /// current day's trades are kept in memory; the store has the rest.
    pub fn roll_day(&mut self, trading_day: NaiveDate, daily_loss_floor: f64) {
        if self.trading_day == Some(trading_day) {
            return;
        }
        tracing::info!(
            "Trading day {} -> {}: closing day P&L {:+.2} over {} trades",
            self.trading_day.map(|d| d.to_string()).unwrap_or_else(|| "-".to_string()),
            trading_day,
            self.daily_realized_pnl,
            self.trades.len()
        );
        self.trading_day = Some(trading_day);
        self.daily_loss_floor = daily_loss_floor;
        self.daily_realized_pnl = 0.0;
        self.consecutive_losses = 0;
        self.daily_loss_latched = false;
        self.trades.clear();
        self.recorded_positions.clear();
        self.terminal_orders.clear();
    }

    /// Resume from persisted state (same trading day)
    pub fn restore(&mut self, state: SessionState) {
        if state.trading_day.is_some() {
            self.trading_day = state.trading_day;
        }
        self.daily_realized_pnl = state.daily_realized_pnl;
        self.consecutive_losses = state.consecutive_losses;
        for position in state.open_positions {
            self.upsert_position(position);
        }
        self.check_daily_floor();
        tracing::info!(
            "Ledger restored: day P&L {:+.2}, loss streak {}, {} open positions",
            self.daily_realized_pnl,
            self.consecutive_losses,
            self.open_positions.len()
        );
    }

    pub fn set_daily_loss_floor(&mut self, floor: f64) {
        self.daily_loss_floor = floor;
        self.check_daily_floor();
    }

    pub fn daily_realized_pnl(&self) -> f64 {
        self.daily_realized_pnl
    }

    pub fn consecutive_losses(&self) -> u32 {
        self.consecutive_losses
    }

    pub fn open_position_count(&self) -> usize {
        self.open_positions.len()
    }

    pub fn is_daily_loss_latched(&self) -> bool {
        self.daily_loss_latched
    }

    pub fn trading_day(&self) -> Option<NaiveDate> {
        self.trading_day
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn terminal_orders(&self) -> &[Order] {
        &self.terminal_orders
    }

    /// Breaker inputs; `exposure` counts open positions plus entries in flight
    pub fn trading_state(&self, exposure: usize, session_start_equity: f64) -> TradingState {
        TradingState {
            open_positions: exposure.max(self.open_positions.len()),
            daily_realized_pnl: self.daily_realized_pnl,
            consecutive_losses: self.consecutive_losses,
            daily_loss_latched: self.daily_loss_latched,
            session_start_equity,
        }
    }
}
