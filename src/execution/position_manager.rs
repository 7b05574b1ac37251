use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::order::{Order, OrderEvent, OrderPurpose, OrderState};
use crate::config::ExitSettings;
use crate::error::OrderError;
use crate::market_hours::SessionPhase;
use crate::models::{realized_pnl, ExitReason, Instrument, Side, Trade};

pub const MAX_SUBMIT_ATTEMPTS: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionState {
    Open,
    Closing,
    Closed,
}

impl PositionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionState::Open => "Open",
            PositionState::Closing => "Closing",
            PositionState::Closed => "Closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Open" => Some(PositionState::Open),
            "Closing" => Some(PositionState::Closing),
            "Closed" => Some(PositionState::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailingState {
    pub active: bool,
    /// Most favourable price since entry
    pub best_price: f64,
    pub stop: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitRules {
    pub stop_price: f64,
    pub target_price: f64,
    pub trailing: TrailingState,
    pub expires_at: DateTime<Utc>,
}

impl ExitRules {
    /// Stop and target anchored at the actual entry price
    pub fn anchored(side: Side, entry: f64, entry_time: DateTime<Utc>, settings: &ExitSettings) -> Self {
        let sl = settings.stop_loss_pct / 100.0;
        let tp = settings.take_profit_pct / 100.0;
        let (stop_price, target_price) = match side {
            Side::Buy => (entry * (1.0 - sl), entry * (1.0 + tp)),
            Side::Sell => (entry * (1.0 + sl), entry * (1.0 - tp)),
        };
        Self {
            stop_price,
            target_price,
            trailing: TrailingState {
                active: false,
                best_price: entry,
                stop: None,
            },
            expires_at: entry_time + Duration::minutes(settings.max_hold_minutes),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub instrument: Instrument,
    pub side: Side,
    /// Units currently open
    pub quantity: u32,
    /// Units bought (or sold) on entry
    pub entry_quantity: u32,
    pub avg_entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub exit_rules: ExitRules,
    pub state: PositionState,
    /// The one non-terminal order allowed for this position
    pub active_order: Option<Uuid>,
    pub exit_reason: Option<ExitReason>,
    pub exit_filled_quantity: u32,
    pub exit_notional: f64,
    pub realized_pnl: f64,
    pub alert: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Positive for long exposure, negative for short
    pub fn signed_quantity(&self) -> i64 {
        let qty = i64::from(self.quantity);
        match self.side {
            Side::Buy => qty,
            Side::Sell => -qty,
        }
    }

    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        realized_pnl(self.side, self.avg_entry_price, price, self.quantity)
    }

    pub fn profit_pct(&self, price: f64) -> f64 {
        if self.avg_entry_price <= 0.0 {
            return 0.0;
        }
        match self.side {
            Side::Buy => (price - self.avg_entry_price) / self.avg_entry_price * 100.0,
            Side::Sell => (self.avg_entry_price - price) / self.avg_entry_price * 100.0,
        }
    }

    fn avg_exit_price(&self) -> f64 {
        if self.exit_filled_quantity == 0 {
            return 0.0;
        }
        self.exit_notional / f64::from(self.exit_filled_quantity)
    }
}

/// What an order event changed
#[derive(Debug, Clone, Default)]
pub struct OrderUpdate {
    /// Copy of the order if it reached a terminal state
    pub terminal_order: Option<Order>,
    /// Position after the event, if it changed
    pub position: Option<Position>,
    /// Emitted once, when an exit fill closes the position
    pub trade: Option<Trade>,
    /// Exit order to resubmit after the backoff
    pub retry: Option<Order>,
    pub alert: Option<String>,
}

/// Owns orders until terminal and positions until closed.
///
/// Every mutation goes through `&mut self`, so a caller holding the lock sees
/// position transitions atomically with respect to fills and the exit monitor.
pub struct PositionManager {
    exits: ExitSettings,
    positions: HashMap<Uuid, Position>,
    orders: HashMap<Uuid, Order>,
}

impl PositionManager {
    pub fn new(exits: ExitSettings) -> Self {
        Self {
            exits,
            positions: HashMap::new(),
            orders: HashMap::new(),
        }
    }

    /// Take over positions recovered from the ledger store
    pub fn restore(&mut self, positions: Vec<Position>, now: DateTime<Utc>) {
        for mut position in positions {
            if position.state == PositionState::Closed || position.quantity == 0 {
                continue;
            }
            // whatever was in flight before the restart is unknown now
            position.state = PositionState::Open;
            position.active_order = None;
            position.updated_at = now;
            tracing::info!(
                "Restored {} position {} in {} ({} @ {:.2})",
                position.side.as_str(),
                position.id,
                position.instrument,
                position.quantity,
                position.avg_entry_price
            );
            self.positions.insert(position.id, position);
        }
    }

    /// Create the entry order for a new position
    pub fn open_entry(
        &mut self,
        instrument: Instrument,
        side: Side,
        quantity: u32,
        reference_price: f64,
        now: DateTime<Utc>,
    ) -> Result<Order, OrderError> {
        if quantity == 0 {
            return Err(OrderError::InvalidQuantity(quantity));
        }
        if self.has_open_position(&instrument.symbol) {
            return Err(OrderError::PositionAlreadyOpen(instrument.symbol));
        }
        if self.has_pending_order(&instrument.symbol) {
            return Err(OrderError::OrderInFlight(instrument.symbol));
        }

        let order = Order::market(
            Uuid::new_v4(),
            instrument,
            side,
            quantity,
            reference_price,
            OrderPurpose::Entry,
            now,
        );
        self.orders.insert(order.id, order.clone());
        Ok(order)
    }

    pub fn apply_event(&mut self, event: &OrderEvent) -> Result<OrderUpdate, OrderError> {
        match event {
            OrderEvent::Acknowledged {
                order_id,
                broker_ref,
                at,
            } => self.on_ack(*order_id, broker_ref, *at),
            OrderEvent::Filled {
                order_id,
                price,
                quantity,
                at,
            } => self.on_fill(*order_id, *price, *quantity, *at),
            OrderEvent::Rejected {
                order_id,
                reason,
                at,
            } => self.on_failure(*order_id, reason, *at),
            OrderEvent::Cancelled { order_id, at } => self.on_cancel(*order_id, *at),
        }
    }

    /// The connector refused the submission outright
    pub fn submit_failed(
        &mut self,
        order_id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<OrderUpdate, OrderError> {
        self.on_failure(order_id, error, now)
    }

    fn on_ack(&mut self, order_id: Uuid, broker_ref: &str, at: DateTime<Utc>) -> Result<OrderUpdate, OrderError> {
        let order = self
            .orders
            .get_mut(&order_id)
            .ok_or(OrderError::UnknownOrder(order_id))?;

        if order.broker_ref.is_none() {
            order.broker_ref = Some(broker_ref.to_string());
        }
        if order.state == OrderState::Pending {
            order.transition(OrderState::Submitted, at)?;
        }
        Ok(OrderUpdate::default())
    }

    fn on_fill(
        &mut self,
        order_id: Uuid,
        price: f64,
        quantity: u32,
        at: DateTime<Utc>,
    ) -> Result<OrderUpdate, OrderError> {
        let order = self
            .orders
            .get_mut(&order_id)
            .ok_or(OrderError::UnknownOrder(order_id))?;
        let applied = order.apply_fill(price, quantity, at)?;
        let order = order.clone();

        let mut update = OrderUpdate {
            terminal_order: order.state.is_terminal().then(|| order.clone()),
            ..OrderUpdate::default()
        };

        match order.purpose {
            OrderPurpose::Entry => {
                let position = self.apply_entry_fill(&order, price, applied, at);
                tracing::info!(
                    "Entry fill {} {} x{} @ {:.2} (position {}, {} open)",
                    order.side.as_str(),
                    order.instrument,
                    applied,
                    price,
                    position.id,
                    position.quantity
                );
                update.position = Some(position);
            }
            OrderPurpose::Exit(reason) => {
                let position = self
                    .positions
                    .get_mut(&order.position_id)
                    .ok_or(OrderError::UnknownPosition(order.position_id))?;

                let applied = applied.min(position.quantity);
                position.quantity -= applied;
                position.exit_filled_quantity += applied;
                position.exit_notional += price * f64::from(applied);
                position.realized_pnl += realized_pnl(position.side, position.avg_entry_price, price, applied);
                position.updated_at = at;

                if order.state.is_terminal() {
                    position.active_order = None;
                    if position.quantity == 0 {
                        position.state = PositionState::Closed;
                        position.exit_reason = Some(reason);
                        update.trade = Some(Self::close_trade(position, reason, at));
                    } else {
                        position.state = PositionState::Open;
                    }
                }
                update.position = Some(position.clone());
            }
        }

        Ok(update)
    }

    fn apply_entry_fill(&mut self, order: &Order, price: f64, quantity: u32, at: DateTime<Utc>) -> Position {
        let active_order = (!order.state.is_terminal()).then_some(order.id);

        let position = self
            .positions
            .entry(order.position_id)
            .and_modify(|p| {
                let notional = p.avg_entry_price * f64::from(p.quantity) + price * f64::from(quantity);
                p.quantity += quantity;
                p.entry_quantity += quantity;
                p.avg_entry_price = notional / f64::from(p.quantity);
                p.exit_rules = ExitRules::anchored(p.side, p.avg_entry_price, p.entry_time, &self.exits);
                p.active_order = active_order;
                p.updated_at = at;
            })
            .or_insert_with(|| Position {
                id: order.position_id,
                instrument: order.instrument.clone(),
                side: order.side,
                quantity,
                entry_quantity: quantity,
                avg_entry_price: price,
                entry_time: at,
                exit_rules: ExitRules::anchored(order.side, price, at, &self.exits),
                state: PositionState::Open,
                active_order,
                exit_reason: None,
                exit_filled_quantity: 0,
                exit_notional: 0.0,
                realized_pnl: 0.0,
                alert: None,
                updated_at: at,
            });
        position.clone()
    }

    fn close_trade(position: &Position, reason: ExitReason, at: DateTime<Utc>) -> Trade {
        Trade {
            id: Uuid::new_v4(),
            position_id: position.id,
            instrument: position.instrument.symbol.clone(),
            side: position.side,
            quantity: position.entry_quantity,
            entry_price: position.avg_entry_price,
            exit_price: position.avg_exit_price(),
            realized_pnl: position.realized_pnl,
            entry_time: position.entry_time,
            exit_time: at,
            holding_secs: (at - position.entry_time).num_seconds(),
            exit_reason: reason,
        }
    }

    /// Rejection by the broker or failed submission.
    ///
    /// Entries are abandoned. Exits are retried once with a fresh order; a
    /// second failure raises an alert and hands the position back to the
    /// exit monitor.
    fn on_failure(&mut self, order_id: Uuid, reason: &str, at: DateTime<Utc>) -> Result<OrderUpdate, OrderError> {
        let order = self
            .orders
            .get_mut(&order_id)
            .ok_or(OrderError::UnknownOrder(order_id))?;
        order.transition(OrderState::Rejected, at)?;
        order.reject_reason = Some(reason.to_string());
        let order = order.clone();

        let mut update = OrderUpdate {
            terminal_order: Some(order.clone()),
            ..OrderUpdate::default()
        };

        let Some(position) = self.positions.get_mut(&order.position_id) else {
            tracing::warn!(
                "Entry {} for {} rejected: {} (abandoned)",
                order.id,
                order.instrument,
                reason
            );
            return Ok(update);
        };

        position.updated_at = at;
        if order.is_entry() {
            // partially filled entry: keep what we got
            position.active_order = None;
            update.position = Some(position.clone());
            return Ok(update);
        }

        if order.attempt < MAX_SUBMIT_ATTEMPTS {
            let retry = order.retry(at);
            position.active_order = Some(retry.id);
            tracing::warn!(
                "Exit {} for position {} failed: {} (retrying as {})",
                order.id,
                position.id,
                reason,
                retry.id
            );
            self.orders.insert(retry.id, retry.clone());
            update.retry = Some(retry);
        } else {
            let alert = format!(
                "exit for {} failed {} times, last error: {}",
                position.instrument, order.attempt, reason
            );
            tracing::error!(position_id = %position.id, "ALERT: {}", alert);
            position.state = PositionState::Open;
            position.active_order = None;
            position.alert = Some(alert.clone());
            update.alert = Some(alert);
            update.position = Some(position.clone());
        }

        Ok(update)
    }

    fn on_cancel(&mut self, order_id: Uuid, at: DateTime<Utc>) -> Result<OrderUpdate, OrderError> {
        let order = self
            .orders
            .get_mut(&order_id)
            .ok_or(OrderError::UnknownOrder(order_id))?;
        order.transition(OrderState::Cancelled, at)?;
        let order = order.clone();

        let mut update = OrderUpdate {
            terminal_order: Some(order.clone()),
            ..OrderUpdate::default()
        };

        if let Some(position) = self.positions.get_mut(&order.position_id) {
            position.active_order = None;
            if position.state == PositionState::Closing {
                position.state = PositionState::Open;
            }
            position.updated_at = at;
            update.position = Some(position.clone());
        }
        tracing::info!("Order {} for {} cancelled", order.id, order.instrument);
        Ok(update)
    }

    /// One pass of the exit monitor over every idle open position.
    ///
    /// Priority per position: stop-loss, take-profit, trailing stop, then
    /// time/end-of-day. Returns the exit orders to submit.
    pub fn check_exits(
        &mut self,
        prices: &HashMap<String, f64>,
        now: DateTime<Utc>,
        phase: SessionPhase,
    ) -> Vec<Order> {
        let mut exits = Vec::new();
        let ids: Vec<Uuid> = self
            .positions
            .values()
            .filter(|p| p.state == PositionState::Open && p.active_order.is_none())
            .map(|p| p.id)
            .collect();

        for id in ids {
            let Some(position) = self.positions.get_mut(&id) else {
                continue;
            };
            let Some(&price) = prices.get(&position.instrument.symbol) else {
                continue;
            };

            Self::update_trailing(position, price, &self.exits);
            if let Some(reason) = Self::exit_reason(position, price, now, phase) {
                exits.push(self.create_exit(id, reason, price, now));
            }
        }
        exits.into_iter().flatten().collect()
    }

    /// Exit orders for every open position without an order in flight
    pub fn flatten_all(&mut self, prices: &HashMap<String, f64>, now: DateTime<Utc>) -> Vec<Order> {
        let ids: Vec<(Uuid, f64)> = self
            .positions
            .values()
            .filter(|p| p.state == PositionState::Open && p.active_order.is_none())
            .map(|p| {
                let price = prices
                    .get(&p.instrument.symbol)
                    .copied()
                    .unwrap_or(p.avg_entry_price);
                (p.id, price)
            })
            .collect();

        ids.into_iter()
            .filter_map(|(id, price)| self.create_exit(id, ExitReason::Manual, price, now))
            .collect()
    }

    fn update_trailing(position: &mut Position, price: f64, settings: &ExitSettings) {
        let profit_pct = position.profit_pct(price);
        let trailing = &mut position.exit_rules.trailing;

        trailing.best_price = match position.side {
            Side::Buy => trailing.best_price.max(price),
            Side::Sell => trailing.best_price.min(price),
        };

        if !trailing.active && profit_pct >= settings.trailing_activation_pct {
            trailing.active = true;
        }
        if !trailing.active {
            return;
        }

        let trail = settings.trailing_pct / 100.0;
        trailing.stop = Some(match (position.side, trailing.stop) {
            (Side::Buy, Some(stop)) => stop.max(trailing.best_price * (1.0 - trail)),
            (Side::Buy, None) => trailing.best_price * (1.0 - trail),
            (Side::Sell, Some(stop)) => stop.min(trailing.best_price * (1.0 + trail)),
            (Side::Sell, None) => trailing.best_price * (1.0 + trail),
        });
    }

    fn exit_reason(
        position: &Position,
        price: f64,
        now: DateTime<Utc>,
        phase: SessionPhase,
    ) -> Option<ExitReason> {
        let rules = &position.exit_rules;
        let (hit_stop, hit_target, hit_trail) = match position.side {
            Side::Buy => (
                price <= rules.stop_price,
                price >= rules.target_price,
                rules.trailing.stop.is_some_and(|s| price <= s),
            ),
            Side::Sell => (
                price >= rules.stop_price,
                price <= rules.target_price,
                rules.trailing.stop.is_some_and(|s| price >= s),
            ),
        };

        if hit_stop {
            Some(ExitReason::StopLoss)
        } else if hit_target {
            Some(ExitReason::TakeProfit)
        } else if hit_trail {
            Some(ExitReason::TrailingStop)
        } else if phase != SessionPhase::Open {
            Some(ExitReason::EndOfDay)
        } else if now >= rules.expires_at {
            Some(ExitReason::TimeExit)
        } else {
            None
        }
    }

    fn create_exit(&mut self, position_id: Uuid, reason: ExitReason, price: f64, now: DateTime<Utc>) -> Option<Order> {
        let position = self.positions.get_mut(&position_id)?;
        if position.active_order.is_some() || position.state != PositionState::Open {
            return None;
        }

        let order = Order::market(
            position.id,
            position.instrument.clone(),
            position.side.opposite(),
            position.quantity,
            price,
            OrderPurpose::Exit(reason),
            now,
        );
        position.state = PositionState::Closing;
        position.active_order = Some(order.id);
        position.updated_at = now;

        tracing::info!(
            "Exit {:?} for {} position {} x{} @ {:.2} (entry {:.2})",
            reason,
            position.instrument,
            position.id,
            position.quantity,
            price,
            position.avg_entry_price
        );

        self.orders.insert(order.id, order.clone());
        Some(order)
    }

    /// Open or closing positions
    pub fn open_positions(&self) -> Vec<&Position> {
        self.positions
            .values()
            .filter(|p| p.state != PositionState::Closed)
            .collect()
    }

    pub fn position(&self, id: Uuid) -> Option<&Position> {
        self.positions.get(&id)
    }

    pub fn order(&self, id: Uuid) -> Option<&Order> {
        self.orders.get(&id)
    }

    pub fn has_open_position(&self, symbol: &str) -> bool {
        self.positions
            .values()
            .any(|p| p.instrument.symbol == symbol && p.state != PositionState::Closed)
    }

    pub fn has_pending_order(&self, symbol: &str) -> bool {
        self.orders
            .values()
            .any(|o| o.instrument.symbol == symbol && !o.state.is_terminal())
    }

    /// Any live position or order on a contract derived from `underlying`
    pub fn is_engaged(&self, underlying: &str) -> bool {
        self.positions
            .values()
            .any(|p| p.state != PositionState::Closed && p.instrument.underlying() == underlying)
            || self
                .orders
                .values()
                .any(|o| !o.state.is_terminal() && o.instrument.underlying() == underlying)
    }

    /// Open positions plus entries still awaiting a fill; what the position cap counts
    pub fn exposure_count(&self) -> usize {
        let pending_entries = self
            .orders
            .values()
            .filter(|o| o.is_entry() && !o.state.is_terminal() && !self.positions.contains_key(&o.position_id))
            .count();
        self.open_positions().len() + pending_entries
    }

    pub fn in_flight_orders(&self) -> usize {
        self.orders.values().filter(|o| !o.state.is_terminal()).count()
    }

    pub fn non_terminal_orders_for(&self, position_id: Uuid) -> usize {
        self.orders
            .values()
            .filter(|o| o.position_id == position_id && !o.state.is_terminal())
            .count()
    }

    pub fn unrealized_pnl(&self, prices: &HashMap<String, f64>) -> f64 {
        self.open_positions()
            .iter()
            .filter_map(|p| prices.get(&p.instrument.symbol).map(|price| p.unrealized_pnl(*price)))
            .sum()
    }

    /// Drop closed positions and terminal orders (trading-day boundary)
    pub fn prune(&mut self) {
        self.positions.retain(|_, p| p.state != PositionState::Closed);
        let live: Vec<Uuid> = self.positions.keys().copied().collect();
        self.orders
            .retain(|_, o| !o.state.is_terminal() || live.contains(&o.position_id));
    }
}
