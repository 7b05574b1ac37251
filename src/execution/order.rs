use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::OrderError;
use crate::models::{ExitReason, Instrument, Side};

/// Order lifecycle. Moves forward only; terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderState {
    Pending,
    Submitted,
    Filled,
    Rejected,
    Cancelled,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Rejected | OrderState::Cancelled
        )
    }

    /// Fills and rejections may overtake the acknowledgement, so a pending
    /// order may jump straight to a terminal state.
    pub fn can_transition_to(&self, next: OrderState) -> bool {
        match self {
            OrderState::Pending => next != OrderState::Pending,
            OrderState::Submitted => next.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderPurpose {
    Entry,
    Exit(ExitReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub position_id: Uuid,
    pub instrument: Instrument,
    pub side: Side,
    pub quantity: u32,
    pub filled_quantity: u32,
    pub avg_fill_price: f64,
    pub order_type: OrderType,
    /// Price the decision was made at
    pub requested_price: f64,
    pub purpose: OrderPurpose,
    pub state: OrderState,
    /// Broker reference, known once acknowledged
    pub broker_ref: Option<String>,
    /// 1 for the first submission, 2 for the retry
    pub attempt: u8,
    pub reject_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_update_at: DateTime<Utc>,
}

impl Order {
    pub fn market(
        position_id: Uuid,
        instrument: Instrument,
        side: Side,
        quantity: u32,
        requested_price: f64,
        purpose: OrderPurpose,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            position_id,
            instrument,
            side,
            quantity,
            filled_quantity: 0,
            avg_fill_price: 0.0,
            order_type: OrderType::Market,
            requested_price,
            purpose,
            state: OrderState::Pending,
            broker_ref: None,
            attempt: 1,
            reject_reason: None,
            created_at: now,
            last_update_at: now,
        }
    }

    /// Fresh order for the same intent, one attempt later
    pub fn retry(&self, now: DateTime<Utc>) -> Self {
        let mut next = Self::market(
            self.position_id,
            self.instrument.clone(),
            self.side,
            self.remaining(),
            self.requested_price,
            self.purpose,
            now,
        );
        next.attempt = self.attempt.saturating_add(1);
        next
    }

    pub fn is_entry(&self) -> bool {
        self.purpose == OrderPurpose::Entry
    }

    pub fn remaining(&self) -> u32 {
        self.quantity.saturating_sub(self.filled_quantity)
    }

    pub fn transition(&mut self, next: OrderState, now: DateTime<Utc>) -> Result<(), OrderError> {
        if !self.state.can_transition_to(next) {
            return Err(OrderError::IllegalTransition {
                order_id: self.id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.last_update_at = now;
        Ok(())
    }

    /// Record an execution. Completes the order once fully filled.
    pub fn apply_fill(&mut self, price: f64, quantity: u32, now: DateTime<Utc>) -> Result<u32, OrderError> {
        if self.state.is_terminal() {
            return Err(OrderError::IllegalTransition {
                order_id: self.id,
                from: self.state,
                to: OrderState::Filled,
            });
        }
        let quantity = quantity.min(self.remaining());
        if quantity == 0 {
            return Err(OrderError::InvalidQuantity(quantity));
        }

        let notional = self.avg_fill_price * f64::from(self.filled_quantity) + price * f64::from(quantity);
        self.filled_quantity += quantity;
        self.avg_fill_price = notional / f64::from(self.filled_quantity);

        let next = if self.remaining() == 0 {
            OrderState::Filled
        } else {
            OrderState::Submitted
        };
        if next != self.state {
            self.transition(next, now)?;
        } else {
            self.last_update_at = now;
        }
        Ok(quantity)
    }
}

/// Asynchronous news about an order, from the connector or the submitter
#[derive(Debug, Clone, PartialEq)]
pub enum OrderEvent {
    Acknowledged {
        order_id: Uuid,
        broker_ref: String,
        at: DateTime<Utc>,
    },
    Filled {
        order_id: Uuid,
        price: f64,
        quantity: u32,
        at: DateTime<Utc>,
    },
    Rejected {
        order_id: Uuid,
        reason: String,
        at: DateTime<Utc>,
    },
    Cancelled {
        order_id: Uuid,
        at: DateTime<Utc>,
    },
}

impl OrderEvent {
    pub fn order_id(&self) -> Uuid {
        match self {
            OrderEvent::Acknowledged { order_id, .. }
            | OrderEvent::Filled { order_id, .. }
            | OrderEvent::Rejected { order_id, .. }
            | OrderEvent::Cancelled { order_id, .. } => *order_id,
        }
    }
}
