use thiserror::Error;
use uuid::Uuid;

use crate::execution::OrderState;

/// Errors surfaced by a broker/market-data connector.
///
/// Only `Transient` failures are worth retrying; everything else is final for
/// the request that produced it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectorError {
    #[error("transient connector error: {0}")]
    Transient(String),

    #[error("order rejected by connector: {0}")]
    Rejected(String),

    #[error("{0} stream already taken")]
    StreamTaken(&'static str),

    #[error("connector failure: {0}")]
    Fatal(String),
}

impl ConnectorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ConnectorError::Transient(_))
    }
}

/// State machine violations, rejected where they originate.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrderError {
    #[error("illegal order transition {from:?} -> {to:?} for order {order_id}")]
    IllegalTransition {
        order_id: Uuid,
        from: OrderState,
        to: OrderState,
    },

    #[error("order already in flight for {0}")]
    OrderInFlight(String),

    #[error("position already open for {0}")]
    PositionAlreadyOpen(String),

    #[error("position {0} is not open")]
    PositionNotOpen(Uuid),

    #[error("unknown order {0}")]
    UnknownOrder(Uuid),

    #[error("unknown position {0}")]
    UnknownPosition(Uuid),

    #[error("invalid order quantity {0}")]
    InvalidQuantity(u32),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("configuration validation failed ({count} violations):\n  - {details}")]
    Invalid { count: usize, details: String },
}

impl ConfigError {
    pub fn from_violations(errors: Vec<String>) -> Self {
        ConfigError::Invalid {
            count: errors.len(),
            details: errors.join("\n  - "),
        }
    }
}
