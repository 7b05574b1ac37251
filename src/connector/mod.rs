// Broker / market-data connector boundary
pub mod paper;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::ConnectorError;
use crate::execution::{Order, OrderEvent, OrderType};
use crate::models::{Instrument, Side, Tick};

pub use paper::{PaperConnector, SyntheticFeed};

/// What the connector needs to place an order
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    /// Our order id; echoed back on every event for this order
    pub client_order_id: Uuid,
    pub instrument: Instrument,
    pub side: Side,
    pub quantity: u32,
    pub order_type: OrderType,
    pub reference_price: f64,
}

impl From<&Order> for OrderRequest {
    fn from(order: &Order) -> Self {
        Self {
            client_order_id: order.id,
            instrument: order.instrument.clone(),
            side: order.side,
            quantity: order.remaining(),
            order_type: order.order_type,
            reference_price: order.requested_price,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub client_order_id: Uuid,
    pub broker_ref: String,
}

/// Broker session: market data in, orders out, executions back as events.
///
/// Both streams can be taken once; the engine owns them for its lifetime.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn subscribe(&self, instruments: &[Instrument]) -> Result<(), ConnectorError>;

    fn stream_ticks(&self) -> Result<mpsc::Receiver<Tick>, ConnectorError>;

    /// Place an order. Returns once the broker has accepted it; fills,
    /// rejections and cancels arrive later on `order_events`.
    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderAck, ConnectorError>;

    fn order_events(&self) -> Result<mpsc::Receiver<OrderEvent>, ConnectorError>;

    async fn account_equity(&self) -> Result<f64, ConnectorError>;
}
