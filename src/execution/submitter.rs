use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use super::order::Order;
use crate::connector::{Connector, OrderAck, OrderRequest};
use crate::error::ConnectorError;

type SubmitRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Outcome of handing an order to the connector
#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionResult {
    Accepted { order_id: Uuid, ack: OrderAck },
    Failed { order_id: Uuid, error: ConnectorError },
}

impl SubmissionResult {
    pub fn order_id(&self) -> Uuid {
        match self {
            SubmissionResult::Accepted { order_id, .. } | SubmissionResult::Failed { order_id, .. } => *order_id,
        }
    }
}

/// Sends orders to the connector off the caller's task.
///
/// Submissions are throttled to the configured orders-per-second and each one
/// reports back on the results channel, so the event loop owns every state
/// change regardless of which path an order took.
#[derive(Clone)]
pub struct OrderSubmitter {
    connector: Arc<dyn Connector>,
    rate_limiter: Arc<SubmitRateLimiter>,
    results: mpsc::Sender<SubmissionResult>,
    tracker: TaskTracker,
}

impl OrderSubmitter {
    pub fn new(
        connector: Arc<dyn Connector>,
        max_orders_per_second: u32,
        results: mpsc::Sender<SubmissionResult>,
    ) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(max_orders_per_second).unwrap_or(NonZeroU32::MIN));
        Self {
            connector,
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
            results,
            tracker: TaskTracker::new(),
        }
    }

    /// Queue an order, optionally after a delay (retry backoff)
    pub fn submit(&self, order: &Order, delay: Option<Duration>) {
        let request = OrderRequest::from(order);
        let connector = self.connector.clone();
        let limiter = self.rate_limiter.clone();
        let results = self.results.clone();

        self.tracker.spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            limiter.until_ready().await;

            let order_id = request.client_order_id;
            let result = match connector.submit_order(&request).await {
                Ok(ack) => {
                    tracing::debug!(
                        order_id = %order_id,
                        broker_ref = %ack.broker_ref,
                        "Order accepted: {} {} x{}",
                        request.side.as_str(),
                        request.instrument,
                        request.quantity
                    );
                    SubmissionResult::Accepted { order_id, ack }
                }
                Err(error) => {
                    tracing::warn!(order_id = %order_id, "Order submission failed: {}", error);
                    SubmissionResult::Failed { order_id, error }
                }
            };

            if results.send(result).await.is_err() {
                tracing::warn!(order_id = %order_id, "Submission result dropped, event loop gone");
            }
        });
    }

    /// Submissions still waiting on the limiter or the connector
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Wait for every queued submission to finish
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}
