// Risk gate: trading window, kill switch, circuit breakers, sizing
pub mod circuit_breakers;
pub mod manager;

pub use circuit_breakers::{CircuitBreakerTrip, CircuitBreakers, TradingState};
pub use manager::{position_size, PortfolioState, RejectReason, RiskAction, RiskDecision, RiskManager};
