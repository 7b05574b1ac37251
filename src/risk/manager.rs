use chrono::{DateTime, Utc};
use std::fmt;

use super::circuit_breakers::{CircuitBreakerTrip, CircuitBreakers, TradingState};
use crate::config::{RiskSettings, SessionSettings};
use crate::market_hours::{MarketHours, SessionPhase};
use crate::models::{Direction, Signal};

/// Everything the risk gate reads about the portfolio at decision time
#[derive(Debug, Clone)]
pub struct PortfolioState {
    pub now: DateTime<Utc>,
    pub kill_switch: bool,
    pub equity: f64,
    pub trading: TradingState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NoDirection,
    OutsideSession,
    FlattenWindow,
    KillSwitch,
    MaxOpenPositions,
    DailyLossLimit,
    ConsecutiveLosses,
    NoVariant,
    ZeroStopDistance,
    ZeroQuantity,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectReason::NoDirection => "signal has no direction",
            RejectReason::OutsideSession => "outside trading session",
            RejectReason::FlattenWindow => "flatten-only window before close",
            RejectReason::KillSwitch => "kill switch engaged",
            RejectReason::MaxOpenPositions => "open position cap reached",
            RejectReason::DailyLossLimit => "daily loss limit breached",
            RejectReason::ConsecutiveLosses => "consecutive loss cap reached",
            RejectReason::NoVariant => "no tradable contract selected",
            RejectReason::ZeroStopDistance => "stop distance is zero",
            RejectReason::ZeroQuantity => "sized quantity is below one lot",
        };
        f.write_str(s)
    }
}

impl From<CircuitBreakerTrip> for RejectReason {
    fn from(trip: CircuitBreakerTrip) -> Self {
        match trip {
            CircuitBreakerTrip::MaxOpenPositions => RejectReason::MaxOpenPositions,
            CircuitBreakerTrip::DailyLoss => RejectReason::DailyLossLimit,
            CircuitBreakerTrip::ConsecutiveLosses => RejectReason::ConsecutiveLosses,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RiskAction {
    Approve { quantity: u32 },
    Reject(RejectReason),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RiskDecision {
    pub action: RiskAction,
    pub reason: String,
}

impl RiskDecision {
    fn approve(quantity: u32, reason: String) -> Self {
        Self {
            action: RiskAction::Approve { quantity },
            reason,
        }
    }

    fn reject(reason: RejectReason) -> Self {
        Self {
            action: RiskAction::Reject(reason),
            reason: reason.to_string(),
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self.action, RiskAction::Approve { .. })
    }

    pub fn quantity(&self) -> u32 {
        match self.action {
            RiskAction::Approve { quantity } => quantity,
            RiskAction::Reject(_) => 0,
        }
    }

    pub fn rejection(&self) -> Option<RejectReason> {
        match self.action {
            RiskAction::Reject(reason) => Some(reason),
            RiskAction::Approve { .. } => None,
        }
    }
}

/// `floor((equity * risk% / stop_distance) / lot) * lot`
pub fn position_size(equity: f64, risk_pct: f64, stop_distance: f64, lot_size: u32) -> u32 {
    if !(stop_distance.is_finite() && stop_distance > 0.0) || lot_size == 0 || equity <= 0.0 {
        return 0;
    }
    let units = equity * risk_pct / 100.0 / stop_distance;
    let lots = (units / f64::from(lot_size)).floor();
    if !lots.is_finite() || lots < 1.0 {
        return 0;
    }
    (lots as u32).saturating_mul(lot_size)
}

/// Gate between signals and orders.
///
/// `evaluate` is pure apart from logging; the first failing rule wins.
#[derive(Debug, Clone)]
pub struct RiskManager {
    hours: MarketHours,
    breakers: CircuitBreakers,
    risk_per_trade_pct: f64,
}

impl RiskManager {
    pub fn new(risk: &RiskSettings, session: &SessionSettings) -> Self {
        Self {
            hours: MarketHours::new(session),
            breakers: CircuitBreakers::from(risk),
            risk_per_trade_pct: risk.risk_per_trade_pct,
        }
    }

    pub fn breakers(&self) -> &CircuitBreakers {
        &self.breakers
    }

    pub fn hours(&self) -> &MarketHours {
        &self.hours
    }

    pub fn evaluate(&self, signal: &Signal, state: &PortfolioState) -> RiskDecision {
        if signal.direction == Direction::None {
            return RiskDecision::reject(RejectReason::NoDirection);
        }

        match self.hours.phase(state.now) {
            SessionPhase::Open => {}
            SessionPhase::FlattenOnly => return self.rejected(signal, RejectReason::FlattenWindow),
            SessionPhase::Closed => return self.rejected(signal, RejectReason::OutsideSession),
        }

        if state.kill_switch {
            return self.rejected(signal, RejectReason::KillSwitch);
        }

        if let Err(trip) = self.breakers.check(&state.trading) {
            return self.rejected(signal, trip.into());
        }

        let Some(variant) = signal.variant.as_ref() else {
            return self.rejected(signal, RejectReason::NoVariant);
        };
        if !(signal.stop_distance.is_finite() && signal.stop_distance > 0.0) {
            return self.rejected(signal, RejectReason::ZeroStopDistance);
        }

        let quantity = position_size(
            state.equity,
            self.risk_per_trade_pct,
            signal.stop_distance,
            variant.lot_size,
        );
        if quantity == 0 {
            return self.rejected(signal, RejectReason::ZeroQuantity);
        }

        RiskDecision::approve(
            quantity,
            format!(
                "risking {:.1}% of {:.0} over stop {:.2}: {} x {}",
                self.risk_per_trade_pct, state.equity, signal.stop_distance, quantity, variant.symbol
            ),
        )
    }

    fn rejected(&self, signal: &Signal, reason: RejectReason) -> RiskDecision {
        match reason {
            RejectReason::OutsideSession | RejectReason::FlattenWindow => tracing::debug!(
                instrument = %signal.instrument,
                candle = signal.candle_index,
                "Risk rejected signal: {}",
                reason
            ),
            _ => tracing::warn!(
                instrument = %signal.instrument,
                candle = signal.candle_index,
                direction = ?signal.direction,
                "Risk rejected signal: {}",
                reason
            ),
        }
        RiskDecision::reject(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Instrument;
    use chrono::{FixedOffset, TimeZone};

    fn session_time(h: u32, m: u32) -> DateTime<Utc> {
        FixedOffset::east_opt(330 * 60)
            .unwrap()
            .with_ymd_and_hms(2024, 1, 2, h, m, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn create_test_manager() -> RiskManager {
        RiskManager::new(
            &RiskSettings {
                risk_per_trade_pct: 1.0,
                max_daily_loss_pct: 3.0,
                max_consecutive_losses: 3,
                max_open_positions: 2,
            },
            &SessionSettings::default(),
        )
    }

    fn create_test_signal(stop_distance: f64) -> Signal {
        let mut signal = Signal::none("NIFTY", 12, session_time(10, 0));
        signal.direction = Direction::Long;
        signal.confidence = 0.8;
        signal.variant = Some(Instrument::equity("NIFTY", 25));
        signal.reference_price = Some(1000.0);
        signal.stop_distance = stop_distance;
        signal
    }

    fn create_test_state() -> PortfolioState {
        PortfolioState {
            now: session_time(10, 0),
            kill_switch: false,
            equity: 100_000.0,
            trading: TradingState {
                session_start_equity: 100_000.0,
                ..TradingState::default()
            },
        }
    }

    #[test]
    fn test_sizing_floors_to_lots() {
        let decision = create_test_manager().evaluate(&create_test_signal(10.0), &create_test_state());
        assert!(decision.is_approved());
        // floor((1000 / 10) / 25) * 25
        assert_eq!(decision.quantity(), 100);
    }

    #[test]
    fn test_position_size_rounds_down() {
        assert_eq!(position_size(100_000.0, 1.0, 12.0, 25), 75);
        assert_eq!(position_size(100_000.0, 1.0, 50.0, 25), 0);
        assert_eq!(position_size(100_000.0, 1.0, 0.0, 25), 0);
    }

    #[test]
    fn test_zero_stop_distance_rejected() {
        let decision = create_test_manager().evaluate(&create_test_signal(0.0), &create_test_state());
        assert_eq!(decision.rejection(), Some(RejectReason::ZeroStopDistance));
    }

    #[test]
    fn test_quantity_below_one_lot_rejected() {
        let decision = create_test_manager().evaluate(&create_test_signal(80.0), &create_test_state());
        assert_eq!(decision.rejection(), Some(RejectReason::ZeroQuantity));
    }

    #[test]
    fn test_outside_hours_rejected_first() {
        let mut state = create_test_state();
        state.now = session_time(8, 0);
        state.kill_switch = true;
        let decision = create_test_manager().evaluate(&create_test_signal(10.0), &state);
        assert_eq!(decision.rejection(), Some(RejectReason::OutsideSession));
    }

    #[test]
    fn test_flatten_window_rejects_entries() {
        let mut state = create_test_state();
        state.now = session_time(15, 20);
        let decision = create_test_manager().evaluate(&create_test_signal(10.0), &state);
        assert_eq!(decision.rejection(), Some(RejectReason::FlattenWindow));
    }

    #[test]
    fn test_kill_switch_before_breakers() {
        let mut state = create_test_state();
        state.kill_switch = true;
        state.trading.open_positions = 5;
        let decision = create_test_manager().evaluate(&create_test_signal(10.0), &state);
        assert_eq!(decision.rejection(), Some(RejectReason::KillSwitch));
    }

    #[test]
    fn test_position_cap() {
        let mut state = create_test_state();
        state.trading.open_positions = 2;
        let decision = create_test_manager().evaluate(&create_test_signal(10.0), &state);
        assert_eq!(decision.rejection(), Some(RejectReason::MaxOpenPositions));
    }

    #[test]
    fn test_three_losses_reject_next_signal() {
        let mut state = create_test_state();
        state.trading.consecutive_losses = 3;
        let decision = create_test_manager().evaluate(&create_test_signal(10.0), &state);
        assert_eq!(decision.rejection(), Some(RejectReason::ConsecutiveLosses));
    }

    #[test]
    fn test_daily_floor_rejects_every_signal() {
        let manager = create_test_manager();
        let mut state = create_test_state();
        state.trading.daily_realized_pnl = -3000.0;
        state.trading.daily_loss_latched = true;

        for stop in [5.0, 10.0, 20.0] {
            let decision = manager.evaluate(&create_test_signal(stop), &state);
            assert_eq!(decision.rejection(), Some(RejectReason::DailyLossLimit));
        }

        // a later winner lifts P&L above the floor, the latch still holds
        state.trading.daily_realized_pnl = -1000.0;
        let decision = manager.evaluate(&create_test_signal(10.0), &state);
        assert_eq!(decision.rejection(), Some(RejectReason::DailyLossLimit));
    }

    #[test]
    fn test_no_direction_rejected() {
        let mut signal = create_test_signal(10.0);
        signal.direction = Direction::None;
        let decision = create_test_manager().evaluate(&signal, &create_test_state());
        assert_eq!(decision.rejection(), Some(RejectReason::NoDirection));
    }
}
