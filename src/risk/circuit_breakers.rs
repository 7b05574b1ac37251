use serde::{Deserialize, Serialize};

use crate::config::RiskSettings;

/// Portfolio-level limits checked before any new entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakers {
    pub max_open_positions: usize,
    pub max_daily_loss_pct: f64,
    pub max_consecutive_losses: u32,
}

impl Default for CircuitBreakers {
    fn default() -> Self {
        Self::from(&RiskSettings::default())
    }
}

impl From<&RiskSettings> for CircuitBreakers {
    fn from(risk: &RiskSettings) -> Self {
        Self {
            max_open_positions: risk.max_open_positions,
            max_daily_loss_pct: risk.max_daily_loss_pct,
            max_consecutive_losses: risk.max_consecutive_losses,
        }
    }
}

/// What the breakers look at
#[derive(Debug, Clone, Default)]
pub struct TradingState {
    /// Open positions plus entries still in flight
    pub open_positions: usize,
    pub daily_realized_pnl: f64,
    pub consecutive_losses: u32,
    /// Set once the daily floor was breached; cleared only at the day roll
    pub daily_loss_latched: bool,
    pub session_start_equity: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerTrip {
    MaxOpenPositions,
    DailyLoss,
    ConsecutiveLosses,
}

impl CircuitBreakers {
    /// Loss level (negative) at which trading stops for the day
    pub fn daily_loss_floor(&self, session_start_equity: f64) -> f64 {
        -(session_start_equity * self.max_daily_loss_pct / 100.0)
    }

    /// Checks in order: position cap, daily loss floor, loss streak
    pub fn check(&self, state: &TradingState) -> Result<(), CircuitBreakerTrip> {
        if state.open_positions >= self.max_open_positions {
            return Err(CircuitBreakerTrip::MaxOpenPositions);
        }

        let floor = self.daily_loss_floor(state.session_start_equity);
        if state.daily_loss_latched || state.daily_realized_pnl <= floor {
            return Err(CircuitBreakerTrip::DailyLoss);
        }

        if state.consecutive_losses >= self.max_consecutive_losses {
            return Err(CircuitBreakerTrip::ConsecutiveLosses);
        }

        Ok(())
    }
}
