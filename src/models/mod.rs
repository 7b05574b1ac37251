pub mod instrument;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use instrument::{atm_strike, option_symbol, weekly_expiry, Instrument, InstrumentKind, OptionRight};

/// Single trade print from the market-data stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tick {
    pub instrument: String,
    pub price: f64,
    pub size: f64,
    /// Exchange timestamp
    pub timestamp: DateTime<Utc>,
}

/// OHLCV bar; `timestamp` is the interval start
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub instrument: String,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Filled in for an interval without ticks
    #[serde(default)]
    pub synthetic: bool,
}

impl Candle {
    /// Flat bar at `price` with no volume.
    pub fn flat(instrument: &str, timestamp: DateTime<Utc>, price: f64) -> Self {
        Self {
            instrument: instrument.to_string(),
            timestamp,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 0.0,
            synthetic: true,
        }
    }

    pub fn is_well_formed(&self) -> bool {
        self.low <= self.open.min(self.close) && self.high >= self.open.max(self.close)
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Direction {
    Long,
    Short,
    None,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "Buy",
            Side::Sell => "Sell",
        }
    }

    pub fn parse(s: &str) -> Option<Side> {
        match s {
            "Buy" => Some(Side::Buy),
            "Sell" => Some(Side::Sell),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    TrailingStop,
    TimeExit,
    EndOfDay,
    Manual,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "StopLoss",
            ExitReason::TakeProfit => "TakeProfit",
            ExitReason::TrailingStop => "TrailingStop",
            ExitReason::TimeExit => "TimeExit",
            ExitReason::EndOfDay => "EndOfDay",
            ExitReason::Manual => "Manual",
        }
    }

    pub fn parse(s: &str) -> Option<ExitReason> {
        match s {
            "StopLoss" => Some(ExitReason::StopLoss),
            "TakeProfit" => Some(ExitReason::TakeProfit),
            "TrailingStop" => Some(ExitReason::TrailingStop),
            "TimeExit" => Some(ExitReason::TimeExit),
            "EndOfDay" => Some(ExitReason::EndOfDay),
            "Manual" => Some(ExitReason::Manual),
            _ => None,
        }
    }
}

/// Directional call produced from one closed candle.
///
/// `variant`, `reference_price` and `stop_distance` are filled in once the
/// contract to trade has been chosen.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub instrument: String,
    pub direction: Direction,
    pub confidence: f64,
    pub bullish: u8,
    pub bearish: u8,
    pub candle_index: u64,
    pub generated_at: DateTime<Utc>,
    pub variant: Option<Instrument>,
    pub reference_price: Option<f64>,
    pub stop_distance: f64,
}

impl Signal {
    pub fn none(instrument: &str, candle_index: u64, generated_at: DateTime<Utc>) -> Self {
        Self {
            instrument: instrument.to_string(),
            direction: Direction::None,
            confidence: 0.0,
            bullish: 0,
            bearish: 0,
            candle_index,
            generated_at,
            variant: None,
            reference_price: None,
            stop_distance: 0.0,
        }
    }

    pub fn is_actionable(&self) -> bool {
        self.direction != Direction::None
    }

    /// Attach the contract to trade, its current price and the stop distance
    /// implied by `stop_loss_pct`.
    pub fn with_variant(mut self, variant: Instrument, reference_price: f64, stop_loss_pct: f64) -> Self {
        self.stop_distance = reference_price * stop_loss_pct / 100.0;
        self.variant = Some(variant);
        self.reference_price = Some(reference_price);
        self
    }

    /// Side of the entry order. Option contracts are always bought.
    pub fn entry_side(&self) -> Option<Side> {
        let variant = self.variant.as_ref()?;
        match (self.direction, variant.is_option()) {
            (Direction::None, _) => None,
            (_, true) => Some(Side::Buy),
            (Direction::Long, false) => Some(Side::Buy),
            (Direction::Short, false) => Some(Side::Sell),
        }
    }
}

/// Closed position's final record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trade {
    pub id: Uuid,
    pub position_id: Uuid,
    pub instrument: String,
    /// Side of the entry
    pub side: Side,
    pub quantity: u32,
    pub entry_price: f64,
    pub exit_price: f64,
    pub realized_pnl: f64,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub holding_secs: i64,
    pub exit_reason: ExitReason,
}

impl Trade {
    pub fn is_loss(&self) -> bool {
        self.realized_pnl < 0.0
    }
}

/// P&L of `quantity` units entered on `side` at `entry` and closed at `exit`.
pub fn realized_pnl(side: Side, entry: f64, exit: f64, quantity: u32) -> f64 {
    let per_unit = match side {
        Side::Buy => exit - entry,
        Side::Sell => entry - exit,
    };
    per_unit * f64::from(quantity)
}
