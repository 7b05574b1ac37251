use chrono::{NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;

pub const DEFAULT_CONFIG_PATH: &str = "config/scalper.toml";
const ENV_PREFIX: &str = "SCALPER";

/// Complete runtime configuration.
///
/// Every field has a default so a partial TOML file (or none at all) is
/// enough to start. Environment variables override the file, e.g.
/// `SCALPER__RISK__MAX_OPEN_POSITIONS=2`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub session: SessionSettings,
    pub candles: CandleSettings,
    pub indicators: IndicatorSettings,
    pub signals: SignalSettings,
    pub risk: RiskSettings,
    pub exits: ExitSettings,
    pub engine: EngineSettings,
    pub paper: PaperSettings,
    pub options: OptionSettings,
    pub instruments: Vec<InstrumentSettings>,
}

/// Exchange trading window, expressed in exchange-local time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub open: NaiveTime,
    pub close: NaiveTime,
    /// Entries are refused and open positions flattened this close to the bell.
    pub flatten_minutes_before_close: u32,
    pub utc_offset_minutes: i32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            open: NaiveTime::from_hms_opt(9, 15, 0).unwrap_or_default(),
            close: NaiveTime::from_hms_opt(15, 30, 0).unwrap_or_default(),
            flatten_minutes_before_close: 15,
            utc_offset_minutes: 330,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CandleSettings {
    pub interval_secs: u64,
    /// How long after a boundary the clock waits for stragglers before closing a candle.
    pub close_grace_ms: u64,
    pub max_history: usize,
}

impl Default for CandleSettings {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            close_grace_ms: 500,
            max_history: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorSettings {
    pub ema_short: usize,
    pub ema_long: usize,
    pub atr_period: usize,
    pub supertrend_period: usize,
    pub supertrend_multiplier: f64,
    pub momentum_period: usize,
    pub volume_period: usize,
}

impl Default for IndicatorSettings {
    fn default() -> Self {
        Self {
            ema_short: 9,
            ema_long: 21,
            atr_period: 14,
            supertrend_period: 10,
            supertrend_multiplier: 3.0,
            momentum_period: 5,
            volume_period: 20,
        }
    }
}

impl IndicatorSettings {
    /// Candles needed before every indicator is defined.
    pub fn warmup_candles(&self) -> usize {
        self.ema_short
            .max(self.ema_long)
            .max(self.atr_period)
            .max(self.supertrend_period)
            .max(self.momentum_period + 1)
            .max(self.volume_period + 1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalSettings {
    pub min_confirmations: u8,
    pub momentum_threshold_pct: f64,
    pub volume_surge_multiplier: f64,
}

impl Default for SignalSettings {
    fn default() -> Self {
        Self {
            min_confirmations: 3,
            momentum_threshold_pct: 0.1,
            volume_surge_multiplier: 1.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskSettings {
    pub risk_per_trade_pct: f64,
    pub max_daily_loss_pct: f64,
    pub max_consecutive_losses: u32,
    pub max_open_positions: usize,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            risk_per_trade_pct: 1.0,
            max_daily_loss_pct: 3.0,
            max_consecutive_losses: 3,
            max_open_positions: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitSettings {
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub trailing_activation_pct: f64,
    pub trailing_pct: f64,
    pub max_hold_minutes: i64,
}

impl Default for ExitSettings {
    fn default() -> Self {
        Self {
            stop_loss_pct: 1.0,
            take_profit_pct: 2.0,
            trailing_activation_pct: 1.0,
            trailing_pct: 0.5,
            max_hold_minutes: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub scheduler_interval_ms: u64,
    pub exit_monitor_interval_ms: u64,
    pub tick_queue_capacity: usize,
    pub max_orders_per_second: u32,
    pub retry_backoff_ms: u64,
    pub drain_timeout_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            scheduler_interval_ms: 1000,
            exit_monitor_interval_ms: 250,
            tick_queue_capacity: 10_000,
            max_orders_per_second: 5,
            retry_backoff_ms: 500,
            drain_timeout_ms: 5000,
        }
    }
}

/// Paper broker and synthetic feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaperSettings {
    pub starting_equity: f64,
    pub slippage_bps: f64,
    pub fill_latency_ms: u64,
    pub tick_interval_ms: u64,
    pub volatility_bps: f64,
    pub seed: u64,
}

impl Default for PaperSettings {
    fn default() -> Self {
        Self {
            starting_equity: 100_000.0,
            slippage_bps: 5.0,
            fill_latency_ms: 50,
            tick_interval_ms: 250,
            volatility_bps: 8.0,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptionSettings {
    /// Buy calls/puts on the signal's underlying instead of trading it directly.
    pub enabled: bool,
    pub expiry_weekday: String,
}

impl Default for OptionSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            expiry_weekday: "Thursday".to_string(),
        }
    }
}

impl OptionSettings {
    pub fn expiry_weekday(&self) -> Option<Weekday> {
        self.expiry_weekday.parse().ok()
    }
}

/// One traded underlying.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentSettings {
    pub symbol: String,
    pub lot_size: u32,
    /// Strike spacing of the option chain; required when options are enabled.
    pub strike_interval: Option<u32>,
    /// Lot size of the option contracts, if different from the underlying.
    pub option_lot_size: Option<u32>,
    /// Opening price for the synthetic feed.
    pub start_price: f64,
}

impl Default for InstrumentSettings {
    fn default() -> Self {
        Self {
            symbol: String::new(),
            lot_size: 1,
            strike_interval: None,
            option_lot_size: None,
            start_price: 100.0,
        }
    }
}

impl Settings {
    /// Load from an optional TOML file, apply `SCALPER__*` overrides, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = path
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

        let settings: Settings = config::Config::builder()
            .add_source(config::File::with_name(&file).required(path.is_some()))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;

        tracing::info!(
            "Loaded configuration ({} instruments, {}s candles, options {})",
            settings.instruments.len(),
            settings.candles.interval_secs,
            if settings.options.enabled { "on" } else { "off" }
        );

        Ok(settings)
    }

    /// Check invariants serde cannot express. Reports every violation at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_session(&mut errors);
        self.validate_indicators(&mut errors);
        self.validate_risk(&mut errors);
        self.validate_engine(&mut errors);
        self.validate_instruments(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::from_violations(errors))
        }
    }

    fn validate_session(&self, errors: &mut Vec<String>) {
        let session = &self.session;
        if session.open >= session.close {
            errors.push(format!(
                "session: open {} must be before close {}",
                session.open, session.close
            ));
        } else {
            let minutes = (session.close - session.open).num_minutes();
            if i64::from(session.flatten_minutes_before_close) >= minutes {
                errors.push(format!(
                    "session.flatten_minutes_before_close: {} leaves no trading window",
                    session.flatten_minutes_before_close
                ));
            }
        }
        if session.utc_offset_minutes.abs() > 14 * 60 {
            errors.push(format!(
                "session.utc_offset_minutes: {} is out of range",
                session.utc_offset_minutes
            ));
        }
        if self.candles.interval_secs == 0 {
            errors.push("candles.interval_secs: must be > 0".into());
        }
        if self.candles.max_history < self.indicators.warmup_candles() {
            errors.push(format!(
                "candles.max_history: {} is shorter than the indicator warm-up ({})",
                self.candles.max_history,
                self.indicators.warmup_candles()
            ));
        }
    }

    fn validate_indicators(&self, errors: &mut Vec<String>) {
        let ind = &self.indicators;
        let periods = [
            ("ema_short", ind.ema_short),
            ("ema_long", ind.ema_long),
            ("atr_period", ind.atr_period),
            ("supertrend_period", ind.supertrend_period),
            ("momentum_period", ind.momentum_period),
            ("volume_period", ind.volume_period),
        ];
        for (name, period) in periods {
            if period == 0 {
                errors.push(format!("indicators.{name}: must be > 0"));
            }
        }
        if ind.ema_short >= ind.ema_long {
            errors.push(format!(
                "indicators: ema_short ({}) must be shorter than ema_long ({})",
                ind.ema_short, ind.ema_long
            ));
        }
        if ind.supertrend_multiplier <= 0.0 {
            errors.push("indicators.supertrend_multiplier: must be > 0".into());
        }

        let sig = &self.signals;
        if sig.min_confirmations == 0 || sig.min_confirmations > 5 {
            errors.push(format!(
                "signals.min_confirmations: {} must be within 1..=5",
                sig.min_confirmations
            ));
        }
        if sig.momentum_threshold_pct < 0.0 {
            errors.push("signals.momentum_threshold_pct: must be >= 0".into());
        }
        if sig.volume_surge_multiplier <= 0.0 {
            errors.push("signals.volume_surge_multiplier: must be > 0".into());
        }
    }

    fn validate_risk(&self, errors: &mut Vec<String>) {
        let risk = &self.risk;
        if risk.risk_per_trade_pct <= 0.0 || risk.risk_per_trade_pct > 100.0 {
            errors.push(format!(
                "risk.risk_per_trade_pct: {} must be within (0, 100]",
                risk.risk_per_trade_pct
            ));
        }
        if risk.max_daily_loss_pct <= 0.0 || risk.max_daily_loss_pct > 100.0 {
            errors.push(format!(
                "risk.max_daily_loss_pct: {} must be within (0, 100]",
                risk.max_daily_loss_pct
            ));
        }
        if risk.max_consecutive_losses == 0 {
            errors.push("risk.max_consecutive_losses: must be > 0".into());
        }
        if risk.max_open_positions == 0 {
            errors.push("risk.max_open_positions: must be > 0".into());
        }

        let exits = &self.exits;
        for (name, value) in [
            ("stop_loss_pct", exits.stop_loss_pct),
            ("take_profit_pct", exits.take_profit_pct),
            ("trailing_pct", exits.trailing_pct),
        ] {
            if value <= 0.0 {
                errors.push(format!("exits.{name}: must be > 0"));
            }
        }
        if exits.trailing_activation_pct < 0.0 {
            errors.push("exits.trailing_activation_pct: must be >= 0".into());
        }
        if exits.max_hold_minutes <= 0 {
            errors.push("exits.max_hold_minutes: must be > 0".into());
        }
    }

    fn validate_engine(&self, errors: &mut Vec<String>) {
        let engine = &self.engine;
        if engine.scheduler_interval_ms == 0 {
            errors.push("engine.scheduler_interval_ms: must be > 0".into());
        }
        if engine.exit_monitor_interval_ms == 0
            || engine.exit_monitor_interval_ms > engine.scheduler_interval_ms
        {
            errors.push(format!(
                "engine.exit_monitor_interval_ms: {} must be > 0 and no slower than the scheduler ({})",
                engine.exit_monitor_interval_ms, engine.scheduler_interval_ms
            ));
        }
        if engine.tick_queue_capacity == 0 {
            errors.push("engine.tick_queue_capacity: must be > 0".into());
        }
        if engine.max_orders_per_second == 0 {
            errors.push("engine.max_orders_per_second: must be > 0".into());
        }
        if self.paper.starting_equity <= 0.0 {
            errors.push("paper.starting_equity: must be > 0".into());
        }
        if self.paper.slippage_bps < 0.0 {
            errors.push("paper.slippage_bps: must be >= 0".into());
        }
    }

    fn validate_instruments(&self, errors: &mut Vec<String>) {
        if self.instruments.is_empty() {
            errors.push("instruments: at least one instrument is required".into());
        }
        for inst in &self.instruments {
            if inst.symbol.trim().is_empty() {
                errors.push("instruments: symbol must not be empty".into());
            } else if inst.symbol != inst.symbol.to_uppercase() {
                errors.push(format!("instruments.{}: symbol must be upper case", inst.symbol));
            }
            if inst.lot_size == 0 {
                errors.push(format!("instruments.{}: lot_size must be > 0", inst.symbol));
            }
            if inst.option_lot_size == Some(0) {
                errors.push(format!(
                    "instruments.{}: option_lot_size must be > 0",
                    inst.symbol
                ));
            }
            if inst.start_price <= 0.0 {
                errors.push(format!("instruments.{}: start_price must be > 0", inst.symbol));
            }
            if self.options.enabled && inst.strike_interval.unwrap_or(0) == 0 {
                errors.push(format!(
                    "instruments.{}: strike_interval is required when options are enabled",
                    inst.symbol
                ));
            }
        }
        if self.options.enabled && self.options.expiry_weekday().is_none() {
            errors.push(format!(
                "options.expiry_weekday: '{}' is not a weekday",
                self.options.expiry_weekday
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_settings() -> Settings {
        Settings {
            instruments: vec![InstrumentSettings {
                symbol: "NIFTY".to_string(),
                lot_size: 25,
                strike_interval: Some(50),
                option_lot_size: None,
                start_price: 24_000.0,
            }],
            ..Settings::default()
        }
    }

    #[test]
    fn test_defaults_are_valid_with_an_instrument() {
        assert!(create_test_settings().validate().is_ok());
    }

    #[test]
    fn test_missing_instruments_rejected() {
        let settings = Settings::default();
        let err = settings.validate().unwrap_err().to_string();
        assert!(err.contains("at least one instrument"));
    }

    #[test]
    fn test_collects_every_violation() {
        let mut settings = create_test_settings();
        settings.indicators.ema_short = 30;
        settings.risk.max_open_positions = 0;
        settings.signals.min_confirmations = 6;

        match settings.validate() {
            Err(ConfigError::Invalid { count, details }) => {
                assert_eq!(count, 3);
                assert!(details.contains("ema_short"));
                assert!(details.contains("max_open_positions"));
                assert!(details.contains("min_confirmations"));
            }
            other => panic!("expected validation failure, got {other:?}"),
        }
    }

    #[test]
    fn test_options_require_strike_interval() {
        let mut settings = create_test_settings();
        settings.options.enabled = true;
        settings.instruments[0].strike_interval = None;
        assert!(settings.validate().is_err());

        settings.instruments[0].strike_interval = Some(50);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_expiry_weekday_parses() {
        let options = OptionSettings::default();
        assert_eq!(options.expiry_weekday(), Some(Weekday::Thu));

        let bad = OptionSettings {
            enabled: true,
            expiry_weekday: "someday".to_string(),
        };
        assert_eq!(bad.expiry_weekday(), None);
    }

    #[test]
    fn test_warmup_candles() {
        let ind = IndicatorSettings::default();
        // volume average needs its period plus the current candle
        assert_eq!(ind.warmup_candles(), 21);
    }

    #[test]
    fn test_exit_monitor_must_not_lag_scheduler() {
        let mut settings = create_test_settings();
        settings.engine.exit_monitor_interval_ms = settings.engine.scheduler_interval_ms + 1;
        assert!(settings.validate().is_err());
    }
}
