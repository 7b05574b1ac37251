use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Row};

use crate::execution::{ExitRules, Position, PositionState};
use crate::ledger::{LedgerStore, SessionState};
use crate::models::{ExitReason, Instrument, Side, Trade};
use crate::Result;

/// Postgres-backed ledger store
pub struct PostgresLedgerStore {
    pool: PgPool,
}

fn to_decimal(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or(Decimal::ZERO)
}

fn to_f64(value: Decimal) -> Result<f64> {
    value
        .to_f64()
        .ok_or_else(|| format!("NUMERIC {} out of f64 range", value).into())
}

fn parse_side(s: &str) -> Result<Side> {
    Side::parse(s).ok_or_else(|| format!("Invalid side: {}", s).into())
}

fn parse_exit_reason(s: &str) -> Result<ExitReason> {
    ExitReason::parse(s).ok_or_else(|| format!("Invalid exit reason: {}", s).into())
}

impl PostgresLedgerStore {
    /// Connect to Postgres and run the embedded migrations
    ///
    /// # Arguments
    /// * `database_url` - Postgres connection URL
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to Postgres ledger store");

        Ok(Self { pool })
    }

    fn trade_from_row(row: &PgRow) -> Result<Trade> {
        let side: String = row.try_get("side")?;
        let exit_reason: String = row.try_get("exit_reason")?;
        let quantity: i64 = row.try_get("quantity")?;

        Ok(Trade {
            id: row.try_get("id")?,
            position_id: row.try_get("position_id")?,
            instrument: row.try_get("instrument")?,
            side: parse_side(&side)?,
            quantity: u32::try_from(quantity)?,
            entry_price: to_f64(row.try_get("entry_price")?)?,
            exit_price: to_f64(row.try_get("exit_price")?)?,
            realized_pnl: to_f64(row.try_get("realized_pnl")?)?,
            entry_time: row.try_get("entry_time")?,
            exit_time: row.try_get("exit_time")?,
            holding_secs: row.try_get("holding_secs")?,
            exit_reason: parse_exit_reason(&exit_reason)?,
        })
    }

    fn position_from_row(row: &PgRow) -> Result<Position> {
        let instrument_spec: String = row.try_get("instrument_spec")?;
        let exit_rules: String = row.try_get("exit_rules")?;
        let side: String = row.try_get("side")?;
        let state: String = row.try_get("state")?;
        let exit_reason: Option<String> = row.try_get("exit_reason")?;
        let quantity: i64 = row.try_get("quantity")?;
        let entry_quantity: i64 = row.try_get("entry_quantity")?;
        let exit_filled_quantity: i64 = row.try_get("exit_filled_quantity")?;
        let updated_at: DateTime<Utc> = row.try_get("updated_at")?;

        Ok(Position {
            id: row.try_get("id")?,
            instrument: serde_json::from_str::<Instrument>(&instrument_spec)?,
            side: parse_side(&side)?,
            quantity: u32::try_from(quantity)?,
            entry_quantity: u32::try_from(entry_quantity)?,
            avg_entry_price: to_f64(row.try_get("avg_entry_price")?)?,
            entry_time: row.try_get("entry_time")?,
            exit_rules: serde_json::from_str::<ExitRules>(&exit_rules)?,
            state: PositionState::parse(&state).ok_or_else(|| format!("Invalid position state: {}", state))?,
            active_order: None,
            exit_reason: exit_reason.as_deref().map(parse_exit_reason).transpose()?,
            exit_filled_quantity: u32::try_from(exit_filled_quantity)?,
            exit_notional: to_f64(row.try_get("exit_notional")?)?,
            realized_pnl: to_f64(row.try_get("realized_pnl")?)?,
            alert: row.try_get("alert")?,
            updated_at,
        })
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn append_trade(&self, trading_day: NaiveDate, trade: &Trade) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trades (
                id, position_id, trading_day, instrument, side, quantity,
                entry_price, exit_price, realized_pnl, entry_time, exit_time,
                holding_secs, exit_reason
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (position_id) DO NOTHING
            "#,
        )
        .bind(trade.id)
        .bind(trade.position_id)
        .bind(trading_day)
        .bind(&trade.instrument)
        .bind(trade.side.as_str())
        .bind(i64::from(trade.quantity))
        .bind(to_decimal(trade.entry_price))
        .bind(to_decimal(trade.exit_price))
        .bind(to_decimal(trade.realized_pnl))
        .bind(trade.entry_time)
        .bind(trade.exit_time)
        .bind(trade.holding_secs)
        .bind(trade.exit_reason.as_str())
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            "Saved trade {} for {} to Postgres",
            trade.id,
            trade.instrument
        );

        Ok(())
    }

    async fn upsert_position(&self, position: &Position) -> Result<()> {
        let instrument_spec = serde_json::to_string(&position.instrument)?;
        let exit_rules = serde_json::to_string(&position.exit_rules)?;

        sqlx::query(
            r#"
            INSERT INTO positions (
                id, instrument, instrument_spec, side, quantity, entry_quantity,
                avg_entry_price, entry_time, exit_rules, state, exit_reason,
                exit_filled_quantity, exit_notional, realized_pnl, alert, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (id) DO UPDATE SET
                quantity = EXCLUDED.quantity,
                entry_quantity = EXCLUDED.entry_quantity,
                avg_entry_price = EXCLUDED.avg_entry_price,
                exit_rules = EXCLUDED.exit_rules,
                state = EXCLUDED.state,
                exit_reason = EXCLUDED.exit_reason,
                exit_filled_quantity = EXCLUDED.exit_filled_quantity,
                exit_notional = EXCLUDED.exit_notional,
                realized_pnl = EXCLUDED.realized_pnl,
                alert = EXCLUDED.alert,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(position.id)
        .bind(&position.instrument.symbol)
        .bind(instrument_spec)
        .bind(position.side.as_str())
        .bind(i64::from(position.quantity))
        .bind(i64::from(position.entry_quantity))
        .bind(to_decimal(position.avg_entry_price))
        .bind(position.entry_time)
        .bind(exit_rules)
        .bind(position.state.as_str())
        .bind(position.exit_reason.map(|r| r.as_str()))
        .bind(i64::from(position.exit_filled_quantity))
        .bind(to_decimal(position.exit_notional))
        .bind(to_decimal(position.realized_pnl))
        .bind(&position.alert)
        .bind(position.updated_at)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            "Saved {} position {} for {} to Postgres",
            position.state.as_str(),
            position.id,
            position.instrument
        );

        Ok(())
    }

    async fn load_session_state(&self, trading_day: NaiveDate) -> Result<SessionState> {
        let trade_rows = sqlx::query(
            r#"
            SELECT id, position_id, instrument, side, quantity, entry_price,
                   exit_price, realized_pnl, entry_time, exit_time,
                   holding_secs, exit_reason
            FROM trades
            WHERE trading_day = $1
            ORDER BY exit_time ASC
            "#,
        )
        .bind(trading_day)
        .fetch_all(&self.pool)
        .await?;

        let trades = trade_rows
            .iter()
            .map(Self::trade_from_row)
            .collect::<Result<Vec<_>>>()?;

        let position_rows = sqlx::query(
            r#"
            SELECT id, instrument_spec, side, quantity, entry_quantity,
                   avg_entry_price, entry_time, exit_rules, state, exit_reason,
                   exit_filled_quantity, exit_notional, realized_pnl, alert,
                   updated_at
            FROM positions
            WHERE state <> 'Closed'
            ORDER BY entry_time ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let open_positions = position_rows
            .iter()
            .map(Self::position_from_row)
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(
            "Loaded {} trades and {} open positions for {} from Postgres",
            trades.len(),
            open_positions.len(),
            trading_day
        );

        Ok(SessionState::from_trades(trading_day, &trades, open_positions))
    }
}
