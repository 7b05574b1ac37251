use anyhow::Context;
use clap::Parser;
use scalper::config::Settings;
use scalper::connector::{PaperConnector, SyntheticFeed};
use scalper::db::PostgresLedgerStore;
use scalper::engine::Engine;
use scalper::ledger::{LedgerStore, MemoryLedgerStore};
use scalper::market_hours::SystemClock;
use scalper::persistence::CandleArchive;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;

const STATUS_INTERVAL_SECS: u64 = 30;

#[derive(Parser, Debug)]
#[command(name = "scalper", about = "Intraday options/equity scalping engine")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run against the synthetic feed and paper broker
    #[arg(long)]
    paper: bool,

    /// Override the paper account's starting equity
    #[arg(long)]
    equity: Option<f64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let args = Args::parse();

    tracing::info!("🚀 Scalper starting");

    let mut settings = Settings::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(equity) = args.equity {
        settings.paper.starting_equity = equity;
    }
    if !args.paper {
        anyhow::bail!("no live broker connector is configured; run with --paper");
    }

    log_configuration(&settings);

    let paper = Arc::new(PaperConnector::new(settings.paper.clone()));
    let store = connect_ledger_store().await;
    let archive = connect_candle_archive().await;

    let engine = Engine::new(
        settings.clone(),
        paper.clone(),
        store,
        archive,
        Arc::new(SystemClock),
    );
    engine.start().await?;

    let feed_cancel = CancellationToken::new();
    let feed = SyntheticFeed::new(paper.clone(), &settings.instruments, &settings.paper);
    let feed_task = tokio::spawn(feed.run(feed_cancel.clone()));

    tracing::info!("\nPress Ctrl+C to stop...\n");

    let mut status_ticker = interval(Duration::from_secs(STATUS_INTERVAL_SECS));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("⚠️  Received Ctrl+C, shutting down...");
                break;
            }
            _ = status_ticker.tick() => log_status(&engine),
        }
    }

    feed_cancel.cancel();
    engine.stop().await;
    let _ = feed_task.await;

    log_status(&engine);
    tracing::info!("👋 Scalper stopped");
    Ok(())
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("scalper=info")),
        )
        .init();
}

fn log_configuration(settings: &Settings) {
    tracing::info!("📊 Configuration:");
    tracing::info!(
        "  Session: {} - {} (flatten {} min before close)",
        settings.session.open,
        settings.session.close,
        settings.session.flatten_minutes_before_close
    );
    tracing::info!("  Candles: {}s", settings.candles.interval_secs);
    tracing::info!(
        "  Risk: {}% per trade, {}% daily loss, {} loss streak, {} positions max",
        settings.risk.risk_per_trade_pct,
        settings.risk.max_daily_loss_pct,
        settings.risk.max_consecutive_losses,
        settings.risk.max_open_positions
    );
    tracing::info!(
        "  Exits: SL {}%, TP {}%, trail {}% after {}%, max hold {} min",
        settings.exits.stop_loss_pct,
        settings.exits.take_profit_pct,
        settings.exits.trailing_pct,
        settings.exits.trailing_activation_pct,
        settings.exits.max_hold_minutes
    );
    tracing::info!("  Mode: {}", if settings.options.enabled { "options" } else { "equity" });
    for inst in &settings.instruments {
        tracing::info!("    - {} (lot {})", inst.symbol, inst.lot_size);
    }
}

async fn connect_ledger_store() -> Arc<dyn LedgerStore> {
    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        tracing::info!("DATABASE_URL not set, using in-memory ledger store");
        return Arc::new(MemoryLedgerStore::new());
    };

    match PostgresLedgerStore::new(&database_url).await {
        Ok(store) => {
            tracing::info!("Postgres ledger store enabled");
            Arc::new(store)
        }
        Err(e) => {
            tracing::warn!(
                "Failed to connect to Postgres ({}), continuing with in-memory ledger",
                e
            );
            Arc::new(MemoryLedgerStore::new())
        }
    }
}

async fn connect_candle_archive() -> Option<CandleArchive> {
    let redis_url = std::env::var("REDIS_URL").ok()?;
    match CandleArchive::new(&redis_url).await {
        Ok(archive) => Some(archive),
        Err(e) => {
            tracing::warn!("Failed to connect to Redis ({}), candles will not be archived", e);
            None
        }
    }
}

fn log_status(engine: &Engine) {
    let status = engine.status();
    tracing::info!(
        "💼 Status: running={} open={} day P&L {:+.2} unrealized {:+.2} streak {} in-flight {} dropped ticks {}{}{}",
        status.running,
        status.open_positions,
        status.daily_pnl,
        status.unrealized_pnl,
        status.consecutive_losses,
        status.in_flight_orders,
        status.dropped_ticks,
        if status.kill_switch { " [KILL SWITCH]" } else { "" },
        if status.daily_loss_latched { " [DAILY LOSS LATCHED]" } else { "" }
    );
    for alert in &status.alerts {
        tracing::error!("ALERT: {}", alert);
    }
}
