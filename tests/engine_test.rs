use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, NaiveDate, TimeZone, Utc};
use scalper::config::{InstrumentSettings, Settings};
use scalper::connector::PaperConnector;
use scalper::engine::{Engine, EngineStatus};
use scalper::execution::{ExitRules, Position, PositionState};
use scalper::ledger::{LedgerStore, MemoryLedgerStore};
use scalper::market_hours::ManualClock;
use scalper::*;
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};
use uuid::Uuid;

// 2024-01-02 was a Tuesday; 10:00 IST
fn t0() -> DateTime<Utc> {
    FixedOffset::east_opt(330 * 60)
        .unwrap()
        .with_ymd_and_hms(2024, 1, 2, 10, 0, 0)
        .unwrap()
        .with_timezone(&Utc)
}

fn trading_day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()
}

fn create_test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.candles.interval_secs = 60;
    settings.candles.close_grace_ms = 0;
    settings.indicators.ema_short = 3;
    settings.indicators.ema_long = 9;
    settings.indicators.atr_period = 5;
    settings.indicators.supertrend_period = 5;
    settings.indicators.momentum_period = 3;
    settings.indicators.volume_period = 5;
    settings.engine.scheduler_interval_ms = 10;
    settings.engine.exit_monitor_interval_ms = 5;
    settings.engine.retry_backoff_ms = 10;
    settings.engine.max_orders_per_second = 50;
    settings.engine.drain_timeout_ms = 1000;
    settings.paper.slippage_bps = 0.0;
    settings.paper.fill_latency_ms = 1;
    settings.instruments = vec![InstrumentSettings {
        symbol: "NIFTY".to_string(),
        lot_size: 1,
        start_price: 100.0,
        ..InstrumentSettings::default()
    }];
    settings
}

struct Harness {
    engine: Engine,
    paper: Arc<PaperConnector>,
    store: Arc<MemoryLedgerStore>,
    clock: Arc<ManualClock>,
}

async fn create_test_harness(settings: Settings, store: Arc<MemoryLedgerStore>) -> Harness {
    let paper = Arc::new(PaperConnector::new(settings.paper.clone()));
    let clock = Arc::new(ManualClock::new(t0()));
    let engine = Engine::new(settings, paper.clone(), store.clone(), None, clock.clone());
    engine.start().await.unwrap();
    Harness {
        engine,
        paper,
        store,
        clock,
    }
}

async fn publish(paper: &PaperConnector, at: DateTime<Utc>, price: f64) {
    paper
        .publish_tick(Tick {
            instrument: "NIFTY".to_string(),
            price,
            size: 10.0,
            timestamp: at,
        })
        .await
        .unwrap();
}

/// Candle `k` (0-based) of a steady uptrend: opens at 100 + k, closes 0.8 higher
async fn publish_uptrend_candle(paper: &PaperConnector, k: i64) {
    let start = t0() + ChronoDuration::minutes(k);
    let base = 100.0 + k as f64;
    publish(paper, start, base).await;
    publish(paper, start + ChronoDuration::seconds(30), base + 0.8).await;
}

/// Nine uptrend candles, closed by the first tick of the tenth interval
async fn publish_nine_candle_uptrend(h: &Harness) {
    for k in 0..9 {
        publish_uptrend_candle(&h.paper, k).await;
    }
    publish(&h.paper, t0() + ChronoDuration::minutes(9), 109.0).await;
    h.clock.set(t0() + ChronoDuration::minutes(9) + ChronoDuration::seconds(5));
}

async fn wait_for(engine: &Engine, what: &str, cond: impl Fn(&EngineStatus) -> bool) -> EngineStatus {
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let status = engine.status();
        if cond(&status) {
            return status;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}: {status:?}");
        }
        sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_uptrend_enters_long_at_candle_nine() {
    let h = create_test_harness(create_test_settings(), Arc::new(MemoryLedgerStore::new())).await;

    for k in 0..8 {
        publish_uptrend_candle(&h.paper, k).await;
    }
    // eight candles closed: indicators still warming up
    publish(&h.paper, t0() + ChronoDuration::minutes(8), 108.0).await;
    sleep(Duration::from_millis(100)).await;
    let status = h.engine.status();
    assert_eq!(status.open_positions, 0);
    assert_eq!(status.in_flight_orders, 0);

    publish(&h.paper, t0() + ChronoDuration::minutes(8) + ChronoDuration::seconds(30), 108.8).await;
    publish(&h.paper, t0() + ChronoDuration::minutes(9), 109.0).await;

    let status = wait_for(&h.engine, "long entry", |s| s.open_positions == 1).await;
    assert_eq!(status.daily_pnl, 0.0);

    let snapshot = h.engine.session().latest_snapshot("NIFTY").unwrap();
    assert_eq!(snapshot.candle_index, 9);
    assert!(snapshot.is_ready());

    // 1% of 100000 over a 1.09 stop, lot 1
    assert_eq!(h.paper.net_quantity("NIFTY"), 917);

    h.engine.stop().await;
    assert!(!h.engine.status().running);
}

#[tokio::test]
async fn test_kill_switch_blocks_entries_until_released() {
    let h = create_test_harness(create_test_settings(), Arc::new(MemoryLedgerStore::new())).await;
    h.engine.set_kill_switch(true);

    publish_nine_candle_uptrend(&h).await;
    sleep(Duration::from_millis(150)).await;
    let status = h.engine.status();
    assert!(status.kill_switch);
    assert_eq!(status.open_positions, 0);
    assert_eq!(status.in_flight_orders, 0);

    h.engine.set_kill_switch(false);
    publish(&h.paper, t0() + ChronoDuration::minutes(9) + ChronoDuration::seconds(30), 109.8).await;
    publish(&h.paper, t0() + ChronoDuration::minutes(10), 110.0).await;

    wait_for(&h.engine, "entry after release", |s| s.open_positions == 1).await;
    h.engine.stop().await;
}

#[tokio::test]
async fn test_stop_loss_fires_with_kill_switch_engaged() {
    let store = Arc::new(MemoryLedgerStore::new());
    let h = create_test_harness(create_test_settings(), store).await;

    publish_nine_candle_uptrend(&h).await;
    wait_for(&h.engine, "long entry", |s| s.open_positions == 1).await;

    h.engine.set_kill_switch(true);
    // stop at 109 * 0.99 = 107.91
    publish(&h.paper, t0() + ChronoDuration::minutes(9) + ChronoDuration::seconds(10), 107.5).await;

    let status = wait_for(&h.engine, "stop-loss exit", |s| s.open_positions == 0 && s.daily_pnl < 0.0).await;
    assert!((status.daily_pnl - (107.5 - 109.0) * 917.0).abs() < 1e-6);
    assert_eq!(status.consecutive_losses, 1);
    assert!(status.kill_switch);

    let trades = h.store.trades();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].exit_reason, ExitReason::StopLoss);
    assert_eq!(h.paper.net_quantity("NIFTY"), 0);

    h.engine.stop().await;
}

#[tokio::test]
async fn test_daily_loss_latches_after_breach() {
    let mut settings = create_test_settings();
    settings.risk.max_daily_loss_pct = 0.5;
    let h = create_test_harness(settings, Arc::new(MemoryLedgerStore::new())).await;

    publish_nine_candle_uptrend(&h).await;
    wait_for(&h.engine, "long entry", |s| s.open_positions == 1).await;
    publish(&h.paper, t0() + ChronoDuration::minutes(9) + ChronoDuration::seconds(10), 107.5).await;

    let status = wait_for(&h.engine, "latched loss", |s| s.daily_loss_latched).await;
    assert!(status.daily_pnl <= -500.0);

    // a fresh long signal on the next candle is refused
    publish(&h.paper, t0() + ChronoDuration::minutes(10), 111.0).await;
    sleep(Duration::from_millis(100)).await;
    let status = h.engine.status();
    assert_eq!(status.open_positions, 0);
    assert_eq!(status.in_flight_orders, 0);

    h.engine.stop().await;
}

#[tokio::test]
async fn test_failed_exit_is_retried_once() {
    let h = create_test_harness(create_test_settings(), Arc::new(MemoryLedgerStore::new())).await;

    publish_nine_candle_uptrend(&h).await;
    wait_for(&h.engine, "long entry", |s| s.open_positions == 1).await;

    h.paper.fail_next_submissions(1);
    publish(&h.paper, t0() + ChronoDuration::minutes(9) + ChronoDuration::seconds(10), 107.5).await;

    let status = wait_for(&h.engine, "retried exit", |s| s.open_positions == 0).await;
    assert!(status.alerts.is_empty());
    assert_eq!(h.store.trades().len(), 1);

    h.engine.stop().await;
}

#[tokio::test]
async fn test_repeated_exit_failure_raises_alert() {
    let h = create_test_harness(create_test_settings(), Arc::new(MemoryLedgerStore::new())).await;

    publish_nine_candle_uptrend(&h).await;
    wait_for(&h.engine, "long entry", |s| s.open_positions == 1).await;

    h.paper.fail_next_submissions(2);
    publish(&h.paper, t0() + ChronoDuration::minutes(9) + ChronoDuration::seconds(10), 107.5).await;

    let status = wait_for(&h.engine, "exit alert", |s| !s.alerts.is_empty()).await;
    assert!(status.alerts[0].contains("NIFTY"));

    // still monitored: the next pass exits for real
    wait_for(&h.engine, "eventual exit", |s| s.open_positions == 0).await;
    h.engine.stop().await;
}

#[tokio::test]
async fn test_session_state_restored_on_start() {
    let store = Arc::new(MemoryLedgerStore::new());
    let entry_time = t0() - ChronoDuration::minutes(5);
    let exits = create_test_settings().exits;

    let losing = Trade {
        id: Uuid::new_v4(),
        position_id: Uuid::new_v4(),
        instrument: "NIFTY".to_string(),
        side: Side::Buy,
        quantity: 100,
        entry_price: 100.0,
        exit_price: 94.0,
        realized_pnl: -600.0,
        entry_time,
        exit_time: entry_time,
        holding_secs: 0,
        exit_reason: ExitReason::StopLoss,
    };
    store.append_trade(trading_day(), &losing).await.unwrap();

    let open = Position {
        id: Uuid::new_v4(),
        instrument: Instrument::equity("NIFTY", 1),
        side: Side::Buy,
        quantity: 10,
        entry_quantity: 10,
        avg_entry_price: 100.0,
        entry_time,
        exit_rules: ExitRules::anchored(Side::Buy, 100.0, entry_time, &exits),
        state: PositionState::Open,
        active_order: None,
        exit_reason: None,
        exit_filled_quantity: 0,
        exit_notional: 0.0,
        realized_pnl: 0.0,
        alert: None,
        updated_at: entry_time,
    };
    store.upsert_position(&open).await.unwrap();

    let mut settings = create_test_settings();
    settings.risk.max_daily_loss_pct = 0.5;
    let h = create_test_harness(settings, store).await;

    let status = h.engine.status();
    assert_eq!(status.open_positions, 1);
    assert_eq!(status.consecutive_losses, 1);
    assert_eq!(status.daily_pnl, -600.0);
    assert!(status.daily_loss_latched);

    // restored position is monitored: take-profit at 102
    publish(&h.paper, t0(), 102.5).await;
    wait_for(&h.engine, "restored exit", |s| s.open_positions == 0).await;
    assert_eq!(h.store.trades().len(), 2);

    h.engine.stop().await;
}

#[tokio::test]
async fn test_manual_flatten_and_stop() {
    let h = create_test_harness(create_test_settings(), Arc::new(MemoryLedgerStore::new())).await;

    publish_nine_candle_uptrend(&h).await;
    wait_for(&h.engine, "long entry", |s| s.open_positions == 1).await;

    assert_eq!(h.engine.flatten_all(), 1);
    wait_for(&h.engine, "flattened", |s| s.open_positions == 0).await;
    assert_eq!(h.store.trades()[0].exit_reason, ExitReason::Manual);

    h.engine.stop().await;
    h.engine.stop().await;
    let status = h.engine.status();
    assert!(!status.running);
    assert_eq!(status.in_flight_orders, 0);
    assert!(h.engine.start().await.is_err());
}
