// Engine supervisor: owns the session and its tasks
pub mod session;

use anyhow::Context;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::Settings;
use crate::connector::Connector;
use crate::execution::{OrderSubmitter, SubmissionResult};
use crate::feed::TickQueue;
use crate::ledger::LedgerStore;
use crate::market_hours::Clock;
use crate::models::{Candle, Instrument};
use crate::persistence::CandleArchive;

pub use session::Session;

const RESULT_CHANNEL_CAPACITY: usize = 1024;
const ARCHIVE_CHANNEL_CAPACITY: usize = 1024;

/// Snapshot for the control surface
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub open_positions: usize,
    pub daily_pnl: f64,
    pub unrealized_pnl: f64,
    pub consecutive_losses: u32,
    pub daily_loss_latched: bool,
    pub kill_switch: bool,
    pub in_flight_orders: usize,
    pub dropped_ticks: u64,
    pub alerts: Vec<String>,
}

struct Receivers {
    results: mpsc::Receiver<SubmissionResult>,
    archive: Option<mpsc::Receiver<Candle>>,
}

/// Runs the trading loop.
///
/// `start` spawns five tasks: tick ingestion, candle aggregation, the
/// scheduler, the exit monitor and the order-event loop (plus the candle
/// archive writer when Redis is configured). `stop` drains them in order.
pub struct Engine {
    session: Arc<Session>,
    archive: Option<CandleArchive>,
    tick_queue: Arc<TickQueue>,
    receivers: Mutex<Option<Receivers>>,
    running: AtomicBool,
    ingest_cancel: CancellationToken,
    loops_cancel: CancellationToken,
    events_cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Engine {
    pub fn new(
        settings: Settings,
        connector: Arc<dyn Connector>,
        store: Arc<dyn LedgerStore>,
        archive: Option<CandleArchive>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (results_tx, results_rx) = mpsc::channel(RESULT_CHANNEL_CAPACITY);
        let (archive_tx, archive_rx) = match archive {
            Some(_) => {
                let (tx, rx) = mpsc::channel(ARCHIVE_CHANNEL_CAPACITY);
                (Some(tx), Some(rx))
            }
            None => (None, None),
        };

        let submitter = OrderSubmitter::new(
            connector.clone(),
            settings.engine.max_orders_per_second,
            results_tx,
        );
        let tick_queue = Arc::new(TickQueue::new(settings.engine.tick_queue_capacity));
        let session = Arc::new(Session::new(
            settings,
            clock,
            connector,
            store,
            archive_tx,
            submitter,
        ));

        Self {
            session,
            archive,
            tick_queue,
            receivers: Mutex::new(Some(Receivers {
                results: results_rx,
                archive: archive_rx,
            })),
            running: AtomicBool::new(false),
            ingest_cancel: CancellationToken::new(),
            loops_cancel: CancellationToken::new(),
            events_cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Recover state, subscribe, and spawn the tasks. Can only run once.
    pub async fn start(&self) -> anyhow::Result<()> {
        let receivers = self
            .receivers
            .lock()
            .map_err(|e| anyhow::anyhow!("engine state poisoned: {e}"))?
            .take()
            .context("engine already started")?;

        let session = self.session.clone();
        let restored = session
            .recover(self.archive.as_ref())
            .await
            .map_err(|e| anyhow::anyhow!("session recovery failed: {e}"))?;

        let mut instruments: Vec<Instrument> = session
            .settings
            .instruments
            .iter()
            .map(|i| Instrument::equity(&i.symbol, i.lot_size))
            .collect();
        instruments.extend(restored);
        session
            .connector
            .subscribe(&instruments)
            .await
            .context("subscribing instruments")?;

        let ticks = session.connector.stream_ticks().context("opening tick stream")?;
        let events = session.connector.order_events().context("opening order event stream")?;

        self.spawn_ingest(ticks);
        self.spawn_aggregator();
        self.spawn_scheduler();
        self.spawn_exit_monitor();
        self.spawn_event_loop(events, receivers.results);
        if let (Some(archive), Some(rx)) = (self.archive.clone(), receivers.archive) {
            self.spawn_archive_writer(archive, rx);
        }

        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            "Engine started: {} instruments, scheduler every {}ms, exit monitor every {}ms",
            instruments.len(),
            session.settings.engine.scheduler_interval_ms,
            session.settings.engine.exit_monitor_interval_ms
        );
        Ok(())
    }

    fn spawn_ingest(&self, mut ticks: mpsc::Receiver<crate::models::Tick>) {
        let queue = self.tick_queue.clone();
        let cancel = self.ingest_cancel.clone();
        self.tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    tick = ticks.recv() => match tick {
                        Some(tick) => {
                            queue.push(tick);
                        }
                        None => {
                            tracing::warn!("Tick stream ended");
                            break;
                        }
                    },
                }
            }
            queue.close();
            tracing::info!("Tick ingestion stopped");
        });
    }

    fn spawn_aggregator(&self) {
        let queue = self.tick_queue.clone();
        let session = self.session.clone();
        self.tracker.spawn(async move {
            while let Some(tick) = queue.pop().await {
                session.on_tick(&tick);
            }
            tracing::info!("Candle aggregation stopped");
        });
    }

    fn spawn_scheduler(&self) {
        let session = self.session.clone();
        let cancel = self.loops_cancel.clone();
        let every = Duration::from_millis(session.settings.engine.scheduler_interval_ms.max(1));
        self.tracker.spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        session.scheduler_pass().await;
                    }
                }
            }
            tracing::info!("Scheduler stopped");
        });
    }

    fn spawn_exit_monitor(&self) {
        let session = self.session.clone();
        let cancel = self.loops_cancel.clone();
        let every = Duration::from_millis(session.settings.engine.exit_monitor_interval_ms.max(1));
        self.tracker.spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        session.exit_pass();
                    }
                }
            }
            tracing::info!("Exit monitor stopped");
        });
    }

    fn spawn_event_loop(
        &self,
        mut events: mpsc::Receiver<crate::execution::OrderEvent>,
        mut results: mpsc::Receiver<SubmissionResult>,
    ) {
        let session = self.session.clone();
        let cancel = self.events_cancel.clone();
        self.tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    Some(event) = events.recv() => session.handle_order_event(event).await,
                    Some(result) = results.recv() => session.handle_submission(result).await,
                    else => break,
                }
            }
            tracing::info!("Order event loop stopped");
        });
    }

    fn spawn_archive_writer(&self, archive: CandleArchive, mut candles: mpsc::Receiver<Candle>) {
        let cancel = self.events_cancel.clone();
        self.tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    candle = candles.recv() => match candle {
                        Some(candle) => {
                            if let Err(e) = archive.save_candle(&candle).await {
                                tracing::warn!(instrument = %candle.instrument, "Failed to archive candle: {}", e);
                            }
                        }
                        None => break,
                    },
                }
            }
        });
    }

    /// Drain and halt: no new ticks, no new decisions, let in-flight orders
    /// settle into the ledger (bounded by `drain_timeout_ms`), then stop.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Engine stopping");

        self.ingest_cancel.cancel();
        self.tick_queue.close();
        self.loops_cancel.cancel();

        let drain = Duration::from_millis(self.session.settings.engine.drain_timeout_ms);
        let session = self.session.clone();
        let settled = tokio::time::timeout(drain, async move {
            session.submitter.drain().await;
            while session.in_flight_orders() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        if settled.is_err() {
            tracing::warn!(
                "Drain timed out with {} orders still in flight",
                self.session.in_flight_orders()
            );
        }

        self.events_cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        let status = self.status();
        tracing::info!(
            "Engine stopped: day P&L {:+.2}, {} open positions",
            status.daily_pnl,
            status.open_positions
        );
    }

    /// Global entry gate. Takes effect before the next submission step;
    /// orders already submitted are left alone.
    pub fn set_kill_switch(&self, engaged: bool) {
        let was = self.session.set_kill_switch(engaged);
        if engaged && !was {
            tracing::error!("KILL SWITCH ENGAGED: no new entries, exits still managed");
        } else if !engaged && was {
            tracing::info!("Kill switch released");
        }
    }

    /// Submit exits for every open position without an order in flight
    pub fn flatten_all(&self) -> usize {
        self.session.flatten_all()
    }

    pub fn status(&self) -> EngineStatus {
        let (open_positions, daily_pnl, consecutive_losses, daily_loss_latched) = {
            let ledger = match self.session.ledger.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            (
                ledger.open_position_count(),
                ledger.daily_realized_pnl(),
                ledger.consecutive_losses(),
                ledger.is_daily_loss_latched(),
            )
        };

        EngineStatus {
            running: self.is_running(),
            open_positions,
            daily_pnl,
            unrealized_pnl: self.session.unrealized_pnl(),
            consecutive_losses,
            daily_loss_latched,
            kill_switch: self.session.kill_switch(),
            in_flight_orders: self.session.in_flight_orders(),
            dropped_ticks: self.tick_queue.dropped() + self.session.dropped_ticks(),
            alerts: self.session.alerts(),
        }
    }
}
