use std::pin::pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{future, stream, StreamExt};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::engine::{Engine, EngineError, MaterializeOutcome};
use crate::model::NotificationStatus;
use crate::observability::*;

/// The periodic jobs. Each one is idempotent per entity, so overlapping or
/// repeated runs are harmless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Recurrence,
    Waitlist,
    Reminder,
    Dispatch,
    Cleanup,
}

impl Tick {
    pub const ALL: [Tick; 5] = [
        Tick::Recurrence,
        Tick::Waitlist,
        Tick::Reminder,
        Tick::Dispatch,
        Tick::Cleanup,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Tick::Recurrence => "recurrence",
            Tick::Waitlist => "waitlist",
            Tick::Reminder => "reminder",
            Tick::Dispatch => "dispatch",
            Tick::Cleanup => "cleanup",
        }
    }

    fn period(self, engine: &Engine) -> Duration {
        let config = engine.config();
        match self {
            Tick::Recurrence => config.recurrence_tick,
            Tick::Waitlist => config.waitlist_tick,
            Tick::Reminder => config.reminder_tick,
            Tick::Dispatch => config.dispatch_tick,
            Tick::Cleanup => config.cleanup_tick,
        }
    }
}

/// What one tick got through.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    /// Items that changed state.
    pub processed: usize,
    /// Items whose attempt failed and were left for a later tick or recorded.
    pub failed: usize,
}

/// Runs every tick on its own timer until stopped.
pub struct Orchestrator {
    engine: Arc<Engine>,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            shutdown: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        !self.handles.is_empty()
    }

    /// Spawn one loop per tick. No-op if already running.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        for tick in Tick::ALL {
            let engine = self.engine.clone();
            let token = self.shutdown.clone();
            self.handles
                .push(tokio::spawn(run_loop(engine, tick, token)));
        }
        info!("orchestrator started");
    }

    /// Ask every loop to stop and wait for them. Work in progress finishes
    /// its current item first.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!("tick task ended abnormally: {e}");
            }
        }
        self.shutdown = CancellationToken::new();
        info!("orchestrator stopped");
    }

    pub async fn trigger(&self, tick: Tick) -> Result<TickReport, EngineError> {
        run_timed(&self.engine, tick, &self.shutdown).await
    }

    pub async fn trigger_recurrence_tick(&self) -> Result<TickReport, EngineError> {
        self.trigger(Tick::Recurrence).await
    }

    pub async fn trigger_waitlist_tick(&self) -> Result<TickReport, EngineError> {
        self.trigger(Tick::Waitlist).await
    }

    pub async fn trigger_reminder_tick(&self) -> Result<TickReport, EngineError> {
        self.trigger(Tick::Reminder).await
    }

    pub async fn trigger_notification_dispatch(&self) -> Result<TickReport, EngineError> {
        self.trigger(Tick::Dispatch).await
    }

    pub async fn trigger_cleanup(&self) -> Result<TickReport, EngineError> {
        self.trigger(Tick::Cleanup).await
    }
}

async fn run_loop(engine: Arc<Engine>, tick: Tick, token: CancellationToken) {
    let mut interval = tokio::time::interval(tick.period(&engine));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }
        // Errors are logged by run_timed; the next tick retries.
        let _ = run_timed(&engine, tick, &token).await;
    }
    debug!("{} tick loop exited", tick.name());
}

async fn run_timed(
    engine: &Engine,
    tick: Tick,
    token: &CancellationToken,
) -> Result<TickReport, EngineError> {
    let started = Instant::now();
    let result = run_tick(engine, tick, token).await;
    metrics::histogram!(TICK_DURATION_SECONDS, "tick" => tick.name())
        .record(started.elapsed().as_secs_f64());
    match &result {
        Ok(report) if report.processed > 0 || report.failed > 0 => info!(
            "{} tick: {} processed, {} failed",
            tick.name(),
            report.processed,
            report.failed
        ),
        Ok(_) => debug!("{} tick: idle", tick.name()),
        Err(e) => {
            metrics::counter!(TICK_FAILURES_TOTAL, "tick" => tick.name()).increment(1);
            error!("{} tick aborted: {e}", tick.name());
        }
    }
    result
}

/// Run one pass of `tick`. A store error aborts the pass; any other
/// per-item error is counted and skipped.
pub async fn run_tick(
    engine: &Engine,
    tick: Tick,
    token: &CancellationToken,
) -> Result<TickReport, EngineError> {
    match tick {
        Tick::Recurrence => recurrence_tick(engine, token).await,
        Tick::Waitlist => waitlist_tick(engine, token).await,
        Tick::Reminder => reminder_tick(engine, token).await,
        Tick::Dispatch => dispatch_tick(engine, token).await,
        Tick::Cleanup => cleanup_tick(engine, token).await,
    }
}

/// Fold one item's result into the report.
fn tally<T>(
    report: &mut TickReport,
    id: ulid::Ulid,
    result: Result<T, EngineError>,
) -> Result<Option<T>, EngineError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_store() => Err(e),
        Err(e) => {
            debug!("skip {id}: {e}");
            report.failed += 1;
            Ok(None)
        }
    }
}

async fn recurrence_tick(engine: &Engine, token: &CancellationToken) -> Result<TickReport, EngineError> {
    let mut report = TickReport::default();
    for id in engine.due_rule_ids().await? {
        if token.is_cancelled() {
            break;
        }
        match tally(&mut report, id, engine.materialize(id).await)? {
            Some(MaterializeOutcome::Booked(_)) => report.processed += 1,
            Some(MaterializeOutcome::Failed(_)) => {
                report.processed += 1;
                report.failed += 1;
            }
            Some(MaterializeOutcome::NotDue) | None => {}
        }
    }
    Ok(report)
}

/// Offer freed capacity to waiting entries in position order. Entries that
/// cannot be served yet stay queued.
async fn waitlist_tick(engine: &Engine, token: &CancellationToken) -> Result<TickReport, EngineError> {
    let mut report = TickReport::default();
    for id in engine.promotable_entries().await? {
        if token.is_cancelled() {
            break;
        }
        match engine.promote_waitlist_entry(id).await {
            Ok(_) => report.processed += 1,
            Err(e) if e.is_store() => return Err(e),
            Err(e) if e.is_conflict() => {}
            Err(e) => {
                debug!("skip promotion of {id}: {e}");
                report.failed += 1;
            }
        }
    }
    Ok(report)
}

async fn reminder_tick(engine: &Engine, token: &CancellationToken) -> Result<TickReport, EngineError> {
    let mut report = TickReport::default();
    for id in engine.reminder_candidates().await? {
        if token.is_cancelled() {
            break;
        }
        if let Some(true) = tally(&mut report, id, engine.send_reminder(id).await)? {
            report.processed += 1;
        }
    }
    Ok(report)
}

/// Requeue due retries, drop expired jobs, then send what is ready with
/// bounded concurrency.
async fn dispatch_tick(engine: &Engine, token: &CancellationToken) -> Result<TickReport, EngineError> {
    let mut report = TickReport::default();
    engine.retry_due_notifications().await?;
    for id in engine.expired_notifications().await? {
        if token.is_cancelled() {
            return Ok(report);
        }
        tally(&mut report, id, engine.expire_notification(id).await)?;
    }

    let ids = engine.dispatchable_notifications().await?;
    let concurrency = engine.config().dispatch_concurrency.max(1);
    let mut sends = pin!(
        stream::iter(ids)
            .take_while(|_| future::ready(!token.is_cancelled()))
            .map(|id| async move { (id, engine.send_notification(id).await) })
            .buffer_unordered(concurrency)
    );
    while let Some((id, result)) = sends.next().await {
        match tally(&mut report, id, result)? {
            Some(NotificationStatus::Sent) => report.processed += 1,
            Some(NotificationStatus::Failed) => {
                report.processed += 1;
                report.failed += 1;
            }
            Some(_) | None => {}
        }
    }
    Ok(report)
}

/// Time-driven expiry and housekeeping.
async fn cleanup_tick(engine: &Engine, token: &CancellationToken) -> Result<TickReport, EngineError> {
    let mut report = TickReport::default();
    for id in engine.expired_waitlist_entries().await? {
        if token.is_cancelled() {
            return Ok(report);
        }
        if tally(&mut report, id, engine.expire_waitlist_entry(id).await)?.is_some() {
            report.processed += 1;
        }
    }
    if token.is_cancelled() {
        return Ok(report);
    }
    report.processed += engine.mark_no_shows().await?;
    report.processed += engine.purge_notifications().await?;
    engine.store().maintain().await?;
    engine.prune();
    Ok(report)
}
