//! Background removal of expired rows.
//!
//! Foreground visibility never depends on the reaper: expired rows are
//! hidden as soon as they expire. The reaper only reclaims them, through
//! the normal commit path, so its deletes are logged and replicated like
//! any user delete.

mod sweep;

use crate::DbInner;
use crate::catalog::types::RowKey;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Counters for one sweep cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub tables_scanned: usize,
    pub rows_examined: usize,
    pub rows_reaped: usize,
    pub rows_deferred: usize,
    pub batches: usize,
    /// Commit failures. The affected rows are retried next cycle.
    pub errors: usize,
    pub cancelled: bool,
}

/// Hook for operators. Both methods default to no-ops.
pub trait ReaperObserver: Send + Sync {
    fn on_cycle(&self, _report: &SweepReport) {}

    /// A row stayed locked for `sweeps` consecutive cycles. Reported once
    /// per stuck episode.
    fn on_stuck_row(&self, _table: &str, _key: &RowKey, _sweeps: u32) {}
}

#[derive(Debug, Default)]
pub struct ReaperMetrics {
    cycles: AtomicU64,
    rows_reaped: AtomicU64,
    rows_deferred: AtomicU64,
    stuck_rows_reported: AtomicU64,
    commit_errors: AtomicU64,
    last_cycle_micros: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaperMetricsSnapshot {
    pub cycles: u64,
    pub rows_reaped: u64,
    pub rows_deferred: u64,
    pub stuck_rows_reported: u64,
    pub commit_errors: u64,
    pub last_cycle_micros: u64,
}

impl ReaperMetrics {
    pub fn snapshot(&self) -> ReaperMetricsSnapshot {
        ReaperMetricsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            rows_reaped: self.rows_reaped.load(Ordering::Relaxed),
            rows_deferred: self.rows_deferred.load(Ordering::Relaxed),
            stuck_rows_reported: self.stuck_rows_reported.load(Ordering::Relaxed),
            commit_errors: self.commit_errors.load(Ordering::Relaxed),
            last_cycle_micros: self.last_cycle_micros.load(Ordering::Relaxed),
        }
    }

    fn record(&self, report: &SweepReport, elapsed: Duration) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.rows_reaped
            .fetch_add(report.rows_reaped as u64, Ordering::Relaxed);
        self.rows_deferred
            .fetch_add(report.rows_deferred as u64, Ordering::Relaxed);
        self.commit_errors
            .fetch_add(report.errors as u64, Ordering::Relaxed);
        self.last_cycle_micros.store(
            u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
    }
}

pub struct Reaper {
    db: Arc<DbInner>,
    metrics: ReaperMetrics,
    observer: Mutex<Option<Arc<dyn ReaperObserver>>>,
    /// Consecutive cycles each contended row has been deferred.
    deferred: Mutex<HashMap<(String, RowKey), u32>>,
    /// One cycle at a time, whether timer-driven or called directly.
    cycle_gate: Mutex<()>,
}

impl Reaper {
    pub(crate) fn new(db: Arc<DbInner>) -> Self {
        Self {
            db,
            metrics: ReaperMetrics::default(),
            observer: Mutex::new(None),
            deferred: Mutex::new(HashMap::new()),
            cycle_gate: Mutex::new(()),
        }
    }

    pub fn metrics(&self) -> ReaperMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn set_observer(&self, observer: Arc<dyn ReaperObserver>) {
        *self.observer.lock() = Some(observer);
    }

    /// Runs one full cycle, judging expiry at `now`.
    pub fn sweep_once(&self, now: i64) -> SweepReport {
        self.sweep_at(now, &CancellationToken::new())
    }

    /// Runs one cycle at the current clock instant, stopping between batches
    /// if `cancel` fires.
    pub fn sweep(&self, cancel: &CancellationToken) -> SweepReport {
        let now = self.db.clock.now_micros();
        self.sweep_at(now, cancel)
    }

    fn sweep_at(&self, now: i64, cancel: &CancellationToken) -> SweepReport {
        let _gate = self.cycle_gate.lock();
        let started = std::time::Instant::now();
        let report = self.run_cycle(now, cancel);
        self.metrics.record(&report, started.elapsed());
        if report.rows_reaped > 0 || report.rows_deferred > 0 || report.errors > 0 {
            debug!(
                now,
                tables = report.tables_scanned,
                examined = report.rows_examined,
                reaped = report.rows_reaped,
                deferred = report.rows_deferred,
                batches = report.batches,
                errors = report.errors,
                cancelled = report.cancelled,
                "reaper cycle"
            );
        }
        if let Some(observer) = self.observer.lock().clone() {
            observer.on_cycle(&report);
        }
        report
    }

    /// Spawns the periodic sweep on the current tokio runtime.
    pub fn start(self: &Arc<Self>, interval: Duration) -> ReaperHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let reaper = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = interval.as_millis() as u64, "reaper started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let cycle_reaper = Arc::clone(&reaper);
                let cycle_token = token.clone();
                let joined =
                    tokio::task::spawn_blocking(move || cycle_reaper.sweep(&cycle_token)).await;
                if let Err(e) = joined {
                    warn!(error = %e, "reaper cycle panicked; continuing next tick");
                }
            }
            info!("reaper stopped");
        });
        ReaperHandle {
            task: Some(task),
            cancel,
        }
    }
}

/// Owns the background sweep task.
pub struct ReaperHandle {
    task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl ReaperHandle {
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancels the task and waits for the in-flight cycle to stop.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!(error = %e, "reaper task ended abnormally");
        }
    }
}

impl Drop for ReaperHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
