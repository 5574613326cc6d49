//! Binlog propagation to replicas.
//!
//! Reaper deletes travel as ordinary row deletes. A replica never learns
//! that a row "expired"; it evaluates expiry on its own copy with its own
//! clock and applies whatever deletes the primary logged.

use crate::TtlDb;
use crate::binlog::BinlogEvent;
use crate::catalog::types::{Row, RowKey};
use crate::error::TtlError;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Receives committed events in commit order.
pub trait ReplicationSink: Send + Sync {
    fn publish(&self, event: &BinlogEvent) -> Result<(), TtlError>;
}

pub struct ChannelSink {
    tx: mpsc::UnboundedSender<BinlogEvent>,
}

impl ReplicationSink for ChannelSink {
    fn publish(&self, event: &BinlogEvent) -> Result<(), TtlError> {
        self.tx.send(event.clone()).map_err(|_| TtlError::Shutdown)
    }
}

pub fn channel_sink() -> (Arc<ChannelSink>, mpsc::UnboundedReceiver<BinlogEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ChannelSink { tx }), rx)
}

/// Replica-side bookkeeping.
#[derive(Debug, Default)]
pub(crate) struct ReplicaState {
    pub(crate) last_upstream_seq: Mutex<u64>,
    pub(crate) events_applied: AtomicU64,
    pub(crate) events_skipped: AtomicU64,
    pub(crate) missing_deletes: AtomicU64,
    pub(crate) skew_warnings: AtomicU64,
}

impl ReplicaState {
    pub(crate) fn snapshot(&self) -> ReplicationStats {
        ReplicationStats {
            last_upstream_seq: *self.last_upstream_seq.lock(),
            events_applied: self.events_applied.load(Ordering::Relaxed),
            events_skipped: self.events_skipped.load(Ordering::Relaxed),
            missing_deletes: self.missing_deletes.load(Ordering::Relaxed),
            skew_warnings: self.skew_warnings.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicationStats {
    pub last_upstream_seq: u64,
    pub events_applied: u64,
    pub events_skipped: u64,
    /// Upstream deletes whose row was already gone here, typically because
    /// this node's reaper removed it first.
    pub missing_deletes: u64,
    pub skew_warnings: u64,
}

/// Result of applying one upstream event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied { local_seq: Option<u64>, missing_deletes: usize },
    /// Already applied (seq at or below the last applied upstream seq).
    Skipped,
}

/// Fails when the primary's commit timestamp is ahead of `local_now` by
/// more than `max_skew_ms`.
pub fn check_clock_skew(
    event: &BinlogEvent,
    local_now: i64,
    max_skew_ms: u64,
) -> Result<(), TtlError> {
    let ahead_micros = event.commit_ts_micros.saturating_sub(local_now);
    if ahead_micros <= 0 {
        return Ok(());
    }
    let skew_ms = (ahead_micros / 1_000) as u64;
    if skew_ms > max_skew_ms {
        return Err(TtlError::ClockSkew {
            skew_ms,
            tolerance_ms: max_skew_ms,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplierReport {
    pub events_applied: u64,
    pub events_skipped: u64,
    pub errors: u64,
    pub cancelled: bool,
}

/// Applies events from `rx` to `replica` until `cancel` fires or the
/// channel closes.
pub fn spawn_applier(
    replica: Arc<TtlDb>,
    mut rx: mpsc::UnboundedReceiver<BinlogEvent>,
    cancel: CancellationToken,
) -> JoinHandle<ApplierReport> {
    tokio::spawn(async move {
        let mut report = ApplierReport::default();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    report.cancelled = true;
                    break;
                }
                next = rx.recv() => {
                    let Some(event) = next else {
                        debug!("replication channel closed");
                        break;
                    };
                    match replica.apply_binlog_event(&event) {
                        Ok(ApplyOutcome::Applied { .. }) => report.events_applied += 1,
                        Ok(ApplyOutcome::Skipped) => report.events_skipped += 1,
                        Err(e) => {
                            error!(seq = event.seq, error = %e, "replica failed to apply event");
                            report.errors += 1;
                        }
                    }
                }
            }
        }
        info!(
            applied = report.events_applied,
            skipped = report.events_skipped,
            errors = report.errors,
            cancelled = report.cancelled,
            "replication applier stopped"
        );
        report
    })
}

/// SHA-256 over the rows of `table` visible at `now`, in key order.
pub fn visible_digest(db: &TtlDb, table: &str, now: i64) -> Result<[u8; 32], TtlError> {
    let mut hasher = Sha256::new();
    for entry in db.visible_entries(table, now)? {
        let bytes = encode_entry(&entry)?;
        hasher.update((bytes.len() as u64).to_be_bytes());
        hasher.update(&bytes);
    }
    Ok(hasher.finalize().into())
}

fn encode_entry(entry: &(RowKey, Row)) -> Result<Vec<u8>, TtlError> {
    rmp_serde::to_vec(entry).map_err(|e| TtlError::Encode(e.to_string()))
}

/// Compares every table's visible row set on both nodes at the same instant.
pub fn verify_convergence(primary: &TtlDb, replica: &TtlDb, now: i64) -> Result<(), TtlError> {
    let tables: BTreeSet<String> = primary
        .table_names()
        .into_iter()
        .chain(replica.table_names())
        .collect();
    for table in tables {
        let (Ok(left), Ok(right)) = (
            visible_digest(primary, &table, now),
            visible_digest(replica, &table, now),
        ) else {
            error!(table = %table, "table missing on one side");
            return Err(TtlError::ReplicationDivergence {
                table,
                message: "table exists on only one node".into(),
            });
        };
        if left != right {
            error!(table = %table, now, "visible row sets differ");
            return Err(TtlError::ReplicationDivergence {
                table,
                message: format!("visible row digests differ at {now}"),
            });
        }
    }
    Ok(())
}

pub(crate) fn note_skew(state: &ReplicaState, event: &BinlogEvent, local_now: i64, max_skew_ms: u64) {
    if let Err(e) = check_clock_skew(event, local_now, max_skew_ms) {
        state.skew_warnings.fetch_add(1, Ordering::Relaxed);
        warn!(seq = event.seq, error = %e, "replica clock behind primary");
    }
}
