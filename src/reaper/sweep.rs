use super::{Reaper, SweepReport};
use crate::binlog::{EventOrigin, RowChange};
use crate::catalog::schema::TtlTableConfig;
use crate::catalog::types::{RowKey, format_key};
use crate::commit::CommitRequest;
use crate::error::TtlError;
use crate::expiry::row_is_expired;
use crate::storage::LockMode;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use tokio_util::sync::CancellationToken;
use tracing::warn;

impl Reaper {
    pub(super) fn run_cycle(&self, now: i64, cancel: &CancellationToken) -> SweepReport {
        let mut report = SweepReport::default();
        let tables = self.db.catalog.read().ttl_tables();
        let batch_size = self.db.config.reaper_batch_size;
        let mut budget = self.db.config.reaper_max_rows_per_cycle;
        let mut deferred_now: HashSet<(String, RowKey)> = HashSet::new();

        'tables: for cfg in &tables {
            report.tables_scanned += 1;
            let mut cursor: Option<RowKey> = None;
            let mut pending: Vec<RowKey> = Vec::new();
            loop {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    break 'tables;
                }
                let page = {
                    let keyspace = self.db.keyspace.read();
                    match keyspace.table(&cfg.table) {
                        Some(data) => data.scan_after(cursor.as_ref(), batch_size),
                        None => Vec::new(),
                    }
                };
                let exhausted = page.len() < batch_size;
                if let Some((last, _)) = page.last() {
                    cursor = Some(last.clone());
                }
                for (key, stored) in page {
                    report.rows_examined += 1;
                    if pending.len() < budget && row_is_expired(cfg, &stored.row, now) {
                        pending.push(key);
                    }
                }
                if pending.len() >= batch_size || pending.len() >= budget || exhausted {
                    let batch = std::mem::take(&mut pending);
                    if !batch.is_empty() {
                        let reaped = self.reap_batch(cfg, batch, now, &mut report, &mut deferred_now);
                        budget = budget.saturating_sub(reaped);
                    }
                }
                if budget == 0 {
                    break 'tables;
                }
                if exhausted {
                    break;
                }
            }
        }

        if !report.cancelled {
            self.deferred
                .lock()
                .retain(|entry, _| deferred_now.contains(entry));
        }
        report
    }

    /// Locks, re-checks and deletes one batch. Returns the rows reaped.
    fn reap_batch(
        &self,
        cfg: &TtlTableConfig,
        keys: Vec<RowKey>,
        now: i64,
        report: &mut SweepReport,
        deferred_now: &mut HashSet<(String, RowKey)>,
    ) -> usize {
        let owner = self.db.next_tx_id();
        let mut deletes = Vec::with_capacity(keys.len());
        for key in keys {
            match self
                .db
                .locks
                .try_acquire(owner, &cfg.table, &key, LockMode::Exclusive)
            {
                Ok(_) => {
                    let still_expired = self
                        .db
                        .keyspace
                        .read()
                        .get_row(&cfg.table, &key)
                        .is_some_and(|stored| row_is_expired(cfg, &stored.row, now));
                    self.deferred.lock().remove(&(cfg.table.clone(), key.clone()));
                    if still_expired {
                        deletes.push(RowChange::Delete {
                            table: cfg.table.clone(),
                            key,
                        });
                    }
                }
                Err(TtlError::LockContention { .. }) => {
                    report.rows_deferred += 1;
                    self.note_deferred(&cfg.table, key, deferred_now);
                }
                Err(e) => {
                    warn!(table = %cfg.table, error = %e, "reaper lock request failed");
                    report.errors += 1;
                }
            }
        }

        let mut reaped = 0;
        if !deletes.is_empty() {
            report.batches += 1;
            match self
                .db
                .commit(CommitRequest::rows(EventOrigin::Reaper, deletes))
            {
                Ok(outcome) => {
                    reaped = outcome.rows_deleted;
                    report.rows_reaped += outcome.rows_deleted;
                }
                Err(e) => {
                    warn!(table = %cfg.table, error = %e, "reaper batch commit failed; retrying next cycle");
                    report.errors += 1;
                }
            }
        }
        self.db.locks.release_all(owner);
        reaped
    }

    fn note_deferred(
        &self,
        table: &str,
        key: RowKey,
        deferred_now: &mut HashSet<(String, RowKey)>,
    ) {
        let threshold = self.db.config.stuck_row_report_after_sweeps;
        let entry = (table.to_string(), key);
        let sweeps = {
            let mut deferred = self.deferred.lock();
            let count = deferred.entry(entry.clone()).or_insert(0);
            *count = count.saturating_add(1);
            *count
        };
        if sweeps == threshold {
            self.metrics
                .stuck_rows_reported
                .fetch_add(1, Ordering::Relaxed);
            warn!(
                table,
                key = %format_key(&entry.1),
                sweeps,
                "expired row held by a lock across consecutive reaper cycles"
            );
            if let Some(observer) = self.observer.lock().clone() {
                observer.on_stuck_row(table, &entry.1, sweeps);
            }
        }
        deferred_now.insert(entry);
    }
}
