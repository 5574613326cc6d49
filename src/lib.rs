pub mod backup;
pub mod binlog;
pub mod catalog;
pub mod checkpoint;
pub mod clock;
pub mod commit;
pub mod config;
pub mod error;
pub mod expiry;
pub mod query;
pub mod reaper;
pub mod recovery;
pub mod replication;
pub mod session;
pub mod storage;
pub mod visibility;

use crate::backup::{
    BACKUP_FORMAT_VERSION, BackupManifest, load_backup_manifest, resolve_checkpoint,
    sha256_file_hex, verify_backup_files, write_backup_manifest,
};
use crate::binlog::{BinlogEvent, BinlogWriter, DdlChange, EventOrigin, binlog_path, truncate_binlog};
use crate::catalog::schema::{ColumnDef, TableSchema, TtlTableConfig};
use crate::catalog::types::{Row, RowKey};
use crate::catalog::{Catalog, parse_table_options};
use crate::checkpoint::{CHECKPOINT_FILE_NAME, write_checkpoint};
use crate::clock::{SharedClock, SystemClock, wall_clock_micros};
use crate::commit::{CommitOutcome, CommitPipeline, CommitRequest};
use crate::config::validate_config;
use crate::expiry::row_is_expired;
use crate::recovery::recover;
use crate::replication::{ApplyOutcome, ReplicaState, ReplicationSink, ReplicationStats, note_skew};
use crate::storage::{Keyspace, RowLockManager, TxId};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

pub use crate::catalog::schema::TableOptions;
pub use crate::clock::{Clock, ManualClock};
pub use crate::config::TtlConfig;
pub use crate::error::{TtlError, TtlErrorCode};
pub use crate::reaper::{
    Reaper, ReaperHandle, ReaperMetricsSnapshot, ReaperObserver, SweepReport,
};
pub use crate::session::{Session, StatementOutcome};
pub use crate::visibility::OverrideMode;

/// Creates a directory readable only by the owner on Unix.
fn create_private_dir_all(path: &Path) -> Result<(), TtlError> {
    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;
        use std::os::unix::fs::PermissionsExt;

        DirBuilder::new().recursive(true).mode(0o700).create(path)?;
        let metadata = fs::metadata(path)?;
        if !metadata.is_dir() {
            return Err(TtlError::Validation(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }
        let mut perms = metadata.permissions();
        if perms.mode() & 0o777 != 0o700 {
            perms.set_mode(0o700);
            fs::set_permissions(path, perms)?;
        }
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(path)?;
    }
    Ok(())
}

/// State shared by sessions, the reaper and the replication applier.
pub(crate) struct DbInner {
    pub(crate) config: TtlConfig,
    pub(crate) clock: SharedClock,
    pub(crate) catalog: RwLock<Catalog>,
    pub(crate) keyspace: RwLock<Keyspace>,
    pub(crate) locks: RowLockManager,
    pub(crate) commits: CommitPipeline,
    pub(crate) replica: ReplicaState,
    next_tx_id: AtomicU64,
    closed: AtomicBool,
}

impl DbInner {
    pub(crate) fn next_tx_id(&self) -> TxId {
        self.next_tx_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn ensure_open(&self) -> Result<(), TtlError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TtlError::Shutdown);
        }
        Ok(())
    }

    pub(crate) fn commit(&self, request: CommitRequest) -> Result<CommitOutcome, TtlError> {
        self.commits.commit(self, request)
    }
}

/// An embedded row store with per-table row expiry.
pub struct TtlDb {
    inner: Arc<DbInner>,
    reaper: Arc<Reaper>,
    reaper_task: Mutex<Option<ReaperHandle>>,
    dir: Option<PathBuf>,
}

impl TtlDb {
    pub fn in_memory(config: TtlConfig) -> Result<Self, TtlError> {
        Self::in_memory_with_clock(config, Arc::new(SystemClock::new()))
    }

    pub fn in_memory_with_clock(config: TtlConfig, clock: SharedClock) -> Result<Self, TtlError> {
        validate_config(&config)?;
        log_config(&config, None);
        Ok(Self::assemble(
            config,
            clock,
            Catalog::default(),
            Keyspace::default(),
            0,
            None,
            None,
        ))
    }

    pub fn open(config: TtlConfig, dir: &Path) -> Result<Self, TtlError> {
        Self::open_with_clock(config, dir, Arc::new(SystemClock::new()))
    }

    /// Opens or creates a data directory, recovering the checkpoint and any
    /// binlog tail.
    pub fn open_with_clock(
        config: TtlConfig,
        dir: &Path,
        clock: SharedClock,
    ) -> Result<Self, TtlError> {
        validate_config(&config)?;
        log_config(&config, Some(dir));
        create_private_dir_all(dir)?;
        let recovered = recover(dir)?;
        let binlog = if config.durable_binlog {
            Some(BinlogWriter::open(dir)?)
        } else {
            None
        };
        Ok(Self::assemble(
            config,
            clock,
            recovered.catalog,
            recovered.keyspace,
            recovered.current_seq,
            binlog,
            Some(dir.to_path_buf()),
        ))
    }

    fn assemble(
        config: TtlConfig,
        clock: SharedClock,
        catalog: Catalog,
        keyspace: Keyspace,
        seq: u64,
        binlog: Option<BinlogWriter>,
        dir: Option<PathBuf>,
    ) -> Self {
        let inner = Arc::new(DbInner {
            config,
            clock,
            catalog: RwLock::new(catalog),
            keyspace: RwLock::new(keyspace),
            locks: RowLockManager::new(),
            commits: CommitPipeline::new(seq, binlog),
            replica: ReplicaState::default(),
            next_tx_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });
        let reaper = Arc::new(Reaper::new(Arc::clone(&inner)));
        Self {
            inner,
            reaper,
            reaper_task: Mutex::new(None),
            dir,
        }
    }

    pub fn config(&self) -> &TtlConfig {
        &self.inner.config
    }

    pub fn clock(&self) -> SharedClock {
        Arc::clone(&self.inner.clock)
    }

    pub fn now_micros(&self) -> i64 {
        self.inner.clock.now_micros()
    }

    pub fn session(&self) -> Session {
        Session::new(Arc::clone(&self.inner))
    }

    /// Sequence of the last committed event.
    pub fn head_seq(&self) -> u64 {
        self.inner.commits.current_seq()
    }

    pub fn create_table(&self, schema: TableSchema) -> Result<(), TtlError> {
        self.inner.ensure_open()?;
        let table = schema.table_name.clone();
        let ttl = schema.options.ttl.clone();
        let fully_replicated = schema.options.fully_replicated;
        self.inner
            .commit(CommitRequest::ddl(DdlChange::CreateTable(schema)))?;
        info!(
            table = %table,
            ttl_column = ttl.as_ref().map(|t| t.column.as_str()).unwrap_or(""),
            ttl_secs = ttl.as_ref().map(|t| t.duration_secs).unwrap_or(0),
            fully_replicated,
            "table created"
        );
        Ok(())
    }

    /// Creates a table whose options come from an engine table comment such
    /// as `NDB_TABLE=TTL=10@col_b`.
    pub fn create_table_with_comment(
        &self,
        table: &str,
        columns: Vec<ColumnDef>,
        primary_key: &[&str],
        comment: &str,
    ) -> Result<(), TtlError> {
        let options = parse_table_options(table, comment)?;
        self.create_table(TableSchema {
            table_name: table.to_string(),
            columns,
            primary_key: primary_key.iter().map(|c| c.to_string()).collect(),
            options,
        })
    }

    pub fn drop_table(&self, table: &str) -> Result<(), TtlError> {
        self.inner.ensure_open()?;
        self.inner.commit(CommitRequest::ddl(DdlChange::DropTable {
            table: table.to_string(),
        }))?;
        info!(table, "table dropped");
        Ok(())
    }

    pub fn table_names(&self) -> Vec<String> {
        self.inner.catalog.read().table_names()
    }

    pub fn table_schema(&self, table: &str) -> Result<TableSchema, TtlError> {
        self.inner.catalog.read().table(table).cloned()
    }

    pub fn get_ttl_config(&self, table: &str) -> Result<Option<TtlTableConfig>, TtlError> {
        self.inner.catalog.read().get_ttl_config(table)
    }

    /// Committed rows of `table` that are unexpired at `now`, with their
    /// keys, in key order. Ignores locks and uncommitted writes.
    pub fn visible_entries(&self, table: &str, now: i64) -> Result<Vec<(RowKey, Row)>, TtlError> {
        let ttl = self.get_ttl_config(table)?;
        let keyspace = self.inner.keyspace.read();
        let Some(data) = keyspace.table(table) else {
            return Ok(Vec::new());
        };
        Ok(data
            .rows
            .iter()
            .filter(|(_, stored)| {
                ttl.as_ref()
                    .is_none_or(|cfg| !row_is_expired(cfg, &stored.row, now))
            })
            .map(|(key, stored)| (key.clone(), stored.row.clone()))
            .collect())
    }

    pub fn visible_rows(&self, table: &str, now: i64) -> Result<Vec<Row>, TtlError> {
        Ok(self
            .visible_entries(table, now)?
            .into_iter()
            .map(|(_, row)| row)
            .collect())
    }

    /// Stored rows including expired ones the reaper has not removed yet.
    pub fn physical_row_count(&self, table: &str) -> Result<usize, TtlError> {
        self.inner.catalog.read().table(table)?;
        Ok(self
            .inner
            .keyspace
            .read()
            .table(table)
            .map_or(0, |data| data.len()))
    }

    pub fn reaper(&self) -> Arc<Reaper> {
        Arc::clone(&self.reaper)
    }

    pub fn reaper_metrics(&self) -> ReaperMetricsSnapshot {
        self.reaper.metrics()
    }

    pub fn set_reaper_observer(&self, observer: Arc<dyn ReaperObserver>) {
        self.reaper.set_observer(observer);
    }

    /// Starts the periodic sweep on the current tokio runtime. No-op when
    /// the reaper is disabled or already running.
    pub fn start_reaper(&self) -> Result<(), TtlError> {
        self.inner.ensure_open()?;
        if !self.inner.config.reaper_enabled {
            debug!("reaper disabled by config");
            return Ok(());
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(TtlError::Validation(
                "start_reaper requires a tokio runtime".into(),
            ));
        }
        let mut task = self.reaper_task.lock();
        if task.is_none() {
            let interval = Duration::from_millis(self.inner.config.reaper_interval_ms);
            *task = Some(self.reaper.start(interval));
        }
        Ok(())
    }

    pub fn add_replication_sink(&self, sink: Arc<dyn ReplicationSink>) {
        self.inner.commits.add_sink(sink);
    }

    /// Applies an upstream event on a replica.
    ///
    /// The event is applied by key regardless of this node's own expiry
    /// view or row locks. Events at or below the last applied upstream seq
    /// are skipped, so redelivery is harmless.
    pub fn apply_binlog_event(&self, event: &BinlogEvent) -> Result<ApplyOutcome, TtlError> {
        self.inner.ensure_open()?;
        let state = &self.inner.replica;
        let mut last = state.last_upstream_seq.lock();
        if event.seq <= *last {
            state.events_skipped.fetch_add(1, Ordering::Relaxed);
            debug!(seq = event.seq, last = *last, "upstream event already applied");
            return Ok(ApplyOutcome::Skipped);
        }
        note_skew(
            state,
            event,
            self.inner.clock.now_micros(),
            self.inner.config.max_clock_skew_ms,
        );
        let ddl = match &event.ddl {
            Some(DdlChange::CreateTable(schema))
                if self
                    .inner
                    .catalog
                    .read()
                    .table(&schema.table_name)
                    .is_ok_and(|existing| existing == schema) =>
            {
                None
            }
            Some(DdlChange::DropTable { table })
                if self.inner.catalog.read().table(table).is_err() =>
            {
                None
            }
            other => other.clone(),
        };
        let outcome = self.inner.commit(CommitRequest {
            origin: EventOrigin::Replicated,
            changes: event.changes.clone(),
            ddl,
        })?;
        *last = event.seq;
        state.events_applied.fetch_add(1, Ordering::Relaxed);
        if outcome.missing_deletes > 0 {
            state
                .missing_deletes
                .fetch_add(outcome.missing_deletes as u64, Ordering::Relaxed);
            debug!(
                seq = event.seq,
                missing = outcome.missing_deletes,
                "upstream deletes of rows already gone"
            );
        }
        Ok(ApplyOutcome::Applied {
            local_seq: outcome.seq,
            missing_deletes: outcome.missing_deletes,
        })
    }

    pub fn replication_stats(&self) -> ReplicationStats {
        self.inner.replica.snapshot()
    }

    /// Writes a checkpoint of the committed state and empties the binlog.
    pub fn checkpoint_now(&self) -> Result<u64, TtlError> {
        let dir = self.dir.as_deref().ok_or_else(|| {
            TtlError::Validation("checkpoint requires a data directory".into())
        })?;
        self.inner.commits.with_quiesced(&self.inner, |snapshot, binlog| {
            let meta = write_checkpoint(&snapshot.keyspace, &snapshot.catalog, snapshot.seq, dir)?;
            match binlog {
                Some(writer) => writer.truncate()?,
                None => {
                    let path = binlog_path(dir);
                    if path.exists() {
                        truncate_binlog(&path, 0)?;
                    }
                }
            }
            info!(seq = meta.seq, rows = meta.rows, "checkpoint written");
            Ok(meta.seq)
        })
    }

    /// Writes a full backup to `backup_dir`. Expired rows not yet reaped are
    /// included with their original TTL values.
    pub fn backup_full(&self, backup_dir: &Path) -> Result<BackupManifest, TtlError> {
        create_private_dir_all(backup_dir)?;
        let (meta, table_rows) = self.inner.commits.with_quiesced(&self.inner, |snapshot, _| {
            let meta = write_checkpoint(
                &snapshot.keyspace,
                &snapshot.catalog,
                snapshot.seq,
                backup_dir,
            )?;
            let table_rows: BTreeMap<String, usize> = snapshot
                .catalog
                .table_names()
                .into_iter()
                .map(|t| {
                    let rows = snapshot.keyspace.table(&t).map_or(0, |d| d.len());
                    (t, rows)
                })
                .collect();
            Ok((meta, table_rows))
        })?;
        let mut file_sha256 = BTreeMap::new();
        file_sha256.insert(
            meta.filename.clone(),
            sha256_file_hex(&backup_dir.join(&meta.filename))?,
        );
        let manifest = BackupManifest {
            version: BACKUP_FORMAT_VERSION,
            backup_id: Uuid::new_v4().to_string(),
            created_at_micros: wall_clock_micros(),
            seq: meta.seq,
            checkpoint_file: meta.filename,
            file_sha256,
            table_rows,
        };
        write_backup_manifest(backup_dir, &manifest, self.inner.config.hmac_key())?;
        info!(
            backup_id = %manifest.backup_id,
            seq = manifest.seq,
            dir = %backup_dir.display(),
            "backup written"
        );
        Ok(manifest)
    }

    pub fn restore_from_backup(
        backup_dir: &Path,
        data_dir: &Path,
        config: TtlConfig,
    ) -> Result<Self, TtlError> {
        Self::restore_from_backup_with_clock(
            backup_dir,
            data_dir,
            config,
            Arc::new(SystemClock::new()),
        )
    }

    /// Verifies a backup and opens a new instance from it in `data_dir`,
    /// which must be empty. Expiry is evaluated against `clock`.
    pub fn restore_from_backup_with_clock(
        backup_dir: &Path,
        data_dir: &Path,
        config: TtlConfig,
        clock: SharedClock,
    ) -> Result<Self, TtlError> {
        validate_config(&config)?;
        if data_dir.exists() && fs::read_dir(data_dir)?.next().is_some() {
            return Err(TtlError::Validation(
                "restore target directory must be empty".into(),
            ));
        }
        let manifest = load_backup_manifest(backup_dir, config.hmac_key())?;
        verify_backup_files(backup_dir, &manifest)?;
        create_private_dir_all(data_dir)?;
        let source = resolve_checkpoint(backup_dir, &manifest)?;
        fs::copy(source, data_dir.join(CHECKPOINT_FILE_NAME))?;
        info!(
            backup_id = %manifest.backup_id,
            seq = manifest.seq,
            data_dir = %data_dir.display(),
            "restoring backup"
        );
        Self::open_with_clock(config, data_dir, clock)
    }

    /// Stops the reaper, refuses further statements and, for on-disk
    /// instances, writes a final checkpoint.
    pub async fn shutdown(&self) -> Result<(), TtlError> {
        let handle = self.reaper_task.lock().take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
        self.inner.closed.store(true, Ordering::Release);
        if self.dir.is_some() {
            self.checkpoint_now()?;
        }
        info!(seq = self.head_seq(), "shutdown complete");
        Ok(())
    }
}

fn log_config(config: &TtlConfig, dir: Option<&Path>) {
    info!(
        dir = dir.map(|d| d.display().to_string()).unwrap_or_default(),
        reaper_enabled = config.reaper_enabled,
        reaper_interval_ms = config.reaper_interval_ms,
        reaper_batch_size = config.reaper_batch_size,
        reaper_max_rows_per_cycle = config.reaper_max_rows_per_cycle,
        stuck_row_report_after_sweeps = config.stuck_row_report_after_sweeps,
        max_reap_lag_ms = config.max_reap_lag_ms,
        lock_wait_timeout_ms = config.lock_wait_timeout_ms,
        max_clock_skew_ms = config.max_clock_skew_ms,
        durable_binlog = config.durable_binlog,
        manifest_hmac_enabled = config.manifest_hmac_key.is_some(),
        "rowttl config"
    );
}
