//! Client sessions.
//!
//! A session runs one statement at a time, either inside an explicit
//! transaction or in an implicit autocommit transaction. Each statement
//! reads the clock once; every expiry decision it makes, including the
//! re-check after a lock wait, uses that instant.

mod write;

pub use write::StatementOutcome;

use crate::DbInner;
use crate::binlog::EventOrigin;
use crate::catalog::schema::{TableSchema, TtlTableConfig};
use crate::catalog::ttl_config_for;
use crate::catalog::types::{Row, RowKey};
use crate::commit::tx::{PendingWrite, Transaction};
use crate::commit::{CommitOutcome, CommitRequest};
use crate::error::TtlError;
use crate::query::operators::{CompiledExpr, compile_expr, matches};
use crate::query::plan::{ReadLock, Select};
use crate::storage::{LockMode, TxId};
use crate::visibility::{OverrideMode, RowSource, StatementClass, StatementContext, is_visible};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

pub struct Session {
    db: Arc<DbInner>,
    override_mode: OverrideMode,
    tx: Option<Transaction>,
}

impl Session {
    pub(crate) fn new(db: Arc<DbInner>) -> Self {
        Self {
            db,
            override_mode: OverrideMode::Normal,
            tx: None,
        }
    }

    /// Session-local. Only DELETE statements observe it.
    pub fn set_override_mode(&mut self, mode: OverrideMode) {
        debug!(?mode, "session override mode changed");
        self.override_mode = mode;
    }

    pub fn override_mode(&self) -> OverrideMode {
        self.override_mode
    }

    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    pub fn tx_id(&self) -> Option<TxId> {
        self.tx.as_ref().map(|tx| tx.id)
    }

    /// The clock instant a statement started now would use.
    pub fn now(&self) -> i64 {
        self.db.clock.now_micros()
    }

    pub fn begin(&mut self) -> Result<(), TtlError> {
        self.db.ensure_open()?;
        if self.tx.is_some() {
            return Err(TtlError::TransactionState(
                "transaction already active".into(),
            ));
        }
        let tx = Transaction::new(self.db.next_tx_id());
        debug!(tx_id = tx.id, "transaction started");
        self.tx = Some(tx);
        Ok(())
    }

    /// Fails with [`TtlError::Shutdown`] once the instance is closed; the
    /// transaction then stays open for rollback.
    pub fn commit(&mut self) -> Result<CommitOutcome, TtlError> {
        self.db.ensure_open()?;
        let tx = self.tx.take().ok_or_else(|| {
            TtlError::TransactionState("commit without an active transaction".into())
        })?;
        self.finish_commit(tx)
    }

    pub fn rollback(&mut self) -> Result<(), TtlError> {
        let tx = self.tx.take().ok_or_else(|| {
            TtlError::TransactionState("rollback without an active transaction".into())
        })?;
        let released = self.db.locks.release_all(tx.id);
        debug!(
            tx_id = tx.id,
            discarded = tx.writes.len(),
            released,
            "transaction rolled back"
        );
        Ok(())
    }

    fn finish_commit(&self, tx: Transaction) -> Result<CommitOutcome, TtlError> {
        let Transaction { id, writes, .. } = tx;
        let result = if writes.is_empty() {
            Ok(CommitOutcome::default())
        } else {
            self.db.commit(CommitRequest::rows(
                EventOrigin::User,
                writes.into_changes(),
            ))
        };
        let released = self.db.locks.release_all(id);
        debug!(tx_id = id, released, ok = result.is_ok(), "transaction finished");
        result
    }

    /// Runs `body` as one statement. Its writes are undone if it fails; in
    /// autocommit mode the implicit transaction commits or rolls back.
    fn run_statement<R>(
        &mut self,
        class: StatementClass,
        body: impl FnOnce(&DbInner, &StatementContext, &mut Transaction) -> Result<R, TtlError>,
    ) -> Result<R, TtlError> {
        self.db.ensure_open()?;
        let db = Arc::clone(&self.db);
        let autocommit = self.tx.is_none();
        let tx = self
            .tx
            .get_or_insert_with(|| Transaction::new(db.next_tx_id()));
        let ctx = StatementContext {
            tx_id: tx.id,
            now: db.clock.now_micros(),
            override_mode: self.override_mode,
            class,
        };
        let savepoint = tx.writes.clone();
        let result = body(&*db, &ctx, tx);
        if result.is_err() {
            tx.writes = savepoint;
        }
        if autocommit && let Some(tx) = self.tx.take() {
            return match result {
                Ok(value) => {
                    self.finish_commit(tx)?;
                    Ok(value)
                }
                Err(e) => {
                    db.locks.release_all(tx.id);
                    Err(e)
                }
            };
        }
        result
    }

    pub fn select(&mut self, query: &Select) -> Result<Vec<Row>, TtlError> {
        self.run_statement(StatementClass::Select, |db, ctx, tx| {
            let view = TableView::load(db, &query.table)?;
            let predicate = view.compile(query.predicate.as_ref())?;
            let limit = query.limit.unwrap_or(usize::MAX);
            let mode = match query.lock {
                ReadLock::None => None,
                ReadLock::Share => Some(LockMode::Shared),
                ReadLock::Update => Some(LockMode::Exclusive),
            };
            let mut out = Vec::new();
            for candidate in visible_candidates(db, ctx, tx, &view, predicate.as_ref())? {
                if out.len() >= limit {
                    break;
                }
                match (mode, candidate.source) {
                    (Some(mode), RowSource::Committed { .. }) => {
                        if let Some(row) =
                            lock_and_recheck(db, ctx, &view, predicate.as_ref(), &candidate.key, mode)?
                        {
                            out.push(row);
                        }
                    }
                    _ => out.push(candidate.row),
                }
            }
            Ok(out)
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let released = self.db.locks.release_all(tx.id);
            debug!(tx_id = tx.id, released, "session closed; open transaction rolled back");
        }
    }
}

/// Schema and TTL settings a statement runs against.
pub(crate) struct TableView {
    pub(crate) schema: TableSchema,
    pub(crate) ttl: Option<TtlTableConfig>,
}

impl TableView {
    pub(crate) fn load(db: &DbInner, table: &str) -> Result<Self, TtlError> {
        let catalog = db.catalog.read();
        let schema = catalog.table(table)?.clone();
        let ttl = ttl_config_for(&schema);
        Ok(Self { schema, ttl })
    }

    fn name(&self) -> &str {
        &self.schema.table_name
    }

    fn compile(
        &self,
        predicate: Option<&crate::query::Expr>,
    ) -> Result<Option<CompiledExpr>, TtlError> {
        predicate.map(|p| compile_expr(p, &self.schema)).transpose()
    }
}

struct Candidate {
    key: RowKey,
    row: Row,
    source: RowSource,
}

/// Rows the statement can see that match `predicate`, in key order. Own
/// uncommitted writes shadow committed rows.
fn visible_candidates(
    db: &DbInner,
    ctx: &StatementContext,
    tx: &Transaction,
    view: &TableView,
    predicate: Option<&CompiledExpr>,
) -> Result<Vec<Candidate>, TtlError> {
    let table = view.name();
    let own: BTreeMap<&RowKey, &PendingWrite> = tx.writes.table_entries(table).collect();
    let mut merged: BTreeMap<RowKey, Candidate> = BTreeMap::new();
    {
        let keyspace = db.keyspace.read();
        if let Some(data) = keyspace.table(table) {
            for (key, stored) in &data.rows {
                if own.contains_key(key) {
                    continue;
                }
                let source = RowSource::Committed {
                    locked_by_reader: db.locks.holds(ctx.tx_id, table, key).is_some(),
                };
                if is_visible(ctx, view.ttl.as_ref(), &stored.row, source)
                    && matches(predicate, &stored.row)
                {
                    merged.insert(
                        key.clone(),
                        Candidate {
                            key: key.clone(),
                            row: stored.row.clone(),
                            source,
                        },
                    );
                }
            }
        }
    }
    for (key, write) in own {
        if let PendingWrite::Put(row) = write
            && matches(predicate, row)
        {
            merged.insert(
                key.clone(),
                Candidate {
                    key: key.clone(),
                    row: row.clone(),
                    source: RowSource::OwnWrite,
                },
            );
        }
    }
    Ok(merged.into_values().collect())
}

/// Locks a committed row and re-reads it.
///
/// Returns `None` when the row is gone, hidden at the statement instant or
/// no longer matches; a lock taken by this call is released in that case.
/// A lock the transaction already held keeps the row visible.
fn lock_and_recheck(
    db: &DbInner,
    ctx: &StatementContext,
    view: &TableView,
    predicate: Option<&CompiledExpr>,
    key: &RowKey,
    mode: LockMode,
) -> Result<Option<Row>, TtlError> {
    let table = view.name();
    let grant = db
        .locks
        .acquire(ctx.tx_id, table, key, mode, db.config.lock_wait_timeout())?;
    let current = db
        .keyspace
        .read()
        .get_row(table, key)
        .map(|stored| stored.row.clone());
    let source = RowSource::Committed {
        locked_by_reader: !grant.newly_held,
    };
    let kept = current.filter(|row| {
        is_visible(ctx, view.ttl.as_ref(), row, source) && matches(predicate, row)
    });
    if kept.is_none() && grant.newly_held {
        db.locks.release(ctx.tx_id, table, key);
        if grant.waited {
            debug!(table, tx_id = ctx.tx_id, "row vanished or expired during lock wait");
        }
    }
    Ok(kept)
}
