pub mod tx;

use crate::DbInner;
use crate::binlog::{BinlogEvent, BinlogWriter, DdlChange, EventOrigin, RowChange};
use crate::catalog::Catalog;
use crate::error::TtlError;
use crate::replication::ReplicationSink;
use crate::storage::Keyspace;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

/// A transaction's changes, ready to be sequenced.
#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub origin: EventOrigin,
    pub changes: Vec<RowChange>,
    pub ddl: Option<DdlChange>,
}

impl CommitRequest {
    pub fn rows(origin: EventOrigin, changes: Vec<RowChange>) -> Self {
        Self {
            origin,
            changes,
            ddl: None,
        }
    }

    pub fn ddl(ddl: DdlChange) -> Self {
        Self {
            origin: EventOrigin::User,
            changes: Vec::new(),
            ddl: Some(ddl),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    /// `None` when nothing changed and no event was produced.
    pub seq: Option<u64>,
    pub rows_written: usize,
    pub rows_deleted: usize,
    /// Deletes of rows that were already gone. Dropped from the event.
    pub missing_deletes: usize,
}

/// Consistent view of the committed state at `seq`.
#[derive(Debug, Clone)]
pub struct CommittedSnapshot {
    pub seq: u64,
    pub catalog: Catalog,
    pub keyspace: Keyspace,
}

struct CommitState {
    seq: u64,
    binlog: Option<BinlogWriter>,
    sinks: Vec<Arc<dyn ReplicationSink>>,
}

/// Serializes commits: sequence, log, apply, publish.
pub(crate) struct CommitPipeline {
    state: Mutex<CommitState>,
}

impl CommitPipeline {
    pub(crate) fn new(seq: u64, binlog: Option<BinlogWriter>) -> Self {
        Self {
            state: Mutex::new(CommitState {
                seq,
                binlog,
                sinks: Vec::new(),
            }),
        }
    }

    pub(crate) fn add_sink(&self, sink: Arc<dyn ReplicationSink>) {
        self.state.lock().sinks.push(sink);
    }

    pub(crate) fn current_seq(&self) -> u64 {
        self.state.lock().seq
    }

    pub(crate) fn commit(
        &self,
        db: &DbInner,
        request: CommitRequest,
    ) -> Result<CommitOutcome, TtlError> {
        let mut state = self.state.lock();
        let CommitRequest {
            origin,
            changes,
            ddl,
        } = request;

        if let Some(ddl) = &ddl {
            validate_ddl(&db.catalog.read(), ddl)?;
        }
        let mut outcome = CommitOutcome::default();
        let effective = {
            let catalog = db.catalog.read();
            let keyspace = db.keyspace.read();
            let mut effective = Vec::with_capacity(changes.len());
            for change in changes {
                if !catalog.tables.contains_key(change.table()) {
                    return Err(TtlError::table_not_found(change.table()));
                }
                match &change {
                    RowChange::Write { .. } => outcome.rows_written += 1,
                    RowChange::Delete { table, key } => {
                        if keyspace.get_row(table, key).is_none() {
                            outcome.missing_deletes += 1;
                            continue;
                        }
                        outcome.rows_deleted += 1;
                    }
                }
                effective.push(change);
            }
            effective
        };
        if effective.is_empty() && ddl.is_none() {
            return Ok(outcome);
        }

        let seq = state.seq + 1;
        let event = BinlogEvent {
            seq,
            commit_ts_micros: db.clock.now_micros(),
            origin,
            changes: effective,
            ddl,
        };
        if let Some(binlog) = state.binlog.as_mut() {
            binlog.append(&event)?;
        }
        apply_event(&mut db.catalog.write(), &mut db.keyspace.write(), &event)?;
        state.seq = seq;
        outcome.seq = Some(seq);
        debug!(
            seq,
            origin = ?event.origin,
            writes = outcome.rows_written,
            deletes = outcome.rows_deleted,
            "commit applied"
        );

        for sink in &state.sinks {
            if let Err(e) = sink.publish(&event) {
                warn!(seq, error = %e, "replication sink rejected event");
            }
        }
        Ok(outcome)
    }

    /// Runs `f` with commits paused, over a snapshot of the committed state
    /// and the binlog writer.
    pub(crate) fn with_quiesced<R>(
        &self,
        db: &DbInner,
        f: impl FnOnce(&CommittedSnapshot, Option<&mut BinlogWriter>) -> Result<R, TtlError>,
    ) -> Result<R, TtlError> {
        let mut state = self.state.lock();
        let snapshot = CommittedSnapshot {
            seq: state.seq,
            catalog: db.catalog.read().clone(),
            keyspace: db.keyspace.read().clone(),
        };
        f(&snapshot, state.binlog.as_mut())
    }
}

fn validate_ddl(catalog: &Catalog, ddl: &DdlChange) -> Result<(), TtlError> {
    match ddl {
        DdlChange::CreateTable(schema) => catalog.clone().create_table(schema.clone()),
        DdlChange::DropTable { table } => catalog.table(table).map(|_| ()),
    }
}

/// Applies an already sequenced event to the committed state. Used by the
/// commit path and by recovery replay.
pub(crate) fn apply_event(
    catalog: &mut Catalog,
    keyspace: &mut Keyspace,
    event: &BinlogEvent,
) -> Result<(), TtlError> {
    match &event.ddl {
        Some(DdlChange::CreateTable(schema)) => {
            catalog.create_table(schema.clone())?;
            keyspace.table_mut(&schema.table_name);
        }
        Some(DdlChange::DropTable { table }) => {
            catalog.drop_table(table)?;
            keyspace.drop_table(table);
        }
        None => {}
    }
    for change in &event.changes {
        match change {
            RowChange::Write { table, key, row } => {
                keyspace.upsert_row(table, key.clone(), row.clone(), event.seq);
            }
            RowChange::Delete { table, key } => {
                keyspace.delete_row(table, key);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::apply_event;
    use crate::binlog::{BinlogEvent, DdlChange, EventOrigin, RowChange};
    use crate::catalog::Catalog;
    use crate::catalog::schema::{ColumnDef, TableOptions, TableSchema};
    use crate::catalog::types::{ColumnType, Row, Value};
    use crate::storage::Keyspace;

    #[test]
    fn apply_event_runs_ddl_then_rows() {
        let schema = TableSchema {
            table_name: "sz".into(),
            columns: vec![ColumnDef::new("col_a", ColumnType::Integer)],
            primary_key: vec!["col_a".into()],
            options: TableOptions::default(),
        };
        let mut catalog = Catalog::new();
        let mut keyspace = Keyspace::default();
        let create = BinlogEvent {
            seq: 1,
            commit_ts_micros: 0,
            origin: EventOrigin::User,
            changes: Vec::new(),
            ddl: Some(DdlChange::CreateTable(schema)),
        };
        apply_event(&mut catalog, &mut keyspace, &create).expect("create");
        let key = vec![Value::Integer(1)];
        let write = BinlogEvent {
            seq: 2,
            commit_ts_micros: 0,
            origin: EventOrigin::User,
            changes: vec![RowChange::Write {
                table: "sz".into(),
                key: key.clone(),
                row: Row::from_values(vec![Value::Integer(1)]),
            }],
            ddl: None,
        };
        apply_event(&mut catalog, &mut keyspace, &write).expect("write");
        assert_eq!(keyspace.get_row("sz", &key).map(|r| r.version), Some(2));
    }
}
