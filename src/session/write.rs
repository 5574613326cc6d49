use super::{Session, TableView, lock_and_recheck, visible_candidates};
use crate::DbInner;
use crate::catalog::types::{Row, RowKey, format_key};
use crate::commit::tx::{PendingWrite, Transaction};
use crate::error::TtlError;
use crate::query::operators::CompiledAssignments;
use crate::query::plan::{Assignment, Expr};
use crate::storage::LockMode;
use crate::visibility::{RowSource, StatementClass, StatementContext, is_visible};

/// Row counts reported for a write statement, MySQL style.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatementOutcome {
    /// Rows the statement found (after expiry filtering).
    pub matched_rows: usize,
    /// Rows whose stored values actually changed.
    pub changed_rows: usize,
    /// Client-visible affected count. Upsert reports 2 for an update,
    /// replace reports 2 for delete + insert.
    pub affected_rows: usize,
}

impl Session {
    pub fn insert(&mut self, table: &str, row: Row) -> Result<StatementOutcome, TtlError> {
        self.insert_many(table, vec![row])
    }

    /// All rows or none: a failure on any row undoes the statement.
    pub fn insert_many(
        &mut self,
        table: &str,
        rows: Vec<Row>,
    ) -> Result<StatementOutcome, TtlError> {
        self.run_statement(StatementClass::Insert, |db, ctx, tx| {
            let view = TableView::load(db, table)?;
            let count = rows.len();
            for row in rows {
                insert_row(db, ctx, tx, &view, row)?;
            }
            Ok(StatementOutcome {
                matched_rows: 0,
                changed_rows: count,
                affected_rows: count,
            })
        })
    }

    /// `INSERT ... ON DUPLICATE KEY UPDATE`. An expired duplicate counts as
    /// absent.
    pub fn upsert(
        &mut self,
        table: &str,
        row: Row,
        on_duplicate: &[Assignment],
    ) -> Result<StatementOutcome, TtlError> {
        self.run_statement(StatementClass::Insert, |db, ctx, tx| {
            let view = TableView::load(db, table)?;
            let assignments = CompiledAssignments::compile(on_duplicate, &view.schema)?;
            view.schema.validate_row(&row)?;
            let Some(key) = view.schema.key_of(&row) else {
                insert_row(db, ctx, tx, &view, row)?;
                return Ok(inserted_one());
            };
            let claim = claim_key(db, ctx, tx, &view, &key)?;
            match claim.existing {
                Some(current) => {
                    let next = assignments.apply(&current, ctx.now, &view.schema)?;
                    if next == current {
                        return Ok(StatementOutcome {
                            matched_rows: 1,
                            changed_rows: 0,
                            affected_rows: 0,
                        });
                    }
                    tx.writes.put(view.name(), key, next);
                    Ok(StatementOutcome {
                        matched_rows: 1,
                        changed_rows: 1,
                        affected_rows: 2,
                    })
                }
                None => {
                    tx.writes.put(view.name(), key, row);
                    Ok(inserted_one())
                }
            }
        })
    }

    /// `REPLACE INTO`. A live duplicate is deleted and the row inserted.
    pub fn replace(&mut self, table: &str, row: Row) -> Result<StatementOutcome, TtlError> {
        self.run_statement(StatementClass::Insert, |db, ctx, tx| {
            let view = TableView::load(db, table)?;
            view.schema.validate_row(&row)?;
            let Some(key) = view.schema.key_of(&row) else {
                insert_row(db, ctx, tx, &view, row)?;
                return Ok(inserted_one());
            };
            let claim = claim_key(db, ctx, tx, &view, &key)?;
            tx.writes.put(view.name(), key, row);
            Ok(if claim.existing.is_some() {
                StatementOutcome {
                    matched_rows: 1,
                    changed_rows: 1,
                    affected_rows: 2,
                }
            } else {
                inserted_one()
            })
        })
    }

    /// `UPDATE table SET ... [WHERE predicate]`. Expired rows never match.
    pub fn update_where(
        &mut self,
        table: &str,
        predicate: Option<&Expr>,
        assignments: &[Assignment],
    ) -> Result<StatementOutcome, TtlError> {
        self.run_statement(StatementClass::Update, |db, ctx, tx| {
            let view = TableView::load(db, table)?;
            let predicate = view.compile(predicate)?;
            let assignments = CompiledAssignments::compile(assignments, &view.schema)?;
            let mut outcome = StatementOutcome::default();
            for candidate in visible_candidates(db, ctx, tx, &view, predicate.as_ref())? {
                let row = match candidate.source {
                    RowSource::OwnWrite => candidate.row,
                    RowSource::Committed { .. } => {
                        match lock_and_recheck(
                            db,
                            ctx,
                            &view,
                            predicate.as_ref(),
                            &candidate.key,
                            LockMode::Exclusive,
                        )? {
                            Some(row) => row,
                            None => continue,
                        }
                    }
                };
                outcome.matched_rows += 1;
                let next = assignments.apply(&row, ctx.now, &view.schema)?;
                if next != row {
                    outcome.changed_rows += 1;
                    tx.writes.put(view.name(), candidate.key, next);
                }
            }
            outcome.affected_rows = outcome.changed_rows;
            Ok(outcome)
        })
    }

    /// `DELETE FROM table [WHERE predicate] [LIMIT n]`. Under
    /// `ExpiredRowsVisibleForDelete` expired rows match too.
    pub fn delete_where(
        &mut self,
        table: &str,
        predicate: Option<&Expr>,
        limit: Option<usize>,
    ) -> Result<StatementOutcome, TtlError> {
        self.run_statement(StatementClass::Delete, |db, ctx, tx| {
            let view = TableView::load(db, table)?;
            let predicate = view.compile(predicate)?;
            let limit = limit.unwrap_or(usize::MAX);
            let mut deleted = 0usize;
            for candidate in visible_candidates(db, ctx, tx, &view, predicate.as_ref())? {
                if deleted >= limit {
                    break;
                }
                match candidate.source {
                    RowSource::OwnWrite => {
                        let committed = db
                            .keyspace
                            .read()
                            .get_row(view.name(), &candidate.key)
                            .is_some();
                        if committed {
                            tx.writes.delete(view.name(), candidate.key);
                        } else {
                            tx.writes.remove(view.name(), &candidate.key);
                        }
                    }
                    RowSource::Committed { .. } => {
                        let locked = lock_and_recheck(
                            db,
                            ctx,
                            &view,
                            predicate.as_ref(),
                            &candidate.key,
                            LockMode::Exclusive,
                        )?;
                        if locked.is_none() {
                            continue;
                        }
                        tx.writes.delete(view.name(), candidate.key);
                    }
                }
                deleted += 1;
            }
            Ok(StatementOutcome {
                matched_rows: deleted,
                changed_rows: deleted,
                affected_rows: deleted,
            })
        })
    }
}

fn inserted_one() -> StatementOutcome {
    StatementOutcome {
        matched_rows: 0,
        changed_rows: 1,
        affected_rows: 1,
    }
}

/// The key's current live row, if any, with the key locked exclusively.
struct KeyClaim {
    existing: Option<Row>,
    newly_locked: bool,
}

/// Takes the exclusive lock on `key`, waiting for an uncommitted writer
/// elsewhere, then reports whether a visible row occupies the key.
fn claim_key(
    db: &DbInner,
    ctx: &StatementContext,
    tx: &Transaction,
    view: &TableView,
    key: &RowKey,
) -> Result<KeyClaim, TtlError> {
    let table = view.name();
    match tx.writes.get(table, key) {
        Some(PendingWrite::Put(row)) => {
            return Ok(KeyClaim {
                existing: Some(row.clone()),
                newly_locked: false,
            });
        }
        Some(PendingWrite::Delete) => {
            return Ok(KeyClaim {
                existing: None,
                newly_locked: false,
            });
        }
        None => {}
    }
    let grant = db.locks.acquire(
        ctx.tx_id,
        table,
        key,
        LockMode::Exclusive,
        db.config.lock_wait_timeout(),
    )?;
    let source = RowSource::Committed {
        locked_by_reader: !grant.newly_held,
    };
    // A row committed while we waited is judged at grant time; the new row
    // keeps the statement instant it was stamped with.
    let judged = if grant.waited {
        StatementContext {
            now: db.clock.now_micros(),
            ..*ctx
        }
    } else {
        *ctx
    };
    let existing = db
        .keyspace
        .read()
        .get_row(table, key)
        .map(|stored| stored.row.clone())
        .filter(|row| is_visible(&judged, view.ttl.as_ref(), row, source));
    Ok(KeyClaim {
        existing,
        newly_locked: grant.newly_held,
    })
}

fn insert_row(
    db: &DbInner,
    ctx: &StatementContext,
    tx: &mut Transaction,
    view: &TableView,
    row: Row,
) -> Result<(), TtlError> {
    view.schema.validate_row(&row)?;
    let table = view.name();
    let Some(key) = view.schema.key_of(&row) else {
        let key = db.keyspace.write().table_mut(table).allocate_row_id();
        db.locks.acquire(
            ctx.tx_id,
            table,
            &key,
            LockMode::Exclusive,
            db.config.lock_wait_timeout(),
        )?;
        tx.writes.put(table, key, row);
        return Ok(());
    };
    let claim = claim_key(db, ctx, tx, view, &key)?;
    if claim.existing.is_some() {
        if claim.newly_locked {
            db.locks.release(ctx.tx_id, table, &key);
        }
        return Err(TtlError::DuplicatePK {
            table: table.to_string(),
            key: format_key(&key),
        });
    }
    tx.writes.put(table, key, row);
    Ok(())
}
