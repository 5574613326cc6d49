//! Expiry-aware visibility for row-producing and row-matching statements.
//!
//! Default rule: an expired row is treated as already deleted, whether or
//! not the reaper has removed it yet. Three things override it:
//!
//! * rows in the reader's own uncommitted write set are always visible;
//! * committed rows the reader's transaction holds a lock on stay visible
//!   to that transaction until it ends;
//! * a DELETE issued under [`OverrideMode::ExpiredRowsVisibleForDelete`]
//!   matches expired rows.

use crate::catalog::schema::TtlTableConfig;
use crate::catalog::types::Row;
use crate::expiry::row_is_expired;
use crate::storage::TxId;

/// Session-level switch that scopes expired-row visibility to DELETE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverrideMode {
    #[default]
    Normal,
    ExpiredRowsVisibleForDelete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementClass {
    Select,
    Insert,
    Update,
    Delete,
}

/// Everything a visibility decision may depend on. Captured once when a
/// statement starts and passed down explicitly.
#[derive(Debug, Clone, Copy)]
pub struct StatementContext {
    pub tx_id: TxId,
    /// Statement clock instant. Re-checks after lock waits reuse it.
    pub now: i64,
    pub override_mode: OverrideMode,
    pub class: StatementClass,
}

impl StatementContext {
    pub fn expired_rows_visible(&self) -> bool {
        self.override_mode == OverrideMode::ExpiredRowsVisibleForDelete
            && self.class == StatementClass::Delete
    }
}

/// Where the row version under inspection comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowSource {
    OwnWrite,
    Committed { locked_by_reader: bool },
}

pub fn is_visible(
    ctx: &StatementContext,
    ttl: Option<&TtlTableConfig>,
    row: &Row,
    source: RowSource,
) -> bool {
    match source {
        RowSource::OwnWrite => true,
        RowSource::Committed {
            locked_by_reader: true,
        } => true,
        RowSource::Committed {
            locked_by_reader: false,
        } => {
            ctx.expired_rows_visible() || ttl.is_none_or(|cfg| !row_is_expired(cfg, row, ctx.now))
        }
    }
}
