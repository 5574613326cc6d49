use crate::binlog::{BinlogReader, binlog_path, truncate_binlog};
use crate::catalog::Catalog;
use crate::checkpoint::{CHECKPOINT_FILE_NAME, load_checkpoint};
use crate::commit::apply_event;
use crate::error::TtlError;
use crate::storage::Keyspace;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredState {
    pub keyspace: Keyspace,
    pub catalog: Catalog,
    pub current_seq: u64,
    pub checkpoint_seq: u64,
    pub replayed_events: usize,
}

/// Rebuilds committed state from the checkpoint and the binlog tail.
///
/// Nothing expiry-related is restored: the first reaper cycle after open
/// removes whatever has expired in the meantime.
pub fn recover(data_dir: &Path) -> Result<RecoveredState, TtlError> {
    let mut catalog = Catalog::default();
    let mut keyspace = Keyspace::default();
    let mut seq = 0u64;

    let checkpoint_path = data_dir.join(CHECKPOINT_FILE_NAME);
    if checkpoint_path.exists() {
        info!(path = %checkpoint_path.display(), "recovery: load checkpoint");
        let loaded = load_checkpoint(&checkpoint_path)?;
        catalog = loaded.catalog;
        keyspace = loaded.keyspace;
        seq = loaded.seq;
    }
    let checkpoint_seq = seq;

    let log_path = binlog_path(data_dir);
    let mut replayed_events = 0usize;
    if log_path.exists() {
        info!(from_seq = seq, "recovery: replay binlog");
        let mut reader = BinlogReader::open(&log_path)?;
        while let Some(event) = reader.next_event()? {
            if event.seq <= seq {
                continue;
            }
            if event.seq != seq + 1 {
                return Err(TtlError::IntegrityError {
                    message: format!("binlog gap: expected seq {}, found {}", seq + 1, event.seq),
                });
            }
            apply_event(&mut catalog, &mut keyspace, &event)?;
            seq = event.seq;
            replayed_events += 1;
        }
        if reader.torn_tail() {
            let valid_len = reader.valid_len();
            warn!(valid_len, "recovery: truncating torn binlog tail");
            drop(reader);
            truncate_binlog(&log_path, valid_len)?;
        }
    }

    info!(
        seq,
        checkpoint_seq,
        replayed_events,
        rows = keyspace.row_count(),
        "recovery complete"
    );
    Ok(RecoveredState {
        keyspace,
        catalog,
        current_seq: seq,
        checkpoint_seq,
        replayed_events,
    })
}
