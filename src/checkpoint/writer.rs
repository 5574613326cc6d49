use crate::catalog::Catalog;
use crate::clock::wall_clock_micros;
use crate::error::TtlError;
use crate::storage::Keyspace;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

pub const CHECKPOINT_FILE_NAME: &str = "checkpoint.rttl.zst";
const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckpointMeta {
    pub filename: String,
    pub seq: u64,
    pub sha256_hex: String,
    pub created_at_micros: i64,
    pub rows: usize,
}

/// On-disk image. Rows keep their original TTL column values; nothing
/// about expiry is stored.
#[derive(Serialize)]
struct CheckpointImage<'a> {
    seq: u64,
    catalog: &'a Catalog,
    keyspace: &'a Keyspace,
}

/// Writes `catalog` and `keyspace` as of `seq` to `dir`, replacing any
/// previous checkpoint atomically.
pub fn write_checkpoint(
    keyspace: &Keyspace,
    catalog: &Catalog,
    seq: u64,
    dir: &Path,
) -> Result<CheckpointMeta, TtlError> {
    fs::create_dir_all(dir)?;
    let image = CheckpointImage {
        seq,
        catalog,
        keyspace,
    };
    let encoded = rmp_serde::to_vec(&image).map_err(|e| TtlError::Encode(e.to_string()))?;
    let mut payload = zstd::stream::encode_all(encoded.as_slice(), ZSTD_LEVEL)
        .map_err(|e| TtlError::Encode(format!("zstd: {e}")))?;
    let trailer = Sha256::digest(&payload);
    payload.extend_from_slice(&trailer);

    let file_hash = Sha256::digest(&payload);
    let final_path = dir.join(CHECKPOINT_FILE_NAME);
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&payload)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(&final_path).map_err(|e| TtlError::Io(e.error))?;

    Ok(CheckpointMeta {
        filename: CHECKPOINT_FILE_NAME.to_string(),
        seq,
        sha256_hex: hex::encode(file_hash),
        created_at_micros: wall_clock_micros(),
        rows: keyspace.row_count(),
    })
}
