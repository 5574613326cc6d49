use crate::catalog::Catalog;
use crate::error::TtlError;
use crate::storage::Keyspace;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

const TRAILER_BYTES: usize = 32;

#[derive(Debug, Deserialize)]
pub struct LoadedCheckpoint {
    pub seq: u64,
    pub catalog: Catalog,
    pub keyspace: Keyspace,
}

pub fn load_checkpoint(path: &Path) -> Result<LoadedCheckpoint, TtlError> {
    let bytes = fs::read(path)?;
    if bytes.len() < TRAILER_BYTES {
        return Err(TtlError::Decode("checkpoint too small".into()));
    }
    let (compressed, trailer) = bytes.split_at(bytes.len() - TRAILER_BYTES);
    if Sha256::digest(compressed).as_slice() != trailer {
        return Err(TtlError::IntegrityError {
            message: format!("checkpoint hash mismatch: {}", path.display()),
        });
    }
    let decompressed = zstd::stream::decode_all(compressed)
        .map_err(|e| TtlError::Decode(format!("zstd: {e}")))?;
    rmp_serde::from_slice(&decompressed).map_err(|e| TtlError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::load_checkpoint;
    use crate::catalog::Catalog;
    use crate::catalog::schema::{ColumnDef, TableOptions, TableSchema};
    use crate::catalog::types::{ColumnType, Row, Value};
    use crate::checkpoint::writer::write_checkpoint;
    use crate::error::TtlError;
    use crate::storage::Keyspace;
    use tempfile::tempdir;

    fn state() -> (Catalog, Keyspace) {
        let mut catalog = Catalog::new();
        catalog
            .create_table(TableSchema {
                table_name: "sz".into(),
                columns: vec![
                    ColumnDef::new("col_a", ColumnType::Integer).not_null(),
                    ColumnDef::new("col_b", ColumnType::Timestamp),
                ],
                primary_key: vec!["col_a".into()],
                options: TableOptions::with_ttl("col_b", 10),
            })
            .expect("table");
        let mut keyspace = Keyspace::default();
        for i in 0..100 {
            keyspace.upsert_row(
                "sz",
                vec![Value::Integer(i)],
                Row::from_values(vec![Value::Integer(i), Value::Timestamp(i * 1_000)]),
                7,
            );
        }
        (catalog, keyspace)
    }

    #[test]
    fn checkpoint_restores_rows_with_original_ttl_values() {
        let dir = tempdir().expect("temp");
        let (catalog, keyspace) = state();
        let meta = write_checkpoint(&keyspace, &catalog, 7, dir.path()).expect("write");
        assert_eq!(meta.rows, 100);

        let loaded = load_checkpoint(&dir.path().join(&meta.filename)).expect("load");
        assert_eq!(loaded.seq, 7);
        assert_eq!(loaded.catalog, catalog);
        assert_eq!(loaded.keyspace, keyspace);
        let row = loaded
            .keyspace
            .get_row("sz", &vec![Value::Integer(42)])
            .expect("row");
        assert_eq!(row.row.values[1], Value::Timestamp(42_000));
    }

    #[test]
    fn tampered_checkpoint_is_rejected() {
        let dir = tempdir().expect("temp");
        let (catalog, keyspace) = state();
        let meta = write_checkpoint(&keyspace, &catalog, 1, dir.path()).expect("write");
        let path = dir.path().join(&meta.filename);
        let mut bytes = std::fs::read(&path).expect("read");
        bytes[3] ^= 0xff;
        std::fs::write(&path, bytes).expect("write back");
        assert!(matches!(
            load_checkpoint(&path).expect_err("tampered"),
            TtlError::IntegrityError { .. }
        ));
    }
}
