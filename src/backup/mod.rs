//! Full backups: a checkpoint image plus a JSON manifest.
//!
//! Rows are backed up with their original TTL column values, including rows
//! that are already expired but not yet reaped. Visibility after restore is
//! recomputed against the restoring instance's clock.

use crate::error::TtlError;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};

pub const BACKUP_MANIFEST_FILE: &str = "backup_manifest.json";
pub const BACKUP_MANIFEST_HMAC_FILE: &str = "backup_manifest.hmac";
pub const BACKUP_FORMAT_VERSION: u32 = 1;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupManifest {
    pub version: u32,
    pub backup_id: String,
    pub created_at_micros: i64,
    /// Last commit sequence covered by the checkpoint.
    pub seq: u64,
    pub checkpoint_file: String,
    pub file_sha256: BTreeMap<String, String>,
    /// Physically present rows per table at backup time.
    #[serde(default)]
    pub table_rows: BTreeMap<String, usize>,
}

pub fn write_backup_manifest(
    dir: &Path,
    manifest: &BackupManifest,
    signing_key: Option<&[u8]>,
) -> Result<(), TtlError> {
    fs::create_dir_all(dir)?;
    let bytes =
        serde_json::to_vec_pretty(manifest).map_err(|e| TtlError::Encode(e.to_string()))?;
    fs::write(dir.join(BACKUP_MANIFEST_FILE), &bytes)?;
    let sig_path = dir.join(BACKUP_MANIFEST_HMAC_FILE);
    match signing_key {
        Some(key) => fs::write(sig_path, hmac_hex(key, &bytes)?)?,
        None => {
            if sig_path.exists() {
                fs::remove_file(sig_path)?;
            }
        }
    }
    Ok(())
}

/// Reads the manifest, checking its HMAC when a key is supplied.
pub fn load_backup_manifest(
    dir: &Path,
    signing_key: Option<&[u8]>,
) -> Result<BackupManifest, TtlError> {
    let bytes = fs::read(dir.join(BACKUP_MANIFEST_FILE))?;
    if let Some(key) = signing_key {
        let expected_hex = fs::read_to_string(dir.join(BACKUP_MANIFEST_HMAC_FILE)).map_err(
            |_| TtlError::IntegrityError {
                message: "backup manifest hmac missing".into(),
            },
        )?;
        verify_hmac_hex(key, &bytes, expected_hex.trim())?;
    }
    let manifest: BackupManifest =
        serde_json::from_slice(&bytes).map_err(|e| TtlError::Decode(e.to_string()))?;
    validate_backup_manifest(&manifest)?;
    Ok(manifest)
}

pub fn verify_backup_files(dir: &Path, manifest: &BackupManifest) -> Result<(), TtlError> {
    for (rel, expected) in &manifest.file_sha256 {
        let resolved = resolve_backup_path(dir, rel)?;
        let actual = sha256_file_hex(&resolved)?;
        if &actual != expected {
            return Err(TtlError::IntegrityError {
                message: format!("backup file checksum mismatch: {rel}"),
            });
        }
    }
    Ok(())
}

pub fn sha256_file_hex(path: &Path) -> Result<String, TtlError> {
    let mut reader = BufReader::new(fs::File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 16 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn hmac_hex(key: &[u8], bytes: &[u8]) -> Result<String, TtlError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| TtlError::Validation(format!("invalid hmac key: {e}")))?;
    mac.update(bytes);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn verify_hmac_hex(key: &[u8], bytes: &[u8], expected_hex: &str) -> Result<(), TtlError> {
    let expected = hex::decode(expected_hex)
        .map_err(|_| TtlError::Validation("backup manifest hmac must be hex".into()))?;
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| TtlError::Validation(format!("invalid hmac key: {e}")))?;
    mac.update(bytes);
    mac.verify_slice(&expected)
        .map_err(|_| TtlError::IntegrityError {
            message: "backup manifest hmac mismatch".into(),
        })
}

fn is_valid_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

fn validate_backup_manifest(manifest: &BackupManifest) -> Result<(), TtlError> {
    if manifest.version != BACKUP_FORMAT_VERSION {
        return Err(TtlError::Validation(format!(
            "unsupported backup format version {}",
            manifest.version
        )));
    }
    validate_safe_relative_path(&manifest.checkpoint_file, "checkpoint_file")?;
    for (rel, sha) in &manifest.file_sha256 {
        validate_safe_relative_path(rel, "file_sha256 key")?;
        if !is_valid_sha256_hex(sha) {
            return Err(TtlError::Validation(format!(
                "invalid sha256 entry in backup manifest for path: {rel}"
            )));
        }
    }
    if !manifest.file_sha256.contains_key(&manifest.checkpoint_file) {
        return Err(TtlError::Validation(
            "backup manifest missing checkpoint checksum".into(),
        ));
    }
    Ok(())
}

fn validate_safe_relative_path(path: &str, field: &str) -> Result<(), TtlError> {
    if path.is_empty() || path.contains('\\') {
        return Err(TtlError::Validation(format!(
            "{field} must be a non-empty path without backslashes"
        )));
    }
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        return Err(TtlError::Validation(format!(
            "{field} must be a relative path"
        )));
    }
    if candidate
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(TtlError::Validation(format!(
            "{field} contains disallowed path component"
        )));
    }
    Ok(())
}

/// Path of the checkpoint image a verified manifest points at.
pub fn resolve_checkpoint(dir: &Path, manifest: &BackupManifest) -> Result<PathBuf, TtlError> {
    resolve_backup_path(dir, &manifest.checkpoint_file)
}

fn resolve_backup_path(dir: &Path, rel: &str) -> Result<PathBuf, TtlError> {
    validate_safe_relative_path(rel, "backup path")?;
    let base = fs::canonicalize(dir)?;
    let canonical = fs::canonicalize(dir.join(rel))?;
    if !canonical.starts_with(&base) {
        return Err(TtlError::Validation(
            "backup path escapes backup directory".into(),
        ));
    }
    Ok(canonical)
}
