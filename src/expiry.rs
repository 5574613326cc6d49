//! Expiry predicate.
//!
//! A row's expiry instant is its TTL column value plus the table duration.
//! The row is expired once `now >= expiry_instant`. Nothing is stored: the
//! decision is recomputed from the clock on every check.

use crate::catalog::schema::TtlTableConfig;
use crate::catalog::types::Row;

/// `ttl_value` and `now` are microseconds since the epoch.
pub fn is_expired(ttl_value: i64, now: i64, duration_micros: i64) -> bool {
    now >= expiry_instant(ttl_value, duration_micros)
}

pub fn expiry_instant(ttl_value: i64, duration_micros: i64) -> i64 {
    ttl_value.saturating_add(duration_micros)
}

/// Expiry of a stored row under `config`. NULL TTL values and disabled
/// configurations never expire.
pub fn row_is_expired(config: &TtlTableConfig, row: &Row, now: i64) -> bool {
    if !config.enabled {
        return false;
    }
    config
        .ttl_value(row)
        .as_timestamp()
        .is_some_and(|ts| is_expired(ts, now, config.duration_micros()))
}
