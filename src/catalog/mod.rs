pub mod schema;
pub mod types;

use crate::catalog::schema::{TableOptions, TableSchema, TtlSpec, TtlTableConfig};
use crate::catalog::types::ColumnType;
use crate::clock::MICROS_PER_SEC;
use crate::error::{ResourceType, TtlError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

const MAX_IDENTIFIER_LEN: usize = 128;
const TABLE_OPTIONS_PREFIX: &str = "NDB_TABLE=";
/// Table options understood by the storage layer but irrelevant to expiry.
const PASSTHROUGH_OPTIONS: &[&str] = &["READ_BACKUP", "PARTITION_BALANCE", "NOLOGGING"];

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Catalog {
    pub tables: BTreeMap<String, TableSchema>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_table(&mut self, schema: TableSchema) -> Result<(), TtlError> {
        validate_identifier(&schema.table_name, "table_name")?;
        if self.tables.contains_key(&schema.table_name) {
            return Err(TtlError::AlreadyExists {
                resource_type: ResourceType::Table,
                resource_id: schema.table_name.clone(),
            });
        }
        validate_schema(&schema)?;
        self.tables.insert(schema.table_name.clone(), schema);
        Ok(())
    }

    pub fn drop_table(&mut self, table: &str) -> Result<TableSchema, TtlError> {
        self.tables
            .remove(table)
            .ok_or_else(|| TtlError::table_not_found(table))
    }

    pub fn table(&self, table: &str) -> Result<&TableSchema, TtlError> {
        self.tables
            .get(table)
            .ok_or_else(|| TtlError::table_not_found(table))
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    /// TTL configuration of `table`, `None` when the table has no TTL.
    pub fn get_ttl_config(&self, table: &str) -> Result<Option<TtlTableConfig>, TtlError> {
        let schema = self.table(table)?;
        Ok(ttl_config_for(schema))
    }

    /// Every table with an enabled TTL, in name order.
    pub fn ttl_tables(&self) -> Vec<TtlTableConfig> {
        self.tables
            .values()
            .filter_map(ttl_config_for)
            .filter(|cfg| cfg.enabled)
            .collect()
    }
}

pub(crate) fn ttl_config_for(schema: &TableSchema) -> Option<TtlTableConfig> {
    let spec = schema.options.ttl.as_ref()?;
    let column_index = schema.column_index(&spec.column)?;
    Some(TtlTableConfig {
        table: schema.table_name.clone(),
        column: spec.column.clone(),
        column_index,
        duration_secs: spec.duration_secs,
        enabled: spec.enabled,
    })
}

fn validate_schema(schema: &TableSchema) -> Result<(), TtlError> {
    let table = schema.table_name.as_str();
    if schema.columns.is_empty() {
        return Err(TtlError::Validation(format!(
            "table '{table}' needs at least one column"
        )));
    }
    let mut seen = HashSet::new();
    for col in &schema.columns {
        validate_identifier(&col.name, "column name")?;
        if !seen.insert(col.name.as_str()) {
            return Err(TtlError::Validation(format!(
                "duplicate column '{}' in table '{table}'",
                col.name
            )));
        }
    }
    for pk in &schema.primary_key {
        if schema.column_index(pk).is_none() {
            return Err(TtlError::UnknownColumn {
                table: table.to_string(),
                column: pk.clone(),
            });
        }
    }
    if let Some(ttl) = &schema.options.ttl {
        validate_ttl_spec(schema, ttl)?;
    }
    Ok(())
}

fn validate_ttl_spec(schema: &TableSchema, ttl: &TtlSpec) -> Result<(), TtlError> {
    let table = schema.table_name.as_str();
    let Some(idx) = schema.column_index(&ttl.column) else {
        return Err(TtlError::ttl_config(
            table,
            format!("ttl column '{}' does not exist", ttl.column),
        ));
    };
    let col = &schema.columns[idx];
    if col.col_type != ColumnType::Timestamp {
        return Err(TtlError::ttl_config(
            table,
            format!(
                "ttl column '{}' must be {}, found {}",
                ttl.column,
                ColumnType::Timestamp,
                col.col_type
            ),
        ));
    }
    let max_secs = (i64::MAX / MICROS_PER_SEC) as u64;
    if ttl.duration_secs > max_secs {
        return Err(TtlError::ttl_config(
            table,
            format!("ttl duration {}s exceeds {max_secs}s", ttl.duration_secs),
        ));
    }
    Ok(())
}

/// Parses a table comment such as `NDB_TABLE=TTL=10@col_b,FULLY_REPLICATED=1`.
///
/// `TTL=<seconds>@<column>` declares the TTL, `FULLY_REPLICATED=<0|1>` marks
/// a fully replicated table. Column existence is checked later by
/// [`Catalog::create_table`].
pub fn parse_table_options(table: &str, comment: &str) -> Result<TableOptions, TtlError> {
    let body = comment.trim();
    let body = body.strip_prefix(TABLE_OPTIONS_PREFIX).unwrap_or(body);
    let mut options = TableOptions::default();
    if body.is_empty() {
        return Ok(options);
    }
    for item in body.split(',') {
        let item = item.trim();
        let Some((key, value)) = item.split_once('=') else {
            return Err(TtlError::ttl_config(
                table,
                format!("malformed table option '{item}'"),
            ));
        };
        match key.trim().to_ascii_uppercase().as_str() {
            "TTL" => {
                if options.ttl.is_some() {
                    return Err(TtlError::ttl_config(table, "TTL declared twice"));
                }
                options.ttl = Some(parse_ttl_option(table, value.trim())?);
            }
            "FULLY_REPLICATED" => {
                options.fully_replicated = parse_flag(table, key, value.trim())?;
            }
            other if PASSTHROUGH_OPTIONS.contains(&other) => {
                debug!(table, option = other, "ignoring storage-only table option");
            }
            other => {
                return Err(TtlError::ttl_config(
                    table,
                    format!("unknown table option '{other}'"),
                ));
            }
        }
    }
    Ok(options)
}

fn parse_ttl_option(table: &str, value: &str) -> Result<TtlSpec, TtlError> {
    let Some((secs, column)) = value.split_once('@') else {
        return Err(TtlError::ttl_config(
            table,
            format!("TTL must be <seconds>@<column>, got '{value}'"),
        ));
    };
    let duration_secs = secs.trim().parse::<u64>().map_err(|_| {
        TtlError::ttl_config(table, format!("invalid TTL duration '{}'", secs.trim()))
    })?;
    let column = column.trim();
    if column.is_empty() {
        return Err(TtlError::ttl_config(table, "TTL column name is empty"));
    }
    Ok(TtlSpec {
        column: column.to_string(),
        duration_secs,
        enabled: true,
    })
}

fn parse_flag(table: &str, key: &str, value: &str) -> Result<bool, TtlError> {
    match value {
        "1" => Ok(true),
        "0" => Ok(false),
        _ => Err(TtlError::ttl_config(
            table,
            format!("{key} must be 0 or 1, got '{value}'"),
        )),
    }
}

fn validate_identifier(value: &str, name: &str) -> Result<(), TtlError> {
    if value.is_empty() {
        return Err(TtlError::Validation(format!("{name} must not be empty")));
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(TtlError::Validation(format!(
            "{name} must be <= {MAX_IDENTIFIER_LEN} bytes"
        )));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(TtlError::Validation(format!(
            "{name} must contain only [A-Za-z0-9_-]"
        )));
    }
    Ok(())
}
