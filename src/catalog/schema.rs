use crate::catalog::types::{ColumnType, Row, RowKey, Value};
use crate::clock::MICROS_PER_SEC;
use crate::error::TtlError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub col_type: ColumnType,
    pub nullable: bool,
}

impl ColumnDef {
    pub fn new(name: &str, col_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            col_type,
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Declared TTL of a table: rows expire `duration_secs` after the instant
/// stored in `column`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TtlSpec {
    pub column: String,
    pub duration_secs: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableOptions {
    pub ttl: Option<TtlSpec>,
    #[serde(default)]
    pub fully_replicated: bool,
}

impl TableOptions {
    pub fn with_ttl(column: &str, duration_secs: u64) -> Self {
        Self {
            ttl: Some(TtlSpec {
                column: column.to_string(),
                duration_secs,
                enabled: true,
            }),
            fully_replicated: false,
        }
    }

    pub fn fully_replicated(mut self) -> Self {
        self.fully_replicated = true;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableSchema {
    pub table_name: String,
    pub columns: Vec<ColumnDef>,
    /// Empty means the table is keyed by a hidden row id.
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub options: TableOptions,
}

impl TableSchema {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn has_hidden_key(&self) -> bool {
        self.primary_key.is_empty()
    }

    pub(crate) fn primary_key_indices(&self) -> Vec<usize> {
        self.primary_key
            .iter()
            .filter_map(|pk| self.column_index(pk))
            .collect()
    }

    /// Primary key of `row`. Tables with a hidden key have no key derivable
    /// from row contents and return `None`.
    pub fn key_of(&self, row: &Row) -> Option<RowKey> {
        if self.has_hidden_key() {
            return None;
        }
        Some(
            self.primary_key_indices()
                .into_iter()
                .map(|idx| row.values.get(idx).cloned().unwrap_or(Value::Null))
                .collect(),
        )
    }

    /// Checks arity, column types and nullability of a row about to be written.
    pub fn validate_row(&self, row: &Row) -> Result<(), TtlError> {
        if row.values.len() != self.columns.len() {
            return Err(TtlError::Validation(format!(
                "table '{}' has {} columns, row has {}",
                self.table_name,
                self.columns.len(),
                row.values.len()
            )));
        }
        for (col, value) in self.columns.iter().zip(row.values.iter()) {
            match value.column_type() {
                None => {
                    let in_pk = self.primary_key.iter().any(|pk| *pk == col.name);
                    if !col.nullable || in_pk {
                        return Err(TtlError::NotNullViolation {
                            table: self.table_name.clone(),
                            column: col.name.clone(),
                        });
                    }
                }
                Some(actual) if actual != col.col_type => {
                    return Err(TtlError::TypeMismatch {
                        table: self.table_name.clone(),
                        column: col.name.clone(),
                        expected: col.col_type.to_string(),
                        actual: actual.to_string(),
                    });
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Resolved TTL configuration handed to the expiry evaluator and reaper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlTableConfig {
    pub table: String,
    pub column: String,
    pub column_index: usize,
    pub duration_secs: u64,
    pub enabled: bool,
}

impl TtlTableConfig {
    pub fn duration_micros(&self) -> i64 {
        i64::try_from(self.duration_secs)
            .unwrap_or(i64::MAX)
            .saturating_mul(MICROS_PER_SEC)
    }

    pub fn ttl_value<'a>(&self, row: &'a Row) -> &'a Value {
        row.values.get(self.column_index).unwrap_or(&Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::{ColumnDef, TableOptions, TableSchema};
    use crate::catalog::types::{ColumnType, Row, Value};
    use crate::error::TtlError;

    fn sz() -> TableSchema {
        TableSchema {
            table_name: "sz".into(),
            columns: vec![
                ColumnDef::new("col_a", ColumnType::Integer).not_null(),
                ColumnDef::new("col_b", ColumnType::Timestamp),
                ColumnDef::new("col_c", ColumnType::Integer),
            ],
            primary_key: vec!["col_a".into()],
            options: TableOptions::with_ttl("col_b", 10),
        }
    }

    #[test]
    fn key_of_uses_primary_key_columns() {
        let schema = sz();
        let row = Row::from_values(vec![
            Value::Integer(7),
            Value::Timestamp(1),
            Value::Integer(100),
        ]);
        assert_eq!(schema.key_of(&row), Some(vec![Value::Integer(7)]));
    }

    #[test]
    fn validate_row_reports_type_and_null_errors() {
        let schema = sz();
        let wrong_type = Row::from_values(vec![
            Value::Integer(1),
            Value::Integer(5),
            Value::Integer(100),
        ]);
        assert!(matches!(
            schema.validate_row(&wrong_type),
            Err(TtlError::TypeMismatch { .. })
        ));
        let null_pk = Row::from_values(vec![Value::Null, Value::Null, Value::Null]);
        assert!(matches!(
            schema.validate_row(&null_pk),
            Err(TtlError::NotNullViolation { .. })
        ));
        let null_ttl = Row::from_values(vec![Value::Integer(1), Value::Null, Value::Null]);
        schema.validate_row(&null_ttl).expect("null ttl value allowed");
    }
}
