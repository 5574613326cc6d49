use crate::catalog::types::{Row, RowKey, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

/// Latest committed version of a row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRow {
    pub row: Row,
    /// Commit sequence that wrote this version.
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableData {
    pub rows: BTreeMap<RowKey, StoredRow>,
    /// Next hidden row id for tables without a primary key.
    #[serde(default)]
    pub next_row_id: i64,
}

impl TableData {
    pub fn get(&self, key: &RowKey) -> Option<&StoredRow> {
        self.rows.get(key)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Up to `limit` rows in key order strictly after `after`.
    pub fn scan_after(&self, after: Option<&RowKey>, limit: usize) -> Vec<(RowKey, StoredRow)> {
        let lower = match after {
            Some(k) => Bound::Excluded(k.clone()),
            None => Bound::Unbounded,
        };
        self.rows
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn allocate_row_id(&mut self) -> RowKey {
        self.next_row_id = self.next_row_id.max(1);
        let id = self.next_row_id;
        self.next_row_id += 1;
        vec![Value::Integer(id)]
    }

    fn observe_key(&mut self, key: &RowKey) {
        if let [Value::Integer(id)] = key.as_slice()
            && *id >= self.next_row_id
        {
            self.next_row_id = id.saturating_add(1);
        }
    }
}

/// Committed rows of every table.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Keyspace {
    pub tables: HashMap<String, TableData>,
}

impl Keyspace {
    pub fn table(&self, table: &str) -> Option<&TableData> {
        self.tables.get(table)
    }

    pub fn table_mut(&mut self, table: &str) -> &mut TableData {
        self.tables.entry(table.to_string()).or_default()
    }

    pub fn get_row(&self, table: &str, key: &RowKey) -> Option<&StoredRow> {
        self.tables.get(table).and_then(|t| t.get(key))
    }

    pub fn upsert_row(&mut self, table: &str, key: RowKey, row: Row, version: u64) {
        let data = self.table_mut(table);
        data.observe_key(&key);
        data.rows.insert(key, StoredRow { row, version });
    }

    /// Returns false when the row was already absent.
    pub fn delete_row(&mut self, table: &str, key: &RowKey) -> bool {
        self.tables
            .get_mut(table)
            .is_some_and(|t| t.rows.remove(key).is_some())
    }

    pub fn drop_table(&mut self, table: &str) {
        self.tables.remove(table);
    }

    pub fn row_count(&self) -> usize {
        self.tables.values().map(TableData::len).sum()
    }
}
