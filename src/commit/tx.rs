use crate::binlog::RowChange;
use crate::catalog::types::{Row, RowKey};
use crate::storage::TxId;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingWrite {
    Put(Row),
    Delete,
}

/// Buffered, uncommitted writes of one transaction.
#[derive(Debug, Clone, Default)]
pub struct WriteSet {
    entries: BTreeMap<(String, RowKey), PendingWrite>,
}

impl WriteSet {
    pub fn get(&self, table: &str, key: &RowKey) -> Option<&PendingWrite> {
        self.entries.get(&(table.to_string(), key.clone()))
    }

    pub fn put(&mut self, table: &str, key: RowKey, row: Row) {
        self.entries
            .insert((table.to_string(), key), PendingWrite::Put(row));
    }

    pub fn delete(&mut self, table: &str, key: RowKey) {
        self.entries
            .insert((table.to_string(), key), PendingWrite::Delete);
    }

    /// Forgets a pending write, e.g. an own insert deleted again before commit.
    pub fn remove(&mut self, table: &str, key: &RowKey) {
        self.entries.remove(&(table.to_string(), key.clone()));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Pending writes on `table` in key order.
    pub fn table_entries<'a>(
        &'a self,
        table: &'a str,
    ) -> impl Iterator<Item = (&'a RowKey, &'a PendingWrite)> + 'a {
        self.entries
            .iter()
            .filter(move |((t, _), _)| t == table)
            .map(|((_, k), w)| (k, w))
    }

    pub fn into_changes(self) -> Vec<RowChange> {
        self.entries
            .into_iter()
            .map(|((table, key), write)| match write {
                PendingWrite::Put(row) => RowChange::Write { table, key, row },
                PendingWrite::Delete => RowChange::Delete { table, key },
            })
            .collect()
    }
}

#[derive(Debug)]
pub struct Transaction {
    pub id: TxId,
    pub writes: WriteSet,
}

impl Transaction {
    pub fn new(id: TxId) -> Self {
        Self {
            id,
            writes: WriteSet::default(),
        }
    }
}
