pub mod keyspace;
pub mod lock;

pub use keyspace::{Keyspace, StoredRow, TableData};
pub use lock::{LockGrant, LockMode, RowLockManager, TxId};
