use crate::catalog::types::RowKey;
use crate::error::TtlError;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::debug;

pub type TxId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockMode {
    Shared,
    Exclusive,
}

type LockKey = (String, RowKey);

#[derive(Debug, Default)]
struct LockEntry {
    exclusive: Option<TxId>,
    shared: BTreeSet<TxId>,
}

impl LockEntry {
    fn grantable(&self, owner: TxId, mode: LockMode) -> bool {
        let exclusive_ok = self.exclusive.is_none_or(|holder| holder == owner);
        match mode {
            LockMode::Shared => exclusive_ok,
            LockMode::Exclusive => exclusive_ok && self.shared.iter().all(|h| *h == owner),
        }
    }

    fn held_by(&self, owner: TxId) -> Option<LockMode> {
        if self.exclusive == Some(owner) {
            Some(LockMode::Exclusive)
        } else if self.shared.contains(&owner) {
            Some(LockMode::Shared)
        } else {
            None
        }
    }

    fn is_free(&self) -> bool {
        self.exclusive.is_none() && self.shared.is_empty()
    }
}

#[derive(Debug, Default)]
struct LockTable {
    entries: HashMap<LockKey, LockEntry>,
    owned: HashMap<TxId, HashSet<LockKey>>,
}

impl LockTable {
    fn grant(&mut self, owner: TxId, key: &LockKey, mode: LockMode) -> bool {
        let entry = self.entries.entry(key.clone()).or_default();
        let newly_held = entry.held_by(owner).is_none();
        match mode {
            LockMode::Shared => {
                if entry.exclusive != Some(owner) {
                    entry.shared.insert(owner);
                }
            }
            LockMode::Exclusive => {
                entry.shared.remove(&owner);
                entry.exclusive = Some(owner);
            }
        }
        self.owned.entry(owner).or_default().insert(key.clone());
        newly_held
    }

    fn release(&mut self, owner: TxId, key: &LockKey) {
        if let Some(entry) = self.entries.get_mut(key) {
            if entry.exclusive == Some(owner) {
                entry.exclusive = None;
            }
            entry.shared.remove(&owner);
            if entry.is_free() {
                self.entries.remove(key);
            }
        }
        if let Some(keys) = self.owned.get_mut(&owner) {
            keys.remove(key);
            if keys.is_empty() {
                self.owned.remove(&owner);
            }
        }
    }
}

/// Outcome of a granted lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockGrant {
    /// The owner held no lock on the row before this request.
    pub newly_held: bool,
    /// The request had to wait for another holder.
    pub waited: bool,
}

/// Shared/exclusive row locks keyed by (table, key), owned by transactions.
#[derive(Debug, Default)]
pub struct RowLockManager {
    state: Mutex<LockTable>,
    cv: Condvar,
}

impl RowLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the lock is granted or `timeout` passes.
    pub fn acquire(
        &self,
        owner: TxId,
        table: &str,
        key: &RowKey,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<LockGrant, TtlError> {
        let lock_key = (table.to_string(), key.clone());
        let deadline = Instant::now() + timeout;
        let mut waited = false;
        let mut state = self.state.lock();
        loop {
            let grantable = state
                .entries
                .get(&lock_key)
                .is_none_or(|e| e.grantable(owner, mode));
            if grantable {
                let newly_held = state.grant(owner, &lock_key, mode);
                return Ok(LockGrant { newly_held, waited });
            }
            waited = true;
            if self.cv.wait_until(&mut state, deadline).timed_out() {
                let still_blocked = state
                    .entries
                    .get(&lock_key)
                    .is_some_and(|e| !e.grantable(owner, mode));
                if still_blocked {
                    debug!(table, owner, ?mode, "row lock wait timed out");
                    return Err(TtlError::LockWaitTimeout {
                        table: table.to_string(),
                    });
                }
            }
        }
    }

    /// Never blocks. Contention is reported as [`TtlError::LockContention`].
    pub fn try_acquire(
        &self,
        owner: TxId,
        table: &str,
        key: &RowKey,
        mode: LockMode,
    ) -> Result<LockGrant, TtlError> {
        let lock_key = (table.to_string(), key.clone());
        let mut state = self.state.lock();
        let grantable = state
            .entries
            .get(&lock_key)
            .is_none_or(|e| e.grantable(owner, mode));
        if !grantable {
            return Err(TtlError::LockContention {
                table: table.to_string(),
            });
        }
        let newly_held = state.grant(owner, &lock_key, mode);
        Ok(LockGrant {
            newly_held,
            waited: false,
        })
    }

    pub fn holds(&self, owner: TxId, table: &str, key: &RowKey) -> Option<LockMode> {
        let state = self.state.lock();
        state
            .entries
            .get(&(table.to_string(), key.clone()))
            .and_then(|e| e.held_by(owner))
    }

    pub fn release(&self, owner: TxId, table: &str, key: &RowKey) {
        let mut state = self.state.lock();
        state.release(owner, &(table.to_string(), key.clone()));
        drop(state);
        self.cv.notify_all();
    }

    pub fn release_all(&self, owner: TxId) -> usize {
        let mut state = self.state.lock();
        let Some(keys) = state.owned.remove(&owner) else {
            return 0;
        };
        let released = keys.len();
        for key in keys {
            if let Some(entry) = state.entries.get_mut(&key) {
                if entry.exclusive == Some(owner) {
                    entry.exclusive = None;
                }
                entry.shared.remove(&owner);
                if entry.is_free() {
                    state.entries.remove(&key);
                }
            }
        }
        drop(state);
        self.cv.notify_all();
        released
    }

    pub fn held_count(&self, owner: TxId) -> usize {
        self.state.lock().owned.get(&owner).map_or(0, HashSet::len)
    }
}
