//! Cached balances and the global optimistic version lock.
//!
//! The version lock serializes accounting mutations across processes: read
//! the current version, stamp it on new work, and commit conditionally. The
//! process-local account mutex map handles in-process serialization; this
//! lock is the cross-process half.

use std::collections::HashMap;
use std::sync::Mutex;

use super::StoreError;

/// A captured balance version for a token account. Committing fails with
/// `StaleVersion` when another writer advanced the version in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimisticVersionLock {
    pub token_account: String,
    pub version: u64,
}

pub trait Store: Send + Sync {
    /// Cached balance in quarks. Unknown accounts read as zero.
    fn get_cached_balance(&self, token_account: &str) -> Result<u64, StoreError>;

    /// Captures the current version for the account, creating it at version
    /// zero on first use.
    fn get_version_lock(&self, token_account: &str) -> Result<OptimisticVersionLock, StoreError>;

    /// Conditionally advances the version, optionally writing a new cached
    /// balance in the same step.
    fn commit(
        &self,
        lock: &OptimisticVersionLock,
        new_balance: Option<u64>,
    ) -> Result<(), StoreError>;
}

#[derive(Default)]
struct Entry {
    balance: u64,
    version: u64,
}

pub struct MemoryStore {
    inner: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    fn get_cached_balance(&self, token_account: &str) -> Result<u64, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.get(token_account).map(|e| e.balance).unwrap_or(0))
    }

    fn get_version_lock(&self, token_account: &str) -> Result<OptimisticVersionLock, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entry(token_account.to_string()).or_default();
        Ok(OptimisticVersionLock {
            token_account: token_account.to_string(),
            version: entry.version,
        })
    }

    fn commit(
        &self,
        lock: &OptimisticVersionLock,
        new_balance: Option<u64>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .get_mut(&lock.token_account)
            .ok_or(StoreError::NotFound)?;

        if entry.version != lock.version {
            return Err(StoreError::StaleVersion);
        }

        entry.version += 1;
        if let Some(balance) = new_balance {
            entry.balance = balance;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_detects_concurrent_writer() {
        let store = MemoryStore::new();
        let lock_a = store.get_version_lock("vault").unwrap();
        let lock_b = store.get_version_lock("vault").unwrap();

        store.commit(&lock_a, Some(100)).unwrap();
        assert_eq!(store.commit(&lock_b, Some(200)), Err(StoreError::StaleVersion));
        assert_eq!(store.get_cached_balance("vault").unwrap(), 100);
    }

    #[test]
    fn unknown_accounts_read_as_zero() {
        let store = MemoryStore::new();
        assert_eq!(store.get_cached_balance("vault").unwrap(), 0);
    }
}
