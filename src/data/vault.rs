//! Server-managed vault keys.
//!
//! Vault keys become nonce account owners. Keys are durably persisted before
//! they are ever offered to the allocator, so no in-memory key is used.

use std::sync::Mutex;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::common::Account;

use super::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    Available,
    Reserved,
}

#[derive(Debug, Clone)]
pub struct Record {
    pub id: u64,
    pub public_key: String,
    /// Base58-encoded 64-byte private key.
    pub private_key: String,
    pub state: State,
    pub created_at: SystemTime,
}

/// Grinds for a vanity key whose base58 public-key form begins with the
/// given prefix. Runs on a background loop; long prefixes take a while.
pub fn grind_key(prefix: &str) -> Record {
    loop {
        let account = Account::generate();
        let public_key = account.to_base58();
        if public_key.starts_with(prefix) {
            return Record {
                id: 0,
                public_key,
                private_key: account
                    .private_key_base58()
                    .expect("generated account always has a private key"),
                state: State::Available,
                created_at: SystemTime::now(),
            };
        }
    }
}

pub trait Store: Send + Sync {
    /// Inserts or updates a key record, keyed by public key.
    fn save(&self, record: &mut Record) -> Result<(), StoreError>;

    fn get(&self, public_key: &str) -> Result<Record, StoreError>;

    fn count_by_state(&self, state: State) -> Result<u64, StoreError>;

    fn get_all_by_state(&self, state: State, limit: usize) -> Result<Vec<Record>, StoreError>;
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    records: Vec<Record>,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    fn save(&self, record: &mut Record) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(stored) = inner
            .records
            .iter_mut()
            .find(|r| r.public_key == record.public_key)
        {
            record.id = stored.id;
            *stored = record.clone();
            return Ok(());
        }

        inner.next_id += 1;
        record.id = inner.next_id;
        inner.records.push(record.clone());
        Ok(())
    }

    fn get(&self, public_key: &str) -> Result<Record, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .iter()
            .find(|r| r.public_key == public_key)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn count_by_state(&self, state: State) -> Result<u64, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.records.iter().filter(|r| r.state == state).count() as u64)
    }

    fn get_all_by_state(&self, state: State, limit: usize) -> Result<Vec<Record>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut records: Vec<Record> = inner
            .records
            .iter()
            .filter(|r| r.state == state)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.id);
        records.truncate(limit);
        if records.is_empty() {
            return Err(StoreError::NotFound);
        }
        Ok(records)
    }
}
