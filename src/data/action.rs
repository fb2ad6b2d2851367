//! Action records.
//!
//! Actions are the sub-units of an intent, identified by a dense zero-based
//! index assigned at decomposition. All actions of an intent are created in
//! a single durable write; only sequencer callbacks advance their states.

use std::sync::Mutex;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use super::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    OpenAccount,
    CloseEmptyAccount,
    NoPrivacyTransfer,
    NoPrivacyWithdraw,
}

pub use super::intent::State;

#[derive(Debug, Clone)]
pub struct Record {
    pub id: u64,
    pub intent_id: String,
    pub action_id: u32,
    pub action_type: Type,
    pub source: String,
    pub destination: Option<String>,
    pub quantity: Option<u64>,
    pub state: State,
    pub version: u64,
    pub created_at: SystemTime,
}

pub trait Store: Send + Sync {
    /// Inserts all actions of one intent. Fails with `AlreadyExists` when
    /// any `(intent_id, action_id)` pair is taken.
    fn put_all(&self, records: &mut [Record]) -> Result<(), StoreError>;

    fn get_by_id(&self, intent_id: &str, action_id: u32) -> Result<Record, StoreError>;

    fn get_all_by_intent(&self, intent_id: &str) -> Result<Vec<Record>, StoreError>;

    fn update(&self, record: &mut Record) -> Result<(), StoreError>;

    /// The withdraw action that drained a gift card vault, when one exists.
    /// Covers both a user claim and the server's auto-return.
    fn get_gift_card_claimed_action(&self, vault: &str) -> Result<Record, StoreError>;
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
    fn put_all(&self, records: &mut [Record]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        for record in records.iter() {
            let taken = inner
                .records
                .iter()
                .any(|r| r.intent_id == record.intent_id && r.action_id == record.action_id);
            if taken {
                return Err(StoreError::AlreadyExists);
            }
        }

        for record in records.iter_mut() {
            inner.next_id += 1;
            record.id = inner.next_id;
            record.version = 1;
            inner.records.push(record.clone());
        }
        Ok(())
    }

    fn get_by_id(&self, intent_id: &str, action_id: u32) -> Result<Record, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .iter()
            .find(|r| r.intent_id == intent_id && r.action_id == action_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn get_all_by_intent(&self, intent_id: &str) -> Result<Vec<Record>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut records: Vec<Record> = inner
            .records
            .iter()
            .filter(|r| r.intent_id == intent_id)
            .cloned()
            .collect();
        if records.is_empty() {
            return Err(StoreError::NotFound);
        }
        records.sort_by_key(|r| r.action_id);
        Ok(records)
    }

    fn update(&self, record: &mut Record) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let stored = inner
            .records
            .iter_mut()
            .find(|r| r.intent_id == record.intent_id && r.action_id == record.action_id)
            .ok_or(StoreError::NotFound)?;

        if stored.version != record.version {
            return Err(StoreError::StaleVersion);
        }
        if stored.state != record.state && !stored.state.can_transition_to(record.state) {
            return Err(StoreError::InvalidStateTransition);
        }

        record.version += 1;
        *stored = record.clone();
        Ok(())
    }

    fn get_gift_card_claimed_action(&self, vault: &str) -> Result<Record, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .iter()
            .filter(|r| {
                r.action_type == Type::NoPrivacyWithdraw
                    && r.source == vault
                    && r.state != State::Revoked
                    && r.state != State::Failed
            })
            .min_by_key(|r| r.id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }
}
