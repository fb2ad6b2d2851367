//! Swap records.
//!
//! A swap moves through its own lifecycle next to the intent pipeline: the
//! funding leg is a regular intent, and the swap worker drives the rest.

use std::sync::Mutex;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use super::query::{paginate, Cursor, Direction};
use super::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    /// Created, waiting for the client to submit the funding intent.
    Created,
    /// Funding intent submitted, waiting for it to confirm.
    Funding,
    /// Funded, waiting for the client to sign the swap.
    Funded,
    /// Swap transaction is being submitted and monitored.
    Submitting,
    /// Swap landed. Terminal.
    Finalized,
    /// Cancellation transaction is being submitted and monitored.
    Cancelling,
    /// Swap was abandoned and funds restored. Terminal.
    Cancelled,
    /// Swap transaction failed on chain. Terminal.
    Failed,
}

impl State {
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Finalized | State::Cancelled | State::Failed)
    }

    pub fn can_transition_to(&self, next: State) -> bool {
        matches!(
            (self, next),
            (State::Created, State::Funding)
                | (State::Created, State::Cancelled)
                | (State::Funding, State::Funded)
                | (State::Funding, State::Cancelled)
                | (State::Funded, State::Submitting)
                | (State::Funded, State::Cancelling)
                | (State::Submitting, State::Finalized)
                | (State::Submitting, State::Failed)
                | (State::Cancelling, State::Cancelled)
        )
    }
}

#[derive(Debug, Clone)]
pub struct Record {
    pub id: u64,
    pub swap_id: String,
    pub owner: String,
    /// Vault the swap was funded from; receives funds back on cancellation.
    pub source_vault: String,
    pub funding_intent_id: Option<String>,
    pub from_mint: String,
    pub to_mint: String,
    pub quantity: u64,
    pub transaction_signature: Option<String>,
    pub transaction_blob: Option<Vec<u8>>,
    pub nonce: Option<String>,
    pub state: State,
    pub version: u64,
    pub created_at: SystemTime,
    pub funded_at: Option<SystemTime>,
}

pub trait Store: Send + Sync {
    fn put(&self, record: &mut Record) -> Result<(), StoreError>;

    fn get(&self, swap_id: &str) -> Result<Record, StoreError>;

    fn update(&self, record: &mut Record) -> Result<(), StoreError>;

    fn get_all_by_state(
        &self,
        state: State,
        cursor: Cursor,
        limit: usize,
        direction: Direction,
    ) -> Result<Vec<Record>, StoreError>;
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
    fn put(&self, record: &mut Record) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.records.iter().any(|r| r.swap_id == record.swap_id) {
            return Err(StoreError::AlreadyExists);
        }

        inner.next_id += 1;
        record.id = inner.next_id;
        record.version = 1;
        inner.records.push(record.clone());
        Ok(())
    }

    fn get(&self, swap_id: &str) -> Result<Record, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .iter()
            .find(|r| r.swap_id == swap_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn update(&self, record: &mut Record) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let stored = inner
            .records
            .iter_mut()
            .find(|r| r.swap_id == record.swap_id)
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

    fn get_all_by_state(
        &self,
        state: State,
        cursor: Cursor,
        limit: usize,
        direction: Direction,
    ) -> Result<Vec<Record>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let matches: Vec<Record> = inner
            .records
            .iter()
            .filter(|r| r.state == state)
            .cloned()
            .collect();
        Ok(paginate(matches, |r| r.id, cursor, limit, direction))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_edges() {
        assert!(State::Created.can_transition_to(State::Cancelled));
        assert!(State::Funded.can_transition_to(State::Cancelling));
        assert!(State::Cancelling.can_transition_to(State::Cancelled));
        assert!(!State::Cancelled.can_transition_to(State::Funding));
        assert!(!State::Finalized.can_transition_to(State::Cancelling));
    }
}
