//! Durable nonce records.
//!
//! A nonce is a single-use replay token anchored on chain. The state machine
//! is explicit: transitions outside the allowed set are store errors, not
//! silent writes.

use std::fmt;
use std::sync::Mutex;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use super::StoreError;

/// Where the nonce account lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Environment {
    Solana,
    Cvm,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Solana => f.write_str("solana"),
            Environment::Cvm => f.write_str("cvm"),
        }
    }
}

/// The canonical instance name for Solana mainnet pools. CVM pools use the
/// VM account address as their instance.
pub const INSTANCE_SOLANA_MAINNET: &str = "mainnet";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Purpose {
    ClientIntent,
    ClientSwap,
    OnDemandTransaction,
    InternalServerProcess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    /// Created but not yet observed initialized on chain.
    Unknown,
    /// Ready for claiming.
    Available,
    /// Claimed by exactly one fulfillment, transaction not yet submitted.
    Reserved,
    /// Transaction using the nonce has been submitted.
    Claimed,
    /// Consumed; waiting for the on-chain value to advance before reuse.
    Released,
    /// Corrupted, uninitialized, or lost. Terminal.
    Invalid,
}

impl State {
    pub fn can_transition_to(&self, next: State) -> bool {
        if next == State::Invalid {
            return !matches!(self, State::Invalid);
        }
        matches!(
            (self, next),
            (State::Unknown, State::Available)
                | (State::Available, State::Reserved)
                | (State::Reserved, State::Claimed)
                | (State::Reserved, State::Released)
                | (State::Claimed, State::Released)
                | (State::Released, State::Available)
        )
    }
}

#[derive(Debug, Clone)]
pub struct Record {
    pub id: u64,
    pub address: String,
    pub authority: String,
    pub environment: Environment,
    pub instance: String,
    pub purpose: Purpose,
    pub state: State,
    /// The current durable value (blockhash or virtual nonce value).
    pub blockhash: Option<String>,
    /// Signature of the transaction the nonce was consumed by.
    pub signature: Option<String>,
    pub version: u64,
    pub created_at: SystemTime,
}

impl Record {
    pub fn pool_key(&self) -> (Environment, &str, Purpose) {
        (self.environment, self.instance.as_str(), self.purpose)
    }
}

pub trait Store: Send + Sync {
    /// Inserts a new nonce record. Fails with `AlreadyExists` when the
    /// address is taken.
    fn put(&self, record: &mut Record) -> Result<(), StoreError>;

    fn get(&self, address: &str) -> Result<Record, StoreError>;

    /// Conditional write on a matching version, enforcing the state machine.
    fn update(&self, record: &mut Record) -> Result<(), StoreError>;

    fn count_by_state_and_purpose(
        &self,
        environment: Environment,
        instance: &str,
        state: State,
        purpose: Purpose,
    ) -> Result<u64, StoreError>;

    /// Records in a pool and state, ordered by id, oldest first.
    fn get_all_by_state_and_purpose(
        &self,
        environment: Environment,
        instance: &str,
        state: State,
        purpose: Purpose,
        limit: usize,
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
        if inner.records.iter().any(|r| r.address == record.address) {
            return Err(StoreError::AlreadyExists);
        }

        inner.next_id += 1;
        record.id = inner.next_id;
        record.version = 1;
        inner.records.push(record.clone());
        Ok(())
    }

    fn get(&self, address: &str) -> Result<Record, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .iter()
            .find(|r| r.address == address)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn update(&self, record: &mut Record) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let stored = inner
            .records
            .iter_mut()
            .find(|r| r.address == record.address)
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

    fn count_by_state_and_purpose(
        &self,
        environment: Environment,
        instance: &str,
        state: State,
        purpose: Purpose,
    ) -> Result<u64, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .records
            .iter()
            .filter(|r| {
                r.environment == environment
                    && r.instance == instance
                    && r.state == state
                    && r.purpose == purpose
            })
            .count() as u64)
    }

    fn get_all_by_state_and_purpose(
        &self,
        environment: Environment,
        instance: &str,
        state: State,
        purpose: Purpose,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut records: Vec<Record> = inner
            .records
            .iter()
            .filter(|r| {
                r.environment == environment
                    && r.instance == instance
                    && r.state == state
                    && r.purpose == purpose
            })
            .cloned()
            .collect();
        records.sort_by_key(|r| r.id);
        records.truncate(limit);
        Ok(records)
    }
}
