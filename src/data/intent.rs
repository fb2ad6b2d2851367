//! Intent records.
//!
//! An intent is the top-level unit of user work. Its id is client-provided
//! and globally unique; its state only moves forward.

use std::sync::Mutex;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use super::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    OpenAccount,
    SendPayment,
    ReceivePayment,
    VoidGiftCard,
    Swap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    Unknown,
    Pending,
    Confirmed,
    Failed,
    Revoked,
}

impl State {
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Confirmed | State::Failed | State::Revoked)
    }

    /// Allowed edges. Transitions never regress and terminal states accept
    /// nothing.
    pub fn can_transition_to(&self, next: State) -> bool {
        match self {
            State::Unknown => matches!(next, State::Pending | State::Revoked),
            State::Pending => next.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Record {
    pub id: u64,
    pub intent_id: String,
    pub intent_type: Type,
    pub initiator_owner: String,
    pub destination_owner: Option<String>,
    pub destination_token_account: Option<String>,
    pub mint: Option<String>,
    pub quantity: Option<u64>,
    pub usd_value: Option<f64>,
    pub state: State,
    pub version: u64,
    pub created_at: SystemTime,
}

pub trait Store: Send + Sync {
    /// Inserts a new intent, assigning its store id. Fails with
    /// `AlreadyExists` when the client-provided intent id is taken.
    fn put(&self, record: &mut Record) -> Result<(), StoreError>;

    fn get(&self, intent_id: &str) -> Result<Record, StoreError>;

    /// Conditional write on a matching version; bumps the version on
    /// success and enforces the state machine edges.
    fn update(&self, record: &mut Record) -> Result<(), StoreError>;

    /// Number of intents an owner has initiated since the given time.
    fn count_by_initiator_since(
        &self,
        owner: &str,
        since: SystemTime,
    ) -> Result<u64, StoreError>;

    /// Total USD value of payment intents an owner has initiated since the
    /// given time, for AML limit math.
    fn transacted_usd_since(&self, owner: &str, since: SystemTime) -> Result<f64, StoreError>;

    /// The earliest payment intent whose destination token account is the
    /// given gift card vault, i.e. the issuance intent.
    fn get_gift_card_issued_intent(&self, vault: &str) -> Result<Record, StoreError>;
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
        if inner.records.iter().any(|r| r.intent_id == record.intent_id) {
            return Err(StoreError::AlreadyExists);
        }

        inner.next_id += 1;
        record.id = inner.next_id;
        record.version = 1;
        inner.records.push(record.clone());
        Ok(())
    }

    fn get(&self, intent_id: &str) -> Result<Record, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .iter()
            .find(|r| r.intent_id == intent_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn update(&self, record: &mut Record) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let stored = inner
            .records
            .iter_mut()
            .find(|r| r.intent_id == record.intent_id)
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

    fn count_by_initiator_since(
        &self,
        owner: &str,
        since: SystemTime,
    ) -> Result<u64, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .records
            .iter()
            .filter(|r| r.initiator_owner == owner && r.created_at >= since)
            .count() as u64)
    }

    fn transacted_usd_since(&self, owner: &str, since: SystemTime) -> Result<f64, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .records
            .iter()
            .filter(|r| {
                r.initiator_owner == owner
                    && r.created_at >= since
                    && matches!(r.intent_type, Type::SendPayment)
                    && r.state != State::Revoked
            })
            .filter_map(|r| r.usd_value)
            .sum())
    }

    fn get_gift_card_issued_intent(&self, vault: &str) -> Result<Record, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .iter()
            .filter(|r| {
                r.intent_type == Type::SendPayment
                    && r.destination_token_account.as_deref() == Some(vault)
            })
            .min_by_key(|r| r.id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_record(intent_id: &str) -> Record {
        Record {
            id: 0,
            intent_id: intent_id.to_string(),
            intent_type: Type::SendPayment,
            initiator_owner: "owner".to_string(),
            destination_owner: None,
            destination_token_account: None,
            mint: None,
            quantity: Some(100),
            usd_value: Some(1.0),
            state: State::Pending,
            version: 0,
            created_at: SystemTime::now(),
        }
    }

    #[test]
    fn intent_id_is_unique() {
        let store = MemoryStore::new();
        let mut record = test_record("i1");
        store.put(&mut record).unwrap();
        assert_eq!(record.id, 1);

        let mut duplicate = test_record("i1");
        assert_eq!(store.put(&mut duplicate), Err(StoreError::AlreadyExists));
    }

    #[test]
    fn update_requires_fresh_version() {
        let store = MemoryStore::new();
        let mut record = test_record("i1");
        store.put(&mut record).unwrap();

        let mut stale = record.clone();
        record.state = State::Confirmed;
        store.update(&mut record).unwrap();

        stale.state = State::Failed;
        assert_eq!(store.update(&mut stale), Err(StoreError::StaleVersion));
    }

    #[test]
    fn state_transitions_are_monotone() {
        let store = MemoryStore::new();
        let mut record = test_record("i1");
        store.put(&mut record).unwrap();

        record.state = State::Confirmed;
        store.update(&mut record).unwrap();

        record.state = State::Pending;
        assert_eq!(
            store.update(&mut record),
            Err(StoreError::InvalidStateTransition)
        );
    }

    #[test]
    fn allowed_edges() {
        assert!(State::Unknown.can_transition_to(State::Pending));
        assert!(State::Pending.can_transition_to(State::Confirmed));
        assert!(State::Pending.can_transition_to(State::Failed));
        assert!(State::Pending.can_transition_to(State::Revoked));
        assert!(!State::Confirmed.can_transition_to(State::Pending));
        assert!(!State::Failed.can_transition_to(State::Confirmed));
        assert!(!State::Unknown.can_transition_to(State::Confirmed));
    }
}
