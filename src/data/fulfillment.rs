//! Fulfillment records.
//!
//! A fulfillment is the leaf unit of the pipeline and maps to at most one
//! on-chain transaction attempt. The three ordering indices define a total
//! order used by the scheduler: for any account, fulfillments are considered
//! in ascending (intent, action, fulfillment) ordering.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use super::query::{paginate, Cursor, Direction};
use super::{action, intent, StoreError};

/// Fulfillment types encode which exact transaction template is built. This
/// is a superset of the action types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    InitializeLockedTimelockAccount,
    NoPrivacyTransferWithAuthority,
    NoPrivacyWithdraw,
    CloseEmptyTimelockAccount,
}

pub use super::intent::State;

#[derive(Debug, Clone)]
pub struct Record {
    pub id: u64,
    pub intent_id: String,
    pub intent_type: intent::Type,
    pub action_id: u32,
    pub action_type: action::Type,
    pub fulfillment_type: Type,
    pub state: State,
    pub source: String,
    pub destination: Option<String>,
    /// Durable nonce bound to this fulfillment, when the type requires one.
    pub nonce: Option<String>,
    /// Blockhash (or virtual nonce value) the transaction was built against.
    pub blockhash: Option<String>,
    /// Signed transaction blob, absent for on-demand types until submission.
    pub data: Option<Vec<u8>>,
    pub signature: Option<String>,
    /// Identifies the fulfillment inside a compressed virtual-machine
    /// transaction.
    pub virtual_signature: Option<String>,
    /// Defers the fulfillment until an external precondition flips it back.
    pub disable_active_scheduling: bool,
    pub intent_ordering_index: u64,
    pub action_ordering_index: u32,
    pub fulfillment_ordering_index: u32,
    pub version: u64,
    pub created_at: SystemTime,
}

impl Record {
    pub fn ordering(&self) -> (u64, u32, u32) {
        (
            self.intent_ordering_index,
            self.action_ordering_index,
            self.fulfillment_ordering_index,
        )
    }

    pub fn involves(&self, address: &str) -> bool {
        self.source == address || self.destination.as_deref() == Some(address)
    }
}

pub trait Store: Send + Sync {
    /// Inserts all fulfillments of one intent in a single atomic write,
    /// assigning ids. Fails with `AlreadyExists` on any signature or
    /// virtual-signature collision.
    fn put_all(&self, records: &mut [Record]) -> Result<(), StoreError>;

    fn update(&self, record: &mut Record) -> Result<(), StoreError>;

    fn get_by_id(&self, id: u64) -> Result<Record, StoreError>;

    fn get_by_signature(&self, signature: &str) -> Result<Record, StoreError>;

    fn get_by_virtual_signature(&self, signature: &str) -> Result<Record, StoreError>;

    fn get_all_by_state(
        &self,
        state: State,
        include_disabled_active_scheduling: bool,
        cursor: Cursor,
        limit: usize,
        direction: Direction,
    ) -> Result<Vec<Record>, StoreError>;

    fn get_all_by_action(&self, intent_id: &str, action_id: u32) -> Result<Vec<Record>, StoreError>;

    fn count_by_state(&self, state: State) -> Result<u64, StoreError>;

    fn count_by_state_and_address(&self, state: State, address: &str) -> Result<u64, StoreError>;

    fn count_by_intent_and_state(&self, intent_id: &str, state: State) -> Result<u64, StoreError>;

    /// Pending-transaction counts by type, for fee estimation gauges.
    fn count_pending_by_type(&self) -> Result<HashMap<Type, u64>, StoreError>;

    /// The earliest non-terminal fulfillment with the account as its source,
    /// by total ordering.
    fn get_first_schedulable_by_address_as_source(
        &self,
        address: &str,
    ) -> Result<Record, StoreError>;

    /// The earliest non-terminal fulfillment with the account as its
    /// destination, by total ordering.
    fn get_first_schedulable_by_address_as_destination(
        &self,
        address: &str,
    ) -> Result<Record, StoreError>;

    /// The next non-terminal fulfillment involving the account after the
    /// given ordering point.
    fn get_next_schedulable_by_address(
        &self,
        address: &str,
        intent_ordering_index: u64,
        action_ordering_index: u32,
        fulfillment_ordering_index: u32,
    ) -> Result<Record, StoreError>;
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

fn is_schedulable(record: &Record) -> bool {
    !record.state.is_terminal()
}

impl Store for MemoryStore {
    fn put_all(&self, records: &mut [Record]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();

        for record in records.iter() {
            let collision = inner.records.iter().any(|r| {
                (record.signature.is_some() && r.signature == record.signature)
                    || (record.virtual_signature.is_some()
                        && r.virtual_signature == record.virtual_signature)
            });
            if collision {
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

    fn update(&self, record: &mut Record) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let stored = inner
            .records
            .iter_mut()
            .find(|r| r.id == record.id)
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

    fn get_by_id(&self, id: u64) -> Result<Record, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn get_by_signature(&self, signature: &str) -> Result<Record, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .iter()
            .find(|r| r.signature.as_deref() == Some(signature))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn get_by_virtual_signature(&self, signature: &str) -> Result<Record, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .iter()
            .find(|r| r.virtual_signature.as_deref() == Some(signature))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn get_all_by_state(
        &self,
        state: State,
        include_disabled_active_scheduling: bool,
        cursor: Cursor,
        limit: usize,
        direction: Direction,
    ) -> Result<Vec<Record>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let matches: Vec<Record> = inner
            .records
            .iter()
            .filter(|r| {
                r.state == state
                    && (include_disabled_active_scheduling || !r.disable_active_scheduling)
            })
            .cloned()
            .collect();

        Ok(paginate(matches, |r| r.id, cursor, limit, direction))
    }

    fn get_all_by_action(
        &self,
        intent_id: &str,
        action_id: u32,
    ) -> Result<Vec<Record>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut records: Vec<Record> = inner
            .records
            .iter()
            .filter(|r| r.intent_id == intent_id && r.action_id == action_id)
            .cloned()
            .collect();
        if records.is_empty() {
            return Err(StoreError::NotFound);
        }
        records.sort_by_key(|r| r.fulfillment_ordering_index);
        Ok(records)
    }

    fn count_by_state(&self, state: State) -> Result<u64, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.records.iter().filter(|r| r.state == state).count() as u64)
    }

    fn count_by_state_and_address(&self, state: State, address: &str) -> Result<u64, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .records
            .iter()
            .filter(|r| r.state == state && r.involves(address))
            .count() as u64)
    }

    fn count_by_intent_and_state(&self, intent_id: &str, state: State) -> Result<u64, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .records
            .iter()
            .filter(|r| r.intent_id == intent_id && r.state == state)
            .count() as u64)
    }

    fn count_pending_by_type(&self) -> Result<HashMap<Type, u64>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut counts = HashMap::new();
        for record in inner.records.iter().filter(|r| r.state == State::Pending) {
            *counts.entry(record.fulfillment_type).or_insert(0) += 1;
        }
        Ok(counts)
    }

    fn get_first_schedulable_by_address_as_source(
        &self,
        address: &str,
    ) -> Result<Record, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .iter()
            .filter(|r| is_schedulable(r) && r.source == address)
            .min_by_key(|r| r.ordering())
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn get_first_schedulable_by_address_as_destination(
        &self,
        address: &str,
    ) -> Result<Record, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .iter()
            .filter(|r| is_schedulable(r) && r.destination.as_deref() == Some(address))
            .min_by_key(|r| r.ordering())
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn get_next_schedulable_by_address(
        &self,
        address: &str,
        intent_ordering_index: u64,
        action_ordering_index: u32,
        fulfillment_ordering_index: u32,
    ) -> Result<Record, StoreError> {
        let point = (
            intent_ordering_index,
            action_ordering_index,
            fulfillment_ordering_index,
        );
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .iter()
            .filter(|r| is_schedulable(r) && r.involves(address) && r.ordering() > point)
            .min_by_key(|r| r.ordering())
            .cloned()
            .ok_or(StoreError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn test_record(intent_id: &str, action_id: u32, ordering: u32) -> Record {
        Record {
            id: 0,
            intent_id: intent_id.to_string(),
            intent_type: intent::Type::SendPayment,
            action_id,
            action_type: action::Type::NoPrivacyTransfer,
            fulfillment_type: Type::NoPrivacyTransferWithAuthority,
            state: State::Unknown,
            source: "source".to_string(),
            destination: Some("destination".to_string()),
            nonce: None,
            blockhash: None,
            data: None,
            signature: None,
            virtual_signature: None,
            disable_active_scheduling: false,
            intent_ordering_index: 0,
            action_ordering_index: action_id,
            fulfillment_ordering_index: ordering,
            version: 0,
            created_at: SystemTime::now(),
        }
    }

    #[test]
    fn put_all_rejects_signature_collision() {
        let store = MemoryStore::new();
        let mut first = test_record("i1", 0, 0);
        first.signature = Some("sig".to_string());
        store.put_all(std::slice::from_mut(&mut first)).unwrap();

        let mut second = test_record("i2", 0, 0);
        second.signature = Some("sig".to_string());
        assert_eq!(
            store.put_all(std::slice::from_mut(&mut second)),
            Err(StoreError::AlreadyExists)
        );
    }

    #[test]
    fn scheduling_order_is_total() {
        let store = MemoryStore::new();
        let mut records = vec![
            test_record("i1", 1, 0),
            test_record("i1", 0, 1),
            test_record("i1", 0, 0),
        ];
        for record in records.iter_mut() {
            record.intent_ordering_index = 7;
        }
        store.put_all(&mut records).unwrap();

        let first = store
            .get_first_schedulable_by_address_as_source("source")
            .unwrap();
        assert_eq!(first.ordering(), (7, 0, 0));

        let next = store
            .get_next_schedulable_by_address("source", 7, 0, 0)
            .unwrap();
        assert_eq!(next.ordering(), (7, 0, 1));
    }

    #[test]
    fn terminal_records_are_not_schedulable() {
        let store = MemoryStore::new();
        let mut record = test_record("i1", 0, 0);
        store.put_all(std::slice::from_mut(&mut record)).unwrap();

        record.state = State::Pending;
        store.update(&mut record).unwrap();
        record.state = State::Confirmed;
        store.update(&mut record).unwrap();

        assert!(store
            .get_first_schedulable_by_address_as_source("source")
            .is_err());
    }

    #[test]
    fn disabled_scheduling_is_filtered() {
        let store = MemoryStore::new();
        let mut enabled = test_record("i1", 0, 0);
        let mut disabled = test_record("i2", 0, 0);
        disabled.disable_active_scheduling = true;
        store.put_all(std::slice::from_mut(&mut enabled)).unwrap();
        store.put_all(std::slice::from_mut(&mut disabled)).unwrap();

        let visible = store
            .get_all_by_state(State::Unknown, false, None, 10, Direction::Ascending)
            .unwrap();
        assert_eq!(visible.len(), 1);

        let all = store
            .get_all_by_state(State::Unknown, true, None, 10, Direction::Ascending)
            .unwrap();
        assert_eq!(all.len(), 2);
    }
}
