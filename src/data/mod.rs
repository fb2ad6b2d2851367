//! Data layer.
//!
//! One module per persisted entity, each carrying its record type, state
//! machine, store trait, and in-memory store. A relational engine would
//! implement the same traits; the in-memory stores are the reference
//! implementation and back every test.

pub mod account_info;
pub mod action;
pub mod balance;
pub mod currency;
pub mod fulfillment;
pub mod intent;
pub mod nonce;
pub mod query;
pub mod swap;
pub mod vault;

use std::sync::{Arc, Mutex};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("record already exists")]
    AlreadyExists,
    #[error("record version is stale")]
    StaleVersion,
    #[error("invalid state transition")]
    InvalidStateTransition,
}

/// Aggregates every store behind one handle, the way request handlers and
/// workers consume them.
#[derive(Clone)]
pub struct Provider {
    pub intents: Arc<dyn intent::Store>,
    pub actions: Arc<dyn action::Store>,
    pub fulfillments: Arc<dyn fulfillment::Store>,
    pub nonces: Arc<dyn nonce::Store>,
    pub vault_keys: Arc<dyn vault::Store>,
    pub account_infos: Arc<dyn account_info::Store>,
    pub balances: Arc<dyn balance::Store>,
    pub currencies: Arc<dyn currency::Store>,
    pub swaps: Arc<dyn swap::Store>,

    // Serializes whole-graph intent inserts so that validation plus insert
    // acts as one transaction, the role the relational store's transaction
    // plays in a multi-node deployment.
    submit_lock: Arc<Mutex<()>>,
}

impl Provider {
    pub fn in_memory() -> Self {
        Self {
            intents: Arc::new(intent::MemoryStore::new()),
            actions: Arc::new(action::MemoryStore::new()),
            fulfillments: Arc::new(fulfillment::MemoryStore::new()),
            nonces: Arc::new(nonce::MemoryStore::new()),
            vault_keys: Arc::new(vault::MemoryStore::new()),
            account_infos: Arc::new(account_info::MemoryStore::new()),
            balances: Arc::new(balance::MemoryStore::new()),
            currencies: Arc::new(currency::MemoryStore::new()),
            swaps: Arc::new(swap::MemoryStore::new()),
            submit_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Persists a decomposed intent graph atomically: the intent, all of its
    /// actions, all of its fulfillments, and the Reserved -> Claimed
    /// transition for every bound nonce.
    ///
    /// Validation runs before any write so a rejected graph leaves no
    /// partial state behind. The caller still owns releasing nonces on
    /// failure.
    pub fn submit_intent_graph(
        &self,
        intent_record: &mut intent::Record,
        action_records: &mut [action::Record],
        fulfillment_records: &mut [fulfillment::Record],
        bound_nonces: &mut [nonce::Record],
    ) -> Result<(), StoreError> {
        let _guard = self.submit_lock.lock().expect("submit lock poisoned");

        if self.intents.get(&intent_record.intent_id).is_ok() {
            return Err(StoreError::AlreadyExists);
        }
        for record in fulfillment_records.iter() {
            if let Some(signature) = &record.signature {
                if self.fulfillments.get_by_signature(signature).is_ok() {
                    return Err(StoreError::AlreadyExists);
                }
            }
            if let Some(signature) = &record.virtual_signature {
                if self.fulfillments.get_by_virtual_signature(signature).is_ok() {
                    return Err(StoreError::AlreadyExists);
                }
            }
        }
        for record in bound_nonces.iter() {
            if record.state != nonce::State::Reserved {
                return Err(StoreError::InvalidStateTransition);
            }
        }

        self.intents.put(intent_record)?;

        // The intent ordering index is the store-assigned intent id, which
        // gives fulfillments a dense total order across intents.
        for record in fulfillment_records.iter_mut() {
            record.intent_ordering_index = intent_record.id;
        }

        self.actions.put_all(action_records)?;
        self.fulfillments.put_all(fulfillment_records)?;

        for record in bound_nonces.iter_mut() {
            record.state = nonce::State::Claimed;
            self.nonces.update(record)?;
        }

        Ok(())
    }
}
