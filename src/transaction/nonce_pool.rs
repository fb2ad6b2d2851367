//! Local nonce pool.
//!
//! A pool hands out durable nonces for one (environment, instance, purpose)
//! triple. Reservation is in-process but always backed by persisted state,
//! so a restart reconciles from the store rather than from memory.

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::data::nonce::{self, Environment, Purpose, State};
use crate::data::{Provider, StoreError};

/// Candidates fetched per claim attempt. Small enough to keep contention
/// cheap, large enough that concurrent claimers rarely collide on the same
/// record.
const CLAIM_BATCH_SIZE: usize = 10;

/// Full-batch retries before a claim is reported as exhaustion.
const CLAIM_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum NoncePoolError {
    /// Transient: callers should retry after the allocator catches up.
    #[error("no available nonces in the pool")]
    NoAvailableNonces,
    #[error("nonce pool for ({0}, {1}, {2:?}) is not provided")]
    NoMatchingPool(Environment, String, Purpose),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct LocalNoncePool {
    data: Provider,
    environment: Environment,
    instance: String,
    purpose: Purpose,
}

impl LocalNoncePool {
    pub fn new(data: Provider, environment: Environment, instance: String, purpose: Purpose) -> Self {
        Self {
            data,
            environment,
            instance,
            purpose,
        }
    }

    pub fn matches(&self, environment: Environment, instance: &str, purpose: Purpose) -> bool {
        self.environment == environment && self.instance == instance && self.purpose == purpose
    }

    /// Claims the earliest available nonce, transitioning it to Reserved.
    ///
    /// Optimistic: competitors racing for the same record lose on version
    /// and move to the next candidate. Exhaustion is transient; the caller
    /// retries after the allocator has refilled the pool.
    pub fn claim(&self) -> Result<nonce::Record, NoncePoolError> {
        for _ in 0..CLAIM_ATTEMPTS {
            let candidates = self.data.nonces.get_all_by_state_and_purpose(
                self.environment,
                &self.instance,
                State::Available,
                self.purpose,
                CLAIM_BATCH_SIZE,
            )?;

            if candidates.is_empty() {
                return Err(NoncePoolError::NoAvailableNonces);
            }

            for mut candidate in candidates {
                candidate.state = State::Reserved;
                match self.data.nonces.update(&mut candidate) {
                    Ok(()) => return Ok(candidate),
                    Err(StoreError::StaleVersion) => {
                        debug!(address = %candidate.address, "lost nonce claim race");
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }

        Err(NoncePoolError::NoAvailableNonces)
    }

    /// Returns a claimed-but-unused nonce: Reserved -> Released.
    pub fn release(&self, record: &mut nonce::Record) -> Result<(), NoncePoolError> {
        record.state = State::Released;
        record.signature = None;
        self.data.nonces.update(record)?;
        Ok(())
    }

    /// Marks a nonce as consumed by a submitted transaction:
    /// Reserved -> Claimed.
    pub fn mark_claimed(
        &self,
        record: &mut nonce::Record,
        signature: &str,
    ) -> Result<(), NoncePoolError> {
        record.state = State::Claimed;
        record.signature = Some(signature.to_string());
        self.data.nonces.update(record)?;
        Ok(())
    }

    /// Returns a consumed nonce to the pool after the on-chain value has
    /// advanced: Released -> Available. Idempotent.
    pub fn recycle(
        &self,
        record: &mut nonce::Record,
        new_value: &str,
    ) -> Result<(), NoncePoolError> {
        if record.state == State::Available && record.blockhash.as_deref() == Some(new_value) {
            return Ok(());
        }
        record.state = State::Available;
        record.blockhash = Some(new_value.to_string());
        record.signature = None;
        self.data.nonces.update(record)?;
        Ok(())
    }

    /// Terminally invalidates a corrupted or lost nonce account.
    pub fn mark_invalid(
        &self,
        record: &mut nonce::Record,
        reason: &str,
    ) -> Result<(), NoncePoolError> {
        tracing::warn!(address = %record.address, reason, "invalidating nonce");
        record.state = State::Invalid;
        self.data.nonces.update(record)?;
        Ok(())
    }
}

/// Picks the pool matching the triple from the provided set, the way the
/// server validates its pool wiring at startup.
pub fn select_nonce_pool<'a>(
    environment: Environment,
    instance: &str,
    purpose: Purpose,
    pools: &'a [Arc<LocalNoncePool>],
) -> Result<&'a Arc<LocalNoncePool>, NoncePoolError> {
    pools
        .iter()
        .find(|pool| pool.matches(environment, instance, purpose))
        .ok_or_else(|| {
            NoncePoolError::NoMatchingPool(environment, instance.to_string(), purpose)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn seed_nonce(data: &Provider, address: &str, state: State) -> nonce::Record {
        let mut record = nonce::Record {
            id: 0,
            address: address.to_string(),
            authority: "authority".to_string(),
            environment: Environment::Solana,
            instance: nonce::INSTANCE_SOLANA_MAINNET.to_string(),
            purpose: Purpose::OnDemandTransaction,
            state: State::Unknown,
            blockhash: Some(bs58::encode([1u8; 32]).into_string()),
            signature: None,
            version: 0,
            created_at: SystemTime::now(),
        };
        data.nonces.put(&mut record).unwrap();
        if state != State::Unknown {
            record.state = State::Available;
            data.nonces.update(&mut record).unwrap();
        }
        record
    }

    fn test_pool(data: &Provider) -> LocalNoncePool {
        LocalNoncePool::new(
            data.clone(),
            Environment::Solana,
            nonce::INSTANCE_SOLANA_MAINNET.to_string(),
            Purpose::OnDemandTransaction,
        )
    }

    #[test]
    fn claim_takes_the_earliest_available() {
        let data = Provider::in_memory();
        seed_nonce(&data, "n1", State::Available);
        seed_nonce(&data, "n2", State::Available);

        let pool = test_pool(&data);
        let claimed = pool.claim().unwrap();
        assert_eq!(claimed.address, "n1");
        assert_eq!(claimed.state, State::Reserved);

        let second = pool.claim().unwrap();
        assert_eq!(second.address, "n2");
    }

    #[test]
    fn empty_pool_reports_exhaustion() {
        let data = Provider::in_memory();
        seed_nonce(&data, "n1", State::Unknown);

        let pool = test_pool(&data);
        assert!(matches!(pool.claim(), Err(NoncePoolError::NoAvailableNonces)));
    }

    #[test]
    fn release_then_recycle_returns_to_pool() {
        let data = Provider::in_memory();
        seed_nonce(&data, "n1", State::Available);

        let pool = test_pool(&data);
        let mut record = pool.claim().unwrap();
        pool.release(&mut record).unwrap();
        assert_eq!(record.state, State::Released);

        let new_value = bs58::encode([2u8; 32]).into_string();
        pool.recycle(&mut record, &new_value).unwrap();
        assert_eq!(record.state, State::Available);

        // Idempotent on repeat.
        pool.recycle(&mut record, &new_value).unwrap();

        let reclaimed = pool.claim().unwrap();
        assert_eq!(reclaimed.address, "n1");
        assert_eq!(reclaimed.blockhash.as_deref(), Some(new_value.as_str()));
    }

    #[test]
    fn claimed_nonce_records_consuming_signature() {
        let data = Provider::in_memory();
        seed_nonce(&data, "n1", State::Available);

        let pool = test_pool(&data);
        let mut record = pool.claim().unwrap();
        pool.mark_claimed(&mut record, "txn-signature").unwrap();
        assert_eq!(record.state, State::Claimed);
        assert_eq!(record.signature.as_deref(), Some("txn-signature"));
    }

    #[test]
    fn pool_selection_validates_wiring() {
        let data = Provider::in_memory();
        let pools = vec![Arc::new(test_pool(&data))];

        assert!(select_nonce_pool(
            Environment::Solana,
            nonce::INSTANCE_SOLANA_MAINNET,
            Purpose::OnDemandTransaction,
            &pools,
        )
        .is_ok());

        assert!(select_nonce_pool(
            Environment::Cvm,
            "some-vm",
            Purpose::ClientIntent,
            &pools,
        )
        .is_err());
    }
}
