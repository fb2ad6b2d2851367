//! Token account metadata.
//!
//! One row per derived token account the server knows about, keyed uniquely
//! by both the token account address and (owner, mint, account type, index).

use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use super::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountType {
    Primary,
    RemoteSendGiftCard,
    Swap,
}

#[derive(Debug, Clone)]
pub struct Record {
    pub id: u64,
    pub owner: String,
    pub mint: String,
    pub account_type: AccountType,
    pub index: u64,
    pub token_account: String,
    /// Set once the auto-return sweep has dispositioned a gift card.
    pub auto_return_check_complete: bool,
    pub version: u64,
    pub created_at: SystemTime,
}

pub trait Store: Send + Sync {
    fn put(&self, record: &mut Record) -> Result<(), StoreError>;

    fn get_by_token_address(&self, token_account: &str) -> Result<Record, StoreError>;

    fn update(&self, record: &mut Record) -> Result<(), StoreError>;

    /// Gift cards created before the cutoff whose auto-return disposition is
    /// still outstanding.
    fn get_gift_cards_needing_auto_return_check(
        &self,
        max_age: Duration,
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
        let collision = inner.records.iter().any(|r| {
            r.token_account == record.token_account
                || (r.owner == record.owner
                    && r.mint == record.mint
                    && r.account_type == record.account_type
                    && r.index == record.index)
        });
        if collision {
            return Err(StoreError::AlreadyExists);
        }

        inner.next_id += 1;
        record.id = inner.next_id;
        record.version = 1;
        inner.records.push(record.clone());
        Ok(())
    }

    fn get_by_token_address(&self, token_account: &str) -> Result<Record, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .iter()
            .find(|r| r.token_account == token_account)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn update(&self, record: &mut Record) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let stored = inner
            .records
            .iter_mut()
            .find(|r| r.token_account == record.token_account)
            .ok_or(StoreError::NotFound)?;

        if stored.version != record.version {
            return Err(StoreError::StaleVersion);
        }

        record.version += 1;
        *stored = record.clone();
        Ok(())
    }

    fn get_gift_cards_needing_auto_return_check(
        &self,
        max_age: Duration,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError> {
        let cutoff = SystemTime::now() - max_age;
        let inner = self.inner.lock().unwrap();
        let mut records: Vec<Record> = inner
            .records
            .iter()
            .filter(|r| {
                r.account_type == AccountType::RemoteSendGiftCard
                    && !r.auto_return_check_complete
                    && r.created_at <= cutoff
            })
            .cloned()
            .collect();
        records.sort_by_key(|r| r.id);
        records.truncate(limit);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn test_record(token_account: &str, account_type: AccountType) -> Record {
        Record {
            id: 0,
            owner: format!("owner-of-{token_account}"),
            mint: "mint".to_string(),
            account_type,
            index: 0,
            token_account: token_account.to_string(),
            auto_return_check_complete: false,
            version: 0,
            created_at: SystemTime::now(),
        }
    }

    #[test]
    fn token_account_is_unique() {
        let store = MemoryStore::new();
        let mut record = test_record("vault1", AccountType::Primary);
        store.put(&mut record).unwrap();

        let mut duplicate = test_record("vault1", AccountType::Primary);
        duplicate.owner = "someone-else".to_string();
        assert_eq!(store.put(&mut duplicate), Err(StoreError::AlreadyExists));
    }

    #[test]
    fn derived_identity_is_unique() {
        let store = MemoryStore::new();
        let mut record = test_record("vault1", AccountType::Primary);
        store.put(&mut record).unwrap();

        let mut same_identity = test_record("vault2", AccountType::Primary);
        same_identity.owner = record.owner.clone();
        assert_eq!(store.put(&mut same_identity), Err(StoreError::AlreadyExists));
    }

    #[test]
    fn auto_return_sweep_only_sees_old_gift_cards() {
        let store = MemoryStore::new();
        let mut fresh = test_record("gc-fresh", AccountType::RemoteSendGiftCard);
        store.put(&mut fresh).unwrap();

        let mut old = test_record("gc-old", AccountType::RemoteSendGiftCard);
        old.created_at = SystemTime::now() - Duration::from_secs(100_000);
        store.put(&mut old).unwrap();

        let due = store
            .get_gift_cards_needing_auto_return_check(Duration::from_secs(86_400), 10)
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].token_account, "gc-old");
    }
}
