//! Exchange rates and mint metadata.
//!
//! Rate ingestion is an external concern; this store only serves reads for
//! the limits math and the currency query surface.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use super::StoreError;

/// One observation of exchange rates: currency code -> units of that
/// currency per unit of the core mint.
#[derive(Debug, Clone)]
pub struct RateRecord {
    pub id: u64,
    pub time: SystemTime,
    pub rates: HashMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MintMetadata {
    pub address: String,
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
    pub quarks_per_unit: u64,
}

pub trait Store: Send + Sync {
    fn put_rates(&self, record: &mut RateRecord) -> Result<(), StoreError>;

    /// The latest rate record at or before the given time; with `None`, the
    /// latest overall.
    fn get_rates(&self, at: Option<SystemTime>) -> Result<RateRecord, StoreError>;

    fn put_mint_metadata(&self, metadata: &MintMetadata) -> Result<(), StoreError>;

    /// Metadata for the requested mint addresses. Unknown addresses are
    /// silently omitted.
    fn get_mints(&self, addresses: &[String]) -> Result<Vec<MintMetadata>, StoreError>;
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    rates: Vec<RateRecord>,
    mints: HashMap<String, MintMetadata>,
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
    fn put_rates(&self, record: &mut RateRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        record.id = inner.next_id;
        inner.rates.push(record.clone());
        Ok(())
    }

    fn get_rates(&self, at: Option<SystemTime>) -> Result<RateRecord, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .rates
            .iter()
            .filter(|r| at.map(|t| r.time <= t).unwrap_or(true))
            .max_by_key(|r| (r.time, r.id))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn put_mint_metadata(&self, metadata: &MintMetadata) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.mints.insert(metadata.address.clone(), metadata.clone());
        Ok(())
    }

    fn get_mints(&self, addresses: &[String]) -> Result<Vec<MintMetadata>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(addresses
            .iter()
            .filter_map(|address| inner.mints.get(address).cloned())
            .collect())
    }
}
