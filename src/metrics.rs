//! In-process counters and the periodic gauge snapshot.
//!
//! Counters are cheap atomics bumped on the hot paths; each runtime also
//! runs a gauge loop that reads per-state record counts from the store and
//! emits them as structured log events.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    pub intents_submitted: AtomicU64,
    pub intents_denied: AtomicU64,
    pub fulfillments_submitted: AtomicU64,
    pub fulfillments_confirmed: AtomicU64,
    pub fulfillments_failed: AtomicU64,
    pub fulfillments_revoked: AtomicU64,
    pub nonces_created: AtomicU64,
    pub nonces_recycled: AtomicU64,
    pub swaps_finalized: AtomicU64,
    pub swaps_cancelled: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_intent_submitted(&self) {
        self.intents_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_intent_denied(&self) {
        self.intents_denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fulfillment_submitted(&self) {
        self.fulfillments_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fulfillment_confirmed(&self) {
        self.fulfillments_confirmed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fulfillment_failed(&self) {
        self.fulfillments_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fulfillment_revoked(&self) {
        self.fulfillments_revoked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_nonce_created(&self) {
        self.nonces_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_nonce_recycled(&self) {
        self.nonces_recycled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_swap_finalized(&self) {
        self.swaps_finalized.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_swap_cancelled(&self) {
        self.swaps_cancelled.fetch_add(1, Ordering::Relaxed);
    }
}
