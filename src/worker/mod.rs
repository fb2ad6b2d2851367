//! Background worker runtimes.
//!
//! Each runtime owns a small fixed set of long-running loops. Loops share
//! only the persistent store and the in-process nonce pools, respect the
//! shutdown signal at every suspension point, and never die on a single
//! record's failure.

pub mod account;
pub mod nonce;
pub mod retry;
pub mod sequencer;
pub mod swap;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

/// Cooperative shutdown token handed to every loop. Cancellation is the only
/// non-retriable condition.
#[derive(Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_raised(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves when shutdown is raised.
    pub async fn raised(&self) {
        let mut receiver = self.receiver.clone();
        while !*receiver.borrow() {
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleeps for the duration unless shutdown is raised first. Returns true
    /// when the caller should stop.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_raised(),
            _ = self.raised() => true,
        }
    }
}

pub fn shutdown_channel() -> (watch::Sender<bool>, ShutdownSignal) {
    let (sender, receiver) = watch::channel(false);
    (sender, ShutdownSignal { receiver })
}

/// A long-running worker runtime. `start` blocks until shutdown.
#[async_trait]
pub trait Runtime: Send + Sync {
    async fn start(&self, shutdown: ShutdownSignal, interval: Duration) -> anyhow::Result<()>;
}
