//! Subsidizer treasury.
//!
//! The subsidizer is the server-owned account that pays transaction fees on
//! behalf of users. It is loaded once at startup from durable key storage and
//! passed as an explicit dependency.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::RwLock;

use crate::chain::ChainClient;
use crate::config::SubsidizerConfig;

use super::account::Account;

/// How long a fetched subsidizer balance stays fresh. The scheduler consults
/// the balance before every submission; hitting the chain every time would
/// dominate RPC traffic.
const BALANCE_CACHE_TTL: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SubsidizerError {
    #[error("subsidizer requires funding")]
    RequiresFunding,
    #[error("failure loading subsidizer key: {0}")]
    KeyLoad(String),
    #[error(transparent)]
    Chain(#[from] crate::chain::ChainError),
}

/// Loads the subsidizer account from the configured key file.
pub fn load_subsidizer(config: &SubsidizerConfig) -> Result<Account, SubsidizerError> {
    if config.key_path.is_empty() {
        return Err(SubsidizerError::KeyLoad(
            "subsidizer.key_path is not configured".to_string(),
        ));
    }

    let raw = std::fs::read_to_string(&config.key_path)
        .map_err(|err| SubsidizerError::KeyLoad(err.to_string()))?;
    Account::from_private_key_base58(raw.trim())
        .map_err(|err| SubsidizerError::KeyLoad(err.to_string()))
}

/// The subsidizer account plus the fee-payer balance gate used by the
/// contextual scheduler.
///
/// The balance check assumes a single scheduler writer; see the deployment
/// notes before running more than one sequencer instance.
pub struct SubsidizerTreasury {
    account: Account,
    min_balance: u64,
    chain: Arc<dyn ChainClient>,
    cached_balance: RwLock<Option<(Instant, u64)>>,
}

impl SubsidizerTreasury {
    pub fn new(account: Account, min_balance: u64, chain: Arc<dyn ChainClient>) -> Self {
        Self {
            account,
            min_balance,
            chain,
            cached_balance: RwLock::new(None),
        }
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    /// Refuses with `RequiresFunding` when the subsidizer balance is below
    /// the configured floor.
    pub async fn enforce_minimum_balance(&self) -> Result<(), SubsidizerError> {
        let balance = self.balance().await?;
        if balance < self.min_balance {
            return Err(SubsidizerError::RequiresFunding);
        }
        Ok(())
    }

    pub async fn balance(&self) -> Result<u64, SubsidizerError> {
        {
            let cached = self.cached_balance.read().await;
            if let Some((at, balance)) = *cached {
                if at.elapsed() < BALANCE_CACHE_TTL {
                    return Ok(balance);
                }
            }
        }

        let balance = self.chain.get_balance(self.account.public_key()).await?;
        *self.cached_balance.write().await = Some((Instant::now(), balance));
        Ok(balance)
    }
}
