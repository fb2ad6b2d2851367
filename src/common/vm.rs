//! Virtual machine registry.
//!
//! Resolves a mint to the VM environment (authority, VM account, omnibus)
//! that custodies timelock accounts for that mint.

use std::collections::HashMap;

use solana_sdk::pubkey::Pubkey;
use thiserror::Error;

use crate::config::VmRegistryConfig;

use super::account::{Account, TimelockAccounts};

#[derive(Debug, Error)]
pub enum VmError {
    #[error("unsupported mint")]
    UnsupportedMint,
    #[error("invalid vm registry config: {0}")]
    InvalidConfig(String),
}

/// One VM environment: the on-chain program instance that custodies
/// timelock accounts for a mint.
#[derive(Debug, Clone)]
pub struct VmEnvironment {
    pub authority: Account,
    pub vm: Pubkey,
    pub omnibus: Pubkey,
    pub mint: Pubkey,
}

impl VmEnvironment {
    pub fn timelock_accounts_for(&self, program_id: &Pubkey, owner: &Account) -> TimelockAccounts {
        owner.timelock_accounts(program_id, &self.vm, &self.mint)
    }
}

pub struct VmRegistry {
    program_id: Pubkey,
    environments: HashMap<Pubkey, VmEnvironment>,
}

impl VmRegistry {
    pub fn from_config(config: &VmRegistryConfig, authority: Account) -> Result<Self, VmError> {
        let program_id = config
            .program_id
            .parse::<Pubkey>()
            .map_err(|_| VmError::InvalidConfig("bad program id".to_string()))?;

        let mut environments = HashMap::new();
        for (mint, entry) in &config.environments {
            let mint = mint
                .parse::<Pubkey>()
                .map_err(|_| VmError::InvalidConfig(format!("bad mint {mint}")))?;
            let vm = entry
                .vm_account
                .parse::<Pubkey>()
                .map_err(|_| VmError::InvalidConfig("bad vm account".to_string()))?;
            let omnibus = entry
                .omnibus_account
                .parse::<Pubkey>()
                .map_err(|_| VmError::InvalidConfig("bad omnibus account".to_string()))?;

            environments.insert(
                mint,
                VmEnvironment {
                    authority: authority.clone(),
                    vm,
                    omnibus,
                    mint,
                },
            );
        }

        Ok(Self {
            program_id,
            environments,
        })
    }

    pub fn program_id(&self) -> &Pubkey {
        &self.program_id
    }

    /// Resolves the VM environment for a mint.
    pub fn for_mint(&self, mint: &Pubkey) -> Result<&VmEnvironment, VmError> {
        self.environments.get(mint).ok_or(VmError::UnsupportedMint)
    }

    pub fn is_supported_mint(&self, mint: &Pubkey) -> bool {
        self.environments.contains_key(mint)
    }

    /// All configured VM instances, used to fan out per-instance workers.
    pub fn vm_instances(&self) -> Vec<Pubkey> {
        self.environments.values().map(|e| e.vm).collect()
    }
}
