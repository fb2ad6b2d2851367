//! Core mint metadata and quark conversions.
//!
//! Quarks are the indivisible minor unit of the core mint.

use solana_sdk::pubkey::Pubkey;

use crate::config::MintConfig;

use super::account::AccountError;

#[derive(Debug, Clone)]
pub struct CoreMint {
    pub address: Pubkey,
    pub quarks_per_unit: u64,
    pub decimals: u8,
    pub name: String,
    pub symbol: String,
}

impl CoreMint {
    pub fn from_config(config: &MintConfig) -> Result<Self, AccountError> {
        let address = config
            .core_mint
            .parse::<Pubkey>()
            .map_err(|_| AccountError::InvalidPublicKey)?;
        Ok(Self {
            address,
            quarks_per_unit: config.quarks_per_unit,
            decimals: config.decimals,
            name: config.name.clone(),
            symbol: config.symbol.clone(),
        })
    }

    pub fn is_core_mint(&self, mint: &Pubkey) -> bool {
        *mint == self.address
    }

    pub fn to_quarks(&self, units: u64) -> u64 {
        units * self.quarks_per_unit
    }

    pub fn from_quarks(&self, quarks: u64) -> u64 {
        quarks / self.quarks_per_unit
    }

    /// Converts quarks to a whole-unit value, preserving the fraction.
    pub fn quarks_to_units_f64(&self, quarks: u64) -> f64 {
        quarks as f64 / self.quarks_per_unit as f64
    }
}
