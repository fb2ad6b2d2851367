//! Account model: Ed25519 keypairs and derived program-owned addresses.

use std::fmt;
use std::sync::Arc;

use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature, Signer};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid private key")]
    InvalidPrivateKey,
    #[error("account has no private key")]
    NoPrivateKey,
}

/// An account is an immutable (public key, optional private key) pair.
///
/// Derived accounts (vault, timelock state, nonce authority) are pure
/// functions of their inputs and carry no private key.
#[derive(Clone)]
pub struct Account {
    public_key: Pubkey,
    keypair: Option<Arc<Keypair>>,
}

impl Account {
    /// Generates a new random account with a private key.
    pub fn generate() -> Self {
        let keypair = Keypair::new();
        Self {
            public_key: keypair.pubkey(),
            keypair: Some(Arc::new(keypair)),
        }
    }

    pub fn from_public_key(public_key: Pubkey) -> Self {
        Self {
            public_key,
            keypair: None,
        }
    }

    /// Parses a public-key-only account from its base58 form.
    pub fn from_base58(value: &str) -> Result<Self, AccountError> {
        let public_key = value
            .parse::<Pubkey>()
            .map_err(|_| AccountError::InvalidPublicKey)?;
        Ok(Self::from_public_key(public_key))
    }

    /// Parses an account from a base58-encoded 64-byte private key.
    pub fn from_private_key_base58(value: &str) -> Result<Self, AccountError> {
        let bytes = bs58::decode(value)
            .into_vec()
            .map_err(|_| AccountError::InvalidPrivateKey)?;
        Self::from_private_key_bytes(&bytes)
    }

    pub fn from_private_key_bytes(bytes: &[u8]) -> Result<Self, AccountError> {
        let keypair = Keypair::from_bytes(bytes).map_err(|_| AccountError::InvalidPrivateKey)?;
        Ok(Self {
            public_key: keypair.pubkey(),
            keypair: Some(Arc::new(keypair)),
        })
    }

    pub fn public_key(&self) -> &Pubkey {
        &self.public_key
    }

    pub fn to_base58(&self) -> String {
        self.public_key.to_string()
    }

    pub fn has_private_key(&self) -> bool {
        self.keypair.is_some()
    }

    /// Base58 form of the 64-byte private key, for durable key storage.
    pub fn private_key_base58(&self) -> Result<String, AccountError> {
        let keypair = self.keypair.as_ref().ok_or(AccountError::NoPrivateKey)?;
        Ok(bs58::encode(keypair.to_bytes()).into_string())
    }

    pub fn keypair(&self) -> Result<&Keypair, AccountError> {
        self.keypair
            .as_deref()
            .ok_or(AccountError::NoPrivateKey)
    }

    pub fn sign_message(&self, message: &[u8]) -> Result<Signature, AccountError> {
        Ok(self.keypair()?.sign_message(message))
    }

    /// Derives the timelock accounts for this owner under the given VM.
    pub fn timelock_accounts(
        &self,
        vm_program_id: &Pubkey,
        vm: &Pubkey,
        mint: &Pubkey,
    ) -> TimelockAccounts {
        TimelockAccounts::derive(vm_program_id, vm, &self.public_key, mint)
    }
}

impl PartialEq for Account {
    fn eq(&self, other: &Self) -> bool {
        self.public_key == other.public_key
    }
}

impl Eq for Account {}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("public_key", &self.to_base58())
            .field("has_private_key", &self.keypair.is_some())
            .finish()
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

/// Program-derived timelock accounts for an owner under a VM.
///
/// The state account enforces the time-locked withdrawal path; the vault is
/// the token account holding the owner's funds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelockAccounts {
    pub owner: Pubkey,
    pub mint: Pubkey,
    pub state: Pubkey,
    pub state_bump: u8,
    pub vault: Pubkey,
    pub vault_bump: u8,
}

impl TimelockAccounts {
    pub fn derive(vm_program_id: &Pubkey, vm: &Pubkey, owner: &Pubkey, mint: &Pubkey) -> Self {
        let (state, state_bump) = Pubkey::find_program_address(
            &[b"timelock_state", vm.as_ref(), owner.as_ref()],
            vm_program_id,
        );
        let (vault, vault_bump) = Pubkey::find_program_address(
            &[b"timelock_vault", state.as_ref(), mint.as_ref()],
            vm_program_id,
        );
        Self {
            owner: *owner,
            mint: *mint,
            state,
            state_bump,
            vault,
            vault_bump,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_key_round_trip() {
        let account = Account::generate();
        let encoded = account.private_key_base58().unwrap();
        let restored = Account::from_private_key_base58(&encoded).unwrap();
        assert_eq!(account, restored);
        assert!(restored.has_private_key());
    }

    #[test]
    fn base58_round_trip() {
        let account = Account::generate();
        let restored = Account::from_base58(&account.to_base58()).unwrap();
        assert_eq!(account, restored);
        assert!(!restored.has_private_key());
        assert!(restored.sign_message(b"msg").is_err());
    }

    #[test]
    fn timelock_derivation_is_deterministic() {
        let program = Pubkey::new_unique();
        let vm = Pubkey::new_unique();
        let mint = Pubkey::new_unique();
        let owner = Account::generate();

        let a = owner.timelock_accounts(&program, &vm, &mint);
        let b = owner.timelock_accounts(&program, &vm, &mint);
        assert_eq!(a, b);
        assert_ne!(a.state, a.vault);
    }
}
