//! Request signature verification.
//!
//! Authenticates that a request body was signed by the client's owner
//! account. Two serialization strategies are attempted in a fixed order: the
//! canonical deterministic form first, then the legacy JSON form. Wire
//! libraries may legitimately produce divergent bytes for the same logical
//! message; the canonical form is the long-term contract but legacy clients
//! remain supported until retired.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::common::Account;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// Signature missing or invalid. The two collapse deliberately: there is
    /// no oracle for callers to distinguish them.
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("internal authentication failure: {0}")]
    Internal(String),
}

/// Serializes the message under every supported strategy, in verification
/// order. Canonical first; the legacy JSON form is kept until all clients
/// have migrated off it.
fn marshal_strategies<M: Serialize>(message: &M) -> Result<[Vec<u8>; 2], AuthError> {
    let canonical =
        bincode::serialize(message).map_err(|err| AuthError::Internal(err.to_string()))?;
    let legacy =
        serde_json::to_vec(message).map_err(|err| AuthError::Internal(err.to_string()))?;
    Ok([canonical, legacy])
}

/// Verifies signed request messages by owner accounts.
pub struct RpcSignatureVerifier;

impl RpcSignatureVerifier {
    pub fn new() -> Self {
        Self
    }

    /// Authenticates that the message is signed by the owner account.
    pub fn authenticate<M: Serialize>(
        &self,
        owner: &Account,
        message: &M,
        signature: Option<&[u8; 64]>,
    ) -> Result<(), AuthError> {
        let signature = match signature {
            Some(signature) => Signature::from_bytes(signature),
            None => return Err(AuthError::Unauthenticated),
        };

        let verifying_key = VerifyingKey::from_bytes(&owner.public_key().to_bytes())
            .map_err(|err| AuthError::Internal(err.to_string()))?;

        for bytes in marshal_strategies(message)? {
            if verifying_key.verify(&bytes, &signature).is_ok() {
                return Ok(());
            }
        }

        warn!(owner = %owner.to_base58(), "request message is not signature verified");
        Err(AuthError::Unauthenticated)
    }
}

impl Default for RpcSignatureVerifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Signs a message in the canonical form with the given account. Used by the
/// server for server-authored signatures and by tests acting as clients.
pub fn sign_canonical<M: Serialize>(account: &Account, message: &M) -> anyhow::Result<[u8; 64]> {
    let bytes = bincode::serialize(message)?;
    let signature = account.sign_message(&bytes)?;
    Ok(signature.into())
}
