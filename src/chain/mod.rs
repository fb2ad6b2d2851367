//! Chain access layer.
//!
//! Workers and the scheduler consume the [`ChainClient`] trait; the real
//! implementation wraps the nonblocking RPC client, and tests substitute a
//! programmable mock.

pub mod rpc;
pub mod updates;

use async_trait::async_trait;
use solana_sdk::hash::Hash;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_sdk::transaction::Transaction;
use thiserror::Error;

pub use rpc::RpcChainClient;

/// Chain observation levels. Finalized is the strongest: transactions seen
/// at this commitment will not be reverted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commitment {
    Processed,
    Confirmed,
    Finalized,
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("chain rpc failure: {0}")]
    Rpc(String),
    #[error("transaction was rejected: {0}")]
    TransactionRejected(String),
}

/// Raw account data as observed on chain.
#[derive(Debug, Clone)]
pub struct AccountData {
    pub address: Pubkey,
    pub lamports: u64,
    pub owner: Pubkey,
    pub data: Vec<u8>,
}

/// Outcome of a transaction lookup. `err` carries the on-chain error string
/// when the transaction landed but failed.
#[derive(Debug, Clone)]
pub struct TransactionStatus {
    pub signature: Signature,
    pub err: Option<String>,
}

impl TransactionStatus {
    pub fn succeeded(&self) -> bool {
        self.err.is_none()
    }
}

/// The operations the core invokes against the chain.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Fetches account info at the given commitment. `None` when the account
    /// does not exist.
    async fn get_account(
        &self,
        address: &Pubkey,
        commitment: Commitment,
    ) -> Result<Option<AccountData>, ChainError>;

    /// Looks up a transaction by signature at the given commitment. `None`
    /// when the transaction has not been observed at that commitment.
    async fn get_transaction_status(
        &self,
        signature: &Signature,
        commitment: Commitment,
    ) -> Result<Option<TransactionStatus>, ChainError>;

    /// Submits a signed transaction. At-least-once: the durable nonce makes
    /// duplicate submission idempotent on chain.
    async fn submit_transaction(&self, transaction: &Transaction) -> Result<Signature, ChainError>;

    async fn get_balance(&self, address: &Pubkey) -> Result<u64, ChainError>;

    async fn get_latest_blockhash(&self) -> Result<Hash, ChainError>;
}
