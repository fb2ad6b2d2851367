//! RPC-backed chain client.

use async_trait::async_trait;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::hash::Hash;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_sdk::transaction::Transaction;

use super::{AccountData, ChainClient, ChainError, Commitment, TransactionStatus};

fn to_commitment_config(commitment: Commitment) -> CommitmentConfig {
    match commitment {
        Commitment::Processed => CommitmentConfig::processed(),
        Commitment::Confirmed => CommitmentConfig::confirmed(),
        Commitment::Finalized => CommitmentConfig::finalized(),
    }
}

pub struct RpcChainClient {
    client: RpcClient,
}

impl RpcChainClient {
    pub fn new(rpc_url: String) -> Self {
        Self {
            client: RpcClient::new_with_commitment(rpc_url, CommitmentConfig::confirmed()),
        }
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn get_account(
        &self,
        address: &Pubkey,
        commitment: Commitment,
    ) -> Result<Option<AccountData>, ChainError> {
        let response = self
            .client
            .get_account_with_commitment(address, to_commitment_config(commitment))
            .await
            .map_err(|err| ChainError::Rpc(err.to_string()))?;

        Ok(response.value.map(|account| AccountData {
            address: *address,
            lamports: account.lamports,
            owner: account.owner,
            data: account.data,
        }))
    }

    async fn get_transaction_status(
        &self,
        signature: &Signature,
        commitment: Commitment,
    ) -> Result<Option<TransactionStatus>, ChainError> {
        let status = self
            .client
            .get_signature_status_with_commitment(signature, to_commitment_config(commitment))
            .await
            .map_err(|err| ChainError::Rpc(err.to_string()))?;

        Ok(status.map(|result| TransactionStatus {
            signature: *signature,
            err: result.err().map(|err| err.to_string()),
        }))
    }

    async fn submit_transaction(&self, transaction: &Transaction) -> Result<Signature, ChainError> {
        self.client
            .send_transaction(transaction)
            .await
            .map_err(|err| {
                let message = err.to_string();
                // Preflight rejections (bad blockhash, already processed) are
                // hard rejections; everything else is a transport failure.
                if message.contains("BlockhashNotFound")
                    || message.contains("AlreadyProcessed")
                    || message.contains("Preflight")
                {
                    ChainError::TransactionRejected(message)
                } else {
                    ChainError::Rpc(message)
                }
            })
    }

    async fn get_balance(&self, address: &Pubkey) -> Result<u64, ChainError> {
        self.client
            .get_balance(address)
            .await
            .map_err(|err| ChainError::Rpc(err.to_string()))
    }

    async fn get_latest_blockhash(&self) -> Result<Hash, ChainError> {
        self.client
            .get_latest_blockhash()
            .await
            .map_err(|err| ChainError::Rpc(err.to_string()))
    }
}
