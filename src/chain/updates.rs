//! Near-real-time account update stream.
//!
//! When a plugin endpoint is configured, the service subscribes to program
//! account updates for low-latency nonce recycling. The stream is best
//! effort: the nonce state workers poll the chain directly and reconcile any
//! drift, so a missing or lagging subscription only costs latency.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use solana_sdk::pubkey::Pubkey;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::ChainError;

/// A single observed account mutation.
#[derive(Debug, Clone)]
pub struct AccountUpdate {
    pub address: Pubkey,
    pub lamports: u64,
    pub data: Vec<u8>,
    pub slot: u64,
}

#[async_trait]
pub trait UpdateStream: Send + Sync {
    /// Opens the stream. Updates arrive on the returned channel until the
    /// stream fails or the service shuts down.
    async fn subscribe(&self) -> Result<mpsc::Receiver<AccountUpdate>, ChainError>;
}

#[derive(Debug, Deserialize)]
struct PluginUpdate {
    address: String,
    lamports: u64,
    data_base64: String,
    slot: u64,
}

/// Long-polling client against the update plugin endpoint.
pub struct HttpUpdateStream {
    endpoint: String,
    token: String,
    client: reqwest::Client,
}

impl HttpUpdateStream {
    pub fn new(endpoint: String, token: String) -> Result<Self, ChainError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| ChainError::Rpc(err.to_string()))?;
        Ok(Self {
            endpoint,
            token,
            client,
        })
    }

    async fn poll_once(&self, cursor: u64) -> Result<(Vec<PluginUpdate>, u64), ChainError> {
        let url = format!("{}/updates?after_slot={}", self.endpoint, cursor);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| ChainError::Rpc(err.to_string()))?;

        let updates: Vec<PluginUpdate> = response
            .json()
            .await
            .map_err(|err| ChainError::Rpc(err.to_string()))?;

        let next_cursor = updates.iter().map(|u| u.slot).max().unwrap_or(cursor);
        Ok((updates, next_cursor))
    }
}

#[async_trait]
impl UpdateStream for HttpUpdateStream {
    async fn subscribe(&self) -> Result<mpsc::Receiver<AccountUpdate>, ChainError> {
        let (tx, rx) = mpsc::channel(1024);
        let endpoint = self.endpoint.clone();
        let token = self.token.clone();
        let client = self.client.clone();

        tokio::spawn(async move {
            let stream = HttpUpdateStream {
                endpoint,
                token,
                client,
            };
            let mut cursor = 0u64;

            loop {
                match stream.poll_once(cursor).await {
                    Ok((updates, next_cursor)) => {
                        cursor = next_cursor;
                        for update in updates {
                            let address = match update.address.parse::<Pubkey>() {
                                Ok(address) => address,
                                Err(_) => {
                                    warn!(address = %update.address, "malformed update address");
                                    continue;
                                }
                            };
                            let data = match base64_decode(&update.data_base64) {
                                Some(data) => data,
                                None => {
                                    warn!(address = %update.address, "malformed update payload");
                                    continue;
                                }
                            };

                            let update = AccountUpdate {
                                address,
                                lamports: update.lamports,
                                data,
                                slot: update.slot,
                            };
                            if tx.send(update).await.is_err() {
                                info!("update consumer dropped, closing stream");
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "update stream poll failed, backing off");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });

        Ok(rx)
    }
}

fn base64_decode(value: &str) -> Option<Vec<u8>> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    STANDARD.decode(value).ok()
}
