//! Swap lifecycle worker.
//!
//! One loop per swap state. Created and Funded enforce the client timeouts;
//! Submitting and Cancelling monitor the finalized transaction and keep
//! re-submitting until it lands. Cancellation restores the funded quarks to
//! the source vault.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_sdk::transaction::Transaction;
use tracing::{info, warn};

use crate::chain::{ChainClient, Commitment};
use crate::common::VmRegistry;
use crate::config::SwapConfig;
use crate::data::nonce::{Environment, Purpose, State as NonceState, INSTANCE_SOLANA_MAINNET};
use crate::data::query::Direction;
use crate::data::swap::{self, State};
use crate::data::{intent, Provider};
use crate::metrics::Metrics;
use crate::transaction::{make_swap_cancellation_transaction, LocalNoncePool};
use crate::worker::{Runtime, ShutdownSignal};

pub struct SwapRuntime {
    data: Provider,
    chain: Arc<dyn ChainClient>,
    vm_registry: Arc<VmRegistry>,
    nonce_pool: Arc<LocalNoncePool>,
    conf: SwapConfig,
    batch_size: usize,
    metrics: Arc<Metrics>,
}

impl SwapRuntime {
    pub fn new(
        data: Provider,
        chain: Arc<dyn ChainClient>,
        vm_registry: Arc<VmRegistry>,
        nonce_pool: Arc<LocalNoncePool>,
        conf: SwapConfig,
        batch_size: usize,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Self> {
        if !nonce_pool.matches(Environment::Solana, INSTANCE_SOLANA_MAINNET, Purpose::ClientSwap) {
            bail!("nonce pool for swap operations is not provided");
        }

        Ok(Self {
            data,
            chain,
            vm_registry,
            nonce_pool,
            conf,
            batch_size,
            metrics,
        })
    }

    /// Processes a single swap according to its current state. Public so
    /// tests can drive the lifecycle without standing up the loops.
    pub async fn handle_swap(&self, record: &mut swap::Record) -> anyhow::Result<()> {
        match record.state {
            State::Created => self.handle_state_created(record),
            State::Funding => self.handle_state_funding(record),
            State::Funded => self.handle_state_funded(record),
            State::Submitting => self.handle_state_submitting(record).await,
            State::Cancelling => self.handle_state_cancelling(record).await,
            _ => Ok(()),
        }
    }

    fn handle_state_created(&self, record: &mut swap::Record) -> anyhow::Result<()> {
        // Cancel if the client hasn't submitted the funding intent within a
        // reasonable amount of time.
        let age = record.created_at.elapsed().unwrap_or(Duration::ZERO);
        if age > Duration::from_secs(self.conf.client_timeout_to_fund_secs) {
            record.state = State::Cancelled;
            self.data.swaps.update(record)?;
            self.metrics.record_swap_cancelled();
            info!(swap = %record.swap_id, "swap cancelled before funding");
        }
        Ok(())
    }

    fn handle_state_funding(&self, record: &mut swap::Record) -> anyhow::Result<()> {
        let funding_id = record
            .funding_intent_id
            .as_deref()
            .ok_or_else(|| anyhow!("funding swap has no funding intent"))?;

        let intent_record = self
            .data
            .intents
            .get(funding_id)
            .context("error getting funding intent record")?;

        match intent_record.state {
            intent::State::Confirmed => {
                record.state = State::Funded;
                record.funded_at = Some(SystemTime::now());
                self.data.swaps.update(record)?;
                info!(swap = %record.swap_id, "swap funded");
                Ok(())
            }
            intent::State::Failed => bail!("funding intent failed"),
            _ => Ok(()),
        }
    }

    fn handle_state_funded(&self, record: &mut swap::Record) -> anyhow::Result<()> {
        // Cancel if the client hasn't signed the swap within a reasonable
        // amount of time. The funds are deposited back into the source VM.
        let funded_at = record.funded_at.unwrap_or(record.created_at);
        let age = funded_at.elapsed().unwrap_or(Duration::ZERO);
        if age <= Duration::from_secs(self.conf.client_timeout_to_swap_secs) {
            return Ok(());
        }

        self.make_cancellation_transaction(record)?;
        record.state = State::Cancelling;
        self.data.swaps.update(record)?;
        info!(swap = %record.swap_id, "swap abandoned by client, cancelling");
        Ok(())
    }

    async fn handle_state_submitting(&self, record: &mut swap::Record) -> anyhow::Result<()> {
        let Some(status) = self.finalized_status(record).await? else {
            return self.submit_transaction(record).await;
        };

        if status.succeeded() {
            record.state = State::Finalized;
            self.data.swaps.update(record)?;
            self.metrics.record_swap_finalized();
            info!(swap = %record.swap_id, "swap finalized");
        } else {
            record.state = State::Failed;
            self.data.swaps.update(record)?;
            warn!(swap = %record.swap_id, error = status.err.as_deref().unwrap_or("<unknown>"), "swap failed on chain");
        }
        Ok(())
    }

    async fn handle_state_cancelling(&self, record: &mut swap::Record) -> anyhow::Result<()> {
        let Some(status) = self.finalized_status(record).await? else {
            return self.submit_transaction(record).await;
        };

        if status.succeeded() {
            self.restore_source_balance(record)?;
        }

        record.state = State::Cancelled;
        self.data.swaps.update(record)?;
        self.metrics.record_swap_cancelled();
        info!(swap = %record.swap_id, "swap cancelled");

        // Release the cancellation nonce so it can recycle.
        if let Some(nonce_address) = &record.nonce {
            let mut nonce_record = self.data.nonces.get(nonce_address)?;
            if matches!(nonce_record.state, NonceState::Reserved | NonceState::Claimed) {
                nonce_record.state = NonceState::Released;
                self.data.nonces.update(&mut nonce_record)?;
            }
        }
        Ok(())
    }

    /// Funds come back to the source vault when a cancellation lands.
    fn restore_source_balance(&self, record: &swap::Record) -> anyhow::Result<()> {
        let lock = self.data.balances.get_version_lock(&record.source_vault)?;
        let balance = self
            .data
            .balances
            .get_cached_balance(&record.source_vault)?;
        self.data
            .balances
            .commit(&lock, Some(balance.saturating_add(record.quantity)))?;
        Ok(())
    }

    /// Builds and signs the cancellation transaction against a freshly
    /// claimed swap nonce, recording it on the swap.
    fn make_cancellation_transaction(&self, record: &mut swap::Record) -> anyhow::Result<()> {
        let from_mint = record
            .from_mint
            .parse::<Pubkey>()
            .context("malformed swap source mint")?;
        let environment = self.vm_registry.for_mint(&from_mint)?.clone();
        let source_vault = record
            .source_vault
            .parse::<Pubkey>()
            .context("malformed swap source vault")?;

        let mut nonce_record = self.nonce_pool.claim()?;
        let built = match make_swap_cancellation_transaction(
            self.vm_registry.program_id(),
            &environment,
            &source_vault,
            record.quantity,
            &nonce_record,
        ) {
            Ok(built) => built,
            Err(err) => {
                self.nonce_pool.release(&mut nonce_record)?;
                return Err(err.into());
            }
        };

        self.nonce_pool
            .mark_claimed(&mut nonce_record, &built.signature)?;

        record.nonce = Some(nonce_record.address.clone());
        record.transaction_signature = Some(built.signature);
        record.transaction_blob = Some(built.blob);
        Ok(())
    }

    async fn finalized_status(
        &self,
        record: &swap::Record,
    ) -> anyhow::Result<Option<crate::chain::TransactionStatus>> {
        let signature = record
            .transaction_signature
            .as_deref()
            .ok_or_else(|| anyhow!("swap {} has no transaction signature", record.swap_id))?
            .parse::<Signature>()
            .map_err(|_| anyhow!("invalid swap transaction signature"))?;

        Ok(self
            .chain
            .get_transaction_status(&signature, Commitment::Finalized)
            .await?)
    }

    async fn submit_transaction(&self, record: &swap::Record) -> anyhow::Result<()> {
        let blob = record
            .transaction_blob
            .as_deref()
            .ok_or_else(|| anyhow!("swap {} has no transaction to submit", record.swap_id))?;
        let transaction: Transaction =
            bincode::deserialize(blob).context("failure unmarshalling swap transaction")?;

        match self.chain.submit_transaction(&transaction).await {
            Ok(_) => Ok(()),
            // Already-processed rejections are expected while waiting for
            // finalization; anything else surfaces for the next sweep.
            Err(crate::chain::ChainError::TransactionRejected(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn worker(&self, state: State, shutdown: ShutdownSignal, interval: Duration) {
        let mut cursor = None;

        loop {
            if shutdown.sleep(interval).await {
                return;
            }

            let items = match self.data.swaps.get_all_by_state(
                state,
                cursor,
                self.batch_size,
                Direction::Ascending,
            ) {
                Ok(items) => items,
                Err(err) => {
                    warn!(state = ?state, error = %err, "failure querying swaps");
                    cursor = None;
                    continue;
                }
            };

            let handled = items.into_iter().map(|mut record| async move {
                let id = record.id;
                if let Err(err) = self.handle_swap(&mut record).await {
                    warn!(
                        swap = %record.swap_id,
                        state = ?state,
                        error = format!("{err:#}"),
                        "failure processing swap"
                    );
                }
                id
            });
            let ids = futures::future::join_all(handled).await;

            cursor = ids.last().copied();
        }
    }
}

#[async_trait]
impl Runtime for SwapRuntime {
    async fn start(&self, shutdown: ShutdownSignal, interval: Duration) -> anyhow::Result<()> {
        tokio::join!(
            self.worker(State::Created, shutdown.clone(), interval),
            self.worker(State::Funding, shutdown.clone(), interval),
            self.worker(State::Funded, shutdown.clone(), interval),
            self.worker(State::Submitting, shutdown.clone(), interval),
            self.worker(State::Cancelling, shutdown.clone(), interval),
        );
        Ok(())
    }
}
