//! Sequencer runtime.
//!
//! One worker loop per fulfillment state in {Unknown, Pending}. The Unknown
//! loop consults the scheduler and submits transactions; the Pending loop
//! monitors finalized confirmation and fires the success, failure, and
//! revocation callbacks, cascading terminal states up through the action and
//! intent handlers.

pub mod action_handler;
pub mod fulfillment_handler;
pub mod intent_handler;
pub mod scheduler;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use solana_sdk::signature::Signature;
use solana_sdk::transaction::Transaction;
use tracing::{debug, info, warn};

use crate::chain::{ChainClient, ChainError, Commitment};
use crate::data::fulfillment::{self, State};
use crate::data::nonce::{self, Environment, Purpose};
use crate::data::query::Direction;
use crate::data::{action, intent, Provider};
use crate::metrics::Metrics;
use crate::transaction::{LocalNoncePool, NoncePoolError};
use crate::worker::retry::backoff_with_jitter;
use crate::worker::{Runtime, ShutdownSignal};

use action_handler::{get_action_handlers, ActionHandler};
use fulfillment_handler::{get_fulfillment_handlers, FulfillmentHandler, HandlerDeps};
use intent_handler::{get_intent_handlers, IntentHandler};
use scheduler::Scheduler;

/// Submission attempts within one sweep before deferring to the next.
const SUBMIT_ATTEMPTS: u32 = 3;

const SUBMIT_BACKOFF_BASE: Duration = Duration::from_millis(250);

pub struct SequencerRuntime {
    data: Provider,
    chain: Arc<dyn ChainClient>,
    scheduler: Arc<dyn Scheduler>,
    nonce_pool: Arc<LocalNoncePool>,
    fulfillment_handlers: HashMap<fulfillment::Type, Arc<dyn FulfillmentHandler>>,
    action_handlers: HashMap<action::Type, Arc<dyn ActionHandler>>,
    intent_handlers: HashMap<intent::Type, Arc<dyn IntentHandler>>,
    batch_size: usize,
    interval: Duration,
    metrics: Arc<Metrics>,
}

impl SequencerRuntime {
    /// Builds the runtime and validates its wiring. A missing handler
    /// registration or a mismatched nonce pool is a startup error, never a
    /// runtime one.
    pub fn new(
        data: Provider,
        chain: Arc<dyn ChainClient>,
        scheduler: Arc<dyn Scheduler>,
        nonce_pool: Arc<LocalNoncePool>,
        handler_deps: HandlerDeps,
        batch_size: usize,
        interval: Duration,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Self> {
        if !nonce_pool.matches(
            Environment::Solana,
            nonce::INSTANCE_SOLANA_MAINNET,
            Purpose::OnDemandTransaction,
        ) {
            bail!("nonce pool for on-demand transactions is not provided");
        }

        let fulfillment_handlers = get_fulfillment_handlers(&handler_deps);
        for fulfillment_type in fulfillment_handler::ALL_TYPES {
            if !fulfillment_handlers.contains_key(&fulfillment_type) {
                bail!("no fulfillment handler registered for {fulfillment_type:?}");
            }
        }

        let action_handlers = get_action_handlers(&data);
        for action_type in action_handler::ALL_TYPES {
            if !action_handlers.contains_key(&action_type) {
                bail!("no action handler registered for {action_type:?}");
            }
        }

        let intent_handlers = get_intent_handlers(&data);
        for intent_type in intent_handler::ALL_TYPES {
            if !intent_handlers.contains_key(&intent_type) {
                bail!("no intent handler registered for {intent_type:?}");
            }
        }

        Ok(Self {
            data,
            chain,
            scheduler,
            nonce_pool,
            fulfillment_handlers,
            action_handlers,
            intent_handlers,
            batch_size,
            interval,
            metrics,
        })
    }

    fn handler_for(
        &self,
        fulfillment_type: fulfillment::Type,
    ) -> anyhow::Result<&Arc<dyn FulfillmentHandler>> {
        self.fulfillment_handlers
            .get(&fulfillment_type)
            .ok_or_else(|| anyhow!("no fulfillment handler for {fulfillment_type:?} type"))
    }

    /// Processes a single fulfillment according to its current state. Public
    /// so tests can drive the pipeline without standing up the loops.
    pub async fn handle_fulfillment(&self, record: &mut fulfillment::Record) -> anyhow::Result<()> {
        match record.state {
            State::Unknown => self.handle_unknown(record).await,
            State::Pending => self.handle_pending(record).await,
            _ => Ok(()),
        }
    }

    async fn handle_unknown(&self, record: &mut fulfillment::Record) -> anyhow::Result<()> {
        if !self.scheduler.can_submit_to_blockchain(record).await? {
            return Ok(());
        }

        let handler = self.handler_for(record.fulfillment_type)?;

        // On-demand types get their transaction built against a freshly
        // claimed nonce the first time they are schedulable.
        if record.data.is_none() {
            if !handler.supports_on_demand_transactions() {
                bail!(
                    "fulfillment {} has no transaction and type {:?} cannot build one on demand",
                    record.id,
                    record.fulfillment_type
                );
            }

            let mut nonce_record = match self.nonce_pool.claim() {
                Ok(nonce_record) => nonce_record,
                Err(NoncePoolError::NoAvailableNonces) => {
                    warn!(intent = %record.intent_id, "nonce pool exhausted, deferring fulfillment");
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            };

            let built = match handler.make_on_demand_transaction(record, &nonce_record) {
                Ok(built) => built,
                Err(err) => {
                    self.nonce_pool.release(&mut nonce_record)?;
                    return Err(err).context("failure making on-demand transaction");
                }
            };

            record.nonce = Some(nonce_record.address.clone());
            record.blockhash = nonce_record.blockhash.clone();
            record.data = Some(built.blob);
            record.signature = Some(built.signature);
            record.virtual_signature = built.virtual_signature;

            if let Err(err) = self.data.fulfillments.update(record) {
                self.nonce_pool.release(&mut nonce_record)?;
                return Err(err).context("failure persisting on-demand transaction");
            }
        }

        let transaction: Transaction = bincode::deserialize(
            record
                .data
                .as_deref()
                .ok_or_else(|| anyhow!("fulfillment has no transaction data"))?,
        )
        .context("failure unmarshalling stored transaction")?;

        match self.submit_with_retries(&transaction).await {
            Ok(_) => {}
            Err(ChainError::TransactionRejected(reason)) => {
                // Hard rejection. For on-demand transactions, drop the built
                // blob and release the nonce so the next sweep retries with
                // a fresh one; pre-signed blobs are retried as-is.
                warn!(
                    intent = %record.intent_id,
                    signature = record.signature.as_deref().unwrap_or("<nil>"),
                    reason,
                    "transaction submission was rejected"
                );
                if handler.supports_on_demand_transactions() {
                    self.reset_on_demand_transaction(record)?;
                }
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }

        // The nonce is consumed once the transaction is accepted by the
        // chain. Pre-signed fulfillments had their nonce claimed at intent
        // submission, so only Reserved nonces move here.
        if let Some(nonce_address) = &record.nonce {
            let mut nonce_record = self.data.nonces.get(nonce_address)?;
            if nonce_record.state == nonce::State::Reserved {
                self.nonce_pool.mark_claimed(
                    &mut nonce_record,
                    record.signature.as_deref().unwrap_or_default(),
                )?;
            }
        }

        record.state = State::Pending;
        self.data.fulfillments.update(record)?;
        self.metrics.record_fulfillment_submitted();

        info!(
            intent = %record.intent_id,
            signature = record.signature.as_deref().unwrap_or("<nil>"),
            "fulfillment submitted to blockchain"
        );
        Ok(())
    }

    async fn handle_pending(&self, record: &mut fulfillment::Record) -> anyhow::Result<()> {
        let handler = self.handler_for(record.fulfillment_type)?;

        let signature = record
            .signature
            .as_deref()
            .ok_or_else(|| anyhow!("pending fulfillment {} has no signature", record.id))?
            .parse::<Signature>()
            .map_err(|_| anyhow!("invalid fulfillment signature"))?;

        let status = self
            .chain
            .get_transaction_status(&signature, Commitment::Finalized)
            .await?;

        match status {
            None => {
                if handler.is_revoked(record)? {
                    warn!(
                        intent = %record.intent_id,
                        signature = %signature,
                        "fulfillment was revoked before landing"
                    );
                    self.metrics.record_fulfillment_revoked();
                    self.mark_terminal(record, State::Revoked)?;
                }
                Ok(())
            }
            Some(status) if status.succeeded() => {
                record.state = State::Confirmed;
                self.data.fulfillments.update(record)?;
                self.metrics.record_fulfillment_confirmed();

                handler.on_success(record)?;
                self.release_bound_nonce(record)?;
                self.cascade(record, State::Confirmed)
            }
            Some(status) => {
                if handler.on_failure(record)? {
                    // Handler recovered (e.g. synthesized a replacement);
                    // leave the fulfillment Pending.
                    debug!(intent = %record.intent_id, "handler recovered failed fulfillment");
                    return Ok(());
                }

                warn!(
                    intent = %record.intent_id,
                    signature = %signature,
                    error = status.err.as_deref().unwrap_or("<unknown>"),
                    "fulfillment failed on chain"
                );
                self.metrics.record_fulfillment_failed();
                self.mark_terminal(record, State::Failed)
            }
        }
    }

    fn mark_terminal(
        &self,
        record: &mut fulfillment::Record,
        state: State,
    ) -> anyhow::Result<()> {
        record.state = state;
        self.data.fulfillments.update(record)?;
        self.release_bound_nonce(record)?;
        self.cascade(record, state)
    }

    /// A consumed or abandoned nonce moves to Released; the nonce worker
    /// recycles it once the on-chain value is observed to have advanced.
    fn release_bound_nonce(&self, record: &fulfillment::Record) -> anyhow::Result<()> {
        let Some(nonce_address) = &record.nonce else {
            return Ok(());
        };

        let mut nonce_record = self.data.nonces.get(nonce_address)?;
        if matches!(
            nonce_record.state,
            nonce::State::Reserved | nonce::State::Claimed
        ) {
            nonce_record.state = nonce::State::Released;
            self.data.nonces.update(&mut nonce_record)?;
        }
        Ok(())
    }

    /// Propagates a terminal fulfillment state to the parent action, then
    /// lets the intent handler re-evaluate the action distribution.
    fn cascade(&self, record: &fulfillment::Record, new_state: State) -> anyhow::Result<()> {
        let action_handler = self
            .action_handlers
            .get(&record.action_type)
            .ok_or_else(|| anyhow!("no action handler for {:?} type", record.action_type))?;
        action_handler.on_fulfillment_state_change(record, new_state)?;

        let intent_handler = self
            .intent_handlers
            .get(&record.intent_type)
            .ok_or_else(|| anyhow!("no intent handler for {:?} type", record.intent_type))?;
        intent_handler.on_action_updated(&record.intent_id)
    }

    fn reset_on_demand_transaction(&self, record: &mut fulfillment::Record) -> anyhow::Result<()> {
        if let Some(nonce_address) = record.nonce.take() {
            let mut nonce_record = self.data.nonces.get(&nonce_address)?;
            if nonce_record.state == nonce::State::Reserved {
                self.nonce_pool.release(&mut nonce_record)?;
            }
        }

        record.blockhash = None;
        record.data = None;
        record.signature = None;
        record.virtual_signature = None;
        self.data.fulfillments.update(record)?;
        Ok(())
    }

    async fn submit_with_retries(
        &self,
        transaction: &Transaction,
    ) -> Result<Signature, ChainError> {
        let mut last_err = None;
        for attempt in 0..SUBMIT_ATTEMPTS {
            match self.chain.submit_transaction(transaction).await {
                Ok(signature) => return Ok(signature),
                Err(ChainError::TransactionRejected(reason)) => {
                    return Err(ChainError::TransactionRejected(reason))
                }
                Err(err) => {
                    let delay = backoff_with_jitter(attempt, SUBMIT_BACKOFF_BASE, self.interval);
                    warn!(attempt, delay = ?delay, error = %err, "transaction submission failed, retrying");
                    last_err = Some(err);
                    tokio::time::sleep(delay).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ChainError::Rpc("submission retries exhausted".into())))
    }

    async fn worker(&self, state: State, shutdown: ShutdownSignal, interval: Duration) {
        let mut cursor = None;

        loop {
            if shutdown.sleep(interval).await {
                return;
            }

            let items = match self.data.fulfillments.get_all_by_state(
                state,
                false,
                cursor,
                self.batch_size,
                Direction::Ascending,
            ) {
                Ok(items) => items,
                Err(err) => {
                    warn!(state = ?state, error = %err, "failure querying fulfillments");
                    cursor = None;
                    continue;
                }
            };

            // Records within an iteration are processed concurrently; a
            // single record's failure is logged and skipped.
            let handled = items.into_iter().map(|mut record| async move {
                let id = record.id;
                if let Err(err) = self.handle_fulfillment(&mut record).await {
                    warn!(id, state = ?state, error = format!("{err:#}"), "failure processing fulfillment");
                }
                id
            });
            let ids = futures::future::join_all(handled).await;

            cursor = ids.last().copied();
        }
    }

    async fn metrics_gauge_worker(&self, shutdown: ShutdownSignal) {
        let gauge_interval = Duration::from_secs(30);

        loop {
            if shutdown.sleep(gauge_interval).await {
                return;
            }

            for state in [
                State::Unknown,
                State::Pending,
                State::Confirmed,
                State::Failed,
                State::Revoked,
            ] {
                match self.data.fulfillments.count_by_state(state) {
                    Ok(count) => {
                        info!(state = ?state, count, "fulfillment count gauge");
                    }
                    Err(err) => {
                        warn!(error = %err, "failure reading fulfillment count gauge");
                    }
                }
            }

            if let Ok(pending_by_type) = self.data.fulfillments.count_pending_by_type() {
                for (fulfillment_type, count) in pending_by_type {
                    info!(fulfillment_type = ?fulfillment_type, count, "pending fulfillment gauge");
                }
            }
        }
    }
}

#[async_trait]
impl Runtime for SequencerRuntime {
    async fn start(&self, shutdown: ShutdownSignal, interval: Duration) -> anyhow::Result<()> {
        tokio::join!(
            self.worker(State::Unknown, shutdown.clone(), interval),
            self.worker(State::Pending, shutdown.clone(), interval),
            self.metrics_gauge_worker(shutdown.clone()),
        );
        Ok(())
    }
}
