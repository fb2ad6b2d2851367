//! Nonce pool maintenance.
//!
//! Keeps each pool at its configured target size and drives nonce records
//! through their on-chain lifecycle: grinding vault keys, creating nonce
//! accounts, promoting Unknown records once initialized on chain, and
//! recycling Released records after the durable value advances.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context};
use async_trait::async_trait;
use solana_sdk::hash::Hash;
use solana_sdk::nonce::state::{State as OnChainNonceState, Versions as NonceVersions};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::system_instruction;
use solana_sdk::transaction::Transaction;
use tracing::{debug, info, warn};

use crate::chain::updates::UpdateStream;
use crate::chain::{ChainClient, Commitment};
use crate::common::Account;
use crate::config::NonceConfig;
use crate::data::nonce::{self, Environment, Purpose, State};
use crate::data::{vault, Provider, StoreError};
use crate::metrics::Metrics;
use crate::worker::{Runtime, ShutdownSignal};

/// Rent-exempt balance for a system nonce account plus creation fees.
/// Empirically derived; revisited when rent parameters change.
const NONCE_RENT_LAMPORTS: u64 = 1_447_680;

/// An Unknown nonce whose account never appears on chain within this window
/// is considered lost.
const UNKNOWN_NONCE_DEADLINE: Duration = Duration::from_secs(600);

/// Keys ground per generation pass.
const MAX_KEYS_PER_PASS: u64 = 5;

pub struct NonceRuntime {
    data: Provider,
    chain: Arc<dyn ChainClient>,
    subsidizer: Account,
    conf: NonceConfig,
    vm_instances: Vec<Pubkey>,
    update_stream: Option<Arc<dyn UpdateStream>>,
    metrics: Arc<Metrics>,
}

fn parse_nonce_value(data: &[u8]) -> Option<Hash> {
    let versions: NonceVersions = bincode::deserialize(data).ok()?;
    match versions.state() {
        OnChainNonceState::Initialized(data) => Some(data.blockhash()),
        _ => None,
    }
}

impl NonceRuntime {
    pub fn new(
        data: Provider,
        chain: Arc<dyn ChainClient>,
        subsidizer: Account,
        conf: NonceConfig,
        vm_instances: Vec<Pubkey>,
        update_stream: Option<Arc<dyn UpdateStream>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            data,
            chain,
            subsidizer,
            conf,
            vm_instances,
            update_stream,
            metrics,
        }
    }

    /// Grinds vanity vault keys until a reserve is available for the
    /// allocators. Keys are persisted before they are ever offered.
    async fn generate_keys(&self, shutdown: ShutdownSignal) {
        loop {
            // Give the server some time to breathe between passes.
            if shutdown.sleep(Duration::from_secs(15)).await {
                return;
            }

            let available = match self.data.vault_keys.count_by_state(vault::State::Available) {
                Ok(count) => count,
                Err(err) => {
                    warn!(error = %err, "failure counting vault keys");
                    continue;
                }
            };

            let reserve_size = (self.conf.on_demand_transaction_pool_size
                + self.conf.client_swap_pool_size)
                * 2;
            if available >= reserve_size {
                continue;
            }

            let missing = (reserve_size - available).min(MAX_KEYS_PER_PASS);
            info!(missing, "not enough reserve keys available, generating more");

            for _ in 0..missing {
                if shutdown.is_raised() {
                    return;
                }

                let prefix = self.conf.pubkey_prefix.clone();
                // Grinding is CPU-bound; keep it off the async workers.
                let ground = tokio::task::spawn_blocking(move || vault::grind_key(&prefix)).await;

                match ground {
                    Ok(mut record) => {
                        if let Err(err) = self.data.vault_keys.save(&mut record) {
                            warn!(error = %err, "failure persisting ground key");
                        } else {
                            debug!(key = %record.public_key, "generated vault key");
                        }
                    }
                    Err(err) => warn!(error = %err, "key grinding task failed"),
                }
            }
        }
    }

    fn reserve_vault_key(&self) -> anyhow::Result<vault::Record> {
        let keys = self
            .data
            .vault_keys
            .get_all_by_state(vault::State::Available, 1)
            .map_err(|err| match err {
                StoreError::NotFound => anyhow::anyhow!("no available keys in the vault"),
                other => other.into(),
            })?;

        let mut key = keys
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("no available keys in the vault"))?;
        key.state = vault::State::Reserved;
        self.data.vault_keys.save(&mut key)?;
        Ok(key)
    }

    /// Creates one nonce account on chain and inserts its Unknown record.
    pub async fn create_solana_nonce(&self, purpose: Purpose) -> anyhow::Result<()> {
        let key = self.reserve_vault_key()?;
        let nonce_account = Account::from_private_key_base58(&key.private_key)
            .context("vault key is not a valid private key")?;

        let blockhash = self.chain.get_latest_blockhash().await?;
        let instructions = system_instruction::create_nonce_account(
            self.subsidizer.public_key(),
            nonce_account.public_key(),
            self.subsidizer.public_key(),
            NONCE_RENT_LAMPORTS,
        );
        let transaction = Transaction::new_signed_with_payer(
            &instructions,
            Some(self.subsidizer.public_key()),
            &[self.subsidizer.keypair()?, nonce_account.keypair()?],
            blockhash,
        );

        self.chain.submit_transaction(&transaction).await?;

        let mut record = nonce::Record {
            id: 0,
            address: nonce_account.to_base58(),
            authority: self.subsidizer.to_base58(),
            environment: Environment::Solana,
            instance: nonce::INSTANCE_SOLANA_MAINNET.to_string(),
            purpose,
            state: State::Unknown,
            blockhash: None,
            signature: None,
            version: 0,
            created_at: SystemTime::now(),
        };
        self.data.nonces.put(&mut record)?;
        self.metrics.record_nonce_created();

        info!(address = %record.address, purpose = ?purpose, "created nonce account");
        Ok(())
    }

    /// Creates one virtual durable nonce under a VM. Virtual nonces have no
    /// on-chain creation transaction; the VM assigns the initial value when
    /// the memory slot is reserved, so the record is immediately Available.
    pub fn create_virtual_nonce(&self, vm: &Pubkey, purpose: Purpose) -> anyhow::Result<()> {
        let key = self.reserve_vault_key()?;
        let owner = Account::from_private_key_base58(&key.private_key)
            .context("vault key is not a valid private key")?;

        let (address, _) = Pubkey::find_program_address(
            &[b"vdn", vm.as_ref(), owner.public_key().as_ref()],
            vm,
        );

        let initial_value: [u8; 32] = rand::random();
        let mut record = nonce::Record {
            id: 0,
            address: address.to_string(),
            authority: owner.to_base58(),
            environment: Environment::Cvm,
            instance: vm.to_string(),
            purpose,
            state: State::Unknown,
            blockhash: None,
            signature: None,
            version: 0,
            created_at: SystemTime::now(),
        };
        self.data.nonces.put(&mut record)?;

        record.state = State::Available;
        record.blockhash = Some(bs58::encode(initial_value).into_string());
        self.data.nonces.update(&mut record)?;
        self.metrics.record_nonce_created();

        debug!(address = %record.address, vm = %vm, "created virtual durable nonce");
        Ok(())
    }

    /// Tops up one pool toward its target size, one account per pass. The
    /// invalid-count limit arrests runaway creation when accounts keep
    /// coming back corrupted.
    async fn allocator(
        &self,
        shutdown: ShutdownSignal,
        environment: Environment,
        instance: String,
        purpose: Purpose,
        target_pool_size: u64,
    ) {
        let mut has_warned = false;

        loop {
            if shutdown.sleep(Duration::from_secs(1)).await {
                return;
            }

            let result = async {
                let invalid = self.data.nonces.count_by_state_and_purpose(
                    environment,
                    &instance,
                    State::Invalid,
                    purpose,
                )?;
                if invalid > self.conf.max_invalid_nonces {
                    bail!("nonce account limit exceeded");
                }

                let mut potentially_available = 0u64;
                for state in [
                    State::Available,
                    State::Claimed,
                    State::Released,
                    State::Unknown,
                ] {
                    potentially_available += self.data.nonces.count_by_state_and_purpose(
                        environment,
                        &instance,
                        state,
                        purpose,
                    )?;
                }

                if potentially_available >= target_pool_size {
                    if has_warned {
                        info!(purpose = ?purpose, "the nonce pool size is reached");
                        has_warned = false;
                    }
                    return Ok(());
                }

                if !has_warned {
                    has_warned = true;
                    warn!(purpose = ?purpose, potentially_available, "the nonce pool is too small");
                }

                match environment {
                    Environment::Solana => self.create_solana_nonce(purpose).await,
                    Environment::Cvm => {
                        let vm = instance
                            .parse::<Pubkey>()
                            .context("cvm instance is not a vm address")?;
                        self.create_virtual_nonce(&vm, purpose)
                    }
                }
            }
            .await;

            if let Err(err) = result {
                let message = format!("{err:#}");
                if message.contains("nonce account limit exceeded") {
                    warn!(purpose = ?purpose, "invalid nonce limit exceeded, halting allocator");
                    return;
                }
                warn!(purpose = ?purpose, error = message, "failure creating nonce");
            }
        }
    }

    /// Backup polling worker for one (environment, instance, state) triple.
    /// Reconciles drift whenever the update subscription is lagging or
    /// absent.
    async fn state_worker(
        &self,
        shutdown: ShutdownSignal,
        environment: Environment,
        instance: String,
        state: State,
        interval: Duration,
    ) {
        loop {
            if shutdown.sleep(interval).await {
                return;
            }

            for purpose in [
                Purpose::ClientIntent,
                Purpose::ClientSwap,
                Purpose::OnDemandTransaction,
                Purpose::InternalServerProcess,
            ] {
                let records = match self.data.nonces.get_all_by_state_and_purpose(
                    environment,
                    &instance,
                    state,
                    purpose,
                    100,
                ) {
                    Ok(records) => records,
                    Err(err) => {
                        warn!(error = %err, "failure querying nonce records");
                        continue;
                    }
                };

                for mut record in records {
                    if shutdown.is_raised() {
                        return;
                    }
                    if let Err(err) = self.observe_nonce(&mut record).await {
                        warn!(address = %record.address, error = format!("{err:#}"), "failure processing nonce");
                    }
                }
            }
        }
    }

    /// Reads the on-chain state of one nonce account and advances the record
    /// accordingly. Public so tests can drive the lifecycle directly.
    pub async fn observe_nonce(&self, record: &mut nonce::Record) -> anyhow::Result<()> {
        if record.environment == Environment::Cvm {
            // Virtual nonce values are only observable through the update
            // stream; the backup poller has nothing to reconcile directly.
            return Ok(());
        }

        let address = record
            .address
            .parse::<Pubkey>()
            .context("malformed nonce address")?;
        let account = self
            .chain
            .get_account(&address, Commitment::Finalized)
            .await?;

        match (record.state, account) {
            (State::Unknown, Some(account)) => match parse_nonce_value(&account.data) {
                Some(value) => {
                    record.state = State::Available;
                    record.blockhash = Some(bs58::encode(value.to_bytes()).into_string());
                    self.data.nonces.update(record)?;
                    info!(address = %record.address, "nonce account initialized and available");
                }
                None => {
                    record.state = State::Invalid;
                    self.data.nonces.update(record)?;
                    warn!(address = %record.address, "nonce account exists but is not initialized");
                }
            },
            (State::Unknown, None) => {
                let age = record
                    .created_at
                    .elapsed()
                    .unwrap_or(Duration::ZERO);
                if age > UNKNOWN_NONCE_DEADLINE {
                    record.state = State::Invalid;
                    self.data.nonces.update(record)?;
                    warn!(address = %record.address, "nonce account never appeared on chain");
                }
            }
            (State::Released, Some(account)) => {
                let Some(observed) = parse_nonce_value(&account.data) else {
                    record.state = State::Invalid;
                    self.data.nonces.update(record)?;
                    warn!(address = %record.address, "released nonce account is corrupted");
                    return Ok(());
                };

                let observed = bs58::encode(observed.to_bytes()).into_string();
                // Only recycle after the consumed value has advanced;
                // otherwise a replayed transaction could still land.
                if record.blockhash.as_deref() != Some(observed.as_str()) {
                    record.state = State::Available;
                    record.blockhash = Some(observed);
                    record.signature = None;
                    self.data.nonces.update(record)?;
                    self.metrics.record_nonce_recycled();
                    debug!(address = %record.address, "nonce recycled");
                }
            }
            (State::Released, None) => {
                record.state = State::Invalid;
                self.data.nonces.update(record)?;
                warn!(address = %record.address, "released nonce account is gone");
            }
            _ => {}
        }

        Ok(())
    }

    /// Consumes the account-update subscription for low-latency recycling.
    async fn update_consumer(&self, shutdown: ShutdownSignal) {
        let Some(stream) = &self.update_stream else {
            return;
        };

        let mut receiver = match stream.subscribe().await {
            Ok(receiver) => receiver,
            Err(err) => {
                warn!(error = %err, "update stream unavailable, relying on backup polling");
                return;
            }
        };

        loop {
            let update = tokio::select! {
                update = receiver.recv() => match update {
                    Some(update) => update,
                    None => return,
                },
                _ = shutdown.raised() => return,
            };

            let address = update.address.to_string();
            let Ok(mut record) = self.data.nonces.get(&address) else {
                continue;
            };
            if record.state != State::Released {
                continue;
            }

            let observed = match record.environment {
                Environment::Solana => parse_nonce_value(&update.data)
                    .map(|value| bs58::encode(value.to_bytes()).into_string()),
                // Virtual nonce updates carry the raw 32-byte value.
                Environment::Cvm => <[u8; 32]>::try_from(update.data.as_slice())
                    .ok()
                    .map(|value| bs58::encode(value).into_string()),
            };

            let Some(observed) = observed else {
                continue;
            };
            if record.blockhash.as_deref() == Some(observed.as_str()) {
                continue;
            }

            record.state = State::Available;
            record.blockhash = Some(observed);
            record.signature = None;
            match self.data.nonces.update(&mut record) {
                Ok(()) => {
                    self.metrics.record_nonce_recycled();
                    debug!(address = %record.address, "nonce recycled from update stream");
                }
                Err(StoreError::StaleVersion) => {
                    // The backup poller got there first.
                }
                Err(err) => {
                    warn!(address = %record.address, error = %err, "failure recycling nonce");
                }
            }
        }
    }

    async fn metrics_gauge_worker(&self, shutdown: ShutdownSignal) {
        let gauge_interval = Duration::from_secs(30);

        loop {
            if shutdown.sleep(gauge_interval).await {
                return;
            }

            for purpose in [Purpose::ClientSwap, Purpose::OnDemandTransaction] {
                for state in [State::Available, State::Claimed, State::Released, State::Invalid] {
                    if let Ok(count) = self.data.nonces.count_by_state_and_purpose(
                        Environment::Solana,
                        nonce::INSTANCE_SOLANA_MAINNET,
                        state,
                        purpose,
                    ) {
                        info!(purpose = ?purpose, state = ?state, count, "nonce pool gauge");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Runtime for NonceRuntime {
    async fn start(&self, shutdown: ShutdownSignal, interval: Duration) -> anyhow::Result<()> {
        let mut loops: Vec<Pin<Box<dyn Future<Output = ()> + Send + '_>>> = vec![
            Box::pin(self.generate_keys(shutdown.clone())),
            Box::pin(self.allocator(
                shutdown.clone(),
                Environment::Solana,
                nonce::INSTANCE_SOLANA_MAINNET.to_string(),
                Purpose::OnDemandTransaction,
                self.conf.on_demand_transaction_pool_size,
            )),
            Box::pin(self.allocator(
                shutdown.clone(),
                Environment::Solana,
                nonce::INSTANCE_SOLANA_MAINNET.to_string(),
                Purpose::ClientSwap,
                self.conf.client_swap_pool_size,
            )),
            Box::pin(self.state_worker(
                shutdown.clone(),
                Environment::Solana,
                nonce::INSTANCE_SOLANA_MAINNET.to_string(),
                State::Unknown,
                interval,
            )),
            Box::pin(self.state_worker(
                shutdown.clone(),
                Environment::Solana,
                nonce::INSTANCE_SOLANA_MAINNET.to_string(),
                State::Released,
                interval,
            )),
            Box::pin(self.update_consumer(shutdown.clone())),
            Box::pin(self.metrics_gauge_worker(shutdown.clone())),
        ];

        for vm in &self.vm_instances {
            loops.push(Box::pin(self.allocator(
                shutdown.clone(),
                Environment::Cvm,
                vm.to_string(),
                Purpose::ClientIntent,
                self.conf.client_intent_pool_size,
            )));
        }

        futures::future::join_all(loops).await;
        Ok(())
    }
}
