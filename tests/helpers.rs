//! Shared test fixtures: a programmable mock chain client and a fully wired
//! transaction server over in-memory stores.

// Not every test binary exercises every fixture.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;
use solana_sdk::hash::Hash;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_sdk::transaction::Transaction;

use orchestrator::auth::sign_canonical;
use orchestrator::chain::{
    AccountData, ChainClient, ChainError, Commitment, TransactionStatus,
};
use orchestrator::common::{Account, CoreMint, SubsidizerTreasury, VmRegistry};
use orchestrator::config::{Config, VmEntryConfig};
use orchestrator::data::nonce::{Environment, Purpose, State as NonceState, INSTANCE_SOLANA_MAINNET};
use orchestrator::data::{account_info, currency, fulfillment, nonce, Provider};
use orchestrator::metrics::Metrics;
use orchestrator::rpc::submit_intent::{IntentDescriptor, IntentDetails, SubmitIntentRequest};
use orchestrator::rpc::TransactionServer;
use orchestrator::transaction::LocalNoncePool;
use orchestrator::worker::sequencer::fulfillment_handler::{get_fulfillment_handlers, HandlerDeps};
use orchestrator::worker::sequencer::scheduler::ContextualScheduler;
use orchestrator::worker::sequencer::SequencerRuntime;

/// Programmable chain client. Tests seed accounts and transaction statuses
/// and inspect submitted transactions.
#[derive(Default)]
pub struct MockChainClient {
    pub accounts: Mutex<HashMap<Pubkey, AccountData>>,
    pub statuses: Mutex<HashMap<Signature, TransactionStatus>>,
    pub submitted: Mutex<Vec<Transaction>>,
    pub lamport_balance: AtomicU64,
    pub reject_reason: Mutex<Option<String>>,
}

impl MockChainClient {
    pub fn new() -> Self {
        let client = Self::default();
        // Plenty of fee-payer headroom unless a test says otherwise.
        client.lamport_balance.store(1_000_000_000, Ordering::SeqCst);
        client
    }

    pub fn set_account(&self, address: Pubkey, lamports: u64, data: Vec<u8>) {
        self.accounts.lock().unwrap().insert(
            address,
            AccountData {
                address,
                lamports,
                owner: Pubkey::new_unique(),
                data,
            },
        );
    }

    pub fn finalize_success(&self, signature: &str) {
        let signature: Signature = signature.parse().unwrap();
        self.statuses.lock().unwrap().insert(
            signature,
            TransactionStatus {
                signature,
                err: None,
            },
        );
    }

    pub fn finalize_failure(&self, signature: &str, err: &str) {
        let signature: Signature = signature.parse().unwrap();
        self.statuses.lock().unwrap().insert(
            signature,
            TransactionStatus {
                signature,
                err: Some(err.to_string()),
            },
        );
    }

    pub fn submitted_count(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn get_account(
        &self,
        address: &Pubkey,
        _commitment: Commitment,
    ) -> Result<Option<AccountData>, ChainError> {
        Ok(self.accounts.lock().unwrap().get(address).cloned())
    }

    async fn get_transaction_status(
        &self,
        signature: &Signature,
        _commitment: Commitment,
    ) -> Result<Option<TransactionStatus>, ChainError> {
        Ok(self.statuses.lock().unwrap().get(signature).cloned())
    }

    async fn submit_transaction(&self, transaction: &Transaction) -> Result<Signature, ChainError> {
        if let Some(reason) = self.reject_reason.lock().unwrap().clone() {
            return Err(ChainError::TransactionRejected(reason));
        }
        self.submitted.lock().unwrap().push(transaction.clone());
        Ok(transaction.signatures[0])
    }

    async fn get_balance(&self, _address: &Pubkey) -> Result<u64, ChainError> {
        Ok(self.lamport_balance.load(Ordering::SeqCst))
    }

    async fn get_latest_blockhash(&self) -> Result<Hash, ChainError> {
        Ok(Hash::new_from_array([9u8; 32]))
    }
}

pub struct TestEnv {
    pub config: Config,
    pub data: Provider,
    pub chain: Arc<MockChainClient>,
    pub server: Arc<TransactionServer>,
    pub sequencer: Arc<SequencerRuntime>,
    pub subsidizer: Account,
    pub core_mint: CoreMint,
    pub vm_registry: Arc<VmRegistry>,
    pub core_vm: Pubkey,
    pub metrics: Arc<Metrics>,
}

pub fn test_config(core_mint: &Pubkey, vm_program: &Pubkey, vm: &Pubkey, omnibus: &Pubkey) -> Config {
    let mut config = Config::default();
    config.mint.core_mint = core_mint.to_string();
    config.vm.program_id = vm_program.to_string();
    config.vm.environments.insert(
        core_mint.to_string(),
        VmEntryConfig {
            vm_account: vm.to_string(),
            omnibus_account: omnibus.to_string(),
        },
    );
    config
}

pub fn setup() -> TestEnv {
    setup_with_config_mutation(|_| {})
}

pub fn setup_with_config_mutation(mutate: impl FnOnce(&mut Config)) -> TestEnv {
    let core_mint_address = Pubkey::new_unique();
    let vm_program = Pubkey::new_unique();
    let vm = Pubkey::new_unique();
    let omnibus = Pubkey::new_unique();

    let mut config = test_config(&core_mint_address, &vm_program, &vm, &omnibus);
    mutate(&mut config);
    config.validate().unwrap();

    let data = Provider::in_memory();
    let chain = Arc::new(MockChainClient::new());
    let subsidizer = Account::generate();
    let core_mint = CoreMint::from_config(&config.mint).unwrap();
    let vm_registry = Arc::new(VmRegistry::from_config(&config.vm, subsidizer.clone()).unwrap());
    let metrics = Arc::new(Metrics::new());

    let treasury = Arc::new(SubsidizerTreasury::new(
        subsidizer.clone(),
        config.subsidizer.min_balance,
        chain.clone(),
    ));

    let nonce_pools = vec![
        Arc::new(LocalNoncePool::new(
            data.clone(),
            Environment::Cvm,
            vm.to_string(),
            Purpose::ClientIntent,
        )),
        Arc::new(LocalNoncePool::new(
            data.clone(),
            Environment::Solana,
            INSTANCE_SOLANA_MAINNET.to_string(),
            Purpose::OnDemandTransaction,
        )),
        Arc::new(LocalNoncePool::new(
            data.clone(),
            Environment::Solana,
            INSTANCE_SOLANA_MAINNET.to_string(),
            Purpose::ClientSwap,
        )),
    ];

    let handler_deps = HandlerDeps {
        data: data.clone(),
        vm_program_id: vm_program,
        vm_registry: vm_registry.clone(),
        core_mint: core_mint_address,
    };

    let scheduler = Arc::new(ContextualScheduler::new(
        data.clone(),
        config.scheduler.clone(),
        get_fulfillment_handlers(&handler_deps),
        treasury,
    ));

    let sequencer = Arc::new(
        SequencerRuntime::new(
            data.clone(),
            chain.clone(),
            scheduler,
            nonce_pools[1].clone(),
            handler_deps,
            config.worker.batch_size,
            config.worker_interval(),
            metrics.clone(),
        )
        .unwrap(),
    );

    let server = Arc::new(
        TransactionServer::new(
            config.clone(),
            data.clone(),
            vm_registry.clone(),
            core_mint.clone(),
            subsidizer.clone(),
            nonce_pools,
            metrics.clone(),
        )
        .unwrap(),
    );

    TestEnv {
        config,
        data,
        chain,
        server,
        sequencer,
        subsidizer,
        core_mint,
        vm_registry,
        core_vm: vm,
        metrics,
    }
}

impl TestEnv {
    /// Seeds USD (and EUR) exchange rates so AML math and limits work.
    pub fn seed_rates(&self) {
        let mut record = currency::RateRecord {
            id: 0,
            time: SystemTime::now(),
            rates: HashMap::from([("usd".to_string(), 1.0), ("eur".to_string(), 0.9)]),
        };
        self.data.currencies.put_rates(&mut record).unwrap();
    }

    /// Seeds Available client-intent nonces in the core VM pool.
    pub fn seed_client_intent_nonces(&self, count: usize) {
        for _ in 0..count {
            self.seed_nonce(
                Environment::Cvm,
                self.core_vm.to_string(),
                Purpose::ClientIntent,
                &Pubkey::new_unique().to_string(),
            );
        }
    }

    pub fn seed_on_demand_nonces(&self, count: usize) {
        for _ in 0..count {
            self.seed_nonce(
                Environment::Solana,
                INSTANCE_SOLANA_MAINNET.to_string(),
                Purpose::OnDemandTransaction,
                &Pubkey::new_unique().to_string(),
            );
        }
    }

    pub fn seed_swap_nonces(&self, count: usize) {
        for _ in 0..count {
            self.seed_nonce(
                Environment::Solana,
                INSTANCE_SOLANA_MAINNET.to_string(),
                Purpose::ClientSwap,
                &Pubkey::new_unique().to_string(),
            );
        }
    }

    fn seed_nonce(
        &self,
        environment: Environment,
        instance: String,
        purpose: Purpose,
        address: &str,
    ) {
        let mut record = nonce::Record {
            id: 0,
            address: address.to_string(),
            authority: self.subsidizer.to_base58(),
            environment,
            instance,
            purpose,
            state: NonceState::Unknown,
            blockhash: None,
            signature: None,
            version: 0,
            created_at: SystemTime::now(),
        };
        self.data.nonces.put(&mut record).unwrap();

        record.state = NonceState::Available;
        record.blockhash = Some(bs58::encode(rand_value()).into_string());
        self.data.nonces.update(&mut record).unwrap();
    }

    /// The primary vault address for an owner under the core mint VM.
    pub fn vault_of(&self, owner: &Account) -> String {
        let environment = self.vm_registry.for_mint(&self.core_mint.address).unwrap();
        environment
            .timelock_accounts_for(self.vm_registry.program_id(), owner)
            .vault
            .to_string()
    }

    /// Registers an already-opened primary account, bypassing the pipeline.
    pub fn register_opened_account(&self, owner: &Account) -> String {
        let vault = self.vault_of(owner);
        let mut record = account_info::Record {
            id: 0,
            owner: owner.to_base58(),
            mint: self.core_mint.address.to_string(),
            account_type: account_info::AccountType::Primary,
            index: 0,
            token_account: vault.clone(),
            auto_return_check_complete: false,
            version: 0,
            created_at: SystemTime::now(),
        };
        self.data.account_infos.put(&mut record).unwrap();
        vault
    }

    pub fn set_cached_balance(&self, token_account: &str, quarks: u64) {
        let lock = self.data.balances.get_version_lock(token_account).unwrap();
        self.data.balances.commit(&lock, Some(quarks)).unwrap();
    }

    /// Runs every Unknown fulfillment through the sequencer once.
    pub async fn process_unknown_fulfillments(&self) {
        self.process_fulfillments_in_state(fulfillment::State::Unknown)
            .await;
    }

    /// Runs every Pending fulfillment through the sequencer once.
    pub async fn process_pending_fulfillments(&self) {
        self.process_fulfillments_in_state(fulfillment::State::Pending)
            .await;
    }

    async fn process_fulfillments_in_state(&self, state: fulfillment::State) {
        let records = self
            .data
            .fulfillments
            .get_all_by_state(
                state,
                false,
                None,
                100,
                orchestrator::data::query::Direction::Ascending,
            )
            .unwrap();
        for mut record in records {
            let _ = self.sequencer.handle_fulfillment(&mut record).await;
        }
    }
}

pub fn rand_value() -> [u8; 32] {
    rand::random()
}

/// Builds a canonically signed submission request.
pub fn signed_submit_request(
    owner: &Account,
    intent_id: &str,
    details: IntentDetails,
) -> SubmitIntentRequest {
    let descriptor = IntentDescriptor {
        id: intent_id.to_string(),
        owner: owner.to_base58(),
        details,
    };
    let signature = sign_canonical(owner, &descriptor).unwrap();
    SubmitIntentRequest {
        intent: descriptor,
        signature: Some(bs58::encode(signature).into_string()),
    }
}
