//! Payment orchestration service.
//!
//! Wires the store, chain client, nonce pools, worker runtimes, and the HTTP
//! API together, then runs until interrupted.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use orchestrator::chain::updates::{HttpUpdateStream, UpdateStream};
use orchestrator::chain::RpcChainClient;
use orchestrator::common::subsidizer::load_subsidizer;
use orchestrator::common::{CoreMint, SubsidizerTreasury, VmRegistry};
use orchestrator::config::Config;
use orchestrator::data::nonce::{Environment, Purpose, INSTANCE_SOLANA_MAINNET};
use orchestrator::data::Provider;
use orchestrator::metrics::Metrics;
use orchestrator::rpc::{self, TransactionServer};
use orchestrator::transaction::nonce_pool::select_nonce_pool;
use orchestrator::transaction::LocalNoncePool;
use orchestrator::worker::account::AccountRuntime;
use orchestrator::worker::nonce::NonceRuntime;
use orchestrator::worker::sequencer::fulfillment_handler::{
    get_fulfillment_handlers, HandlerDeps,
};
use orchestrator::worker::sequencer::scheduler::ContextualScheduler;
use orchestrator::worker::sequencer::SequencerRuntime;
use orchestrator::worker::swap::SwapRuntime;
use orchestrator::worker::{shutdown_channel, Runtime, ShutdownSignal};

fn spawn_runtime(
    name: &'static str,
    runtime: Arc<dyn Runtime>,
    shutdown: ShutdownSignal,
    interval: Duration,
) {
    tokio::spawn(async move {
        if let Err(err) = runtime.start(shutdown, interval).await {
            warn!(runtime = name, error = format!("{err:#}"), "runtime terminated unexpectedly");
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    info!("starting payment orchestration service");

    let config = Config::load_from_path(None)?;
    info!("configuration loaded");

    // The store traits are what the pipeline consumes; a relational engine
    // slots in behind data::Provider without touching anything above it.
    let data = Provider::in_memory();

    let chain = Arc::new(RpcChainClient::new(config.chain.rpc_url.clone()));

    let subsidizer = load_subsidizer(&config.subsidizer)?;
    let core_mint = CoreMint::from_config(&config.mint)?;
    let vm_registry = Arc::new(VmRegistry::from_config(&config.vm, subsidizer.clone())?);
    let metrics = Arc::new(Metrics::new());

    let treasury = Arc::new(SubsidizerTreasury::new(
        subsidizer.clone(),
        config.subsidizer.min_balance,
        chain.clone(),
    ));

    let core_vm = vm_registry.for_mint(&core_mint.address)?.vm;
    let nonce_pools = vec![
        Arc::new(LocalNoncePool::new(
            data.clone(),
            Environment::Cvm,
            core_vm.to_string(),
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

    let on_demand_pool = select_nonce_pool(
        Environment::Solana,
        INSTANCE_SOLANA_MAINNET,
        Purpose::OnDemandTransaction,
        &nonce_pools,
    )?
    .clone();
    let swap_pool = select_nonce_pool(
        Environment::Solana,
        INSTANCE_SOLANA_MAINNET,
        Purpose::ClientSwap,
        &nonce_pools,
    )?
    .clone();

    let handler_deps = HandlerDeps {
        data: data.clone(),
        vm_program_id: *vm_registry.program_id(),
        vm_registry: vm_registry.clone(),
        core_mint: core_mint.address,
    };

    let scheduler = Arc::new(ContextualScheduler::new(
        data.clone(),
        config.scheduler.clone(),
        get_fulfillment_handlers(&handler_deps),
        treasury.clone(),
    ));

    let sequencer = Arc::new(SequencerRuntime::new(
        data.clone(),
        chain.clone(),
        scheduler,
        on_demand_pool,
        handler_deps,
        config.worker.batch_size,
        config.worker_interval(),
        metrics.clone(),
    )?);

    let update_stream: Option<Arc<dyn UpdateStream>> =
        if config.chain.update_stream_endpoint.is_empty() {
            None
        } else {
            Some(Arc::new(HttpUpdateStream::new(
                config.chain.update_stream_endpoint.clone(),
                config.chain.update_stream_token.clone(),
            )?))
        };

    let nonce_runtime = Arc::new(NonceRuntime::new(
        data.clone(),
        chain.clone(),
        subsidizer.clone(),
        config.nonce.clone(),
        vm_registry.vm_instances(),
        update_stream,
        metrics.clone(),
    ));

    let account_runtime = Arc::new(AccountRuntime::new(
        data.clone(),
        config.gift_card_expiry(),
        config.worker.batch_size,
    ));

    let swap_runtime = Arc::new(SwapRuntime::new(
        data.clone(),
        chain.clone(),
        vm_registry.clone(),
        swap_pool,
        config.swap.clone(),
        config.worker.batch_size,
        metrics.clone(),
    )?);

    let (shutdown_sender, shutdown) = shutdown_channel();
    let interval = config.worker_interval();

    spawn_runtime("sequencer", sequencer, shutdown.clone(), interval);
    spawn_runtime("nonce", nonce_runtime, shutdown.clone(), interval);
    spawn_runtime("account", account_runtime, shutdown.clone(), interval);
    spawn_runtime("swap", swap_runtime, shutdown.clone(), interval);
    info!("worker runtimes started");

    let server = Arc::new(TransactionServer::new(
        config.clone(),
        data,
        vm_registry,
        core_mint,
        subsidizer,
        nonce_pools,
        metrics,
    )?);

    let address: SocketAddr = config
        .service
        .bind_address
        .parse()
        .context("invalid bind address")?;
    info!(address = %address, "serving api");

    let api = tokio::spawn(rpc::run(server, address, shutdown.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("failure waiting for shutdown signal")?;
    info!("shutdown signal received, draining");

    let _ = shutdown_sender.send(true);
    let grace = Duration::from_secs(config.service.shutdown_grace_secs);
    if tokio::time::timeout(grace, api).await.is_err() {
        warn!("graceful shutdown timed out");
    }

    info!("shutdown complete");
    Ok(())
}
