//! HTTP API surface.
//!
//! Thin warp handlers over the transaction server. Every mutating endpoint
//! authenticates the request body against the owner's signature, and every
//! response, including rejections that never reach a handler, is wrapped in
//! the shared [`ApiResponse`] envelope.

pub mod currency;
pub mod gift_card;
pub mod limits;
pub mod submit_intent;
pub mod swap;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use tokio::sync::Mutex;
use tracing::warn;
use warp::http::StatusCode;
use warp::Filter;

use crate::auth::RpcSignatureVerifier;
use crate::common::{Account, CoreMint, VmRegistry};
use crate::config::Config;
use crate::data::nonce::{Environment, Purpose, INSTANCE_SOLANA_MAINNET};
use crate::data::Provider;
use crate::guard::Guard;
use crate::metrics::Metrics;
use crate::transaction::nonce_pool::select_nonce_pool;
use crate::transaction::LocalNoncePool;
use crate::worker::ShutdownSignal;

/// Standardized response structure for all API endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// Whether the request was successful
    pub success: bool,
    /// Response data (if successful)
    pub data: Option<T>,
    /// Error message (if failed)
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Decodes a client signature from its base58 wire form.
pub(crate) fn decode_signature(signature: Option<&str>) -> Option<[u8; 64]> {
    let decoded = bs58::decode(signature?).into_vec().ok()?;
    decoded.try_into().ok()
}

/// The transaction server: shared state behind every handler.
pub struct TransactionServer {
    pub conf: Config,
    pub data: Provider,
    pub auth: RpcSignatureVerifier,
    pub guard: Guard,
    pub vm_registry: Arc<VmRegistry>,
    pub core_mint: CoreMint,
    pub subsidizer: Account,
    pub nonce_pools: Vec<Arc<LocalNoncePool>>,
    pub metrics: Arc<Metrics>,

    /// Serializes request handlers that mutate accounting state for the
    /// same account within this process.
    local_account_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TransactionServer {
    pub fn new(
        conf: Config,
        data: Provider,
        vm_registry: Arc<VmRegistry>,
        core_mint: CoreMint,
        subsidizer: Account,
        nonce_pools: Vec<Arc<LocalNoncePool>>,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Self> {
        // Validate pool wiring up front; a missing pool is a configuration
        // error, not something to discover on the first request.
        let core_vm = vm_registry.for_mint(&core_mint.address)?.vm.to_string();
        if select_nonce_pool(
            Environment::Cvm,
            &core_vm,
            Purpose::ClientIntent,
            &nonce_pools,
        )
        .is_err()
        {
            bail!("nonce pool for core mint intent operations is not provided");
        }
        if select_nonce_pool(
            Environment::Solana,
            INSTANCE_SOLANA_MAINNET,
            Purpose::ClientSwap,
            &nonce_pools,
        )
        .is_err()
        {
            bail!("nonce pool for swap operations is not provided");
        }

        let guard = Guard::new(conf.guards.clone(), data.clone());

        Ok(Self {
            conf,
            data,
            auth: RpcSignatureVerifier::new(),
            guard,
            vm_registry,
            core_mint,
            subsidizer,
            nonce_pools,
            metrics,
            local_account_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Per-account mutex for in-process serialization of accounting
    /// mutations. The map only grows; the account space a single process
    /// touches is small enough that eviction has never been worth it.
    pub async fn local_account_lock(&self, account: &str) -> Arc<Mutex<()>> {
        let mut locks = self.local_account_locks.lock().await;
        locks
            .entry(account.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn client_intent_nonce_pool(&self) -> anyhow::Result<Arc<LocalNoncePool>> {
        let core_vm = self
            .vm_registry
            .for_mint(&self.core_mint.address)?
            .vm
            .to_string();
        Ok(select_nonce_pool(
            Environment::Cvm,
            &core_vm,
            Purpose::ClientIntent,
            &self.nonce_pools,
        )?
        .clone())
    }

    pub fn core_vm(&self) -> anyhow::Result<Pubkey> {
        Ok(self.vm_registry.for_mint(&self.core_mint.address)?.vm)
    }

    pub fn gift_card_expiry(&self) -> Duration {
        self.conf.gift_card_expiry()
    }
}

fn with_server(
    server: Arc<TransactionServer>,
) -> impl Filter<Extract = (Arc<TransactionServer>,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || server.clone())
}

/// Global rejection handler for all API routes.
///
/// Rejections that never reach a handler (malformed bodies, unknown paths,
/// wrong methods) are wrapped into the same [`ApiResponse`] envelope the
/// handlers return, with the matching status code.
async fn handle_rejection(
    rejection: warp::Rejection,
) -> Result<impl warp::Reply, std::convert::Infallible> {
    let (status, message) = if let Some(err) =
        rejection.find::<warp::filters::body::BodyDeserializeError>()
    {
        (StatusCode::BAD_REQUEST, format!("invalid request body: {err}"))
    } else if rejection.is_not_found() {
        (StatusCode::NOT_FOUND, "endpoint not found".to_string())
    } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            "method not allowed".to_string(),
        )
    } else {
        warn!(rejection = ?rejection, "unhandled rejection");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal server error".to_string(),
        )
    };

    Ok(warp::reply::with_status(
        warp::reply::json(&ApiResponse::<()>::err(message)),
        status,
    ))
}

/// Builds the route tree for the API server.
pub fn routes(
    server: Arc<TransactionServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = std::convert::Infallible> + Clone {
    let submit_intent = warp::path!("v1" / "intents" / "submit")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_server(server.clone()))
        .and_then(submit_intent::submit_intent_handler);

    let submit_swap = warp::path!("v1" / "swaps" / "submit")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_server(server.clone()))
        .and_then(swap::submit_swap_handler);

    let void_gift_card = warp::path!("v1" / "giftcards" / "void")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_server(server.clone()))
        .and_then(gift_card::void_gift_card_handler);

    let get_limits = warp::path!("v1" / "limits")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_server(server.clone()))
        .and_then(limits::get_limits_handler);

    let get_rates = warp::path!("v1" / "rates")
        .and(warp::get())
        .and(warp::query::<currency::GetRatesQuery>())
        .and(with_server(server.clone()))
        .and_then(currency::get_all_rates_handler);

    let get_mints = warp::path!("v1" / "mints")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_server(server.clone()))
        .and_then(currency::get_mints_handler);

    submit_intent
        .or(submit_swap)
        .or(void_gift_card)
        .or(get_limits)
        .or(get_rates)
        .or(get_mints)
        .recover(handle_rejection)
}

/// Serves the API until shutdown is raised.
pub async fn run(
    server: Arc<TransactionServer>,
    address: SocketAddr,
    shutdown: ShutdownSignal,
) {
    let (_, serving) =
        warp::serve(routes(server)).bind_with_graceful_shutdown(address, async move {
            shutdown.raised().await;
        });
    serving.await;
}
