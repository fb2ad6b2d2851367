//! Configuration Management Module
//!
//! Loads and validates the orchestrator configuration from a TOML file.
//! Every tunable has a default so a minimal config file only needs the
//! chain endpoints and key material.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Main configuration structure for the orchestrator service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Service-level settings (bind address, shutdown grace period)
    #[serde(default)]
    pub service: ServiceConfig,
    /// Chain connection settings
    #[serde(default)]
    pub chain: ChainConfig,
    /// Core mint settings
    #[serde(default)]
    pub mint: MintConfig,
    /// Virtual machine registry: mint address -> VM environment
    #[serde(default)]
    pub vm: VmRegistryConfig,
    /// Subsidizer key material
    #[serde(default)]
    pub subsidizer: SubsidizerConfig,
    /// Anti-spam and AML guard settings
    #[serde(default)]
    pub guards: GuardConfig,
    /// Contextual scheduler settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Nonce pool and allocator settings
    #[serde(default)]
    pub nonce: NonceConfig,
    /// Worker loop settings
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Swap lifecycle settings
    #[serde(default)]
    pub swap: SwapConfig,
    /// Gift card settings
    #[serde(default)]
    pub gift_card: GiftCardConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Address the HTTP API binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Grace period for in-flight work during shutdown, in seconds
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// RPC endpoint URL for chain communication
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
    /// Account-update plugin endpoint (empty disables the subscription and
    /// leaves only the backup polling path)
    #[serde(default)]
    pub update_stream_endpoint: String,
    /// Access token for the account-update plugin
    #[serde(default)]
    pub update_stream_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MintConfig {
    /// Core mint public key (base58)
    #[serde(default)]
    pub core_mint: String,
    /// Quarks per whole unit of the core mint
    #[serde(default = "default_quarks_per_unit")]
    pub quarks_per_unit: u64,
    /// Core mint decimals
    #[serde(default = "default_mint_decimals")]
    pub decimals: u8,
    /// Display name
    #[serde(default = "default_mint_name")]
    pub name: String,
    /// Display symbol
    #[serde(default = "default_mint_symbol")]
    pub symbol: String,
}

/// One VM environment entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmEntryConfig {
    /// VM program account (base58)
    pub vm_account: String,
    /// VM omnibus token account (base58)
    pub omnibus_account: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmRegistryConfig {
    /// VM program id that owns derived timelock accounts (base58)
    #[serde(default)]
    pub program_id: String,
    /// Map of mint address -> VM environment
    #[serde(default)]
    pub environments: HashMap<String, VmEntryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubsidizerConfig {
    /// Path to a file containing the subsidizer private key (base58, 64 bytes)
    #[serde(default)]
    pub key_path: String,
    /// Minimum balance, in lamports, the subsidizer must hold before the
    /// scheduler will submit fulfillments
    #[serde(default = "default_min_subsidizer_balance")]
    pub min_balance: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Enables the anti-spam guard
    #[serde(default = "default_true")]
    pub antispam_enabled: bool,
    /// Enables the AML guard
    #[serde(default = "default_true")]
    pub aml_enabled: bool,
    /// Maximum intents a single owner may submit per hour
    #[serde(default = "default_max_intents_per_hour")]
    pub max_intents_per_hour: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Manually disables all fulfillment scheduling
    #[serde(default)]
    pub disable_transaction_scheduling: bool,
    /// Global circuit breaker threshold on total failed fulfillments
    #[serde(default = "default_max_global_failed_fulfillments")]
    pub max_global_failed_fulfillments: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonceConfig {
    /// Base58 prefix ground into nonce account owner keys
    #[serde(default = "default_nonce_pubkey_prefix")]
    pub pubkey_prefix: String,
    /// Target pool size for on-demand transaction nonces
    #[serde(default = "default_nonce_pool_size")]
    pub on_demand_transaction_pool_size: u64,
    /// Target pool size for client swap nonces
    #[serde(default = "default_nonce_pool_size")]
    pub client_swap_pool_size: u64,
    /// Target pool size for client intent nonces (virtual durable nonces)
    #[serde(default = "default_nonce_pool_size")]
    pub client_intent_pool_size: u64,
    /// Safety limit on invalid nonces before the allocator halts
    #[serde(default = "default_max_invalid_nonces")]
    pub max_invalid_nonces: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Sleep between worker loop iterations, in milliseconds
    #[serde(default = "default_worker_interval_ms")]
    pub interval_ms: u64,
    /// Maximum records processed per loop iteration
    #[serde(default = "default_worker_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapConfig {
    /// How long a created swap may wait for its funding intent, in seconds
    #[serde(default = "default_client_timeout_to_fund_secs")]
    pub client_timeout_to_fund_secs: u64,
    /// How long a funded swap may wait for the client to swap, in seconds
    #[serde(default = "default_client_timeout_to_swap_secs")]
    pub client_timeout_to_swap_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GiftCardConfig {
    /// Age after which an unclaimed gift card is auto-returned, in seconds
    #[serde(default = "default_gift_card_expiry_secs")]
    pub expiry_secs: u64,
}

fn default_bind_address() -> String {
    "127.0.0.1:8085".to_string()
}
fn default_shutdown_grace_secs() -> u64 {
    25
}
fn default_rpc_url() -> String {
    "http://127.0.0.1:8899".to_string()
}
fn default_quarks_per_unit() -> u64 {
    1_000_000
}
fn default_mint_decimals() -> u8 {
    6
}
fn default_mint_name() -> String {
    "USDO".to_string()
}
fn default_mint_symbol() -> String {
    "USDO".to_string()
}
fn default_min_subsidizer_balance() -> u64 {
    // Covers rent for a nonce account plus fees for a healthy batch of
    // transactions. Empirically derived.
    50_000_000
}
fn default_true() -> bool {
    true
}
fn default_max_intents_per_hour() -> u64 {
    250
}
fn default_max_global_failed_fulfillments() -> u64 {
    10
}
fn default_nonce_pubkey_prefix() -> String {
    "non".to_string()
}
fn default_nonce_pool_size() -> u64 {
    1000
}
fn default_max_invalid_nonces() -> u64 {
    100
}
fn default_worker_interval_ms() -> u64 {
    1000
}
fn default_worker_batch_size() -> usize {
    100
}
fn default_client_timeout_to_fund_secs() -> u64 {
    300
}
fn default_client_timeout_to_swap_secs() -> u64 {
    60
}
fn default_gift_card_expiry_secs() -> u64 {
    // 24 hours
    86_400
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: default_rpc_url(),
            update_stream_endpoint: String::new(),
            update_stream_token: String::new(),
        }
    }
}

impl Default for MintConfig {
    fn default() -> Self {
        Self {
            core_mint: String::new(),
            quarks_per_unit: default_quarks_per_unit(),
            decimals: default_mint_decimals(),
            name: default_mint_name(),
            symbol: default_mint_symbol(),
        }
    }
}

impl Default for SubsidizerConfig {
    fn default() -> Self {
        Self {
            key_path: String::new(),
            min_balance: default_min_subsidizer_balance(),
        }
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            antispam_enabled: true,
            aml_enabled: true,
            max_intents_per_hour: default_max_intents_per_hour(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            disable_transaction_scheduling: false,
            max_global_failed_fulfillments: default_max_global_failed_fulfillments(),
        }
    }
}

impl Default for NonceConfig {
    fn default() -> Self {
        Self {
            pubkey_prefix: default_nonce_pubkey_prefix(),
            on_demand_transaction_pool_size: default_nonce_pool_size(),
            client_swap_pool_size: default_nonce_pool_size(),
            client_intent_pool_size: default_nonce_pool_size(),
            max_invalid_nonces: default_max_invalid_nonces(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_worker_interval_ms(),
            batch_size: default_worker_batch_size(),
        }
    }
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            client_timeout_to_fund_secs: default_client_timeout_to_fund_secs(),
            client_timeout_to_swap_secs: default_client_timeout_to_swap_secs(),
        }
    }
}

impl Default for GiftCardConfig {
    fn default() -> Self {
        Self {
            expiry_secs: default_gift_card_expiry_secs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            chain: ChainConfig::default(),
            mint: MintConfig::default(),
            vm: VmRegistryConfig::default(),
            subsidizer: SubsidizerConfig::default(),
            guards: GuardConfig::default(),
            scheduler: SchedulerConfig::default(),
            nonce: NonceConfig::default(),
            worker: WorkerConfig::default(),
            swap: SwapConfig::default(),
            gift_card: GiftCardConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from a TOML file.
    ///
    /// Uses the provided path, or the `ORCHESTRATOR_CONFIG_PATH` environment
    /// variable, or `config/orchestrator.toml`.
    pub fn load_from_path(path: Option<&str>) -> anyhow::Result<Self> {
        let config_path = path
            .map(|p| p.to_string())
            .or_else(|| std::env::var("ORCHESTRATOR_CONFIG_PATH").ok())
            .unwrap_or_else(|| "config/orchestrator.toml".to_string());

        if !std::path::Path::new(&config_path).exists() {
            anyhow::bail!(
                "configuration file not found at {}; copy the template and fill in chain endpoints",
                config_path
            );
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates cross-field constraints that serde defaults can't express.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mint.core_mint.is_empty() {
            anyhow::bail!("mint.core_mint is required");
        }
        if self.vm.program_id.is_empty() {
            anyhow::bail!("vm.program_id is required");
        }
        if !self.vm.environments.contains_key(&self.mint.core_mint) {
            anyhow::bail!("vm.environments must contain an entry for the core mint");
        }
        if self.nonce.pubkey_prefix.len() > 4 {
            anyhow::bail!("nonce.pubkey_prefix longer than 4 characters makes grinding impractical");
        }
        Ok(())
    }

    pub fn worker_interval(&self) -> Duration {
        Duration::from_millis(self.worker.interval_ms)
    }

    pub fn gift_card_expiry(&self) -> Duration {
        Duration::from_secs(self.gift_card.expiry_secs)
    }

    pub fn client_timeout_to_fund(&self) -> Duration {
        Duration::from_secs(self.swap.client_timeout_to_fund_secs)
    }

    pub fn client_timeout_to_swap(&self) -> Duration {
        Duration::from_secs(self.swap.client_timeout_to_swap_secs)
    }
}
