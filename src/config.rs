//! Configuration management for the HTLC relayer
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::hashlock::{ChainId, HashFunction};

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub relayer: RelayerConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub chains: BTreeMap<String, ChainConfig>,
    #[serde(default)]
    pub wallet: WalletConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    pub instance_id: String,
    pub sweep_interval_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub confirmation_timeout_secs: u64,
    pub health_check_interval_secs: u64,
    #[serde(default = "default_archive_after_secs")]
    pub archive_after_secs: u64,
    #[serde(default)]
    pub hash_function: HashFunction,
    #[serde(default)]
    pub shard_index: u64,
    #[serde(default = "default_shard_count")]
    pub shard_count: u64,
}

impl RelayerConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }
}

fn default_archive_after_secs() -> u64 {
    7 * 24 * 3600
}

fn default_shard_count() -> u64 {
    1
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub backend: StoreBackend,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: ChainId,
    pub name: String,
    pub rpc_urls: Vec<String>,
    /// HTLCFactory contracts whose `HTLCDeployed` events add HTLCs to the watch set
    #[serde(default)]
    pub factory_addresses: Vec<String>,
    /// HTLC contracts watched from startup
    #[serde(default)]
    pub htlc_addresses: Vec<String>,
    /// Depth after which an observed event is treated as final
    pub confirmation_blocks: Option<u64>,
    /// Confirmations awaited for our own unlock/refund transactions
    #[serde(default = "default_tx_confirmations")]
    pub tx_confirmations: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_block_range")]
    pub max_block_range: u64,
    #[serde(default)]
    pub start_block: u64,
    #[serde(default)]
    pub time_lock_kind: TimeLockKind,
    pub gas_price_strategy: GasPriceStrategy,
    pub max_gas_price_gwei: u64,
    pub enabled: bool,
}

impl ChainConfig {
    /// Configured depth, or the recommended default for this chain
    pub fn confirmation_depth(&self) -> u64 {
        self.confirmation_blocks
            .unwrap_or_else(|| crate::chain::finality::recommended_confirmations(self.chain_id))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_tx_confirmations() -> u64 {
    1
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_max_block_range() -> u64 {
    1000
}

/// How an HTLC's `timeLock` is interpreted
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TimeLockKind {
    Block,
    #[default]
    Timestamp,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    Legacy,
    Eip1559,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    #[serde(default = "default_private_key_env")]
    pub private_key_env: String,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            private_key_env: default_private_key_env(),
        }
    }
}

fn default_private_key_env() -> String {
    "RELAYER_PRIVATE_KEY".to_string()
}

impl Settings {
    /// Load settings from the file named by `HTLC_RELAYER_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("HTLC_RELAYER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    fn parse(raw: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(raw);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        let enabled = self.enabled_chains();
        if enabled.len() != 2 {
            anyhow::bail!(
                "Exactly two chains must be enabled, found {}",
                enabled.len()
            );
        }

        let ids: HashSet<ChainId> = enabled.iter().map(|(_, c)| c.chain_id).collect();
        if ids.len() != 2 {
            anyhow::bail!("Enabled chains must have distinct chain ids");
        }

        for (name, chain) in &enabled {
            if chain.rpc_urls.is_empty() {
                anyhow::bail!("Chain {} has no RPC URLs configured", name);
            }
            if chain.factory_addresses.is_empty() && chain.htlc_addresses.is_empty() {
                tracing::warn!("Chain {} watches no factory or HTLC contracts", name);
            }
        }

        if self.relayer.shard_count == 0 || self.relayer.shard_index >= self.relayer.shard_count {
            anyhow::bail!(
                "Invalid shard {}/{}",
                self.relayer.shard_index,
                self.relayer.shard_count
            );
        }

        if self.relayer.max_retries == 0 {
            anyhow::bail!("relayer.max_retries must be at least 1");
        }

        if self.database.backend == StoreBackend::Postgres && self.database.url.is_empty() {
            anyhow::bail!("database.url is required for the postgres backend");
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static regex");
    }

    ENV_VAR
        .replace_all(input, |cap: &regex::Captures| {
            env::var(&cap[1]).unwrap_or_default()
        })
        .into_owned()
}
