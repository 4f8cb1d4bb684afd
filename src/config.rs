//! Configuration management for the fan simulator
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::tx::CrazedLevel;

use anyhow::{Context, Result};
use ethers::signers::LocalWallet;
use ethers::types::U256;
use ethers::utils::parse_ether;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub chain: ChainConfig,
    pub funding: FundingConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub rpc_urls: Vec<String>,
    pub ws_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FundingConfig {
    /// Hex private key of the account that funds every fan
    pub private_key: String,
    /// Amount sent to each fan before it starts
    pub initial_amount_eth: f64,
    /// Amount sent to a fan that runs dry; refunds are off when unset
    pub top_up_amount_eth: Option<f64>,
    #[serde(default = "default_confirmation_timeout")]
    pub confirmation_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub fan_count: usize,
    pub crazed_level: String,
    pub run_for_secs: Option<u64>,
    pub run_for_blocks: Option<u64>,
    pub resubscribe_delay_ms: u64,
    pub confirmation_poll_ms: u64,
    pub history_capacity: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            fan_count: 10,
            crazed_level: "Mixed".to_string(),
            run_for_secs: None,
            run_for_blocks: None,
            resubscribe_delay_ms: 1_000,
            confirmation_poll_ms: 250,
            history_capacity: 1_024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

fn default_confirmation_timeout() -> u64 {
    120
}

/// How long fans stay active once started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Until the process is told to shut down
    Indefinite,
    Duration(Duration),
    Blocks(u64),
}

impl Settings {
    /// Load settings from the file named by `CRAZED_FANS_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("CRAZED_FANS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.chain.rpc_urls.is_empty() {
            anyhow::bail!("Chain {} has no RPC URLs configured", self.chain.chain_id);
        }
        if self.chain.ws_url.trim().is_empty() {
            anyhow::bail!("A WebSocket URL is required for head subscriptions");
        }
        if self.simulation.fan_count == 0 {
            anyhow::bail!("fan_count must be at least 1");
        }
        if self.simulation.run_for_secs.is_some() && self.simulation.run_for_blocks.is_some() {
            anyhow::bail!("run_for_secs and run_for_blocks are mutually exclusive");
        }
        self.funding_signer()?;
        self.initial_amount()?;
        self.top_up_amount()?;

        Ok(())
    }

    /// Configured crazed level, falling back to `Mixed` when unrecognised
    pub fn crazed_level(&self) -> CrazedLevel {
        match self.simulation.crazed_level.parse() {
            Ok(level) => level,
            Err(e) => {
                tracing::warn!("{}, using Mixed", e);
                CrazedLevel::Mixed
            }
        }
    }

    pub fn run_mode(&self) -> RunMode {
        match (self.simulation.run_for_secs, self.simulation.run_for_blocks) {
            (Some(secs), _) => RunMode::Duration(Duration::from_secs(secs)),
            (None, Some(blocks)) => RunMode::Blocks(blocks),
            (None, None) => RunMode::Indefinite,
        }
    }

    /// Signing key of the funding account
    pub fn funding_signer(&self) -> Result<LocalWallet> {
        self.funding
            .private_key
            .trim()
            .trim_start_matches("0x")
            .parse::<LocalWallet>()
            .map_err(|e| anyhow::anyhow!("Invalid funding private key: {}", e))
    }

    /// Initial funding per fan, in wei
    pub fn initial_amount(&self) -> Result<U256> {
        eth_to_wei(self.funding.initial_amount_eth)
    }

    /// Refund amount per fan, in wei
    pub fn top_up_amount(&self) -> Result<Option<U256>> {
        self.funding.top_up_amount_eth.map(eth_to_wei).transpose()
    }
}

fn eth_to_wei(amount: f64) -> Result<U256> {
    if !amount.is_finite() || amount < 0.0 {
        anyhow::bail!("Invalid ETH amount: {}", amount);
    }
    parse_ether(amount).with_context(|| format!("Invalid ETH amount: {}", amount))
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = match regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}") {
        Ok(re) => re,
        Err(_) => return result,
    };

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
