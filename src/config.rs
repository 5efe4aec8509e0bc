//! Configuration management
//!
//! Loads configuration from TOML files with environment variable substitution.
//! Per-network behavior (confirmations, timeouts, gas bounds, escalation
//! factors) is data in `NetworkProfile`, so supporting a new chain is a config
//! edit, not a code change.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub broadcaster: BroadcasterConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub wallet: WalletConfig,
    pub networks: HashMap<String, NetworkProfile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BroadcasterConfig {
    pub instance_id: String,

    // Queue
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub priority_enabled: bool,

    // Dispatch
    pub dispatch_interval_ms: u64,
    pub max_concurrent: usize,
    pub default_mode: StrategyMode,
    pub fanout: usize,
    pub quorum_size: usize,
    pub coordination_timeout_ms: u64,

    // Per-attempt behavior
    pub attempt_timeout_secs: u64,
    pub max_provider_attempts: u32,
    pub retry_delay_ms: u64,
    pub max_retries: u32,

    // Monitoring
    pub monitor_interval_ms: u64,
    pub monitor_batch_size: usize,
    pub history_capacity: usize,

    // Provider health
    pub probe_interval_secs: u64,
    pub failure_threshold: u32,
    pub recovery_threshold: u32,
    pub rate_limit_per_sec: f64,
    pub rate_limit_burst: f64,
}

/// What to do when the queue is full
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    Reject,
    DropOldest,
    DropNewest,
}

/// Broadcast coordination mode over the selected provider set
#[derive(Debug, Clone, Copy, Deserialize, serde::Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StrategyMode {
    Single,
    Failover,
    Parallel,
    Racing,
    Quorum,
    Consensus,
}

impl StrategyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyMode::Single => "single",
            StrategyMode::Failover => "failover",
            StrategyMode::Parallel => "parallel",
            StrategyMode::Racing => "racing",
            StrategyMode::Quorum => "quorum",
            StrategyMode::Consensus => "consensus",
        }
    }

    /// Fan-out modes submit to several providers at once
    pub fn is_fanout(&self) -> bool {
        !matches!(self, StrategyMode::Single | StrategyMode::Failover)
    }
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
pub struct WalletConfig {
    pub private_key_env: Option<String>,
}

/// Static per-chain profile: everything the strategies and the monitor need
/// to know about a network is looked up here.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkProfile {
    pub chain_id: u64,
    pub name: String,
    pub providers: Vec<ProviderConfig>,
    pub required_confirmations: u64,
    /// Confirmation window before a pending broadcast is timed out
    pub timeout_secs: u64,
    pub min_gas_price_gwei: u64,
    pub max_gas_price_gwei: u64,
    /// Gas price multiplier applied on each underpriced retry, in percent
    /// (e.g. 125 = +25% per escalation)
    pub gas_inflation_percent: u64,
    /// Safety buffer applied on top of network-reported fees, in percent
    pub fee_safety_percent: u64,
    pub eip1559: bool,
    pub block_time_ms: u64,
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub tier: u8,
}

fn default_weight() -> u32 {
    1
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("BROADCASTD_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &PathBuf) -> Result<Self> {
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
        if self.enabled_networks().is_empty() {
            anyhow::bail!("At least one network must be enabled");
        }

        for (name, network) in &self.networks {
            if !network.enabled {
                continue;
            }
            if network.providers.is_empty() {
                anyhow::bail!("Network {} has no providers configured", name);
            }
            if network.max_gas_price_gwei < network.min_gas_price_gwei {
                anyhow::bail!("Network {} has max gas price below min", name);
            }
            if network.gas_inflation_percent <= 100 {
                anyhow::bail!(
                    "Network {} gas_inflation_percent must be > 100 to escalate",
                    name
                );
            }
        }

        let b = &self.broadcaster;
        if b.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be > 0");
        }
        if b.quorum_size == 0 || b.quorum_size > b.fanout {
            anyhow::bail!("quorum_size must be in 1..=fanout");
        }

        Ok(())
    }

    /// Get list of enabled networks
    pub fn enabled_networks(&self) -> Vec<(&String, &NetworkProfile)> {
        self.networks.iter().filter(|(_, n)| n.enabled).collect()
    }

    /// Get network profile by chain ID
    pub fn network_by_chain_id(&self, chain_id: u64) -> Option<&NetworkProfile> {
        self.networks
            .values()
            .find(|n| n.chain_id == chain_id && n.enabled)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
