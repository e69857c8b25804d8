//! Configuration module for the off-chain node
//!
//! This module handles configuration loading from TOML files, `.env` files
//! and environment variable overrides, and provides structured configuration
//! types. Validation failures are fatal at startup.

use crate::submission::RetryConfig;
use crate::types::{Role, TopicId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const ENV_NODE_RPC: &str = "OFFCHAIN_NODE_RPC";
pub const ENV_KEY_NAME: &str = "OFFCHAIN_KEY_NAME";
pub const ENV_KEYRING_DIR: &str = "OFFCHAIN_KEYRING_DIR";
pub const ENV_SUBMIT_TX: &str = "OFFCHAIN_SUBMIT_TX";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub wallet: WalletConfig,

    #[serde(default)]
    pub worker: Vec<WorkerConfig>,

    #[serde(default)]
    pub reputer: Vec<ReputerConfig>,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WalletConfig {
    /// Key in the keystore the node signs with
    pub address_key_name: String,

    /// Directory holding key files
    #[serde(default = "default_keyring_dir")]
    pub keyring_dir: String,

    #[serde(default = "default_address_prefix")]
    pub address_prefix: String,

    /// Chain REST gateway
    pub node_rpc: String,

    /// Signing gateway used to build and broadcast transactions
    #[serde(default)]
    pub tx_gateway: Option<String>,

    #[serde(default = "default_emissions_version")]
    pub emissions_version: String,

    /// Fee per gas unit, 0 for no fees
    #[serde(default)]
    pub gas_prices: f64,

    #[serde(default = "default_max_fees")]
    pub max_fees: u64,

    #[serde(default = "default_fee_denom")]
    pub fee_denom: String,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Seconds between regular retries, also the backoff base
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,

    #[serde(default = "default_account_sequence_retry_delay")]
    pub account_sequence_retry_delay: u64,

    /// Set to false for a dry run that logs payloads without submitting
    #[serde(default = "default_true")]
    pub submit_tx: bool,

    /// Deadline for every chain and adapter call
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    pub topic_id: TopicId,

    #[serde(default)]
    pub inference_entrypoint: Option<String>,

    #[serde(default)]
    pub forecast_entrypoint: Option<String>,

    /// Seconds between nonce polls
    #[serde(default = "default_loop_seconds")]
    pub loop_seconds: u64,

    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReputerConfig {
    pub topic_id: TopicId,

    pub ground_truth_entrypoint: String,

    pub loss_function_entrypoint: String,

    /// Minimum stake required before reputing; 0 accepts whatever is staked
    #[serde(default)]
    pub min_stake: u64,

    #[serde(default = "default_loop_seconds")]
    pub loop_seconds: u64,

    #[serde(default)]
    pub ground_truth_parameters: HashMap<String, String>,

    #[serde(default)]
    pub loss_function_parameters: LossFunctionParameters,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LossFunctionParameters {
    #[serde(default)]
    pub loss_function_service: String,

    #[serde(default)]
    pub loss_method_options: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            port: default_metrics_port(),
        }
    }
}

// Default value functions
fn default_keyring_dir() -> String { "keys".to_string() }
fn default_address_prefix() -> String { "allo".to_string() }
fn default_emissions_version() -> String { "v2".to_string() }
fn default_max_fees() -> u64 { 500_000 }
fn default_fee_denom() -> String { "uallo".to_string() }
fn default_max_retries() -> u32 { 5 }
fn default_retry_delay() -> u64 { 3 }
fn default_account_sequence_retry_delay() -> u64 { 5 }
fn default_request_timeout() -> u64 { 30 }
fn default_loop_seconds() -> u64 { 10 }
fn default_metrics_port() -> u16 { 9090 }
fn default_true() -> bool { true }

impl Config {
    /// Parse a TOML document
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load configuration from TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&content)
    }

    /// Load `.env`, the TOML file, environment overrides, then validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let mut config = Self::from_file(path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from `lookup` (the process environment in production)
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(rpc) = lookup(ENV_NODE_RPC) {
            self.wallet.node_rpc = rpc;
        }
        if let Some(key) = lookup(ENV_KEY_NAME) {
            self.wallet.address_key_name = key;
        }
        if let Some(dir) = lookup(ENV_KEYRING_DIR) {
            self.wallet.keyring_dir = dir;
        }
        if let Some(submit) = lookup(ENV_SUBMIT_TX) {
            match submit.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => self.wallet.submit_tx = true,
                "0" | "false" | "no" => self.wallet.submit_tx = false,
                other => tracing::warn!(value = other, "ignoring unrecognized {}", ENV_SUBMIT_TX),
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let wallet = &self.wallet;
        if wallet.address_key_name.trim().is_empty() {
            return Err(ConfigError::Invalid("wallet.address_key_name is empty".into()));
        }
        if wallet.node_rpc.trim().is_empty() {
            return Err(ConfigError::Invalid("wallet.node_rpc is empty".into()));
        }
        if !wallet.gas_prices.is_finite() || wallet.gas_prices < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "wallet.gas_prices must be a non-negative number, got {}",
                wallet.gas_prices
            )));
        }
        if wallet.gas_prices > 0.0 && wallet.max_fees == 0 {
            return Err(ConfigError::Invalid(
                "wallet.max_fees must be positive when gas_prices is set".into(),
            ));
        }
        if wallet.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("wallet.request_timeout_secs must be positive".into()));
        }
        if self.worker.is_empty() && self.reputer.is_empty() {
            return Err(ConfigError::Invalid("no [[worker]] or [[reputer]] configured".into()));
        }

        for worker in &self.worker {
            if worker.inference_entrypoint.is_none() && worker.forecast_entrypoint.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "worker on topic {} has neither inference_entrypoint nor forecast_entrypoint",
                    worker.topic_id
                )));
            }
            check_loop_seconds(worker.loop_seconds, worker.topic_id, Role::Worker)?;
        }

        for reputer in &self.reputer {
            if reputer.ground_truth_entrypoint.trim().is_empty()
                || reputer.loss_function_entrypoint.trim().is_empty()
            {
                return Err(ConfigError::Invalid(format!(
                    "reputer on topic {} needs ground_truth_entrypoint and loss_function_entrypoint",
                    reputer.topic_id
                )));
            }
            check_loop_seconds(reputer.loop_seconds, reputer.topic_id, Role::Reputer)?;
        }

        Ok(())
    }

    /// Submission parameters derived from the wallet section
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.wallet.max_retries,
            retry_delay: self.wallet.retry_delay,
            account_sequence_retry_delay: self.wallet.account_sequence_retry_delay,
            gas_prices: self.wallet.gas_prices,
            max_fees: self.wallet.max_fees,
            fee_denom: self.wallet.fee_denom.clone(),
            call_timeout: self.request_timeout(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.wallet.request_timeout_secs)
    }
}

fn check_loop_seconds(loop_seconds: u64, topic_id: TopicId, role: Role) -> Result<(), ConfigError> {
    if loop_seconds == 0 {
        return Err(ConfigError::Invalid(format!(
            "{} on topic {} has loop_seconds = 0",
            role, topic_id
        )));
    }
    Ok(())
}
