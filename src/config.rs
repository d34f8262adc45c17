//! Configuration management for VaultChain

use crate::error::ChainError;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::fs;
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub consensus: ConsensusConfig,
    #[serde(default)]
    pub gas: GasConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub chain: ChainConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    Pow,
    Pos,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsensusConfig {
    #[serde(default = "default_algorithm")]
    pub algorithm: Algorithm,
    /// Required leading zero hex digits (PoW)
    #[serde(default = "default_difficulty")]
    pub difficulty: usize,
    /// Minimum staking-currency balance to be eligible as a validator (PoS)
    #[serde(default = "default_min_stake")]
    pub min_stake: Decimal,
    #[serde(default = "default_staking_currency")]
    pub staking_currency: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GasConfig {
    #[serde(default = "default_gas_currency")]
    pub gas_currency: String,
    #[serde(default = "default_base_price")]
    pub base_price: Decimal,
    #[serde(default = "default_min_base_price")]
    pub min_base_price: Decimal,
    #[serde(default = "default_max_base_price")]
    pub max_base_price: Decimal,
    /// Number of most recent blocks sampled by the congestion controller
    #[serde(default = "default_congestion_window")]
    pub congestion_window: usize,
    #[serde(default = "default_target_gas_per_block")]
    pub target_gas_per_block: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// Re-derive hashes and linkage of stored blocks on startup
    #[serde(default = "default_verify_on_load")]
    pub verify_on_load: bool,
    #[serde(default = "default_reward_currency")]
    pub reward_currency: String,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            difficulty: default_difficulty(),
            min_stake: default_min_stake(),
            staking_currency: default_staking_currency(),
        }
    }
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            gas_currency: default_gas_currency(),
            base_price: default_base_price(),
            min_base_price: default_min_base_price(),
            max_base_price: default_max_base_price(),
            congestion_window: default_congestion_window(),
            target_gas_per_block: default_target_gas_per_block(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            verify_on_load: default_verify_on_load(),
            reward_currency: default_reward_currency(),
        }
    }
}

impl Config {
    pub fn from_toml_str(source: &str) -> Result<Self, ChainError> {
        let config: Config = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ChainError> {
        if self.database.path.is_empty() {
            return Err(ChainError::ConfigError("database.path must be set".to_string()));
        }
        if self.consensus.algorithm == Algorithm::Pow && self.consensus.difficulty > 64 {
            return Err(ChainError::ConfigError(format!(
                "consensus.difficulty {} exceeds the 64 hex digits of a SHA-256 hash",
                self.consensus.difficulty
            )));
        }
        if self.consensus.min_stake.is_sign_negative() {
            return Err(ChainError::ConfigError(
                "consensus.min_stake cannot be negative".to_string(),
            ));
        }
        if self.gas.base_price <= Decimal::ZERO || self.gas.min_base_price <= Decimal::ZERO {
            return Err(ChainError::ConfigError("gas prices must be positive".to_string()));
        }
        if self.gas.min_base_price > self.gas.max_base_price {
            return Err(ChainError::ConfigError(
                "gas.min_base_price must not exceed gas.max_base_price".to_string(),
            ));
        }
        if self.gas.congestion_window == 0 {
            return Err(ChainError::ConfigError(
                "gas.congestion_window must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Loads `config.toml` from the working directory, falling back to defaults when it is absent.
pub fn load_config() -> Result<Config, ChainError> {
    load_config_from(DEFAULT_CONFIG_PATH)
}

pub fn load_config_from(path: impl AsRef<Path>) -> Result<Config, ChainError> {
    let config_str = fs::read_to_string(path).unwrap_or_default();
    if config_str.trim().is_empty() {
        let config = Config::default();
        config.validate()?;
        return Ok(config);
    }
    Config::from_toml_str(&config_str)
}

fn default_algorithm() -> Algorithm {
    Algorithm::Pow
}

fn default_difficulty() -> usize {
    2
}

fn default_min_stake() -> Decimal {
    Decimal::new(100, 0)
}

fn default_staking_currency() -> String {
    "STAKE".to_string()
}

fn default_gas_currency() -> String {
    "GAS".to_string()
}

fn default_base_price() -> Decimal {
    Decimal::new(1, 6)
}

fn default_min_base_price() -> Decimal {
    Decimal::new(1, 9)
}

fn default_max_base_price() -> Decimal {
    Decimal::ONE
}

fn default_congestion_window() -> usize {
    10
}

fn default_target_gas_per_block() -> u64 {
    42_000
}

fn default_db_path() -> String {
    "./data/vaultchain.db".to_string()
}

fn default_verify_on_load() -> bool {
    true
}

fn default_reward_currency() -> String {
    "STAKE".to_string()
}
