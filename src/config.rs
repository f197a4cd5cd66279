//! Service configuration.
//!
//! The engine service is configured by a YAML file addressed through
//! `CONFIG_PATH`. Keys are PascalCase, matching the deployed configuration
//! files. Paymaster settings can be overridden from the environment; they are
//! passthrough-only and never interpreted here.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const CONFIG_PATH_ENV: &str = "CONFIG_PATH";
pub const DATA_DIR_ENV: &str = "INDEXER_DATA_DIR";
const DEFAULT_CONFIG_PATH: &str = "configs/config.yaml";
pub const DEFAULT_DATA_DIR: &str = "./indexer_db";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RpcConfig {
    pub host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub allow_origins: Vec<String>,
    pub allow_methods: Vec<String>,
    pub allow_headers: Vec<String>,
    pub production: bool,
    pub admin: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8085,
            allow_origins: Vec::new(),
            allow_methods: Vec::new(),
            allow_headers: Vec::new(),
            production: false,
            admin: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct IndexerSettings {
    pub host: String,
    pub port: u16,
    /// Optional override of the subscription start block.
    pub start_at: Option<u64>,
}

impl Default for IndexerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            start_at: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PaymasterConfig {
    pub network: String,
    pub api_url: String,
    /// Passthrough credential; never echoed.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Config {
    pub rpc: RpcConfig,
    pub api: ApiConfig,
    pub indexer: IndexerSettings,
    pub paymaster: PaymasterConfig,
    pub modules: Vec<String>,
}

impl Config {
    /// Loads the configuration from `CONFIG_PATH` (or the default path) and
    /// applies environment overrides. Invalid YAML is fatal at startup.
    pub fn load() -> Result<Self> {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file {path}"))?;
        let mut config = Self::parse(&raw)?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn parse(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("invalid config YAML")
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(network) = std::env::var("PAYMASTER_NETWORK") {
            self.paymaster.network = network;
        }
        if let Ok(api_url) = std::env::var("PAYMASTER_API_URL") {
            self.paymaster.api_url = api_url;
        }
        if let Ok(api_key) = std::env::var("AVNU_PAYMASTER_API_KEY") {
            self.paymaster.api_key = Some(api_key);
        }
    }

    /// Storage root: `INDEXER_DATA_DIR` or the default local directory.
    pub fn data_dir() -> PathBuf {
        std::env::var(DATA_DIR_ENV)
            .unwrap_or_else(|_| DEFAULT_DATA_DIR.to_string())
            .into()
    }
}
