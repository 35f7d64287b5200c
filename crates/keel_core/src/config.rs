use anyhow::{Context, Result};
use async_trait::async_trait;
use keel_traits::{SettingsStore, SetupProfile, Tuning};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

fn default_threads() -> usize {
    num_cpus::get()
}

/// Mining flags forwarded to the node process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiningConfig {
    pub enabled: bool,
    #[serde(default = "default_threads")]
    pub threads: usize,
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threads: default_threads(),
        }
    }
}

/// Top-level application configuration, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: String,
    pub api_port: u16,
    pub data_dir: PathBuf,
    /// Validator node executable launched by the supervisor.
    pub node_binary: PathBuf,
    /// Wallet daemon that holds keys and signs on our behalf.
    pub wallet_url: String,
    /// Base URLs of the bootstrap peers, in preference order.
    pub bootstrap_peers: Vec<String>,
    pub recent_block_count: usize,
    pub mining: MiningConfig,
    pub tuning: Tuning,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: "mainnet".to_string(),
            api_port: 3030,
            data_dir: PathBuf::from("keel-data"),
            node_binary: PathBuf::from("keel-node"),
            wallet_url: "http://127.0.0.1:3050".to_string(),
            bootstrap_peers: Vec::new(),
            recent_block_count: 10,
            mining: MiningConfig::default(),
            tuning: Tuning::default(),
        }
    }
}

impl Config {
    /// The P2P port is always derived, never configured independently.
    pub fn p2p_port(&self) -> u16 {
        self.api_port + self.tuning.p2p_port_offset
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("cannot parse config {:?}", path))
    }

    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!("{:#}; using defaults", e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("cannot serialize config")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content).with_context(|| format!("cannot write config {:?}", path))
    }
}

/// Settings collaborator backed by a TOML file in the data directory.
pub struct TomlSettingsStore {
    path: PathBuf,
}

impl TomlSettingsStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl SettingsStore for TomlSettingsStore {
    async fn load_profile(&self) -> Result<Option<SetupProfile>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => {
                let profile = toml::from_str(&content)
                    .with_context(|| format!("corrupt profile {:?}", self.path))?;
                Ok(Some(profile))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("cannot read profile {:?}", self.path)),
        }
    }

    async fn save_profile(&self, profile: &SetupProfile) -> Result<()> {
        let content = toml::to_string_pretty(profile).context("cannot serialize profile")?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, content)
            .await
            .with_context(|| format!("cannot write profile {:?}", self.path))?;
        info!("setup profile saved to {:?}", self.path);
        Ok(())
    }
}
