pub mod snapshot;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use snapshot::DashboardSnapshot;

/// Lifecycle state of the managed validator process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Stopped,
    Starting,
    Syncing,
    Running,
    Stopping,
    Error,
}

impl NodeStatus {
    /// True while a child process is (or should be) alive.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Syncing | Self::Running)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Syncing => "syncing",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Lifecycle state of the anonymizing-proxy hidden service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Idle,
    Bootstrapping,
    Ready,
    Failed,
}

/// Stages of the first-time setup flow. Linear, with a single backward
/// transition (Confirm -> Import). Monitoring is a read-only terminal
/// stage entered instead of Launching for a pre-existing bootstrap
/// identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStage {
    NetworkChoice,
    Import,
    Confirm,
    Launching,
    Done,
    Monitoring,
}

/// The address a validator publishes to the rest of the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AdvertisedAddress {
    /// Hidden-service address, e.g. "abc123xyz.onion".
    Onion(String),
    /// Clear-transport address, "host:port".
    Host(String),
}

impl AdvertisedAddress {
    pub fn is_onion(&self) -> bool {
        matches!(self, Self::Onion(_))
    }
}

impl fmt::Display for AdvertisedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Onion(a) | Self::Host(a) => f.write_str(a),
        }
    }
}

/// How the node reaches the outside world.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TransportChoice {
    /// All traffic through the anonymizing proxy; the advertised address
    /// is a hidden service created at launch.
    Anonymized,
    /// Direct TCP with a user-supplied reachable "host:port".
    Clear { host: String },
}

/// Who this validator is, decided once during import and consumed once
/// at the top of the setup sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidatorIdentity {
    /// A new identity that gets its own process and registration.
    Fresh { address: String, public_key: String },
    /// An identity already live as a bootstrap node elsewhere. Never
    /// spawn a process or hidden service for it, only observe.
    PreexistingBootstrap { address: String },
}

impl ValidatorIdentity {
    pub fn address(&self) -> &str {
        match self {
            Self::Fresh { address, .. } | Self::PreexistingBootstrap { address } => address,
        }
    }
}

/// User choices persisted by the settings collaborator between runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupProfile {
    pub network: String,
    pub transport: TransportChoice,
    pub address: Option<String>,
    pub advertised: Option<AdvertisedAddress>,
}

/// Which registry a registration write is aimed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationTarget {
    Local,
    Bootstrap,
}

impl fmt::Display for RegistrationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Bootstrap => f.write_str("bootstrap"),
        }
    }
}

/// Result of one best-effort registration attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// The target already knew the address; no write was issued.
    AlreadyRegistered,
    /// A signed write was issued and acknowledged.
    Registered,
    /// The attempt was not made (prior attempt still in flight, or no
    /// reachable target URL).
    Skipped(String),
    /// The attempt was made and failed; retried on a later cycle.
    Failed(String),
}

/// One signed announce payload. Immutable once constructed; the
/// timestamp is part of the signed message, so every attempt signs a
/// fresh record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationRecord {
    pub address: String,
    pub public_key: String,
    pub signature: String,
    pub timestamp: u64,
    pub advertised_address: Option<String>,
}

/// Epoch countdown shown by the dashboard. Ticks down locally between
/// polls; the server value is authoritative only when strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EpochCountdown {
    pub remaining_secs: u64,
    pub epoch_duration_secs: u64,
    pub stale_ticks: u32,
}

/// Tuning knobs inherited from field observation of the live network.
/// Kept configurable rather than hard-coded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Tuning {
    pub poll_interval_secs: u64,
    pub stale_tick_threshold: u32,
    pub countdown_warn_secs: u64,
    pub countdown_critical_secs: u64,
    pub readiness_grace_secs: u64,
    pub start_timeout_secs: u64,
    pub proxy_bootstrap_timeout_secs: u64,
    pub balance_probe_timeout_secs: u64,
    pub log_ring_capacity: usize,
    pub p2p_port_offset: u16,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            poll_interval_secs: 15,
            stale_tick_threshold: 15,
            countdown_warn_secs: 60,
            countdown_critical_secs: 30,
            readiness_grace_secs: 20,
            start_timeout_secs: 90,
            proxy_bootstrap_timeout_secs: 120,
            balance_probe_timeout_secs: 5,
            log_ring_capacity: 500,
            p2p_port_offset: 1000,
        }
    }
}

/// Signing capability, provided by the wallet collaborator. The
/// orchestrator never sees key material.
#[async_trait]
pub trait Signer: Send + Sync {
    fn address(&self) -> String;
    fn public_key_hex(&self) -> String;
    async fn sign(&self, message: &[u8]) -> anyhow::Result<Vec<u8>>;
}

/// Read/write access to a target's known-validator set.
#[async_trait]
pub trait ValidatorRegistry: Send + Sync {
    async fn is_registered(&self, base_url: &str, address: &str) -> anyhow::Result<bool>;
    async fn register(&self, base_url: &str, record: &RegistrationRecord) -> anyhow::Result<()>;
    async fn unregister(&self, base_url: &str, record: &RegistrationRecord) -> anyhow::Result<()>;
}

/// Produces the composite network snapshot for one poll cycle.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_snapshot(&self) -> anyhow::Result<DashboardSnapshot>;
}

/// Active liveness probe against a local API port, used when the log
/// marker heuristic stays silent.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn is_healthy(&self, api_port: u16) -> bool;
}

/// Network-wide identity questions answered by the bootstrap peers.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    async fn is_bootstrap_identity(&self, address: &str) -> anyhow::Result<bool>;
    async fn balance_cil(&self, address: &str) -> anyhow::Result<u64>;
}

/// Hidden-service transport lifecycle, as seen by the orchestrator.
#[async_trait]
pub trait TransportProvider: Send + Sync {
    /// Returns the published address, or None when the proxy daemon is
    /// unreachable or bootstrap timed out. Callers decide whether that
    /// is fatal.
    async fn start_hidden_service(
        &self,
        api_port: u16,
        p2p_port: u16,
    ) -> anyhow::Result<Option<String>>;
    async fn stop(&self);
    fn socks_endpoint(&self) -> Option<String>;
}

/// Persistent settings storage collaborator.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn load_profile(&self) -> anyhow::Result<Option<SetupProfile>>;
    async fn save_profile(&self, profile: &SetupProfile) -> anyhow::Result<()>;
}
