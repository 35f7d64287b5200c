use crate::{EndpointSelector, NetError};
use async_trait::async_trait;
use keel_traits::snapshot::{
    BlockSummary, DashboardSnapshot, HealthInfo, NodeInfo, RewardInfo, ValidatorInfo,
};
use keel_traits::{HealthProbe, IdentityDirectory, RegistrationRecord, SnapshotSource, ValidatorRegistry};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Deserialize)]
struct ValidatorsEnvelope {
    validators: Vec<ValidatorInfo>,
}

#[derive(Deserialize)]
struct BlocksEnvelope {
    blocks: Vec<BlockSummary>,
}

#[derive(Deserialize)]
struct PeersEnvelope {
    peers: Vec<String>,
}

#[derive(Deserialize)]
struct BalanceEnvelope {
    balance_cil: u64,
}

#[derive(Deserialize)]
struct BootstrapIdentityEnvelope {
    bootstrap: bool,
}

/// Write acknowledgement envelope used by the node for mutations.
#[derive(Debug, Deserialize)]
struct WriteAck {
    status: String,
    #[serde(default)]
    msg: Option<String>,
}

impl WriteAck {
    fn into_result(self) -> Result<(), NetError> {
        match self.status.as_str() {
            "ok" | "registered" | "unregistered" => Ok(()),
            other => Err(NetError::Rejected(
                self.msg.unwrap_or_else(|| other.to_string()),
            )),
        }
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Typed consumer of the node REST surface. Stateless; every call names
/// its base URL, so the same client serves the local node and any
/// bootstrap peer.
#[derive(Clone)]
pub struct RestClient {
    client: reqwest::Client,
}

impl RestClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, NetError> {
        let resp = self.client.get(url).send().await?.error_for_status()?;
        Ok(resp.json().await?)
    }

    pub async fn node_info(&self, base: &str) -> Result<NodeInfo, NetError> {
        self.get_json(&join_url(base, "node-info")).await
    }

    pub async fn health(&self, base: &str) -> Result<HealthInfo, NetError> {
        self.get_json(&join_url(base, "health")).await
    }

    pub async fn validators(&self, base: &str) -> Result<Vec<ValidatorInfo>, NetError> {
        let env: ValidatorsEnvelope = self.get_json(&join_url(base, "validators")).await?;
        Ok(env.validators)
    }

    pub async fn recent_blocks(
        &self,
        base: &str,
        count: usize,
    ) -> Result<Vec<BlockSummary>, NetError> {
        let url = format!("{}?count={}", join_url(base, "blocks/recent"), count);
        let env: BlocksEnvelope = self.get_json(&url).await?;
        Ok(env.blocks)
    }

    pub async fn peers(&self, base: &str) -> Result<BTreeSet<String>, NetError> {
        let env: PeersEnvelope = self.get_json(&join_url(base, "peers")).await?;
        Ok(env.peers.into_iter().collect())
    }

    pub async fn epoch_info(&self, base: &str) -> Result<RewardInfo, NetError> {
        self.get_json(&join_url(base, "epoch-info")).await
    }

    pub async fn balance(&self, base: &str, address: &str) -> Result<u64, NetError> {
        let url = join_url(base, &format!("balance/{}", address));
        let env: BalanceEnvelope = self.get_json(&url).await?;
        Ok(env.balance_cil)
    }

    pub async fn bootstrap_identity(&self, base: &str, address: &str) -> Result<bool, NetError> {
        let url = join_url(base, &format!("bootstrap-identity/{}", address));
        let env: BootstrapIdentityEnvelope = self.get_json(&url).await?;
        Ok(env.bootstrap)
    }

    async fn post_record(
        &self,
        url: &str,
        record: &RegistrationRecord,
    ) -> Result<(), NetError> {
        let ack: WriteAck = self
            .client
            .post(url)
            .json(record)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        ack.into_result()
    }

    pub async fn register_validator(
        &self,
        base: &str,
        record: &RegistrationRecord,
    ) -> Result<(), NetError> {
        self.post_record(&join_url(base, "register-validator"), record)
            .await
    }

    pub async fn unregister_validator(
        &self,
        base: &str,
        record: &RegistrationRecord,
    ) -> Result<(), NetError> {
        self.post_record(&join_url(base, "unregister-validator"), record)
            .await
    }
}

#[async_trait]
impl ValidatorRegistry for RestClient {
    async fn is_registered(&self, base_url: &str, address: &str) -> anyhow::Result<bool> {
        let validators = self.validators(base_url).await?;
        Ok(validators.iter().any(|v| v.address == address))
    }

    async fn register(&self, base_url: &str, record: &RegistrationRecord) -> anyhow::Result<()> {
        self.register_validator(base_url, record).await?;
        Ok(())
    }

    async fn unregister(&self, base_url: &str, record: &RegistrationRecord) -> anyhow::Result<()> {
        self.unregister_validator(base_url, record).await?;
        Ok(())
    }
}

/// Gathers the composite dashboard snapshot through the endpoint
/// selector, feeding observed latency back into its ranking.
///
/// Sub-requests run sequentially on purpose: the transport behind a
/// SOCKS tunnel is high-latency and easily saturated.
pub struct DashboardGateway {
    rest: RestClient,
    selector: Arc<EndpointSelector>,
    recent_block_count: usize,
}

impl DashboardGateway {
    pub fn new(rest: RestClient, selector: Arc<EndpointSelector>, recent_block_count: usize) -> Self {
        Self {
            rest,
            selector,
            recent_block_count,
        }
    }

    async fn fetch_from(&self, base: &str) -> Result<DashboardSnapshot, NetError> {
        let node_info = self.rest.node_info(base).await?;
        let health = self.rest.health(base).await?;
        let validators = self.rest.validators(base).await?;
        let recent_blocks = self.rest.recent_blocks(base, self.recent_block_count).await?;
        let peers = self.rest.peers(base).await?;
        // The epoch summary is optional; nodes mid-upgrade may not
        // serve it and the snapshot is still useful without it.
        let reward = match self.rest.epoch_info(base).await {
            Ok(info) => Some(info),
            Err(e) => {
                debug!("epoch-info unavailable from {}: {}", base, e);
                None
            }
        };

        Ok(DashboardSnapshot::new(
            node_info,
            health,
            validators,
            recent_blocks,
            peers,
            reward,
        ))
    }
}

#[async_trait]
impl SnapshotSource for DashboardGateway {
    async fn fetch_snapshot(&self) -> anyhow::Result<DashboardSnapshot> {
        let base = self.selector.resolve_base_url().ok_or(NetError::NoEndpoint)?;
        let started = Instant::now();
        let result = self.fetch_from(&base).await;
        self.selector
            .record_probe(&base, started.elapsed(), result.is_ok());
        Ok(result?)
    }
}

/// Liveness probe against the local API port, used by the supervisor
/// when the log markers stay silent.
pub struct LocalHealthProbe {
    client: reqwest::Client,
}

impl LocalHealthProbe {
    pub fn new() -> Result<Self, NetError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(3))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for LocalHealthProbe {
    async fn is_healthy(&self, api_port: u16) -> bool {
        let url = format!("http://127.0.0.1:{}/health", api_port);
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

/// Answers identity questions against the first bootstrap peer that
/// responds.
pub struct BootstrapDirectory {
    rest: RestClient,
    urls: Vec<String>,
}

impl BootstrapDirectory {
    pub fn new(rest: RestClient, urls: Vec<String>) -> Self {
        Self { rest, urls }
    }
}

#[async_trait]
impl IdentityDirectory for BootstrapDirectory {
    async fn is_bootstrap_identity(&self, address: &str) -> anyhow::Result<bool> {
        let mut last_err: Option<NetError> = None;
        for base in &self.urls {
            match self.rest.bootstrap_identity(base, address).await {
                Ok(answer) => return Ok(answer),
                Err(e) => last_err = Some(e),
            }
        }
        Err(anyhow::anyhow!(
            "no bootstrap peer answered: {}",
            last_err.map(|e| e.to_string()).unwrap_or_else(|| "empty peer list".into())
        ))
    }

    async fn balance_cil(&self, address: &str) -> anyhow::Result<u64> {
        let mut last_err: Option<NetError> = None;
        for base in &self.urls {
            match self.rest.balance(base, address).await {
                Ok(balance) => return Ok(balance),
                Err(e) => last_err = Some(e),
            }
        }
        Err(anyhow::anyhow!(
            "no bootstrap peer answered: {}",
            last_err.map(|e| e.to_string()).unwrap_or_else(|| "empty peer list".into())
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_url_handles_slashes() {
        assert_eq!(join_url("http://a:1/", "/health"), "http://a:1/health");
        assert_eq!(join_url("http://a:1", "health"), "http://a:1/health");
    }

    #[test]
    fn write_ack_accepts_all_ok_statuses() {
        for status in ["ok", "registered", "unregistered"] {
            let ack = WriteAck {
                status: status.into(),
                msg: None,
            };
            assert!(ack.into_result().is_ok());
        }
    }

    #[test]
    fn write_ack_surfaces_rejection_message() {
        let ack: WriteAck =
            serde_json::from_str(r#"{"status":"error","msg":"stake below minimum"}"#).unwrap();
        match ack.into_result() {
            Err(NetError::Rejected(msg)) => assert_eq!(msg, "stake below minimum"),
            other => panic!("expected rejection, got {:?}", other.err()),
        }
    }

    #[test]
    fn validators_envelope_shape() {
        let raw = r#"{"validators":[
            {"address":"KEEL1abc","stake":1500,"active":true,"uptime_pct":99.2},
            {"address":"KEEL1def","stake":1000,"active":false}
        ]}"#;
        let env: ValidatorsEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(env.validators.len(), 2);
        assert_eq!(env.validators[0].address, "KEEL1abc");
        // uptime_pct defaults when a peer omits it.
        assert_eq!(env.validators[1].uptime_pct, 0.0);
    }

    #[test]
    fn epoch_info_shape() {
        let raw = r#"{"epoch":42,"epoch_duration_secs":2592000,"remaining_secs":86400,
                      "pool_cil":5000000,"validator_count":17}"#;
        let info: RewardInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(info.epoch, 42);
        assert_eq!(info.remaining_secs, 86_400);
    }

    #[test]
    fn bootstrap_identity_shape() {
        let env: BootstrapIdentityEnvelope =
            serde_json::from_str(r#"{"bootstrap":true}"#).unwrap();
        assert!(env.bootstrap);
    }
}
