use crate::config::Config;
use crate::registration::RegistrationCoordinator;
use crate::supervisor::{LaunchConfig, MiningOptions, NodeSupervisor};
use anyhow::{anyhow, bail, Result};
use keel_net::EndpointSelector;
use keel_traits::{
    AdvertisedAddress, IdentityDirectory, NodeStatus, RegistrationTarget, SettingsStore,
    SetupProfile, SetupStage, TransportChoice, TransportProvider, ValidatorIdentity,
};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Drives first-time setup: transport, then process, then registration.
/// The same primitives back later manual start/stop/restart.
///
/// Stages are linear (NetworkChoice -> Import -> Confirm -> Launching
/// -> Done) with one backward edge, Confirm -> Import. A fatal step
/// rolls back to Confirm so the user can retry; registration failures
/// never block reaching Done.
pub struct SetupOrchestrator {
    config: Config,
    transport: Arc<dyn TransportProvider>,
    supervisor: Arc<NodeSupervisor>,
    coordinator: Arc<RegistrationCoordinator>,
    directory: Arc<dyn IdentityDirectory>,
    settings: Arc<dyn SettingsStore>,
    selector: Arc<EndpointSelector>,
    stage: RwLock<SetupStage>,
    network: RwLock<Option<String>>,
    identity: RwLock<Option<ValidatorIdentity>>,
}

impl SetupOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        transport: Arc<dyn TransportProvider>,
        supervisor: Arc<NodeSupervisor>,
        coordinator: Arc<RegistrationCoordinator>,
        directory: Arc<dyn IdentityDirectory>,
        settings: Arc<dyn SettingsStore>,
        selector: Arc<EndpointSelector>,
    ) -> Self {
        Self {
            config,
            transport,
            supervisor,
            coordinator,
            directory,
            settings,
            selector,
            stage: RwLock::new(SetupStage::NetworkChoice),
            network: RwLock::new(None),
            identity: RwLock::new(None),
        }
    }

    pub fn stage(&self) -> SetupStage {
        *self.stage.read()
    }

    pub fn identity(&self) -> Option<ValidatorIdentity> {
        self.identity.read().clone()
    }

    pub fn choose_network(&self, network: &str) -> Result<()> {
        let mut stage = self.stage.write();
        if *stage != SetupStage::NetworkChoice {
            bail!("network can only be chosen at the start of setup (stage is {:?})", *stage);
        }
        *self.network.write() = Some(network.to_string());
        *stage = SetupStage::Import;
        Ok(())
    }

    /// Classify and store the imported identity. Only a positive answer
    /// from the directory proves the address is already live as a
    /// bootstrap node; an unreachable directory defaults to Fresh.
    pub async fn import_identity(
        &self,
        address: &str,
        public_key: &str,
    ) -> Result<ValidatorIdentity> {
        if self.stage() != SetupStage::Import {
            bail!("identity import is only valid in the Import stage");
        }

        let is_bootstrap = match self.directory.is_bootstrap_identity(address).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!("bootstrap identity check unavailable, assuming fresh: {:#}", e);
                false
            }
        };

        let identity = if is_bootstrap {
            ValidatorIdentity::PreexistingBootstrap {
                address: address.to_string(),
            }
        } else {
            ValidatorIdentity::Fresh {
                address: address.to_string(),
                public_key: public_key.to_string(),
            }
        };

        *self.identity.write() = Some(identity.clone());
        *self.stage.write() = SetupStage::Confirm;
        Ok(identity)
    }

    /// The single allowed backward transition.
    pub fn back_to_import(&self) -> Result<()> {
        let mut stage = self.stage.write();
        if *stage != SetupStage::Confirm {
            bail!("can only go back to Import from Confirm");
        }
        *self.identity.write() = None;
        *stage = SetupStage::Import;
        Ok(())
    }

    /// Run the launch sequence. Each step completes, suspension
    /// included, before the next starts.
    pub async fn confirm_and_launch(&self, transport_choice: TransportChoice) -> Result<SetupStage> {
        {
            let mut stage = self.stage.write();
            if *stage != SetupStage::Confirm {
                bail!("launch is only valid from the Confirm stage");
            }
            *stage = SetupStage::Launching;
        }

        match self.run_launch(&transport_choice).await {
            Ok(final_stage) => {
                *self.stage.write() = final_stage;
                Ok(final_stage)
            }
            Err(e) => {
                *self.stage.write() = SetupStage::Confirm;
                Err(e)
            }
        }
    }

    async fn run_launch(&self, transport_choice: &TransportChoice) -> Result<SetupStage> {
        let identity = self
            .identity()
            .ok_or_else(|| anyhow!("no identity imported"))?;

        // Consumed exactly once. A pre-existing bootstrap identity gets
        // no process and no hidden service: a second instance signing
        // under the same identity would equivocate.
        let address = match identity {
            ValidatorIdentity::PreexistingBootstrap { address } => {
                info!("{} is a live bootstrap identity, entering monitor mode", address);
                self.save_profile(transport_choice, &address, None).await;
                return Ok(SetupStage::Monitoring);
            }
            ValidatorIdentity::Fresh { address, .. } => address,
        };

        let api_port = self.config.api_port;
        let p2p_port = self.config.p2p_port();

        // Step 1: transport. Absent address under anonymized mode is
        // fatal; clear mode skips the proxy entirely.
        let (advertised, socks_proxy) = match transport_choice {
            TransportChoice::Anonymized => {
                let published = self.transport.start_hidden_service(api_port, p2p_port).await?;
                match published {
                    Some(onion) => (AdvertisedAddress::Onion(onion), self.transport.socks_endpoint()),
                    None => bail!(
                        "anonymizing proxy did not publish an address; \
                         check the proxy daemon or switch to clear transport"
                    ),
                }
            }
            TransportChoice::Clear { host } => (AdvertisedAddress::Host(host.clone()), None),
        };

        // Step 2: node process. Failure here rolls the transport back.
        let launch = LaunchConfig {
            node_binary: self.config.node_binary.clone(),
            node_args: Vec::new(),
            api_port,
            p2p_port,
            data_dir: self.config.data_dir.clone(),
            advertised: advertised.clone(),
            socks_proxy,
            bootstrap_peers: self.config.bootstrap_peers.clone(),
            signing_seed: None,
            mining: self
                .config
                .mining
                .enabled
                .then(|| MiningOptions {
                    threads: self.config.mining.threads,
                }),
        };
        self.supervisor.start(launch).await?;

        if !self.await_running().await {
            let reason = self
                .supervisor
                .error_message()
                .unwrap_or_else(|| "node did not reach Running".to_string());
            self.supervisor.stop().await;
            self.transport.stop().await;
            bail!("node start failed: {}", reason);
        }

        // The node's own address leaves the read pool the moment it is
        // known, and local reads become the explicit fallback.
        self.selector.exclude_own_address(&advertised.to_string());
        self.selector
            .exclude_own_address(&format!("http://{}", advertised));
        self.selector
            .exclude_own_address(&format!("http://{}:{}", advertised, api_port));
        self.selector
            .set_local_fallback(&format!("http://127.0.0.1:{}", api_port));
        self.coordinator.set_advertised(advertised.clone());

        // Step 3: balance probe. Success is optional; the first
        // dashboard poll after launch does the real check.
        let probe_timeout = Duration::from_secs(self.config.tuning.balance_probe_timeout_secs);
        match tokio::time::timeout(probe_timeout, self.directory.balance_cil(&address)).await {
            Ok(Ok(balance)) => info!("balance probe: {} cil", balance),
            Ok(Err(e)) => warn!("balance probe failed, continuing: {:#}", e),
            Err(_) => warn!("balance probe timed out, continuing"),
        }

        // Step 4: registration, best effort toward both targets.
        let local = self
            .coordinator
            .register_on_target(RegistrationTarget::Local)
            .await;
        info!("local registration: {:?}", local);
        let bootstrap = self
            .coordinator
            .register_on_target(RegistrationTarget::Bootstrap)
            .await;
        info!("bootstrap registration: {:?}", bootstrap);

        self.save_profile(transport_choice, &address, Some(advertised)).await;
        Ok(SetupStage::Done)
    }

    async fn await_running(&self) -> bool {
        let mut rx = self.supervisor.subscribe();
        let deadline = Duration::from_secs(self.config.tuning.start_timeout_secs);
        tokio::time::timeout(deadline, async {
            loop {
                match *rx.borrow() {
                    NodeStatus::Running => return true,
                    NodeStatus::Error | NodeStatus::Stopped => return false,
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await
        .unwrap_or(false)
    }

    async fn save_profile(
        &self,
        transport: &TransportChoice,
        address: &str,
        advertised: Option<AdvertisedAddress>,
    ) {
        let profile = SetupProfile {
            network: self
                .network
                .read()
                .clone()
                .unwrap_or_else(|| self.config.network.clone()),
            transport: transport.clone(),
            address: Some(address.to_string()),
            advertised,
        };
        if let Err(e) = self.settings.save_profile(&profile).await {
            warn!("could not persist setup profile: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use keel_traits::{HealthProbe, RegistrationRecord, Signer, Tuning, ValidatorRegistry};
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct NeverHealthy;

    #[async_trait]
    impl HealthProbe for NeverHealthy {
        async fn is_healthy(&self, _api_port: u16) -> bool {
            false
        }
    }

    struct MockTransport {
        publish: Option<String>,
        starts: AtomicUsize,
        stopped: AtomicBool,
    }

    impl MockTransport {
        fn publishing(onion: &str) -> Arc<Self> {
            Arc::new(Self {
                publish: Some(onion.to_string()),
                starts: AtomicUsize::new(0),
                stopped: AtomicBool::new(false),
            })
        }

        fn dead() -> Arc<Self> {
            Arc::new(Self {
                publish: None,
                starts: AtomicUsize::new(0),
                stopped: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl TransportProvider for MockTransport {
        async fn start_hidden_service(
            &self,
            _api_port: u16,
            _p2p_port: u16,
        ) -> Result<Option<String>> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(self.publish.clone())
        }

        async fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }

        fn socks_endpoint(&self) -> Option<String> {
            self.publish.as_ref().map(|_| "127.0.0.1:9050".to_string())
        }
    }

    struct MockDirectory {
        bootstrap: bool,
    }

    #[async_trait]
    impl IdentityDirectory for MockDirectory {
        async fn is_bootstrap_identity(&self, _address: &str) -> Result<bool> {
            Ok(self.bootstrap)
        }

        async fn balance_cil(&self, _address: &str) -> Result<u64> {
            Ok(42_000)
        }
    }

    #[derive(Default)]
    struct MemorySettings {
        saved: Mutex<Option<SetupProfile>>,
    }

    #[async_trait]
    impl SettingsStore for MemorySettings {
        async fn load_profile(&self) -> Result<Option<SetupProfile>> {
            Ok(self.saved.lock().clone())
        }

        async fn save_profile(&self, profile: &SetupProfile) -> Result<()> {
            *self.saved.lock() = Some(profile.clone());
            Ok(())
        }
    }

    struct MockSigner;

    #[async_trait]
    impl Signer for MockSigner {
        fn address(&self) -> String {
            "KEEL1abc".to_string()
        }

        fn public_key_hex(&self) -> String {
            "00ff".to_string()
        }

        async fn sign(&self, _message: &[u8]) -> Result<Vec<u8>> {
            Ok(b"sig".to_vec())
        }
    }

    #[derive(Default)]
    struct MockRegistry {
        registered: Mutex<HashSet<(String, String)>>,
        failing_urls: Mutex<HashSet<String>>,
        records: Mutex<Vec<RegistrationRecord>>,
    }

    #[async_trait]
    impl ValidatorRegistry for MockRegistry {
        async fn is_registered(&self, base_url: &str, address: &str) -> Result<bool> {
            if self.failing_urls.lock().contains(base_url) {
                anyhow::bail!("connection refused");
            }
            Ok(self
                .registered
                .lock()
                .contains(&(base_url.to_string(), address.to_string())))
        }

        async fn register(&self, base_url: &str, record: &RegistrationRecord) -> Result<()> {
            if self.failing_urls.lock().contains(base_url) {
                anyhow::bail!("connection refused");
            }
            self.registered
                .lock()
                .insert((base_url.to_string(), record.address.clone()));
            self.records.lock().push(record.clone());
            Ok(())
        }

        async fn unregister(&self, _base_url: &str, _record: &RegistrationRecord) -> Result<()> {
            Ok(())
        }
    }

    struct Rig {
        orchestrator: SetupOrchestrator,
        supervisor: Arc<NodeSupervisor>,
        transport: Arc<MockTransport>,
        registry: Arc<MockRegistry>,
        settings: Arc<MemorySettings>,
    }

    fn rig(transport: Arc<MockTransport>, bootstrap_identity: bool, node_script: &str) -> Rig {
        let mut config = Config::default();
        config.bootstrap_peers = vec!["http://boot:3030".into()];
        config.tuning = Tuning {
            readiness_grace_secs: 60,
            ..Tuning::default()
        };

        // The orchestrator launches node_binary with no arguments, so
        // the fake node is installed as an executable script.
        let script_path = {
            let dir = tempfile::tempdir().unwrap().into_path();
            let path = dir.join("fake-node");
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", node_script)).unwrap();
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            }
            path
        };
        config.node_binary = script_path;

        let supervisor = Arc::new(NodeSupervisor::new(Arc::new(NeverHealthy), config.tuning));
        let registry = Arc::new(MockRegistry::default());
        let coordinator = Arc::new(RegistrationCoordinator::new(
            registry.clone(),
            Arc::new(MockSigner),
            "http://local:3030".to_string(),
            vec!["http://boot:3030".to_string()],
        ));
        let settings = Arc::new(MemorySettings::default());
        let selector = Arc::new(EndpointSelector::new());

        let orchestrator = SetupOrchestrator::new(
            config,
            transport.clone(),
            supervisor.clone(),
            coordinator,
            Arc::new(MockDirectory {
                bootstrap: bootstrap_identity,
            }),
            settings.clone(),
            selector,
        );

        Rig {
            orchestrator,
            supervisor,
            transport,
            registry,
            settings,
        }
    }

    async fn advance_to_confirm(rig: &Rig) {
        rig.orchestrator.choose_network("mainnet").unwrap();
        rig.orchestrator
            .import_identity("KEEL1abc", "00ff")
            .await
            .unwrap();
        assert_eq!(rig.orchestrator.stage(), SetupStage::Confirm);
    }

    #[tokio::test]
    async fn happy_path_clear_transport_reaches_done() {
        let rig = rig(MockTransport::dead(), false, "echo node ready; sleep 5");
        advance_to_confirm(&rig).await;

        let stage = rig
            .orchestrator
            .confirm_and_launch(TransportChoice::Clear {
                host: "198.51.100.7:4030".into(),
            })
            .await
            .unwrap();

        assert_eq!(stage, SetupStage::Done);
        assert_eq!(rig.supervisor.status(), NodeStatus::Running);
        // Clear transport never touches the proxy.
        assert_eq!(rig.transport.starts.load(Ordering::SeqCst), 0);
        // Both targets were registered.
        assert!(rig
            .registry
            .registered
            .lock()
            .contains(&("http://local:3030".to_string(), "KEEL1abc".to_string())));
        assert!(rig
            .registry
            .registered
            .lock()
            .contains(&("http://boot:3030".to_string(), "KEEL1abc".to_string())));
        // The user's choices survived.
        let saved = rig.settings.saved.lock().clone().unwrap();
        assert_eq!(saved.address.as_deref(), Some("KEEL1abc"));

        rig.supervisor.stop().await;
    }

    #[tokio::test]
    async fn anonymized_transport_passes_published_address_through() {
        let rig = rig(
            MockTransport::publishing("abc123.onion"),
            false,
            "echo node ready; sleep 5",
        );
        advance_to_confirm(&rig).await;

        let stage = rig
            .orchestrator
            .confirm_and_launch(TransportChoice::Anonymized)
            .await
            .unwrap();
        assert_eq!(stage, SetupStage::Done);

        let records = rig.registry.records.lock();
        assert!(records
            .iter()
            .all(|r| r.advertised_address.as_deref() == Some("abc123.onion")));

        let launch = rig.supervisor.current_launch().unwrap();
        assert_eq!(launch.socks_proxy.as_deref(), Some("127.0.0.1:9050"));
        assert!(launch.advertised.is_onion());

        rig.supervisor.stop().await;
    }

    #[tokio::test]
    async fn proxy_failure_aborts_before_the_node_ever_starts() {
        let rig = rig(MockTransport::dead(), false, "echo node ready; sleep 5");
        advance_to_confirm(&rig).await;

        let result = rig
            .orchestrator
            .confirm_and_launch(TransportChoice::Anonymized)
            .await;

        assert!(result.is_err());
        assert_eq!(rig.orchestrator.stage(), SetupStage::Confirm);
        assert_eq!(rig.supervisor.status(), NodeStatus::Stopped);
        assert!(rig.supervisor.current_launch().is_none());
    }

    #[tokio::test]
    async fn node_start_failure_rolls_back_to_confirm() {
        let rig = rig(
            MockTransport::publishing("abc123.onion"),
            false,
            "echo FATAL: bind failed; sleep 5",
        );
        advance_to_confirm(&rig).await;

        let result = rig
            .orchestrator
            .confirm_and_launch(TransportChoice::Anonymized)
            .await;

        assert!(result.is_err());
        assert_eq!(rig.orchestrator.stage(), SetupStage::Confirm);
        assert_eq!(rig.supervisor.status(), NodeStatus::Stopped);
        // The hidden service was rolled back with the sequence.
        assert!(rig.transport.stopped.load(Ordering::SeqCst));
        // Registration was never attempted.
        assert!(rig.registry.records.lock().is_empty());
    }

    #[tokio::test]
    async fn bootstrap_identity_short_circuits_into_monitoring() {
        let rig = rig(
            MockTransport::publishing("abc123.onion"),
            true,
            "echo node ready; sleep 5",
        );
        rig.orchestrator.choose_network("mainnet").unwrap();
        let identity = rig
            .orchestrator
            .import_identity("KEEL1boot", "00ff")
            .await
            .unwrap();
        assert!(matches!(
            identity,
            ValidatorIdentity::PreexistingBootstrap { .. }
        ));

        let stage = rig
            .orchestrator
            .confirm_and_launch(TransportChoice::Anonymized)
            .await
            .unwrap();

        assert_eq!(stage, SetupStage::Monitoring);
        // Never spawned, never created a hidden service.
        assert_eq!(rig.supervisor.status(), NodeStatus::Stopped);
        assert_eq!(rig.transport.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn bootstrap_registration_failure_still_reaches_done() {
        let rig = rig(MockTransport::dead(), false, "echo node ready; sleep 5");
        rig.registry.failing_urls.lock().insert("http://boot:3030".into());
        advance_to_confirm(&rig).await;

        let stage = rig
            .orchestrator
            .confirm_and_launch(TransportChoice::Clear {
                host: "198.51.100.7:4030".into(),
            })
            .await
            .unwrap();

        assert_eq!(stage, SetupStage::Done);
        assert!(rig
            .registry
            .registered
            .lock()
            .contains(&("http://local:3030".to_string(), "KEEL1abc".to_string())));

        rig.supervisor.stop().await;
    }

    #[tokio::test]
    async fn stage_transitions_are_strict() {
        let rig = rig(MockTransport::dead(), false, "true");

        // Import before NetworkChoice is rejected.
        assert!(rig
            .orchestrator
            .import_identity("KEEL1abc", "00ff")
            .await
            .is_err());
        // Back only exists from Confirm.
        assert!(rig.orchestrator.back_to_import().is_err());

        rig.orchestrator.choose_network("mainnet").unwrap();
        assert!(rig.orchestrator.choose_network("testnet").is_err());

        rig.orchestrator
            .import_identity("KEEL1abc", "00ff")
            .await
            .unwrap();
        rig.orchestrator.back_to_import().unwrap();
        assert_eq!(rig.orchestrator.stage(), SetupStage::Import);
        assert!(rig.orchestrator.identity().is_none());

        // Launch requires Confirm.
        assert!(rig
            .orchestrator
            .confirm_and_launch(TransportChoice::Anonymized)
            .await
            .is_err());
    }
}
