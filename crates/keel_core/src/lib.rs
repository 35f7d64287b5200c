pub mod config;
pub mod orchestrator;
pub mod poller;
pub mod registration;
pub mod supervisor;

use anyhow::Result;
use config::{Config, TomlSettingsStore};
use keel_net::rest::{BootstrapDirectory, LocalHealthProbe};
use keel_net::{build_client, DashboardGateway, EndpointSelector, ProxyConfig, ProxySession, RestClient};
use keel_traits::{
    DashboardSnapshot, EpochCountdown, NodeStatus, Signer, TransportProvider, Tuning,
};
use orchestrator::SetupOrchestrator;
use poller::DashboardPoller;
use registration::RegistrationCoordinator;
use std::sync::Arc;
use std::time::Duration;
use supervisor::NodeSupervisor;
use tracing::info;

/// Process-wide context owning the single instances of every
/// orchestration component. Created once at app start, torn down at
/// app exit; components receive it explicitly instead of reaching for
/// ambient singletons.
pub struct AppContext {
    pub config: Config,
    pub selector: Arc<EndpointSelector>,
    pub proxy: Arc<ProxySession>,
    pub supervisor: Arc<NodeSupervisor>,
    pub poller: Arc<DashboardPoller>,
    pub coordinator: Arc<RegistrationCoordinator>,
    pub orchestrator: SetupOrchestrator,
}

/// Wire the components together and start the dashboard poller.
pub async fn init_core(config: Config, signer: Arc<dyn Signer>) -> Result<Arc<AppContext>> {
    info!("initializing keel core");

    let selector = Arc::new(EndpointSelector::new());
    selector.refresh_candidates(config.bootstrap_peers.iter().map(String::as_str));

    let proxy_config = ProxyConfig::from_env(
        &config.data_dir,
        Duration::from_secs(config.tuning.proxy_bootstrap_timeout_secs),
    );
    let proxy = Arc::new(ProxySession::new(proxy_config));

    // Any onion bootstrap peer means all dashboard reads tunnel through
    // the SOCKS endpoint; it resolves .onion names for us.
    let socks = config
        .bootstrap_peers
        .iter()
        .any(|u| u.contains(".onion"))
        .then(|| proxy.socks_addr().to_string());
    let client = build_client(socks.as_deref(), Duration::from_secs(30))?;
    let rest = RestClient::new(client);

    let gateway = Arc::new(DashboardGateway::new(
        rest.clone(),
        selector.clone(),
        config.recent_block_count,
    ));
    let poller = Arc::new(DashboardPoller::new(gateway, config.tuning));

    let probe = Arc::new(LocalHealthProbe::new()?);
    let supervisor = Arc::new(NodeSupervisor::new(probe, config.tuning));

    let local_url = format!("http://127.0.0.1:{}", config.api_port);
    let coordinator = Arc::new(RegistrationCoordinator::new(
        Arc::new(rest.clone()),
        signer,
        local_url,
        config.bootstrap_peers.clone(),
    ));

    let directory = Arc::new(BootstrapDirectory::new(
        rest,
        config.bootstrap_peers.clone(),
    ));
    let settings = Arc::new(TomlSettingsStore::new(config.data_dir.join("profile.toml")));

    let orchestrator = SetupOrchestrator::new(
        config.clone(),
        proxy.clone() as Arc<dyn TransportProvider>,
        supervisor.clone(),
        coordinator.clone(),
        directory,
        settings,
        selector.clone(),
    );

    poller.start();

    Ok(Arc::new(AppContext {
        config,
        selector,
        proxy,
        supervisor,
        poller,
        coordinator,
        orchestrator,
    }))
}

/// Tear everything down in dependency order: timers first, then the
/// node process, then the hidden service.
pub async fn shutdown(ctx: &AppContext) {
    info!("shutting down keel core");
    ctx.poller.shutdown();
    ctx.supervisor.stop().await;
    ctx.proxy.stop().await;
}

impl keel_tui::DashboardFeed for AppContext {
    fn snapshot(&self) -> Option<DashboardSnapshot> {
        self.poller.snapshot()
    }

    fn countdown(&self) -> EpochCountdown {
        self.poller.countdown()
    }

    fn node_status(&self) -> NodeStatus {
        self.supervisor.status()
    }

    fn node_logs(&self) -> Vec<String> {
        self.supervisor.logs()
    }

    fn using_local_fallback(&self) -> bool {
        self.selector.is_using_local_fallback()
    }

    fn last_error(&self) -> Option<String> {
        self.poller.last_error()
    }

    fn tuning(&self) -> Tuning {
        self.config.tuning
    }

    fn request_refresh(&self) {
        self.poller.request_refresh()
    }
}
