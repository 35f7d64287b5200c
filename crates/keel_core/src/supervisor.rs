use anyhow::{bail, Result};
use keel_traits::{AdvertisedAddress, HealthProbe, NodeStatus, Tuning};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Key-derivation seed forwarded to the child environment. Wiped on
/// drop and never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SigningSeed(String);

impl SigningSeed {
    pub fn new(seed: String) -> Self {
        Self(seed)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SigningSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningSeed(..)")
    }
}

#[derive(Debug, Clone)]
pub struct MiningOptions {
    pub threads: usize,
}

impl Default for MiningOptions {
    fn default() -> Self {
        Self {
            threads: num_cpus::get(),
        }
    }
}

/// Everything needed to launch the validator process. The environment
/// encoding is deterministic: same config, same child environment.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub node_binary: PathBuf,
    pub node_args: Vec<String>,
    pub api_port: u16,
    pub p2p_port: u16,
    pub data_dir: PathBuf,
    pub advertised: AdvertisedAddress,
    pub socks_proxy: Option<String>,
    pub bootstrap_peers: Vec<String>,
    pub signing_seed: Option<SigningSeed>,
    pub mining: Option<MiningOptions>,
}

impl LaunchConfig {
    pub fn to_env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            ("KEEL_API_PORT".to_string(), self.api_port.to_string()),
            ("KEEL_P2P_PORT".to_string(), self.p2p_port.to_string()),
            (
                "KEEL_DATA_DIR".to_string(),
                self.data_dir.display().to_string(),
            ),
            ("KEEL_HOST_ADDRESS".to_string(), self.advertised.to_string()),
        ];
        if let Some(socks) = &self.socks_proxy {
            env.push(("KEEL_SOCKS5_PROXY".to_string(), socks.clone()));
        }
        if !self.bootstrap_peers.is_empty() {
            env.push((
                "KEEL_BOOTSTRAP_NODES".to_string(),
                self.bootstrap_peers.join(","),
            ));
        }
        if let Some(seed) = &self.signing_seed {
            env.push(("KEEL_SIGNING_SEED".to_string(), seed.expose().to_string()));
        }
        if let Some(mining) = &self.mining {
            env.push(("KEEL_MINING".to_string(), "1".to_string()));
            env.push((
                "KEEL_MINING_THREADS".to_string(),
                mining.threads.to_string(),
            ));
        }
        env
    }
}

/// Classification of one child log line. The marker scan is a
/// heuristic liveness signal, not a handshake; the health-probe
/// watchdog backs it up when it stays silent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMarker {
    Ready,
    Syncing,
    Fatal,
}

/// Documented marker substrings from the node's startup output.
const READY_MARKERS: &[&str] = &["rest api listening", "node ready", "p2p swarm listening"];
const SYNCING_MARKERS: &[&str] = &["syncing from peers", "catching up"];
const FATAL_MARKERS: &[&str] = &["fatal", "panicked", "address already in use"];

pub fn classify_line(line: &str) -> Option<LaunchMarker> {
    let lower = line.to_lowercase();
    if FATAL_MARKERS.iter().any(|m| lower.contains(m)) {
        Some(LaunchMarker::Fatal)
    } else if READY_MARKERS.iter().any(|m| lower.contains(m)) {
        Some(LaunchMarker::Ready)
    } else if SYNCING_MARKERS.iter().any(|m| lower.contains(m)) {
        Some(LaunchMarker::Syncing)
    } else {
        None
    }
}

struct SessionState {
    status: NodeStatus,
    last_error: Option<String>,
    launch: Option<LaunchConfig>,
    logs: VecDeque<String>,
    kill_tx: Option<watch::Sender<bool>>,
}

struct Inner {
    state: RwLock<SessionState>,
    status_tx: watch::Sender<NodeStatus>,
    probe: Arc<dyn HealthProbe>,
    tuning: Tuning,
    /// Serializes start/stop so two concurrent triggers cannot both
    /// spawn a process.
    start_gate: Mutex<()>,
}

impl Inner {
    fn status(&self) -> NodeStatus {
        self.state.read().status
    }

    fn set_status(&self, status: NodeStatus) {
        self.state.write().status = status;
        let _ = self.status_tx.send(status);
    }

    /// Atomic conditional transition; returns whether it applied.
    fn transition_if(&self, from: &[NodeStatus], to: NodeStatus) -> bool {
        let applied = {
            let mut st = self.state.write();
            if from.contains(&st.status) {
                st.status = to;
                true
            } else {
                false
            }
        };
        if applied {
            let _ = self.status_tx.send(to);
        }
        applied
    }

    /// Error transition that never clobbers Stopping/Stopped.
    fn fail_if_active(&self, message: impl Into<String>) {
        let message = message.into();
        let applied = {
            let mut st = self.state.write();
            if st.status.is_active() {
                st.status = NodeStatus::Error;
                st.last_error = Some(message.clone());
                true
            } else {
                false
            }
        };
        if applied {
            warn!("node session error: {}", message);
            let _ = self.status_tx.send(NodeStatus::Error);
        }
    }

    fn push_log(&self, line: String) {
        let mut st = self.state.write();
        if st.logs.len() >= self.tuning.log_ring_capacity {
            st.logs.pop_front();
        }
        st.logs.push_back(line);
    }

    fn request_kill(&self) {
        if let Some(tx) = &self.state.read().kill_tx {
            let _ = tx.send(true);
        }
    }
}

/// Owns the validator process: spawn, observe, stop, restart. The one
/// NodeSession per app instance lives behind this type and nothing
/// else mutates it.
pub struct NodeSupervisor {
    inner: Arc<Inner>,
}

impl NodeSupervisor {
    pub fn new(probe: Arc<dyn HealthProbe>, tuning: Tuning) -> Self {
        let (status_tx, _) = watch::channel(NodeStatus::Stopped);
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(SessionState {
                    status: NodeStatus::Stopped,
                    last_error: None,
                    launch: None,
                    logs: VecDeque::new(),
                    kill_tx: None,
                }),
                status_tx,
                probe,
                tuning,
                start_gate: Mutex::new(()),
            }),
        }
    }

    pub fn status(&self) -> NodeStatus {
        self.inner.status()
    }

    pub fn subscribe(&self) -> watch::Receiver<NodeStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn logs(&self) -> Vec<String> {
        self.inner.state.read().logs.iter().cloned().collect()
    }

    pub fn error_message(&self) -> Option<String> {
        self.inner.state.read().last_error.clone()
    }

    pub fn current_launch(&self) -> Option<LaunchConfig> {
        self.inner.state.read().launch.clone()
    }

    /// Launch the node process. Returns Ok(true) when a new process was
    /// spawned, Ok(false) when one was already active. Spawn failures
    /// do not propagate: the session moves to Error and callers observe
    /// `status`/`error_message`.
    pub async fn start(&self, config: LaunchConfig) -> Result<bool> {
        let inner = self.inner.clone();
        let _gate = inner.start_gate.lock().await;

        if inner.status().is_active() {
            info!("start ignored, node already active");
            return Ok(false);
        }

        {
            let mut st = inner.state.write();
            st.launch = Some(config.clone());
            st.logs.clear();
            st.last_error = None;
            st.status = NodeStatus::Starting;
        }
        let _ = inner.status_tx.send(NodeStatus::Starting);

        let mut cmd = Command::new(&config.node_binary);
        cmd.args(&config.node_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in config.to_env() {
            cmd.env(key, value);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                inner.fail_if_active(format!(
                    "failed to launch {:?}: {}",
                    config.node_binary, e
                ));
                return Ok(false);
            }
        };
        info!(
            "node process launched (pid {:?}, api {}, p2p {})",
            child.id(),
            config.api_port,
            config.p2p_port
        );

        let (kill_tx, kill_rx) = watch::channel(false);
        inner.state.write().kill_tx = Some(kill_tx);

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(read_lines(inner.clone(), stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(read_lines(inner.clone(), stderr));
        }
        tokio::spawn(monitor_child(inner.clone(), child, kill_rx));
        tokio::spawn(readiness_watchdog(inner.clone(), config.api_port));

        Ok(true)
    }

    /// Signal the process to terminate and wait for confirmed exit.
    /// Safe to call when already Stopped.
    pub async fn stop(&self) {
        let inner = self.inner.clone();
        let _gate = inner.start_gate.lock().await;

        let (status, has_child) = {
            let st = inner.state.read();
            (st.status, st.kill_tx.is_some())
        };
        if status == NodeStatus::Stopped {
            return;
        }
        if !has_child {
            // Error after exit, or a session that never spawned.
            inner.set_status(NodeStatus::Stopped);
            return;
        }

        inner.set_status(NodeStatus::Stopping);
        inner.request_kill();

        let mut rx = inner.status_tx.subscribe();
        let waited = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if *rx.borrow() == NodeStatus::Stopped {
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;

        if waited.is_err() || inner.status() != NodeStatus::Stopped {
            warn!("node did not confirm exit in time, forcing Stopped");
            inner.state.write().kill_tx = None;
            inner.set_status(NodeStatus::Stopped);
        }
    }

    /// Stop then start with the previously supplied configuration.
    pub async fn restart(&self) -> Result<bool> {
        let config = match self.current_launch() {
            Some(config) => config,
            None => bail!("restart requested but the node was never started"),
        };
        self.stop().await;
        self.start(config).await
    }
}

async fn read_lines<R>(inner: Arc<Inner>, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let clean = String::from_utf8_lossy(&strip_ansi_escapes::strip(&line)).into_owned();
        match classify_line(&clean) {
            Some(LaunchMarker::Ready) => {
                if inner.transition_if(
                    &[NodeStatus::Starting, NodeStatus::Syncing],
                    NodeStatus::Running,
                ) {
                    info!("node reported ready: {}", clean);
                }
            }
            Some(LaunchMarker::Syncing) => {
                inner.transition_if(&[NodeStatus::Starting], NodeStatus::Syncing);
            }
            Some(LaunchMarker::Fatal) => {
                inner.fail_if_active(clean.clone());
            }
            None => {}
        }
        inner.push_log(clean);
    }
}

async fn monitor_child(inner: Arc<Inner>, mut child: Child, mut kill_rx: watch::Receiver<bool>) {
    tokio::select! {
        exit = child.wait() => {
            let status_now = {
                let mut st = inner.state.write();
                st.kill_tx = None;
                st.status
            };
            let desc = match exit {
                Ok(st) => st.to_string(),
                Err(e) => format!("wait failed: {}", e),
            };
            match status_now {
                NodeStatus::Stopping => inner.set_status(NodeStatus::Stopped),
                NodeStatus::Error => {}
                _ => inner.fail_if_active(format!("node process exited unexpectedly ({})", desc)),
            }
        }
        _ = kill_rx.changed() => {
            if let Err(e) = child.start_kill() {
                warn!("kill signal failed: {}", e);
            }
            match child.wait().await {
                Ok(st) => info!("node process exited after stop ({})", st),
                Err(e) => warn!("wait after kill failed: {}", e),
            }
            inner.state.write().kill_tx = None;
            // Stopped only on an explicit stop; a timeout-triggered kill
            // keeps the Error already recorded.
            if inner.status() == NodeStatus::Stopping {
                inner.set_status(NodeStatus::Stopped);
            }
        }
    }
}

/// Backs up the marker heuristic with an active health probe after a
/// grace period, and enforces the overall start timeout.
async fn readiness_watchdog(inner: Arc<Inner>, api_port: u16) {
    let deadline = tokio::time::Instant::now()
        + Duration::from_secs(inner.tuning.start_timeout_secs);
    tokio::time::sleep(Duration::from_secs(inner.tuning.readiness_grace_secs)).await;

    loop {
        match inner.status() {
            NodeStatus::Starting | NodeStatus::Syncing => {}
            _ => return,
        }
        if inner.probe.is_healthy(api_port).await {
            if inner.transition_if(
                &[NodeStatus::Starting, NodeStatus::Syncing],
                NodeStatus::Running,
            ) {
                info!("health probe confirmed readiness on port {}", api_port);
            }
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            inner.fail_if_active("node did not become ready before the start timeout");
            inner.request_kill();
            return;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}
