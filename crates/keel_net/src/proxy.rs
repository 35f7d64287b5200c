use crate::NetError;
use async_trait::async_trait;
use keel_traits::{ProxyState, TransportProvider};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tracing::{info, warn};

/// Connection settings for the anonymizing proxy's control port.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Control port address, default 127.0.0.1:9051.
    pub control_addr: String,
    /// Cookie file for control-port authentication, auto-detected when
    /// unset.
    pub cookie_path: Option<PathBuf>,
    /// Control-port password, the alternative to cookie auth.
    pub control_password: Option<String>,
    /// SOCKS endpoint outbound traffic is tunneled through.
    pub socks_addr: String,
    /// Where the hidden-service key is persisted for a stable address.
    pub data_dir: PathBuf,
    /// First-run key generation has been observed to take close to two
    /// minutes; past this the session transitions to Failed.
    pub bootstrap_timeout: Duration,
}

impl ProxyConfig {
    /// Environment overrides: KEEL_PROXY_CONTROL, KEEL_PROXY_COOKIE,
    /// KEEL_PROXY_CONTROL_PWD, KEEL_SOCKS5_PROXY.
    pub fn from_env(data_dir: &Path, bootstrap_timeout: Duration) -> Self {
        let control_addr =
            std::env::var("KEEL_PROXY_CONTROL").unwrap_or_else(|_| "127.0.0.1:9051".to_string());
        let cookie_path = std::env::var("KEEL_PROXY_COOKIE")
            .ok()
            .map(PathBuf::from)
            .or_else(auto_detect_cookie_path);
        let control_password = std::env::var("KEEL_PROXY_CONTROL_PWD").ok();
        let socks_addr = std::env::var("KEEL_SOCKS5_PROXY")
            .map(|s| {
                s.trim_start_matches("socks5h://")
                    .trim_start_matches("socks5://")
                    .to_string()
            })
            .unwrap_or_else(|_| "127.0.0.1:9050".to_string());

        Self {
            control_addr,
            cookie_path,
            control_password,
            socks_addr,
            data_dir: data_dir.to_path_buf(),
            bootstrap_timeout,
        }
    }
}

fn auto_detect_cookie_path() -> Option<PathBuf> {
    let candidates = [
        "/var/run/tor/control.authcookie",
        "/var/lib/tor/control_auth_cookie",
        "/usr/local/var/lib/tor/control_auth_cookie",
        "/opt/homebrew/var/lib/tor/control_auth_cookie",
    ];
    candidates.iter().map(PathBuf::from).find(|p| p.exists())
}

fn key_file_path(data_dir: &Path) -> PathBuf {
    data_dir.join("proxy_service_key")
}

fn onion_file_path(data_dir: &Path) -> PathBuf {
    data_dir.join("onion_address")
}

type ControlReader = BufReader<ReadHalf<TcpStream>>;
type ControlWriter = WriteHalf<TcpStream>;

/// One control-port exchange. Replies are line based: "250-" continues,
/// "250 " terminates, 4xx/5xx is an error.
async fn send_command(
    reader: &mut ControlReader,
    writer: &mut ControlWriter,
    command: &str,
) -> Result<Vec<String>, NetError> {
    writer.write_all(format!("{}\r\n", command).as_bytes()).await?;

    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(NetError::Control("connection closed mid-reply".into()));
        }

        let trimmed = line.trim_end().to_string();
        if trimmed.len() >= 4 {
            let code = &trimmed[..3];
            let sep = trimmed[3..4].to_string();
            if code.starts_with('4') || code.starts_with('5') {
                return Err(NetError::Control(trimmed));
            }
            lines.push(trimmed);
            if sep == " " {
                break;
            }
        } else {
            lines.push(trimmed);
        }
    }
    Ok(lines)
}

/// Tries cookie, then password, then null authentication.
async fn authenticate(
    reader: &mut ControlReader,
    writer: &mut ControlWriter,
    config: &ProxyConfig,
) -> Result<(), NetError> {
    if let Some(cookie_path) = &config.cookie_path {
        match std::fs::read(cookie_path) {
            Ok(cookie) => {
                let cmd = format!("AUTHENTICATE {}", hex::encode(cookie));
                match send_command(reader, writer, &cmd).await {
                    Ok(lines) if lines.iter().any(|l| l.starts_with("250 ")) => return Ok(()),
                    Ok(_) | Err(_) => warn!("proxy cookie auth failed, trying alternatives"),
                }
            }
            Err(e) => warn!("cannot read proxy cookie {:?}: {}", cookie_path, e),
        }
    }

    if let Some(password) = &config.control_password {
        let cmd = format!("AUTHENTICATE \"{}\"", password);
        match send_command(reader, writer, &cmd).await {
            Ok(lines) if lines.iter().any(|l| l.starts_with("250 ")) => return Ok(()),
            Ok(_) | Err(_) => warn!("proxy password auth failed, trying null auth"),
        }
    }

    match send_command(reader, writer, "AUTHENTICATE").await {
        Ok(lines) if lines.iter().any(|l| l.starts_with("250 ")) => Ok(()),
        _ => Err(NetError::Control(
            "all control-port authentication methods failed".into(),
        )),
    }
}

struct CreatedService {
    onion_address: String,
    service_id: String,
}

/// Owns the lifecycle of the optional hidden service: bootstrap it,
/// publish an address, expose the SOCKS endpoint, tear it down.
///
/// A failed or unreachable proxy daemon is reported as an absent
/// address, not an error; callers decide whether that is fatal.
pub struct ProxySession {
    config: ProxyConfig,
    state: RwLock<ProxyState>,
    onion: RwLock<Option<String>>,
    service_id: RwLock<Option<String>>,
}

impl ProxySession {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            state: RwLock::new(ProxyState::Idle),
            onion: RwLock::new(None),
            service_id: RwLock::new(None),
        }
    }

    pub fn state(&self) -> ProxyState {
        *self.state.read()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ProxyState::Ready
    }

    pub fn onion_address(&self) -> Option<String> {
        self.onion.read().clone()
    }

    /// The SOCKS port to hand to the node process, present once Ready.
    pub fn active_socks_port(&self) -> Option<u16> {
        if !self.is_running() {
            return None;
        }
        self.config
            .socks_addr
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
    }

    pub fn socks_addr(&self) -> &str {
        &self.config.socks_addr
    }

    /// Create (or restore) the hidden service mapping the API and P2P
    /// ports. Returns None when the control port is unreachable or the
    /// bootstrap timed out.
    pub async fn start_with_hidden_service(
        &self,
        api_port: u16,
        p2p_port: u16,
    ) -> Option<String> {
        if let Some(existing) = self.onion_address() {
            if self.is_running() {
                return Some(existing);
            }
        }

        *self.state.write() = ProxyState::Bootstrapping;
        info!("proxy bootstrap started (timeout {:?})", self.config.bootstrap_timeout);

        let result = tokio::time::timeout(
            self.config.bootstrap_timeout,
            self.bootstrap(api_port, p2p_port),
        )
        .await;

        match result {
            Ok(Ok(created)) => {
                info!("hidden service published: {}", created.onion_address);
                *self.state.write() = ProxyState::Ready;
                *self.onion.write() = Some(created.onion_address.clone());
                *self.service_id.write() = Some(created.service_id);
                Some(created.onion_address)
            }
            Ok(Err(e)) => {
                warn!("proxy bootstrap failed: {}", e);
                *self.state.write() = ProxyState::Failed;
                None
            }
            Err(_) => {
                warn!(
                    "proxy bootstrap timed out after {:?}",
                    self.config.bootstrap_timeout
                );
                *self.state.write() = ProxyState::Failed;
                None
            }
        }
    }

    async fn bootstrap(&self, api_port: u16, p2p_port: u16) -> Result<CreatedService, NetError> {
        let stream = TcpStream::connect(&self.config.control_addr)
            .await
            .map_err(|e| {
                NetError::Control(format!(
                    "control port {} unreachable: {} (is the proxy daemon running?)",
                    self.config.control_addr, e
                ))
            })?;
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        let mut writer = write_half;

        authenticate(&mut reader, &mut writer, &self.config).await?;

        // Reusing a persisted key keeps the published address stable
        // across restarts.
        let key_path = key_file_path(&self.config.data_dir);
        let existing_key = match tokio::fs::read_to_string(&key_path).await {
            Ok(key) if !key.trim().is_empty() => Some(key.trim().to_string()),
            _ => None,
        };

        let key_spec = match &existing_key {
            Some(key) => format!("ED25519-V3:{}", key),
            None => "NEW:ED25519-V3".to_string(),
        };
        let flags = if existing_key.is_some() {
            "Flags=Detach,DiscardPK"
        } else {
            "Flags=Detach"
        };
        let command = format!(
            "ADD_ONION {} {} Port={},127.0.0.1:{} Port={},127.0.0.1:{}",
            key_spec, flags, api_port, api_port, p2p_port, p2p_port
        );

        let response = send_command(&mut reader, &mut writer, &command).await?;

        let mut service_id = String::new();
        let mut private_key = existing_key.unwrap_or_default();
        for line in &response {
            if let Some(id) = line.strip_prefix("250-ServiceID=") {
                service_id = id.to_string();
            } else if let Some(key) = line.strip_prefix("250-PrivateKey=ED25519-V3:") {
                private_key = key.to_string();
            }
        }
        if service_id.is_empty() {
            return Err(NetError::Control(format!(
                "no ServiceID in reply: {:?}",
                response
            )));
        }

        if !private_key.is_empty() {
            tokio::fs::create_dir_all(&self.config.data_dir).await?;
            tokio::fs::write(&key_path, &private_key).await?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = std::fs::Permissions::from_mode(0o600);
                if let Err(e) = std::fs::set_permissions(&key_path, perms) {
                    warn!("could not restrict key file permissions: {}", e);
                }
            }
        }

        let onion_address = format!("{}.onion", service_id);
        let _ = tokio::fs::write(onion_file_path(&self.config.data_dir), &onion_address).await;

        Ok(CreatedService {
            onion_address,
            service_id,
        })
    }

    /// Tear the service down. Safe to call when already stopped.
    pub async fn stop(&self) {
        let service_id = self.service_id.write().take();
        *self.onion.write() = None;

        if let Some(id) = service_id {
            if let Err(e) = self.remove_service(&id).await {
                warn!("hidden service removal failed (proxy may be down): {}", e);
            } else {
                info!("hidden service {} removed", id);
            }
        }
        *self.state.write() = ProxyState::Idle;
    }

    async fn remove_service(&self, service_id: &str) -> Result<(), NetError> {
        let stream = TcpStream::connect(&self.config.control_addr)
            .await
            .map_err(|e| NetError::Control(format!("control port unreachable: {}", e)))?;
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        let mut writer = write_half;

        authenticate(&mut reader, &mut writer, &self.config).await?;
        let id = service_id.trim_end_matches(".onion");
        send_command(&mut reader, &mut writer, &format!("DEL_ONION {}", id)).await?;
        Ok(())
    }
}

/// Reachability probe for the control port. Does not authenticate.
pub async fn is_control_port_available(addr: &str) -> bool {
    matches!(
        tokio::time::timeout(Duration::from_secs(1), TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

#[async_trait]
impl TransportProvider for ProxySession {
    async fn start_hidden_service(
        &self,
        api_port: u16,
        p2p_port: u16,
    ) -> anyhow::Result<Option<String>> {
        Ok(self.start_with_hidden_service(api_port, p2p_port).await)
    }

    async fn stop(&self) {
        ProxySession::stop(self).await;
    }

    fn socks_endpoint(&self) -> Option<String> {
        if self.is_running() {
            Some(self.config.socks_addr.clone())
        } else {
            None
        }
    }
}
