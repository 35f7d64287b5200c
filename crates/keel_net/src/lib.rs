pub mod endpoint;
pub mod proxy;
pub mod rest;
pub mod wallet;

use std::time::Duration;

pub use endpoint::EndpointSelector;
pub use proxy::{ProxyConfig, ProxySession};
pub use rest::{DashboardGateway, RestClient};
pub use wallet::WalletSigner;

/// Errors raised by the network layer.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("http transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid proxy endpoint {0:?}")]
    BadProxy(String),
    #[error("no usable endpoint (all candidates excluded or down)")]
    NoEndpoint,
    #[error("target rejected request: {0}")]
    Rejected(String),
    #[error("proxy control protocol: {0}")]
    Control(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Builds the HTTP client every outbound call goes through.
///
/// With a SOCKS endpoint the scheme is socks5h so hostname resolution
/// (including .onion) happens on the proxy side, never locally.
pub fn build_client(socks_endpoint: Option<&str>, timeout: Duration) -> Result<reqwest::Client, NetError> {
    let mut builder = reqwest::Client::builder()
        .user_agent(concat!("keel/", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10));

    if let Some(addr) = socks_endpoint {
        let url = if addr.contains("://") {
            addr.to_string()
        } else {
            format!("socks5h://{}", addr)
        };
        let proxy = reqwest::Proxy::all(&url).map_err(|_| NetError::BadProxy(url))?;
        builder = builder.proxy(proxy);
    }

    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_client_without_proxy() {
        assert!(build_client(None, Duration::from_secs(30)).is_ok());
    }

    #[test]
    fn build_client_with_bare_socks_addr() {
        assert!(build_client(Some("127.0.0.1:9050"), Duration::from_secs(30)).is_ok());
    }

    #[test]
    fn build_client_with_schemed_socks_addr() {
        assert!(build_client(Some("socks5h://127.0.0.1:9050"), Duration::from_secs(30)).is_ok());
    }
}
