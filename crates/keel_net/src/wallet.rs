use crate::NetError;
use async_trait::async_trait;
use keel_traits::Signer;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
struct KeysResponse {
    public_key: String,
    address: String,
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    signature: String,
}

/// Signing capability backed by the wallet daemon's REST surface. Key
/// material never crosses into this process; the daemon signs and we
/// relay hex.
pub struct WalletSigner {
    client: reqwest::Client,
    base_url: String,
    address: String,
    public_key: String,
}

impl WalletSigner {
    /// Fetch the active key identity from the wallet daemon.
    pub async fn connect(client: reqwest::Client, base_url: &str) -> Result<Self, NetError> {
        let url = format!("{}/wallet/keys", base_url.trim_end_matches('/'));
        let keys: KeysResponse = client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            address: keys.address,
            public_key: keys.public_key,
        })
    }
}

#[async_trait]
impl Signer for WalletSigner {
    fn address(&self) -> String {
        self.address.clone()
    }

    fn public_key_hex(&self) -> String {
        self.public_key.clone()
    }

    async fn sign(&self, message: &[u8]) -> anyhow::Result<Vec<u8>> {
        let url = format!("{}/wallet/sign", self.base_url);
        let resp: SignResponse = self
            .client
            .post(&url)
            .json(&json!({ "message": hex::encode(message) }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let signature = hex::decode(resp.signature.trim())
            .map_err(|e| anyhow::anyhow!("wallet returned malformed signature hex: {}", e))?;
        Ok(signature)
    }
}
