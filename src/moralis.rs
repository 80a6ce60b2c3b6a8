use crate::config;
use eyre::Result;
use serde::{Deserialize, Serialize};

const MORALIS_URL_PREFIX: &str = "https://deep-index.moralis.io/api/v2";

/// One NFT held by a wallet, as reported by the Moralis index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NftItem {
    #[serde(default)]
    pub token_address: String,
    #[serde(default)]
    pub token_id: String,
    #[serde(default)]
    pub owner_of: String,
    #[serde(default)]
    pub amount: String,
    #[serde(default)]
    pub contract_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub token_uri: Option<String>,
    #[serde(default)]
    pub metadata: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NftPage {
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    result: Vec<NftItem>,
}

/// Client for the Moralis NFT-by-wallet endpoint, paginated by opaque cursor.
#[derive(Clone)]
pub struct MoralisClient {
    http: reqwest::Client,
    api_key: String,
}

impl MoralisClient {
    pub fn new(cfg: &config::Moralis) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: cfg.x_api_key.clone(),
        }
    }

    /// All NFTs currently held by `wallet_addr` on `network` ("bsc" or
    /// "bsc testnet").
    pub async fn query_wallet_nft(&self, wallet_addr: &str, network: &str) -> Result<Vec<NftItem>> {
        let mut out = Vec::new();
        let mut cursor = String::new();
        loop {
            let page: NftPage = self
                .http
                .get(format!("{}/{}/nft", MORALIS_URL_PREFIX, wallet_addr))
                .header("X-API-Key", &self.api_key)
                .query(&[("chain", network), ("format", "decimal"), ("cursor", &cursor)])
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            out.extend(page.result);
            match page.cursor {
                Some(c) if !c.is_empty() => cursor = c,
                _ => break,
            }
        }
        Ok(out)
    }
}
