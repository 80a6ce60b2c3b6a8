use crate::config;
use eyre::{eyre, Result};
use serde::{Deserialize, Serialize};

/// The explorer replaces the `result` array with a bare string when a key is
/// throttled, so a decode failure of `result` *is* the rate-limit signal. The
/// quotes are part of the sentinel the game backend matches on.
pub const BSC_SCAN_RATE_LIMIT: &str = "\"Max rate limit reached\"";

/// History window for record lookups: 201600 blocks, about 7 days at 3 s
/// blocks. Compatibility constant; do not tune.
pub const TX_RECORD_BLOCK_WINDOW: u64 = 201_600;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BscTxRecord {
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub time_stamp: String,
    #[serde(default)]
    pub block_number: String,
    #[serde(default)]
    pub block_hash: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub input: String,
    #[serde(default, rename = "type")]
    pub tx_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BscRes {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub result: Vec<BscTxRecord>,
}

/// Thin client for the block-explorer account endpoints.
#[derive(Clone)]
pub struct ExplorerClient {
    http: reqwest::Client,
    url_prefix: String,
    api_key: String,
}

impl ExplorerClient {
    pub fn new(cfg: &config::BscScan) -> Self {
        Self {
            http: reqwest::Client::new(),
            url_prefix: cfg.url_prefix.clone(),
            api_key: cfg.api_key.clone(),
        }
    }

    fn native_url(&self, block_num: u64, address: &str) -> String {
        format!(
            "{}?module=account&action=txlist&address={}&startblock={}&endblock={}&offset=10000&page=1&sort=desc&apikey={}",
            self.url_prefix,
            address,
            block_num.saturating_sub(TX_RECORD_BLOCK_WINDOW),
            block_num,
            self.api_key
        )
    }

    fn native_internal_url(&self, block_num: u64, address: &str) -> String {
        format!(
            "{}?module=account&action=txlistinternal&address={}&startblock={}&endblock={}&offset=10000&page=1&sort=desc&apikey={}",
            self.url_prefix,
            address,
            block_num.saturating_sub(TX_RECORD_BLOCK_WINDOW),
            block_num,
            self.api_key
        )
    }

    fn erc20_url(&self, contract_addr: &str, address: &str, block_num: u64) -> String {
        format!(
            "{}?module=account&action=tokentx&address={}&startblock={}&endblock={}&offset=10000&page=1&sort=desc&apikey={}&contractaddress={}",
            self.url_prefix,
            address,
            block_num.saturating_sub(TX_RECORD_BLOCK_WINDOW),
            block_num,
            self.api_key,
            contract_addr
        )
    }

    async fn get(&self, url: String) -> Result<BscRes> {
        let resp = self
            .http
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await?;
        let body = resp.bytes().await?;
        parse_response(&body)
    }

    /// External plus internal native transfers for the trailing window,
    /// appended in that order.
    pub async fn query_native_tx_record(&self, address: &str, block_num: u64) -> Result<BscRes> {
        let mut res = self.get(self.native_url(block_num, address)).await?;
        let internal = self.get(self.native_internal_url(block_num, address)).await?;
        res.result.extend(internal.result);
        Ok(res)
    }

    pub async fn query_erc20_tx_record(
        &self,
        contract_addr: &str,
        address: &str,
        block_num: u64,
    ) -> Result<BscRes> {
        self.get(self.erc20_url(contract_addr, address, block_num)).await
    }
}

fn parse_response(body: &[u8]) -> Result<BscRes> {
    serde_json::from_slice::<BscRes>(body).map_err(|_| eyre!(BSC_SCAN_RATE_LIMIT))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_record_array() {
        let body = br#"{
            "status": "1",
            "message": "OK",
            "result": [
                {"hash":"0xaa","timeStamp":"1700000000","blockNumber":"100",
                 "blockHash":"0xbb","from":"0x1","to":"0x2","value":"42",
                 "input":"0x","type":"call"}
            ]
        }"#;
        let res = parse_response(body).unwrap();
        assert_eq!(res.result.len(), 1);
        assert_eq!(res.result[0].value, "42");
        assert_eq!(res.result[0].tx_type, "call");
    }

    #[test]
    fn string_result_surfaces_as_rate_limited() {
        let body = br#"{"status":"0","message":"NOTOK","result":"Max rate limit reached"}"#;
        let err = parse_response(body).unwrap_err();
        assert_eq!(err.to_string(), BSC_SCAN_RATE_LIMIT);
    }

    #[test]
    fn window_is_clamped_at_genesis() {
        let client = ExplorerClient::new(&crate::config::BscScan {
            api_key: "K".into(),
            url_prefix: "https://api.bscscan.com/api".into(),
        });
        let url = client.native_url(100, "0x1");
        assert!(url.contains("startblock=0&endblock=100"));
    }
}
