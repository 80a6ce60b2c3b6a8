use eyre::{eyre, Result};
use serde::Deserialize;
use std::{fs, path::Path};

/// Service configuration, loaded from a TOML file at startup.
///
/// A missing or unparseable file is fatal: every component downstream assumes
/// these addresses are present and well-formed.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub chain: Chain,
    pub bscscan: BscScan,
    pub moralis: Moralis,
    pub redis: Redis,
    pub kafka: Kafka,
    pub contract: Contract,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chain {
    /// WebSocket JSON-RPC endpoint; used for the head subscription and all reads.
    pub node_address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BscScan {
    pub api_key: String,
    pub url_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Moralis {
    pub x_api_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Redis {
    pub address: String,
    #[serde(default)]
    pub password: String,
    /// Suffixes the cursor key so instances can share one redis.
    #[serde(default)]
    pub machine_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Kafka {
    pub address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Contract {
    pub game_nft_address: String,
    pub governance_token_address: String,
    pub game_token_address: String,
    pub game_vault_address: String,
    pub usdc_address: String,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|e| eyre!("failed to read config {}: {e}", path.display()))?;
        let cfg: Config = toml::from_str(&raw)
            .map_err(|e| eyre!("failed to parse config {}: {e}", path.display()))?;

        if cfg.chain.node_address.trim().is_empty() {
            return Err(eyre!("chain.node_address is empty"));
        }
        if cfg.bscscan.url_prefix.trim().is_empty() {
            return Err(eyre!("bscscan.url_prefix is empty"));
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [chain]
        node_address = "wss://bsc-ws-node.example:443"

        [bscscan]
        api_key = "KEY"
        url_prefix = "https://api.bscscan.com/api"

        [moralis]
        x_api_key = "MKEY"

        [redis]
        address = "127.0.0.1:6379"
        password = ""
        machine_id = "01"

        [kafka]
        address = "127.0.0.1:9092"

        [contract]
        game_nft_address = "0x0000000000000000000000000000000000000001"
        governance_token_address = "0x0000000000000000000000000000000000000002"
        game_token_address = "0x0000000000000000000000000000000000000003"
        game_vault_address = "0x0000000000000000000000000000000000000004"
        usdc_address = "0x0000000000000000000000000000000000000005"
    "#;

    #[test]
    fn parses_full_config() {
        let cfg: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(cfg.chain.node_address, "wss://bsc-ws-node.example:443");
        assert_eq!(cfg.redis.machine_id, "01");
        assert_eq!(
            cfg.contract.game_vault_address,
            "0x0000000000000000000000000000000000000004"
        );
    }

    #[test]
    fn missing_section_is_an_error() {
        let broken = SAMPLE.replace("[kafka]", "[kafkaa]");
        assert!(toml::from_str::<Config>(&broken).is_err());
    }
}
