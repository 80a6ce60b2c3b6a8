use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of blocks behind the tip considered safely immutable on BSC.
pub const BLOCK_CONFIRM_HEIGHT: u64 = 3;

/// The zero address, used by mints and by the vault's native-withdraw marker.
pub const EMPTY_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

/// Cursor key prefix; the configured machine id is appended so multiple
/// instances can share one redis without clobbering each other's cursor.
pub const BLOCK_NUM_KEY: &str = "blockNum";

pub const NATIVE_TX_RECORD_SUFFIX: &str = "_native_tx_record";
pub const ERC20_TX_RECORD_SUFFIX: &str = "_erc20_tx_record";
pub const NFT_TYPE_SUFFIX: &str = "_nft_type";

pub const NEW_BLOCK_TOPIC: &str = "newBlock";

pub const NATIVE_TX_KAFKA_TOPIC: &str = "native_tx_event";
pub const NFT_TX_KAFKA_TOPIC: &str = "nft_tx_event";

/// The contracts (plus the gas token) this service watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Native,
    GovernanceToken,
    GameToken,
    Usdc,
    GameVault,
    GameNft,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TokenKind::Native => "native",
            TokenKind::GovernanceToken => "governanceToken",
            TokenKind::GameToken => "gameToken",
            TokenKind::Usdc => "usdc",
            TokenKind::GameVault => "gameVault",
            TokenKind::GameNft => "gameNft",
        };
        f.write_str(s)
    }
}

/// Closed enumeration of domain event kinds consumed by the game backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TxKind {
    NativeRecharge,
    NativeWithdraw,
    GovRecharge,
    GovWithdraw,
    GameRecharge,
    GameWithdraw,
    UsdcRecharge,
    UsdcWithdraw,
    NftMint,
    NftImport,
    NftTransfer,
}

/// A credit/debit of the watched wallet in the gas token or a fungible token.
///
/// `amount` is the raw token value as a base-10 string; `payTime` is the block
/// timestamp in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeTxEvent {
    pub from: String,
    pub to: String,
    pub tx_type: TxKind,
    pub tx_hash: String,
    pub status: u64,
    pub pay_time: i64,
    pub amount: String,
}

/// A movement of one NFT in the watched collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NftTxEvent {
    pub from: String,
    pub to: String,
    pub tx_type: TxKind,
    pub tx_hash: String,
    pub status: u64,
    pub pay_time: i64,
    pub token_id: u64,
}

/// A failed height range, queued for the retry driver.
#[derive(Debug, Clone, Copy)]
pub struct ErrMsg {
    pub kind: TokenKind,
    pub from: u64,
    pub to: u64,
}

/// Case-insensitive 0x-hex address comparison.
pub fn addr_eq(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Canonical form of an address used in cache keys. Query parameters arrive
/// in whatever case the client sent and log decoding produces checksummed
/// strings; both must land on the same key or invalidation misses.
pub fn addr_key(addr: &str) -> String {
    addr.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_eq_ignores_case() {
        assert!(addr_eq(
            "0xAbCd000000000000000000000000000000000001",
            "0xabcd000000000000000000000000000000000001"
        ));
        assert!(!addr_eq(EMPTY_ADDRESS, "0xabcd000000000000000000000000000000000001"));
    }

    #[test]
    fn addr_key_collapses_case_variants() {
        let checksummed = "0x8ba1f109551bD432803012645Ac136ddd64DBA72";
        assert_eq!(addr_key(checksummed), addr_key(&checksummed.to_uppercase().replace("0X", "0x")));
        assert_eq!(addr_key(checksummed), "0x8ba1f109551bd432803012645ac136ddd64dba72");
    }

    #[test]
    fn tx_kind_serializes_camel_case() {
        assert_eq!(
            serde_json::to_string(&TxKind::NativeRecharge).unwrap(),
            "\"nativeRecharge\""
        );
        assert_eq!(serde_json::to_string(&TxKind::NftMint).unwrap(), "\"nftMint\"");
    }
}
