use ethers::types::{Address, Log, H256, U256};
use ethers::utils::{keccak256, to_checksum};
use eyre::{eyre, Result};

use crate::types::TxKind;

/// Per-contract accept/reject and event-kind assignment. Pure function of the
/// watched wallet and the (from, to) pair; comparisons are case-insensitive.
pub trait TxFilter {
    fn accept(&self, from_addr: &str, to_addr: &str) -> Option<TxKind>;
}

/// topic0 of `Transfer(address,address,uint256)` (ERC20 and ERC721).
pub fn transfer_topic0() -> H256 {
    H256::from(keccak256("Transfer(address,address,uint256)"))
}

/// topic0 of the vault's `Withdraw(address,address,address,uint256)`.
pub fn withdraw_topic0() -> H256 {
    H256::from(keccak256("Withdraw(address,address,address,uint256)"))
}

/// EIP-55 string form, matching what the rest of the pipeline compares and
/// publishes.
pub fn addr_hex(addr: Address) -> String {
    to_checksum(&addr, None)
}

fn topic_addr(topic: &H256) -> Address {
    Address::from_slice(&topic.as_bytes()[12..])
}

/// Decoded fungible `Transfer`: indexed from/to, amount in data.
pub fn decode_erc20_transfer(log: &Log) -> Result<(String, String, U256)> {
    if log.topics.len() < 3 {
        return Err(eyre!("transfer log has {} topics", log.topics.len()));
    }
    if log.data.len() < 32 {
        return Err(eyre!("transfer log data too short: {}", log.data.len()));
    }
    let from = addr_hex(topic_addr(&log.topics[1]));
    let to = addr_hex(topic_addr(&log.topics[2]));
    let amount = U256::from_big_endian(&log.data[..32]);
    Ok((from, to, amount))
}

/// Decoded NFT `Transfer`: all three parameters indexed, tokenId in topics[3].
pub fn decode_nft_transfer(log: &Log) -> Result<(String, String, u64)> {
    if log.topics.len() < 4 {
        return Err(eyre!("nft transfer log has {} topics", log.topics.len()));
    }
    let from = addr_hex(topic_addr(&log.topics[1]));
    let to = addr_hex(topic_addr(&log.topics[2]));
    let token_id = U256::from_big_endian(log.topics[3].as_bytes()).low_u64();
    Ok((from, to, token_id))
}

/// Decoded vault `Withdraw`: (token, from, to, amount), all in data.
pub fn decode_vault_withdraw(log: &Log) -> Result<(String, String, String, U256)> {
    if log.data.len() < 128 {
        return Err(eyre!("withdraw log data too short: {}", log.data.len()));
    }
    let word = |i: usize| &log.data[i * 32..(i + 1) * 32];
    let token = addr_hex(Address::from_slice(&word(0)[12..]));
    let from = addr_hex(Address::from_slice(&word(1)[12..]));
    let to = addr_hex(Address::from_slice(&word(2)[12..]));
    let amount = U256::from_big_endian(word(3));
    Ok((token, from, to, amount))
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use ethers::types::Bytes;

    pub fn addr_topic(addr: &str) -> H256 {
        let a: Address = addr.parse().unwrap();
        H256::from(a)
    }

    pub fn u256_word(v: u64) -> [u8; 32] {
        let mut w = [0u8; 32];
        U256::from(v).to_big_endian(&mut w);
        w
    }

    pub fn transfer_log(from: &str, to: &str, amount: u64) -> Log {
        Log {
            topics: vec![transfer_topic0(), addr_topic(from), addr_topic(to)],
            data: Bytes::from(u256_word(amount).to_vec()),
            ..Default::default()
        }
    }

    pub fn nft_transfer_log(from: &str, to: &str, token_id: u64) -> Log {
        Log {
            topics: vec![
                transfer_topic0(),
                addr_topic(from),
                addr_topic(to),
                H256::from_low_u64_be(token_id),
            ],
            ..Default::default()
        }
    }

    pub fn withdraw_log(token: &str, from: &str, to: &str, amount: u64) -> Log {
        let mut data = Vec::with_capacity(128);
        data.extend_from_slice(addr_topic(token).as_bytes());
        data.extend_from_slice(addr_topic(from).as_bytes());
        data.extend_from_slice(addr_topic(to).as_bytes());
        data.extend_from_slice(&u256_word(amount));
        Log {
            topics: vec![withdraw_topic0()],
            data: Bytes::from(data),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;
    use crate::types::addr_eq;

    const ALICE: &str = "0x1111111111111111111111111111111111111111";
    const BOB: &str = "0x2222222222222222222222222222222222222222";

    #[test]
    fn transfer_topic_matches_known_hash() {
        assert_eq!(
            format!("{:?}", transfer_topic0()),
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
    }

    #[test]
    fn decodes_erc20_transfer() {
        let log = transfer_log(ALICE, BOB, 42);
        let (from, to, amount) = decode_erc20_transfer(&log).unwrap();
        assert!(addr_eq(&from, ALICE));
        assert!(addr_eq(&to, BOB));
        assert_eq!(amount, U256::from(42u64));
    }

    #[test]
    fn short_transfer_data_is_an_error() {
        let mut log = transfer_log(ALICE, BOB, 42);
        log.data = Default::default();
        assert!(decode_erc20_transfer(&log).is_err());
    }

    #[test]
    fn decodes_nft_transfer_token_id() {
        let log = nft_transfer_log(ALICE, BOB, 7);
        let (from, to, token_id) = decode_nft_transfer(&log).unwrap();
        assert!(addr_eq(&from, ALICE));
        assert!(addr_eq(&to, BOB));
        assert_eq!(token_id, 7);
    }

    #[test]
    fn decodes_vault_withdraw() {
        let log = withdraw_log(crate::types::EMPTY_ADDRESS, ALICE, BOB, 99);
        let (token, from, to, amount) = decode_vault_withdraw(&log).unwrap();
        assert!(addr_eq(&token, crate::types::EMPTY_ADDRESS));
        assert!(addr_eq(&from, ALICE));
        assert!(addr_eq(&to, BOB));
        assert_eq!(amount, U256::from(99u64));
    }
}
