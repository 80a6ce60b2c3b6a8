use crate::cache::Cache;
use crate::listener::{decode_nft_transfer, transfer_topic0, TxFilter};
use crate::types::{
    addr_eq, addr_key, ErrMsg, NftTxEvent, TokenKind, TxKind, EMPTY_ADDRESS, NFT_TYPE_SUFFIX,
};
use ethers::providers::Middleware;
use ethers::types::{Address, Filter, Log};
use eyre::{eyre, Result};
use std::sync::Arc;
use tokio::sync::mpsc;

/// NFT classifier. Every Transfer is accepted; the kind distinguishes mints
/// (from the zero address), imports into the watched wallet, and everything
/// else.
pub struct NftTarget {
    wallet_addr: String,
}

impl NftTarget {
    pub fn new(wallet_addr: String) -> Self {
        Self { wallet_addr }
    }
}

impl TxFilter for NftTarget {
    fn accept(&self, from_addr: &str, to_addr: &str) -> Option<TxKind> {
        if addr_eq(EMPTY_ADDRESS, from_addr) {
            return Some(TxKind::NftMint);
        }
        if addr_eq(&self.wallet_addr, to_addr) {
            return Some(TxKind::NftImport);
        }
        Some(TxKind::NftTransfer)
    }
}

/// Log-filter listener for the game NFT collection.
///
/// Besides emitting events, it invalidates the cached per-address NFT entries
/// for both sides of a transfer so the read API re-fetches ownership.
pub struct NftListener<M> {
    target: NftTarget,
    contract_addr: Address,
    token_kind: TokenKind,
    client: Arc<M>,
    cache: Cache,
    nft_notify: mpsc::Sender<NftTxEvent>,
    error_handle: mpsc::Sender<ErrMsg>,
}

impl<M: Middleware + 'static> NftListener<M> {
    pub fn new(
        target: NftTarget,
        contract_addr: Address,
        client: Arc<M>,
        cache: Cache,
        nft_notify: mpsc::Sender<NftTxEvent>,
        error_handle: mpsc::Sender<ErrMsg>,
    ) -> Self {
        Self {
            target,
            contract_addr,
            token_kind: TokenKind::GameNft,
            client,
            cache,
            nft_notify,
            error_handle,
        }
    }

    pub async fn watch_new_blocks(self: Arc<Self>, mut new_block_notify: mpsc::Receiver<u64>) {
        while let Some(height) = new_block_notify.recv().await {
            let _ = self.handle_past_block(height, height).await;
        }
    }

    pub async fn handle_past_block(&self, from: u64, to: u64) -> Result<()> {
        tracing::info!(from, to, "nft past event filter");
        let filter = Filter::new()
            .address(self.contract_addr)
            .from_block(from)
            .to_block(to);
        let logs = match self.client.get_logs(&filter).await {
            Ok(logs) => logs,
            Err(err) => {
                tracing::error!(from, to, error = %err, "nft log filter err");
                let _ = self
                    .error_handle
                    .send(ErrMsg {
                        kind: self.token_kind,
                        from,
                        to,
                    })
                    .await;
                return Err(eyre!("nft log filter err: {err}"));
            }
        };

        let topic0 = transfer_topic0();
        for log in logs {
            if log.topics.first() != Some(&topic0) {
                continue;
            }
            let block_num = log.block_number.map(|b| b.as_u64()).unwrap_or(from);
            if let Err(err) = self.process_transfer(&log, block_num).await {
                tracing::error!(block_num, error = %err, "nft transfer handling err");
                let _ = self
                    .error_handle
                    .send(ErrMsg {
                        kind: self.token_kind,
                        from: block_num,
                        to: block_num,
                    })
                    .await;
            }
        }
        Ok(())
    }

    async fn process_transfer(&self, log: &Log, block_num: u64) -> Result<()> {
        let (from_addr, to_addr, token_id) = decode_nft_transfer(log)?;
        let tx_hash = log.transaction_hash.ok_or_else(|| eyre!("log missing tx hash"))?;
        let receipt = self
            .client
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| eyre!("txReceipt {:?} err: {e}", tx_hash))?
            .ok_or_else(|| eyre!("receipt {:?} not found", tx_hash))?;
        let block = self
            .client
            .get_block(block_num)
            .await
            .map_err(|e| eyre!("blockByNumber {block_num} err: {e}"))?
            .ok_or_else(|| eyre!("block {block_num} not found"))?;

        // kind is always assigned for NFT transfers
        let kind = self
            .target
            .accept(&from_addr, &to_addr)
            .unwrap_or(TxKind::NftTransfer);

        // ownership moved; stale per-address entries must not be served
        for addr in [&from_addr, &to_addr] {
            let key = format!("{}{}", addr_key(addr), NFT_TYPE_SUFFIX);
            if let Err(err) = self.cache.del(&key).await {
                tracing::warn!(addr = %addr, error = %err, "nft cache invalidate err");
            }
        }

        let event = NftTxEvent {
            from: from_addr,
            to: to_addr,
            tx_type: kind,
            tx_hash: format!("{:?}", tx_hash),
            status: receipt.status.unwrap_or_default().as_u64(),
            pay_time: (block.timestamp.as_u64() * 1000) as i64,
            token_id,
        };
        let _ = self.nft_notify.send(event).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::decode_nft_transfer;
    use crate::listener::test_util::nft_transfer_log;

    const WALLET: &str = "0x9999999999999999999999999999999999999999";
    const USER: &str = "0x1111111111111111111111111111111111111111";
    const OTHER: &str = "0x2222222222222222222222222222222222222222";

    fn target() -> NftTarget {
        NftTarget::new(WALLET.into())
    }

    #[test]
    fn mint_wins_over_import() {
        // a mint directly into the watched wallet is still a mint
        assert_eq!(target().accept(EMPTY_ADDRESS, WALLET), Some(TxKind::NftMint));
    }

    #[test]
    fn transfer_into_wallet_is_an_import() {
        assert_eq!(target().accept(USER, WALLET), Some(TxKind::NftImport));
    }

    #[test]
    fn every_other_transfer_is_accepted_as_transfer() {
        assert_eq!(target().accept(USER, OTHER), Some(TxKind::NftTransfer));
        assert_eq!(target().accept(WALLET, USER), Some(TxKind::NftTransfer));
    }

    #[test]
    fn mint_log_classifies_from_decoded_addresses() {
        let log = nft_transfer_log(EMPTY_ADDRESS, USER, 7);
        let (from, to, token_id) = decode_nft_transfer(&log).unwrap();
        assert_eq!(token_id, 7);
        assert_eq!(target().accept(&from, &to), Some(TxKind::NftMint));
    }

    #[test]
    fn invalidation_key_matches_read_api_key() {
        // decoded logs carry checksummed addresses while clients query in
        // arbitrary case; both must resolve to the same cache key
        let checksummed = crate::listener::addr_hex(
            "0x8ba1f109551bD432803012645Ac136ddd64DBA72".parse().unwrap(),
        );
        let queried = checksummed.to_lowercase();
        assert_eq!(
            format!("{}{}", addr_key(&checksummed), NFT_TYPE_SUFFIX),
            format!("{}{}", addr_key(&queried), NFT_TYPE_SUFFIX),
        );
    }
}
