use crate::bus::EventBus;
use crate::cache::Cache;
use crate::listener::{addr_hex, TxFilter};
use crate::types::{addr_eq, ErrMsg, NativeTxEvent, TokenKind, TxKind, NEW_BLOCK_TOPIC};
use ethers::providers::{Middleware, PubsubClient};
use ethers::types::Transaction;
use eyre::{eyre, Result};
use futures::{stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Concurrent heights while replaying a past range. Full-block scans are the
/// heaviest RPC path, so the replay throttles itself.
const REPLAY_CONCURRENCY: usize = 30;

/// Gas-token credits: only transfers *into* the watched wallet count.
/// Native withdraws are observed through the vault contract instead.
pub struct NativeTarget {
    wallet_addr: String,
}

impl NativeTarget {
    pub fn new(wallet_addr: String) -> Self {
        Self { wallet_addr }
    }
}

impl TxFilter for NativeTarget {
    fn accept(&self, _from_addr: &str, to_addr: &str) -> Option<TxKind> {
        if addr_eq(&self.wallet_addr, to_addr) {
            return Some(TxKind::NativeRecharge);
        }
        None
    }
}

/// Watches the chain head and scans full blocks for native transfers.
///
/// This listener doubles as the block follower: it is the only component that
/// advances the persisted cursor once catch-up has finished, and it publishes
/// every confirmed height on the new-block topic for the log-filter listeners.
pub struct NativeListener<M> {
    target: NativeTarget,
    client: Arc<M>,
    cache: Cache,
    bus: Arc<EventBus>,
    confirm_height: u64,
    native_notify: mpsc::Sender<NativeTxEvent>,
    error_handle: mpsc::Sender<ErrMsg>,
}

impl<M: Middleware + 'static> NativeListener<M> {
    pub fn new(
        target: NativeTarget,
        client: Arc<M>,
        cache: Cache,
        bus: Arc<EventBus>,
        confirm_height: u64,
        native_notify: mpsc::Sender<NativeTxEvent>,
        error_handle: mpsc::Sender<ErrMsg>,
    ) -> Self {
        Self {
            target,
            client,
            cache,
            bus,
            confirm_height,
            native_notify,
            error_handle,
        }
    }

    /// Replay `[from, to]`, throttled; failed heights land on the error
    /// channel and come back through the retry driver.
    pub async fn handle_past_block(&self, from: u64, to: u64) -> Result<()> {
        stream::iter(from..=to)
            .for_each_concurrent(REPLAY_CONCURRENCY, |height| async move {
                if let Err(err) = self.single_block_filter(height).await {
                    tracing::error!(height, error = %err, "native past block scan failed");
                    let _ = self
                        .error_handle
                        .send(ErrMsg {
                            kind: TokenKind::Native,
                            from: height,
                            to: height,
                        })
                        .await;
                }
            })
            .await;
        Ok(())
    }

    /// Scan one confirmed block's transactions and emit accepted transfers.
    pub async fn single_block_filter(&self, height: u64) -> Result<()> {
        let block = self
            .client
            .get_block_with_txs(height)
            .await
            .map_err(|e| eyre!("blockByNumber {height} err: {e}"))?
            .ok_or_else(|| eyre!("block {height} not found"))?;
        tracing::info!(height, txs = block.transactions.len(), "native block scan");

        for tx in &block.transactions {
            let Some((from, to, kind)) = classify_native_tx(&self.target, tx) else {
                continue;
            };
            let receipt = self
                .client
                .get_transaction_receipt(tx.hash)
                .await
                .map_err(|e| eyre!("txReceipt {:?} err: {e}", tx.hash))?
                .ok_or_else(|| eyre!("receipt {:?} not found", tx.hash))?;
            let event = NativeTxEvent {
                from,
                to,
                tx_type: kind,
                tx_hash: format!("{:?}", tx.hash),
                status: receipt.status.unwrap_or_default().as_u64(),
                pay_time: (block.timestamp.as_u64() * 1000) as i64,
                amount: tx.value.to_string(),
            };
            let _ = self.native_notify.send(event).await;
        }
        Ok(())
    }
}

impl<M> NativeListener<M>
where
    M: Middleware + 'static,
    M::Provider: PubsubClient,
{
    /// Follow the chain head until process exit.
    ///
    /// For each head H the confirmed height is h = H − K. Gaps between the
    /// persisted cursor and h are reconciled twice over: an error record per
    /// missing height re-drives the native scan, and the height is published
    /// on the bus so the log-filter listeners see it too.
    pub async fn watch_heads(self: Arc<Self>) {
        loop {
            let mut stream = match self.client.subscribe_blocks().await {
                Ok(s) => s,
                Err(err) => {
                    tracing::error!(error = %err, "new head subscribe err");
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    continue;
                }
            };
            while let Some(head) = stream.next().await {
                let Some(number) = head.number else {
                    continue;
                };
                self.process_head(number.as_u64()).await;
            }
            tracing::error!("new head subscription ended; resubscribing");
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    async fn process_head(&self, head: u64) {
        let height = head.saturating_sub(self.confirm_height);

        let cursor = match self.cache.block_cursor().await {
            Ok(c) => c,
            Err(err) => {
                tracing::error!(error = %err, "query cache blockNum err");
                return;
            }
        };

        // Head gaps are tolerated: every height the subscription skipped is
        // re-driven as a native error record and published for the others.
        if let Some(gap) = cursor.and_then(|c| gap_range(c, height)) {
            for missing in gap {
                tracing::info!(height = missing, "ws node gap; re-driving height");
                let _ = self
                    .error_handle
                    .send(ErrMsg {
                        kind: TokenKind::Native,
                        from: missing,
                        to: missing,
                    })
                    .await;
                self.bus.publish(NEW_BLOCK_TOPIC, missing);
            }
        }

        self.bus.publish(NEW_BLOCK_TOPIC, height);
        tracing::info!(block = head, height, "new block");

        if let Err(err) = self.single_block_filter(height).await {
            tracing::error!(height, error = %err, "native block scan failed");
            let _ = self
                .error_handle
                .send(ErrMsg {
                    kind: TokenKind::Native,
                    from: height,
                    to: height,
                })
                .await;
            // cursor stays put; the retry driver owns this height now
            return;
        }

        if let Err(err) = self.cache.set_block_cursor(height).await {
            tracing::error!(height, error = %err, "persist blockNum err");
            return;
        }
        tracing::info!(height, "native listen new block finished");
    }
}

/// Heights the head subscription skipped: everything from the persisted
/// cursor up to (not including) the new confirmed height. The cursor height
/// itself is re-driven; replays are idempotent downstream.
fn gap_range(cursor: u64, height: u64) -> Option<std::ops::Range<u64>> {
    if height > cursor + 1 {
        Some(cursor..height)
    } else {
        None
    }
}

/// Skip contract creations and zero-value transfers, then classify. The
/// sender is recovered from the transaction signature; when recovery fails
/// the from side is left empty, which can still classify as a recharge.
fn classify_native_tx(target: &NativeTarget, tx: &Transaction) -> Option<(String, String, TxKind)> {
    let to = tx.to?;
    if tx.value.is_zero() {
        return None;
    }
    let from = tx.recover_from().map(addr_hex).unwrap_or_default();
    let to = addr_hex(to);
    let kind = target.accept(&from, &to)?;
    Some((from, to, kind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::{Address, U256};

    const WALLET: &str = "0x9999999999999999999999999999999999999999";

    fn target() -> NativeTarget {
        NativeTarget::new(WALLET.to_string())
    }

    #[test]
    fn accepts_only_transfers_to_the_wallet() {
        let t = target();
        assert_eq!(
            t.accept("0x1", "0x9999999999999999999999999999999999999999"),
            Some(TxKind::NativeRecharge)
        );
        assert_eq!(t.accept("0x1", "0x1111111111111111111111111111111111111111"), None);
        assert_eq!(t.accept(WALLET, "0x1"), None, "outbound native is the vault's job");
    }

    #[test]
    fn case_is_ignored_in_the_address_body() {
        let t = NativeTarget::new("0xAbCd000000000000000000000000000000000001".into());
        assert_eq!(
            t.accept("0x1", "0xabcd000000000000000000000000000000000001"),
            Some(TxKind::NativeRecharge)
        );
    }

    #[test]
    fn contract_creation_is_skipped() {
        let tx = Transaction {
            value: U256::from(42u64),
            to: None,
            ..Default::default()
        };
        assert!(classify_native_tx(&target(), &tx).is_none());
    }

    #[test]
    fn zero_value_transfer_is_skipped() {
        let tx = Transaction {
            value: U256::zero(),
            to: Some(WALLET.parse::<Address>().unwrap()),
            ..Default::default()
        };
        assert!(classify_native_tx(&target(), &tx).is_none());
    }

    #[test]
    fn transfer_to_wallet_is_a_recharge() {
        let tx = Transaction {
            value: U256::from(42u64),
            to: Some(WALLET.parse::<Address>().unwrap()),
            ..Default::default()
        };
        let (_, to, kind) = classify_native_tx(&target(), &tx).unwrap();
        assert!(addr_eq(&to, WALLET));
        assert_eq!(kind, TxKind::NativeRecharge);
    }

    #[test]
    fn transfer_elsewhere_is_rejected() {
        let tx = Transaction {
            value: U256::from(42u64),
            to: Some("0x1111111111111111111111111111111111111111".parse().unwrap()),
            ..Default::default()
        };
        assert!(classify_native_tx(&target(), &tx).is_none());
    }

    #[test]
    fn gap_covers_cursor_through_height_exclusive() {
        // cursor 990, confirmed height 997: seven heights are re-driven
        let gap = gap_range(990, 997).unwrap();
        assert_eq!(gap.clone().count(), 7);
        assert_eq!(gap.start, 990);
        assert_eq!(gap.end, 997);
    }

    #[test]
    fn contiguous_heads_produce_no_gap() {
        assert!(gap_range(996, 997).is_none());
        assert!(gap_range(997, 997).is_none());
        assert!(gap_range(997, 996).is_none());
    }
}
