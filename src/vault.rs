use crate::listener::{decode_vault_withdraw, withdraw_topic0, TxFilter};
use crate::types::{addr_eq, ErrMsg, NativeTxEvent, TokenKind, TxKind, EMPTY_ADDRESS};
use ethers::providers::Middleware;
use ethers::types::{Address, Filter, Log};
use eyre::{eyre, Result};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Vault classifier: only withdraws initiated by the watched wallet count,
/// and only for the native token (the vault tags those with the zero address).
pub struct VaultTarget {
    wallet_addr: String,
}

impl VaultTarget {
    pub fn new(wallet_addr: String) -> Self {
        Self { wallet_addr }
    }
}

impl TxFilter for VaultTarget {
    fn accept(&self, from_addr: &str, _to_addr: &str) -> Option<TxKind> {
        if addr_eq(&self.wallet_addr, from_addr) {
            return Some(TxKind::NativeWithdraw);
        }
        None
    }
}

/// Log-filter listener for the game vault's `Withdraw` events.
pub struct VaultListener<M> {
    target: VaultTarget,
    contract_addr: Address,
    token_kind: TokenKind,
    client: Arc<M>,
    native_notify: mpsc::Sender<NativeTxEvent>,
    error_handle: mpsc::Sender<ErrMsg>,
}

impl<M: Middleware + 'static> VaultListener<M> {
    pub fn new(
        target: VaultTarget,
        contract_addr: Address,
        client: Arc<M>,
        native_notify: mpsc::Sender<NativeTxEvent>,
        error_handle: mpsc::Sender<ErrMsg>,
    ) -> Self {
        Self {
            target,
            contract_addr,
            token_kind: TokenKind::GameVault,
            client,
            native_notify,
            error_handle,
        }
    }

    pub async fn watch_new_blocks(self: Arc<Self>, mut new_block_notify: mpsc::Receiver<u64>) {
        while let Some(height) = new_block_notify.recv().await {
            let _ = self.handle_past_block(height, height).await;
        }
    }

    pub async fn handle_past_block(&self, from: u64, to: u64) -> Result<()> {
        tracing::info!(kind = %self.token_kind, from, to, "vault past event filter");
        let filter = Filter::new()
            .address(self.contract_addr)
            .from_block(from)
            .to_block(to);
        let logs = match self.client.get_logs(&filter).await {
            Ok(logs) => logs,
            Err(err) => {
                tracing::error!(from, to, error = %err, "vault log filter err");
                let _ = self
                    .error_handle
                    .send(ErrMsg {
                        kind: self.token_kind,
                        from,
                        to,
                    })
                    .await;
                return Err(eyre!("vault log filter err: {err}"));
            }
        };

        let topic0 = withdraw_topic0();
        for log in logs {
            if log.topics.first() != Some(&topic0) {
                continue;
            }
            let block_num = log.block_number.map(|b| b.as_u64()).unwrap_or(from);
            if let Err(err) = self.process_withdraw(&log, block_num).await {
                tracing::error!(block_num, error = %err, "vault withdraw handling err");
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

    async fn process_withdraw(&self, log: &Log, block_num: u64) -> Result<()> {
        let (token, from_addr, to_addr, amount) = decode_vault_withdraw(log)?;
        // only the native-withdraw case; token withdraws already surface as
        // Transfer events on their own contracts
        if !addr_eq(&token, EMPTY_ADDRESS) {
            return Ok(());
        }
        let Some(kind) = self.target.accept(&from_addr, &to_addr) else {
            return Ok(());
        };
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

        let event = NativeTxEvent {
            from: from_addr,
            to: to_addr,
            tx_type: kind,
            tx_hash: format!("{:?}", tx_hash),
            status: receipt.status.unwrap_or_default().as_u64(),
            pay_time: (block.timestamp.as_u64() * 1000) as i64,
            amount: amount.to_string(),
        };
        let _ = self.native_notify.send(event).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::decode_vault_withdraw;
    use crate::listener::test_util::withdraw_log;

    const WALLET: &str = "0x9999999999999999999999999999999999999999";
    const USER: &str = "0x1111111111111111111111111111111111111111";

    #[test]
    fn withdraw_from_wallet_is_a_native_withdraw() {
        let t = VaultTarget::new(WALLET.into());
        assert_eq!(t.accept(WALLET, USER), Some(TxKind::NativeWithdraw));
    }

    #[test]
    fn withdraw_from_anyone_else_is_rejected() {
        let t = VaultTarget::new(WALLET.into());
        assert_eq!(t.accept(USER, WALLET), None);
    }

    #[test]
    fn non_native_token_marker_is_ignored() {
        // the listener drops Withdraw events whose token is not the zero
        // address before classification
        let log = withdraw_log(USER, WALLET, USER, 5);
        let (token, _, _, _) = decode_vault_withdraw(&log).unwrap();
        assert!(!addr_eq(&token, EMPTY_ADDRESS));
    }
}
