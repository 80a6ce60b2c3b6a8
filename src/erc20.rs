use crate::listener::{decode_erc20_transfer, transfer_topic0, TxFilter};
use crate::types::{addr_eq, ErrMsg, NativeTxEvent, TokenKind, TxKind};
use ethers::providers::Middleware;
use ethers::types::{Address, Filter, Log};
use eyre::{eyre, Result};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Fungible-token classifier: credits and debits of the watched wallet, with
/// the event kinds fixed per token at construction.
pub struct Erc20Target {
    wallet_addr: String,
    recharge: TxKind,
    withdraw: TxKind,
}

impl Erc20Target {
    pub fn new(wallet_addr: String, recharge: TxKind, withdraw: TxKind) -> Self {
        Self {
            wallet_addr,
            recharge,
            withdraw,
        }
    }
}

impl TxFilter for Erc20Target {
    fn accept(&self, from_addr: &str, to_addr: &str) -> Option<TxKind> {
        if addr_eq(&self.wallet_addr, to_addr) {
            return Some(self.recharge);
        }
        if addr_eq(&self.wallet_addr, from_addr) {
            return Some(self.withdraw);
        }
        None
    }
}

/// Log-filter listener for one fungible token contract.
pub struct Erc20Listener<M> {
    target: Erc20Target,
    contract_addr: Address,
    token_kind: TokenKind,
    client: Arc<M>,
    native_notify: mpsc::Sender<NativeTxEvent>,
    error_handle: mpsc::Sender<ErrMsg>,
}

impl<M: Middleware + 'static> Erc20Listener<M> {
    pub fn new(
        target: Erc20Target,
        contract_addr: Address,
        token_kind: TokenKind,
        client: Arc<M>,
        native_notify: mpsc::Sender<NativeTxEvent>,
        error_handle: mpsc::Sender<ErrMsg>,
    ) -> Self {
        Self {
            target,
            contract_addr,
            token_kind,
            client,
            native_notify,
            error_handle,
        }
    }

    /// Drain confirmed heights off the bus until process exit.
    pub async fn watch_new_blocks(self: Arc<Self>, mut new_block_notify: mpsc::Receiver<u64>) {
        while let Some(height) = new_block_notify.recv().await {
            let _ = self.handle_past_block(height, height).await;
        }
    }

    /// Filter this contract's logs over `[from, to]` and emit every accepted
    /// transfer. A failed filter call queues the whole range for retry; a
    /// failed log queues just its block and the scan moves on.
    pub async fn handle_past_block(&self, from: u64, to: u64) -> Result<()> {
        tracing::info!(kind = %self.token_kind, from, to, "erc20 past event filter");
        let filter = Filter::new()
            .address(self.contract_addr)
            .from_block(from)
            .to_block(to);
        let logs = match self.client.get_logs(&filter).await {
            Ok(logs) => logs,
            Err(err) => {
                tracing::error!(kind = %self.token_kind, from, to, error = %err, "erc20 log filter err");
                let _ = self
                    .error_handle
                    .send(ErrMsg {
                        kind: self.token_kind,
                        from,
                        to,
                    })
                    .await;
                return Err(eyre!("erc20 log filter err: {err}"));
            }
        };

        let topic0 = transfer_topic0();
        for log in logs {
            if log.topics.first() != Some(&topic0) {
                continue;
            }
            let block_num = log.block_number.map(|b| b.as_u64()).unwrap_or(from);
            if let Err(err) = self.process_transfer(&log, block_num).await {
                tracing::error!(kind = %self.token_kind, block_num, error = %err, "erc20 transfer handling err");
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
        let (from_addr, to_addr, amount) = decode_erc20_transfer(log)?;
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
