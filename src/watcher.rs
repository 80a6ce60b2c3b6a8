use crate::bus::EventBus;
use crate::cache::Cache;
use crate::config::Config;
use crate::dispatcher::TxDispatcher;
use crate::erc20::{Erc20Listener, Erc20Target};
use crate::explorer::ExplorerClient;
use crate::moralis::MoralisClient;
use crate::native::{NativeListener, NativeTarget};
use crate::nft::{NftListener, NftTarget};
use crate::scheduler::{NftListScheduler, TxRecordScheduler};
use crate::types::{
    ErrMsg, NativeTxEvent, NftTxEvent, TokenKind, TxKind, BLOCK_CONFIRM_HEIGHT, NEW_BLOCK_TOPIC,
};
use crate::vault::{VaultListener, VaultTarget};
use ethers::providers::{Middleware, Provider, Ws};
use ethers::types::Address;
use eyre::{eyre, Result};
use std::cmp;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Domain-event channel depth. Bounded so a slow Kafka producer applies
/// backpressure to the listeners instead of losing events.
const EVENT_CHANNEL_CAPACITY: usize = 10;

/// Error-channel depth; the retry driver is the single consumer.
const ERROR_CHANNEL_CAPACITY: usize = 10;

/// Delay before a failed range is re-run.
const RETRY_DELAY: Duration = Duration::from_millis(200);

/// Catch-up replay stride. One unchunked call over a long outage would blow
/// past RPC batch limits.
const CATCHUP_STRIDE: u64 = 5000;

type WsClient = Provider<Ws>;

/// Tagged dispatch over the per-contract listeners; the catch-up and retry
/// drivers only ever need `handle_past_block`.
#[derive(Clone)]
pub enum ChainListener {
    Native(Arc<NativeListener<WsClient>>),
    Erc20(Arc<Erc20Listener<WsClient>>),
    Vault(Arc<VaultListener<WsClient>>),
    Nft(Arc<NftListener<WsClient>>),
}

impl ChainListener {
    pub async fn handle_past_block(&self, from: u64, to: u64) -> Result<()> {
        match self {
            ChainListener::Native(l) => l.handle_past_block(from, to).await,
            ChainListener::Erc20(l) => l.handle_past_block(from, to).await,
            ChainListener::Vault(l) => l.handle_past_block(from, to).await,
            ChainListener::Nft(l) => l.handle_past_block(from, to).await,
        }
    }
}

/// Listener tasks not yet spawned, each paired with its bus mailbox.
struct PendingRuns {
    gov: (Arc<Erc20Listener<WsClient>>, mpsc::Receiver<u64>),
    game: (Arc<Erc20Listener<WsClient>>, mpsc::Receiver<u64>),
    usdc: (Arc<Erc20Listener<WsClient>>, mpsc::Receiver<u64>),
    vault: (Arc<VaultListener<WsClient>>, mpsc::Receiver<u64>),
    nft: (Arc<NftListener<WsClient>>, mpsc::Receiver<u64>),
}

/// Owns the chain connection, the listener set, the schedulers, and the
/// startup/runtime drivers.
pub struct ChainWatcher {
    pub client: Arc<WsClient>,
    pub cache: Cache,
    pub network: String,
    pub tx_scheduler: Arc<TxRecordScheduler>,
    pub nft_scheduler: Arc<NftListScheduler>,
    listeners: HashMap<TokenKind, ChainListener>,
    native: Arc<NativeListener<WsClient>>,
    error_handle: Option<mpsc::Receiver<ErrMsg>>,
    pending_runs: Option<PendingRuns>,
}

impl ChainWatcher {
    /// Dial the node, verify the chain, and wire every component. The kafka
    /// dispatcher starts immediately; listeners start in `run`.
    pub async fn new(cfg: &Config, cache: Cache) -> Result<Self> {
        tracing::info!("bsc watcher start");
        let client = Provider::<Ws>::connect(cfg.chain.node_address.as_str())
            .await
            .map_err(|e| eyre!("eth client dial err: {e}"))?;
        let client = Arc::new(client);

        let chain_id = client
            .get_chainid()
            .await
            .map_err(|e| eyre!("query chain id err: {e}"))?;
        let network = match chain_id.as_u64() {
            56 => "bsc".to_string(),
            97 => "bsc testnet".to_string(),
            other => return Err(eyre!("unexpected chainId {other}")),
        };

        // The custodial wallet the classifiers watch is the vault itself.
        let wallet_addr = cfg.contract.game_vault_address.clone();

        let (error_tx, error_rx) = mpsc::channel::<ErrMsg>(ERROR_CHANNEL_CAPACITY);
        let (native_tx, native_rx) = mpsc::channel::<NativeTxEvent>(EVENT_CHANNEL_CAPACITY);
        let (nft_tx, nft_rx) = mpsc::channel::<NftTxEvent>(EVENT_CHANNEL_CAPACITY);

        let bus = Arc::new(EventBus::new());
        let gov_chan = bus.subscribe(NEW_BLOCK_TOPIC);
        let game_chan = bus.subscribe(NEW_BLOCK_TOPIC);
        let usdc_chan = bus.subscribe(NEW_BLOCK_TOPIC);
        let vault_chan = bus.subscribe(NEW_BLOCK_TOPIC);
        let nft_chan = bus.subscribe(NEW_BLOCK_TOPIC);

        let native = Arc::new(NativeListener::new(
            NativeTarget::new(wallet_addr.clone()),
            client.clone(),
            cache.clone(),
            bus,
            BLOCK_CONFIRM_HEIGHT,
            native_tx.clone(),
            error_tx.clone(),
        ));
        let gov = Arc::new(Erc20Listener::new(
            Erc20Target::new(wallet_addr.clone(), TxKind::GovRecharge, TxKind::GovWithdraw),
            parse_addr("governance_token_address", &cfg.contract.governance_token_address)?,
            TokenKind::GovernanceToken,
            client.clone(),
            native_tx.clone(),
            error_tx.clone(),
        ));
        let game = Arc::new(Erc20Listener::new(
            Erc20Target::new(wallet_addr.clone(), TxKind::GameRecharge, TxKind::GameWithdraw),
            parse_addr("game_token_address", &cfg.contract.game_token_address)?,
            TokenKind::GameToken,
            client.clone(),
            native_tx.clone(),
            error_tx.clone(),
        ));
        let usdc = Arc::new(Erc20Listener::new(
            Erc20Target::new(wallet_addr.clone(), TxKind::UsdcRecharge, TxKind::UsdcWithdraw),
            parse_addr("usdc_address", &cfg.contract.usdc_address)?,
            TokenKind::Usdc,
            client.clone(),
            native_tx.clone(),
            error_tx.clone(),
        ));
        let vault = Arc::new(VaultListener::new(
            VaultTarget::new(wallet_addr.clone()),
            parse_addr("game_vault_address", &cfg.contract.game_vault_address)?,
            client.clone(),
            native_tx.clone(),
            error_tx.clone(),
        ));
        let nft = Arc::new(NftListener::new(
            NftTarget::new(wallet_addr),
            parse_addr("game_nft_address", &cfg.contract.game_nft_address)?,
            client.clone(),
            cache.clone(),
            nft_tx,
            error_tx,
        ));

        let mut listeners = HashMap::new();
        listeners.insert(TokenKind::Native, ChainListener::Native(native.clone()));
        listeners.insert(TokenKind::GovernanceToken, ChainListener::Erc20(gov.clone()));
        listeners.insert(TokenKind::GameToken, ChainListener::Erc20(game.clone()));
        listeners.insert(TokenKind::Usdc, ChainListener::Erc20(usdc.clone()));
        listeners.insert(TokenKind::GameVault, ChainListener::Vault(vault.clone()));
        listeners.insert(TokenKind::GameNft, ChainListener::Nft(nft.clone()));

        let dispatcher = TxDispatcher::new(&cfg.kafka.address, native_rx, nft_rx)?;
        tokio::spawn(dispatcher.run());

        let tx_scheduler = TxRecordScheduler::start(ExplorerClient::new(&cfg.bscscan));
        let nft_scheduler = NftListScheduler::start(MoralisClient::new(&cfg.moralis));

        Ok(Self {
            client,
            cache,
            network,
            tx_scheduler,
            nft_scheduler,
            listeners,
            native,
            error_handle: Some(error_rx),
            pending_runs: Some(PendingRuns {
                gov: (gov, gov_chan),
                game: (game, game_chan),
                usdc: (usdc, usdc_chan),
                vault: (vault, vault_chan),
                nft: (nft, nft_chan),
            }),
        })
    }

    /// Arm the retry driver, replay the gap between the persisted cursor and
    /// the confirmed tip, then start the follower and the log listeners.
    pub async fn run(&mut self) -> Result<()> {
        if let Some(error_rx) = self.error_handle.take() {
            tokio::spawn(handle_error(self.listeners.clone(), error_rx));
        }

        self.sync_past_blocks().await?;

        let runs = self
            .pending_runs
            .take()
            .ok_or_else(|| eyre!("watcher already running"))?;
        tokio::spawn(self.native.clone().watch_heads());
        let (gov, gov_chan) = runs.gov;
        tokio::spawn(gov.watch_new_blocks(gov_chan));
        let (game, game_chan) = runs.game;
        tokio::spawn(game.watch_new_blocks(game_chan));
        let (usdc, usdc_chan) = runs.usdc;
        tokio::spawn(usdc.watch_new_blocks(usdc_chan));
        let (vault, vault_chan) = runs.vault;
        tokio::spawn(vault.watch_new_blocks(vault_chan));
        let (nft, nft_chan) = runs.nft;
        tokio::spawn(nft.watch_new_blocks(nft_chan));
        Ok(())
    }

    /// Catch-up driver: loop until the cursor reaches `tip − K`, replaying
    /// each stride through every listener concurrently. First run just plants
    /// the cursor.
    async fn sync_past_blocks(&self) -> Result<()> {
        loop {
            let tip = match self.client.get_block_number().await {
                Ok(n) => n.as_u64(),
                Err(err) => {
                    tracing::error!(error = %err, "query block number err");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
            };
            let confirmed = tip.saturating_sub(BLOCK_CONFIRM_HEIGHT);

            let cursor = match self.cache.block_cursor().await {
                Ok(c) => c,
                Err(err) => {
                    tracing::error!(error = %err, "query cache blockNum err");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
            };
            let Some(cursor) = cursor else {
                tracing::info!(confirmed, "blockNum is not exist; starting fresh");
                self.cache.set_block_cursor(confirmed).await?;
                break;
            };
            if cursor >= confirmed {
                tracing::info!(cursor, "sync done");
                break;
            }

            tracing::info!(from = cursor + 1, to = confirmed, "sync past blocks");
            let mut start = cursor + 1;
            while start <= confirmed {
                let end = cmp::min(start.saturating_add(CATCHUP_STRIDE - 1), confirmed);
                let tasks = self
                    .listeners
                    .values()
                    .map(|l| l.handle_past_block(start, end));
                // failures are already on the error channel; the retry driver
                // re-runs them while we keep advancing
                futures::future::join_all(tasks).await;
                start = end + 1;
            }
            self.cache.set_block_cursor(confirmed).await?;
        }
        Ok(())
    }
}

/// Retry driver: single consumer of the shared error channel. No retry
/// budget; a range that keeps failing keeps coming back.
async fn handle_error(
    listeners: HashMap<TokenKind, ChainListener>,
    mut error_handle: mpsc::Receiver<ErrMsg>,
) {
    while let Some(msg) = error_handle.recv().await {
        tracing::info!(kind = %msg.kind, from = msg.from, to = msg.to, "re-running failed range");
        if let Some(listener) = listeners.get(&msg.kind) {
            tokio::time::sleep(RETRY_DELAY).await;
            let _ = listener.handle_past_block(msg.from, msg.to).await;
        }
    }
}

fn parse_addr(name: &str, raw: &str) -> Result<Address> {
    raw.parse::<Address>()
        .map_err(|e| eyre!("invalid {name} '{raw}': {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_addr_rejects_garbage() {
        assert!(parse_addr("x", "not-an-address").is_err());
        assert!(parse_addr("x", "0x9999999999999999999999999999999999999999").is_ok());
    }
}
