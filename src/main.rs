mod bus;
mod cache;
mod config;
mod counter;
mod dispatcher;
mod erc20;
mod explorer;
mod listener;
mod moralis;
mod native;
mod nft;
mod scheduler;
mod server;
mod types;
mod vault;
mod watcher;

use cache::Cache;
use clap::Parser;
use config::Config;
use eyre::Result;
use server::ApiContext;
use std::path::PathBuf;
use watcher::ChainWatcher;

#[derive(Parser, Debug)]
#[command(name = "vaultwatch", version, about = "BSC chain-indexing service for the game backend")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, env = "CONFIG_PATH")]
    config: PathBuf,

    /// Address the read API listens on.
    #[arg(long, default_value = "0.0.0.0:3000")]
    listen: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let cfg = Config::load(&args.config)?;
    tracing::info!(config = %args.config.display(), "config loaded");

    let cache = Cache::connect(&cfg.redis, &cfg.bscscan.api_key).await?;

    let mut chain_watcher = ChainWatcher::new(&cfg, cache.clone()).await?;
    chain_watcher.run().await?;

    let ctx = ApiContext {
        cache,
        client: chain_watcher.client.clone(),
        network: chain_watcher.network.clone(),
        vault_address: cfg.contract.game_vault_address.clone(),
        tx_scheduler: chain_watcher.tx_scheduler.clone(),
        nft_scheduler: chain_watcher.nft_scheduler.clone(),
    };
    server::serve(ctx, &args.listen).await
}
