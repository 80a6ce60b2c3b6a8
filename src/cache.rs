use crate::config;
use crate::types::BLOCK_NUM_KEY;
use eyre::{eyre, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

/// Narrow interface over redis: the confirmed-height cursor, read-API response
/// caching, NFT cache invalidation, and the explorer api-key allowlist.
///
/// Cheap to clone; all clones share one multiplexed connection.
#[derive(Clone)]
pub struct Cache {
    conn: ConnectionManager,
    cursor_key: String,
}

impl Cache {
    /// Connect and ping. A failed ping is fatal at startup: the cursor lives
    /// here and the service cannot run without it.
    pub async fn connect(cfg: &config::Redis, bscscan_api_key: &str) -> Result<Self> {
        let url = if cfg.password.is_empty() {
            format!("redis://{}", cfg.address)
        } else {
            format!("redis://:{}@{}", cfg.password, cfg.address)
        };
        let client =
            redis::Client::open(url).map_err(|e| eyre!("redis client init err: {e}"))?;
        let mut conn = client
            .get_connection_manager()
            .await
            .map_err(|e| eyre!("redis connect err: {e}"))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| eyre!("redis init err: {e}"))?;

        let _: () = conn.sadd("api_key", bscscan_api_key).await?;

        Ok(Self {
            conn,
            cursor_key: format!("{}{}", BLOCK_NUM_KEY, cfg.machine_id),
        })
    }

    /// Highest fully processed confirmed height, or `None` on first run.
    pub async fn block_cursor(&self) -> Result<Option<u64>> {
        let mut conn = self.conn.clone();
        let v: Option<u64> = conn.get(&self.cursor_key).await?;
        Ok(v)
    }

    pub async fn set_block_cursor(&self, height: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(&self.cursor_key, height).await?;
        Ok(())
    }

    pub async fn get_string(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let v: Option<String> = conn.get(key).await?;
        Ok(v)
    }

    pub async fn set_string_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl_secs).await?;
        Ok(())
    }

    pub async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }
}
