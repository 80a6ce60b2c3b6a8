use crate::cache::Cache;
use crate::explorer::{BscRes, BscTxRecord};
use crate::moralis::NftItem;
use crate::scheduler::{NftListScheduler, TxRecordScheduler};
use crate::types::{
    addr_eq, addr_key, ERC20_TX_RECORD_SUFFIX, NATIVE_TX_RECORD_SUFFIX, NFT_TYPE_SUFFIX,
};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use ethers::providers::{Middleware, Provider, Ws};
use eyre::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const QUERY_TX_RECORD_TIMEOUT: Duration = Duration::from_secs(10);

/// Read-API responses are cached for ten minutes; the explorer window only
/// moves by ~200 blocks in that time.
const TX_RECORD_TTL_SECS: u64 = 600;
const NFT_LIST_TTL_SECS: u64 = 600;

#[derive(Clone)]
pub struct ApiContext {
    pub cache: Cache,
    pub client: Arc<Provider<Ws>>,
    pub network: String,
    pub vault_address: String,
    pub tx_scheduler: Arc<TxRecordScheduler>,
    pub nft_scheduler: Arc<NftListScheduler>,
}

#[derive(Debug, Serialize)]
struct ApiResponse<T: Serialize> {
    code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    msg: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            code: 200,
            data: Some(data),
            msg: None,
        }
    }

    fn err(msg: impl Into<String>) -> Self {
        Self {
            code: 500,
            data: None,
            msg: Some(msg.into()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct NativeTxRecordParams {
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Erc20TxRecordParams {
    address: Option<String>,
    contract_address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NftListParams {
    address: Option<String>,
}

pub fn router(ctx: ApiContext) -> Router {
    Router::new()
        .route("/api/v1/native-tx-record", get(native_tx_record))
        .route("/api/v1/erc20-tx-record", get(erc20_tx_record))
        .route("/api/v1/nft-list", get(nft_list))
        .with_state(ctx)
}

pub async fn serve(ctx: ApiContext, listen: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    tracing::info!(addr = listen, "read api listening");
    axum::serve(listener, router(ctx)).await?;
    Ok(())
}

async fn native_tx_record(
    State(ctx): State<ApiContext>,
    Query(params): Query<NativeTxRecordParams>,
) -> (StatusCode, Json<ApiResponse<BscRes>>) {
    let Some(address) = params.address else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::err("parameter error")),
        );
    };
    match find_native_tx_record(&ctx, &address).await {
        Ok(res) => (StatusCode::OK, Json(ApiResponse::ok(res))),
        Err(err) => {
            tracing::error!(address, error = %err, "query native tx record err");
            (StatusCode::OK, Json(ApiResponse::err(err.to_string())))
        }
    }
}

async fn erc20_tx_record(
    State(ctx): State<ApiContext>,
    Query(params): Query<Erc20TxRecordParams>,
) -> (StatusCode, Json<ApiResponse<BscRes>>) {
    let (Some(address), Some(contract_address)) = (params.address, params.contract_address) else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::err("parameter error")),
        );
    };
    match find_erc20_tx_record(&ctx, &address, &contract_address).await {
        Ok(res) => (StatusCode::OK, Json(ApiResponse::ok(res))),
        Err(err) => {
            tracing::error!(address, contract_address, error = %err, "query erc20 tx record err");
            (StatusCode::OK, Json(ApiResponse::err(err.to_string())))
        }
    }
}

async fn nft_list(
    State(ctx): State<ApiContext>,
    Query(params): Query<NftListParams>,
) -> (StatusCode, Json<ApiResponse<Vec<NftItem>>>) {
    let Some(address) = params.address else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::err("parameter error")),
        );
    };
    match find_nft_list(&ctx, &address).await {
        Ok(items) => (StatusCode::OK, Json(ApiResponse::ok(items))),
        Err(err) => {
            tracing::error!(address, error = %err, "query nft list err");
            (StatusCode::OK, Json(ApiResponse::err(err.to_string())))
        }
    }
}

/// Cursor if we have one, otherwise the live tip; 0 only if both fail, which
/// the explorer treats as an empty window.
async fn current_block_num(ctx: &ApiContext) -> u64 {
    match ctx.cache.block_cursor().await {
        Ok(Some(cursor)) => cursor,
        _ => match ctx.client.get_block_number().await {
            Ok(n) => n.as_u64(),
            Err(err) => {
                tracing::error!(error = %err, "query block number err");
                0
            }
        },
    }
}

async fn find_native_tx_record(ctx: &ApiContext, address: &str) -> Result<BscRes> {
    let cache_key = format!("{}{}", addr_key(address), NATIVE_TX_RECORD_SUFFIX);
    if let Ok(Some(cached)) = ctx.cache.get_string(&cache_key).await {
        if let Ok(res) = serde_json::from_str::<BscRes>(&cached) {
            return Ok(res);
        }
    }

    let block_num = current_block_num(ctx).await;
    let pending = ctx
        .tx_scheduler
        .query_tx_record(None, address.to_string(), block_num);
    let mut res = pending.wait(QUERY_TX_RECORD_TIMEOUT).await?;
    res.result = filter_native_records(res.result, &ctx.vault_address);

    let data = serde_json::to_string(&res)?;
    if let Err(err) = ctx.cache.set_string_ex(&cache_key, &data, TX_RECORD_TTL_SECS).await {
        tracing::warn!(cache_key, error = %err, "cache set err");
    }
    Ok(res)
}

async fn find_erc20_tx_record(ctx: &ApiContext, address: &str, contract_addr: &str) -> Result<BscRes> {
    let cache_key = format!(
        "{}{}{}",
        addr_key(address),
        addr_key(contract_addr),
        ERC20_TX_RECORD_SUFFIX
    );
    if let Ok(Some(cached)) = ctx.cache.get_string(&cache_key).await {
        if let Ok(res) = serde_json::from_str::<BscRes>(&cached) {
            return Ok(res);
        }
    }

    let block_num = current_block_num(ctx).await;
    let pending = ctx.tx_scheduler.query_tx_record(
        Some(contract_addr.to_string()),
        address.to_string(),
        block_num,
    );
    let res = pending.wait(QUERY_TX_RECORD_TIMEOUT).await?;

    let data = serde_json::to_string(&res)?;
    if let Err(err) = ctx.cache.set_string_ex(&cache_key, &data, TX_RECORD_TTL_SECS).await {
        tracing::warn!(cache_key, error = %err, "cache set err");
    }
    Ok(res)
}

async fn find_nft_list(ctx: &ApiContext, address: &str) -> Result<Vec<NftItem>> {
    let cache_key = format!("{}{}", addr_key(address), NFT_TYPE_SUFFIX);
    if let Ok(Some(cached)) = ctx.cache.get_string(&cache_key).await {
        if let Ok(items) = serde_json::from_str::<Vec<NftItem>>(&cached) {
            return Ok(items);
        }
    }

    let pending = ctx
        .nft_scheduler
        .query_nft_list(address.to_string(), ctx.network.clone());
    let items = pending.wait(QUERY_TX_RECORD_TIMEOUT).await?;

    let data = serde_json::to_string(&items)?;
    if let Err(err) = ctx.cache.set_string_ex(&cache_key, &data, NFT_LIST_TTL_SECS).await {
        tracing::warn!(cache_key, error = %err, "cache set err");
    }
    Ok(items)
}

/// Plain gas transfers plus vault payouts, newest first. Token transfers and
/// arbitrary contract calls in the merged explorer result are dropped.
fn filter_native_records(records: Vec<BscTxRecord>, vault_addr: &str) -> Vec<BscTxRecord> {
    let mut kept: Vec<BscTxRecord> = records
        .into_iter()
        .filter(|r| r.input == "0x" || addr_eq(&r.from, vault_addr))
        .collect();
    kept.sort_by_key(|r| std::cmp::Reverse(r.time_stamp.parse::<i64>().unwrap_or(0)));
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    const VAULT: &str = "0x9999999999999999999999999999999999999999";

    fn record(input: &str, from: &str, time_stamp: &str) -> BscTxRecord {
        BscTxRecord {
            hash: String::new(),
            time_stamp: time_stamp.into(),
            block_number: String::new(),
            block_hash: String::new(),
            from: from.into(),
            to: String::new(),
            value: String::new(),
            input: input.into(),
            tx_type: String::new(),
        }
    }

    #[test]
    fn keeps_plain_transfers_and_vault_payouts() {
        let records = vec![
            record("0x", "0x1", "10"),
            record("0xa9059cbb", "0x1", "20"),
            record("0xdeadbeef", VAULT, "30"),
        ];
        let kept = filter_native_records(records, VAULT);
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|r| r.input == "0x" || addr_eq(&r.from, VAULT)));
    }

    #[test]
    fn sorts_newest_first() {
        let records = vec![
            record("0x", "0x1", "10"),
            record("0x", "0x1", "30"),
            record("0x", "0x1", "20"),
        ];
        let kept = filter_native_records(records, VAULT);
        let stamps: Vec<&str> = kept.iter().map(|r| r.time_stamp.as_str()).collect();
        assert_eq!(stamps, vec!["30", "20", "10"]);
    }

    #[test]
    fn vault_match_ignores_case() {
        let records = vec![record("0xdead", &VAULT.to_uppercase().replace("0X", "0x"), "1")];
        assert_eq!(filter_native_records(records, VAULT).len(), 1);
    }

    #[test]
    fn success_and_error_response_shapes() {
        let ok = serde_json::to_value(ApiResponse::ok(1u32)).unwrap();
        assert_eq!(ok, serde_json::json!({"code": 200, "data": 1}));

        let err = serde_json::to_value(ApiResponse::<u32>::err("boom")).unwrap();
        assert_eq!(err, serde_json::json!({"code": 500, "msg": "boom"}));
    }

    #[test]
    fn rate_limit_error_round_trips_into_the_body() {
        let err = ApiResponse::<BscRes>::err(crate::explorer::BSC_SCAN_RATE_LIMIT);
        let body = serde_json::to_string(&err).unwrap();
        assert_eq!(body, r#"{"code":500,"msg":"\"Max rate limit reached\""}"#);
    }
}
