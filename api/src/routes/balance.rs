use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use domain::{BlockRef, RawBalance};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::{ApiError, ApiResult},
    routes::require_address,
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/getNativeBalance", get(get_native_balance))
        .route("/getBalance", get(get_balance))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceQuery {
    chain: Option<String>,
    address: Option<String>,
    token_address: Option<String>,
    symbol: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    balance: String,
}

fn record(endpoint: &'static str, outcome: &'static str) {
    counter!("balance_requests_total", "endpoint" => endpoint, "outcome" => outcome).increment(1);
}

/// Raw native-coin balance in wei.
async fn get_native_balance(
    State(state): State<AppState>,
    Query(params): Query<BalanceQuery>,
) -> ApiResult<Json<BalanceResponse>> {
    let result: ApiResult<RawBalance> = async {
        let engine = state.engines.resolve(params.chain.as_deref())?;
        let owner = require_address("address", params.address.as_deref())?;
        engine
            .balances()
            .fetch_native_balance(owner, BlockRef::Latest)
            .await
            .map_err(|source| ApiError::Upstream {
                message: "Failed to fetch Native balance",
                source,
            })
    }
    .await;

    match result {
        Ok(raw) => {
            record("native", "ok");
            Ok(Json(BalanceResponse {
                balance: raw.raw_amount.to_string(),
            }))
        }
        Err(err) => {
            record("native", "error");
            Err(err)
        }
    }
}

/// Token balance scaled by its decimals. The token is named by `tokenAddress`
/// or by a directory `symbol`; a symbol the directory does not know reads as zero.
async fn get_balance(
    State(state): State<AppState>,
    Query(params): Query<BalanceQuery>,
) -> ApiResult<Json<BalanceResponse>> {
    let result: ApiResult<String> = async {
        let engine = state.engines.resolve(params.chain.as_deref())?;
        let owner = require_address("address", params.address.as_deref())?;
        let token = match (params.token_address.as_deref(), params.symbol.as_deref()) {
            (Some(raw), _) if !raw.trim().is_empty() => require_address("tokenAddress", Some(raw))?,
            (_, Some(symbol)) if !symbol.trim().is_empty() => {
                match engine.directory().resolve_symbol(engine.chain_id(), symbol.trim()) {
                    Some(token) => token,
                    None => {
                        debug!(%symbol, chain_id = engine.chain_id(), "symbol not in directory");
                        return Ok("0".to_string());
                    }
                }
            }
            _ => {
                return Err(ApiError::BadRequest(
                    "tokenAddress or symbol is required".to_string(),
                ))
            }
        };
        engine
            .balances()
            .fetch_formatted(owner, token, BlockRef::Latest)
            .await
            .map(|(_, formatted)| formatted.amount())
            .map_err(|source| ApiError::Upstream {
                message: "Failed to fetch balance",
                source,
            })
    }
    .await;

    match result {
        Ok(balance) => {
            record("token", "ok");
            Ok(Json(BalanceResponse { balance }))
        }
        Err(err) => {
            record("token", "error");
            Err(err)
        }
    }
}
