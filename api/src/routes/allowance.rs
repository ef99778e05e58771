use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use domain::BlockRef;
use metrics::counter;
use serde::{Deserialize, Serialize};

use crate::{
    error::{ApiError, ApiResult},
    routes::require_address,
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new().route("/allowance", get(get_allowance))
}

#[derive(Debug, Deserialize)]
pub struct AllowanceQuery {
    chain: Option<String>,
    token: Option<String>,
    owner: Option<String>,
    spender: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AllowanceResponse {
    raw: String,
    formatted: String,
    symbol: String,
}

/// Read-only `allowance(owner, spender)` on an ERC-20.
async fn get_allowance(
    State(state): State<AppState>,
    Query(params): Query<AllowanceQuery>,
) -> ApiResult<Json<AllowanceResponse>> {
    let engine = state.engines.resolve(params.chain.as_deref())?;
    let token = require_address("token", params.token.as_deref())?;
    let owner = require_address("owner", params.owner.as_deref())?;
    let spender = require_address("spender", params.spender.as_deref())?;
    if token.is_native() {
        return Err(ApiError::BadRequest(
            "the native coin has no allowance".to_string(),
        ));
    }

    let outcome = engine
        .balances()
        .fetch_allowance(token, owner, spender, BlockRef::Latest)
        .await;
    let label = if outcome.is_ok() { "ok" } else { "error" };
    counter!("balance_requests_total", "endpoint" => "allowance", "outcome" => label).increment(1);

    let (metadata, allowance) = outcome.map_err(|source| ApiError::Upstream {
        message: "Failed to fetch allowance",
        source,
    })?;
    Ok(Json(AllowanceResponse {
        raw: allowance.raw().to_string(),
        formatted: allowance.amount(),
        symbol: metadata.symbol,
    }))
}
