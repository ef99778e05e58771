use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use domain::{LineStatus, PortfolioSnapshot, SnapshotAt};
use indexer::{BuildOptions, WatchList};
use metrics::counter;
use serde::Deserialize;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new().route("/portfolio/:address", get(get_portfolio))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioQuery {
    chain: Option<String>,
    block: Option<String>,
    timestamp: Option<String>,
    watch: Option<String>,
    since_block: Option<String>,
    timeout_ms: Option<String>,
}

async fn get_portfolio(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Query(params): Query<PortfolioQuery>,
) -> ApiResult<Json<PortfolioSnapshot>> {
    let engine = state.engines.resolve(params.chain.as_deref())?;
    let options = build_options(&params)?;

    let snapshot = engine.build_snapshot(&address, options).await?;

    counter!("portfolio_snapshots_total").increment(1);
    for line in &snapshot.lines {
        counter!("portfolio_token_lines_total", "status" => status_label(line.status)).increment(1);
    }
    Ok(Json(snapshot))
}

fn build_options(params: &PortfolioQuery) -> ApiResult<BuildOptions> {
    let block = parse_u64("block", params.block.as_deref())?;
    let timestamp = params
        .timestamp
        .as_deref()
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .map(parse_timestamp)
        .transpose()?;
    let at = match (block, timestamp) {
        (Some(_), Some(_)) => {
            return Err(ApiError::BadRequest(
                "block and timestamp are mutually exclusive".to_string(),
            ))
        }
        (Some(block), None) => SnapshotAt::Block(block),
        (None, Some(timestamp)) => SnapshotAt::Timestamp(timestamp),
        (None, None) => SnapshotAt::Latest,
    };

    let mut options = BuildOptions::default().at(at);
    if let Some(watch) = params.watch.as_deref() {
        options = options.watching(WatchList::from_symbols(watch.split(',')));
    }
    if let Some(since) = parse_u64("sinceBlock", params.since_block.as_deref())? {
        options = options.since_block(since);
    }
    if let Some(ms) = parse_u64("timeoutMs", params.timeout_ms.as_deref())? {
        options = options.with_deadline(Duration::from_millis(ms.max(1)));
    }
    Ok(options)
}

fn parse_u64(field: &str, raw: Option<&str>) -> ApiResult<Option<u64>> {
    match raw.map(str::trim).filter(|value| !value.is_empty()) {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ApiError::BadRequest(format!("{field} must be a non-negative integer"))),
    }
}

/// RFC 3339, unix seconds, or a bare date (end of that day, UTC).
fn parse_timestamp(raw: &str) -> ApiResult<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    if let Ok(secs) = raw.parse::<i64>() {
        return DateTime::from_timestamp(secs, 0)
            .ok_or_else(|| ApiError::BadRequest(format!("timestamp {raw} out of range")));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(23, 59, 59))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| ApiError::BadRequest(format!("unrecognised timestamp {raw:?}")))
}

fn status_label(status: LineStatus) -> &'static str {
    match status {
        LineStatus::Resolved => "resolved",
        LineStatus::PartiallyFailed => "partially_failed",
        LineStatus::Failed => "failed",
    }
}
