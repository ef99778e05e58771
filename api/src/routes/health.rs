use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/healthz", get(healthz))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Health {
    status: &'static str,
    chains: Vec<u64>,
    default_chain: u64,
    offline: bool,
}

async fn healthz(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        chains: state.engines.chains(),
        default_chain: state.config.default_chain_id,
        offline: state.config.offline_mode,
    })
}
