use anyhow::Context;
use domain::SnapshotAt;
use indexer::{BuildOptions, WatchList};
use portfolio_api::{bootstrap::build_state, config::AppConfig, telemetry};

/// One-shot snapshot: `snapshot <address>`, printed as JSON on stdout.
/// `PORTFOLIO_CHAIN`, `PORTFOLIO_BLOCK` and `PORTFOLIO_WATCH` narrow the request.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing()?;
    let config = AppConfig::from_env()?;

    let address = std::env::args()
        .nth(1)
        .context("usage: snapshot <address>")?;
    let chain = std::env::var("PORTFOLIO_CHAIN").ok();
    let watch = std::env::var("PORTFOLIO_WATCH").unwrap_or_else(|_| "ETH".to_string());
    let at = match std::env::var("PORTFOLIO_BLOCK") {
        Ok(raw) => SnapshotAt::Block(
            raw.trim()
                .parse()
                .with_context(|| format!("PORTFOLIO_BLOCK {raw:?} is not a block number"))?,
        ),
        Err(_) => SnapshotAt::Latest,
    };

    let state = build_state(&config)?;
    let engine = state.engines.resolve(chain.as_deref())?;
    let options = BuildOptions::default()
        .at(at)
        .watching(WatchList::from_symbols(watch.split(',')));

    let snapshot = engine.build_snapshot(&address, options).await?;
    tracing::info!(
        lines = snapshot.lines.len(),
        total_value_usd = %snapshot.total_value_usd,
        partial = snapshot.is_partial(),
        "snapshot complete"
    );
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    Ok(())
}
