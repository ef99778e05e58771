use std::{sync::Arc, time::Duration};

use chrono::{TimeZone, Utc};
use domain::{Address, BlockRef, ErrorKind, LineStatus, SnapshotAt, NATIVE_TOKEN_ADDRESS};
use ethers::types::U256;
use async_trait::async_trait;
use indexer::{
    AggregatorConfig, BuildOptions, CancellationToken, DirectoryEntry, DiscoveryPolicy,
    InMemoryChainClient, MetadataPolicy, PortfolioAggregator, PortfolioError,
    PriceOracleAdapter, PriceSource, PriceSourceError, StaticPriceSource, TokenDirectory,
    TokenMethod, WatchList,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;

const OWNER: &str = "0x1111111111111111111111111111111111111111";

fn addr(hex: &str) -> Address {
    Address::parse(hex).unwrap()
}

fn owner() -> Address {
    addr(OWNER)
}

fn token_a() -> Address {
    addr("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa")
}

fn token_b() -> Address {
    addr("0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb")
}

fn token_c() -> Address {
    addr("0xcccccccccccccccccccccccccccccccccccccccc")
}

fn counterparty() -> Address {
    addr("0x2222222222222222222222222222222222222222")
}

fn prices() -> StaticPriceSource {
    StaticPriceSource::new([("AAA", dec!(2.00)), ("CCC", dec!(10)), ("ETH", dec!(3000))])
}

/// Price feed whose upstream never answers.
struct Unreachable;

#[async_trait]
impl PriceSource for Unreachable {
    async fn usd_prices(
        &self,
        _symbols: &[String],
    ) -> Result<HashMap<String, Option<Decimal>>, PriceSourceError> {
        Err(PriceSourceError::Upstream("connection refused".to_string()))
    }
}

fn aggregator_with(
    chain: InMemoryChainClient,
    prices: impl PriceSource + 'static,
    directory: TokenDirectory,
) -> PortfolioAggregator {
    PortfolioAggregator::new(
        Arc::new(chain),
        Arc::new(PriceOracleAdapter::new(Arc::new(prices), Duration::from_secs(1))),
        Arc::new(directory),
        AggregatorConfig {
            chain_id: 1,
            max_concurrency: 4,
            snapshot_timeout: Duration::from_secs(30),
            since_block: 0,
            metadata: MetadataPolicy {
                call_timeout: Duration::from_secs(2),
                retry_backoff: Duration::from_millis(5),
            },
            discovery: DiscoveryPolicy {
                block_range: 250,
                min_block_range: 8,
            },
        },
    )
}

fn aggregator(chain: InMemoryChainClient) -> PortfolioAggregator {
    aggregator_with(chain, prices(), TokenDirectory::default())
}

/// Owner received AAA at block 10 and holds 1.5 of it.
fn chain_with_token_a() -> InMemoryChainClient {
    InMemoryChainClient::new(1_000)
        .with_token(token_a(), "AAA", "Token A", 6)
        .with_transfer(token_a(), counterparty(), owner(), 10)
        .with_balance(token_a(), owner(), U256::from(1_500_000u64))
}

#[tokio::test]
async fn invalid_address_fails_before_any_chain_call() {
    let chain = Arc::new(InMemoryChainClient::new(100));
    let aggregator = PortfolioAggregator::new(
        chain.clone(),
        Arc::new(PriceOracleAdapter::new(Arc::new(prices()), Duration::from_secs(1))),
        Arc::new(TokenDirectory::default()),
        AggregatorConfig::default(),
    );

    let err = aggregator
        .build_snapshot("0x1234", BuildOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, PortfolioError::InvalidAddress { .. }));
    assert_eq!(err.kind(), ErrorKind::InvalidAddress);
    assert_eq!(chain.log_queries(), 0);
}

#[tokio::test]
async fn empty_history_yields_only_watched_tokens() {
    let chain = InMemoryChainClient::new(500).with_native_balance(owner(), 0, U256::exp10(18));
    let aggregator = aggregator_with(chain, prices(), TokenDirectory::mainnet_defaults());

    let empty = aggregator
        .build_snapshot(OWNER, BuildOptions::default())
        .await
        .unwrap();
    assert!(empty.lines.is_empty());
    assert_eq!(empty.total_value_usd, dec!(0));
    assert_eq!(empty.as_of_block, BlockRef::Number(500));

    let watched = aggregator
        .build_snapshot(
            OWNER,
            BuildOptions::default().watching(WatchList::from_symbols(["eth", "NOPE"])),
        )
        .await
        .unwrap();
    assert_eq!(watched.lines.len(), 1);
    let eth = watched.line(&NATIVE_TOKEN_ADDRESS).unwrap();
    assert_eq!(eth.status, LineStatus::Resolved);
    assert_eq!(eth.value_usd, Some(dec!(3000)));
    assert_eq!(watched.unresolved_watch_symbols, vec!["NOPE".to_string()]);
}

#[tokio::test]
async fn prices_discovered_holding() {
    let snapshot = aggregator(chain_with_token_a())
        .build_snapshot(OWNER, BuildOptions::default())
        .await
        .unwrap();

    assert_eq!(snapshot.lines.len(), 1);
    let line = &snapshot.lines[0];
    assert_eq!(line.status, LineStatus::Resolved);
    assert_eq!(line.balance.as_ref().unwrap().amount(), "1.5");
    assert_eq!(line.value_usd, Some(dec!(3.00)));
    assert_eq!(snapshot.total_value_usd, dec!(3.00));
    assert!(line.error.is_none());
}

#[tokio::test]
async fn reverting_symbol_marks_only_that_line() {
    let chain = chain_with_token_a()
        .with_token(token_b(), "BBB", "Token B", 18)
        .with_reverting(token_b(), TokenMethod::Symbol)
        .with_transfer(token_b(), counterparty(), owner(), 20)
        .with_balance(token_b(), owner(), U256::exp10(18));

    let snapshot = aggregator(chain)
        .build_snapshot(OWNER, BuildOptions::default())
        .await
        .unwrap();

    assert_eq!(snapshot.lines.len(), 2);
    let bad = snapshot.line(&token_b()).unwrap();
    assert_eq!(bad.status, LineStatus::Failed);
    assert_eq!(bad.error, Some(ErrorKind::MetadataUnavailable));
    assert!(bad.value_usd.is_none());
    assert!(bad.balance.is_none());
    assert_eq!(snapshot.total_value_usd, dec!(3.00));
    // failed line has no symbol and sorts first
    assert_eq!(snapshot.lines[0].contract_address, token_b());
}

#[tokio::test]
async fn one_failing_balance_leaves_siblings_resolved() {
    let chain = chain_with_token_a()
        .with_token(token_b(), "BBB", "Token B", 18)
        .with_reverting(token_b(), TokenMethod::BalanceOf)
        .with_transfer(token_b(), counterparty(), owner(), 20)
        .with_token(token_c(), "CCC", "Token C", 18)
        .with_transfer(token_c(), owner(), counterparty(), 30)
        .with_balance(token_c(), owner(), U256::exp10(17));

    let snapshot = aggregator(chain)
        .build_snapshot(OWNER, BuildOptions::default())
        .await
        .unwrap();

    let symbols: Vec<_> = snapshot.lines.iter().map(|line| line.symbol()).collect();
    assert_eq!(symbols, vec!["AAA", "BBB", "CCC"]);

    let failed = snapshot.line(&token_b()).unwrap();
    assert_eq!(failed.status, LineStatus::Failed);
    assert_eq!(failed.error, Some(ErrorKind::BalanceUnavailable));
    assert_eq!(failed.symbol(), "BBB");

    assert_eq!(snapshot.line(&token_c()).unwrap().value_usd, Some(dec!(1.0)));
    assert_eq!(snapshot.total_value_usd, dec!(4.00));
}

#[tokio::test]
async fn unpriced_token_is_kept_but_not_counted() {
    let chain = chain_with_token_a()
        .with_token(token_b(), "BBB", "Token B", 18)
        .with_transfer(token_b(), counterparty(), owner(), 20)
        .with_balance(token_b(), owner(), U256::exp10(18));

    let snapshot = aggregator(chain)
        .build_snapshot(OWNER, BuildOptions::default())
        .await
        .unwrap();

    let unpriced = snapshot.line(&token_b()).unwrap();
    assert_eq!(unpriced.status, LineStatus::PartiallyFailed);
    assert_eq!(unpriced.error, Some(ErrorKind::PriceUnavailable));
    assert_eq!(unpriced.balance.as_ref().unwrap().amount(), "1");
    assert!(unpriced.value_usd.is_none());
    assert_eq!(snapshot.total_value_usd, dec!(3.00));
}

#[tokio::test]
async fn price_outage_degrades_every_line_without_failing() {
    let snapshot = aggregator_with(
        chain_with_token_a(),
        Unreachable,
        TokenDirectory::default(),
    )
    .build_snapshot(OWNER, BuildOptions::default())
    .await
    .unwrap();

    assert_eq!(snapshot.lines[0].status, LineStatus::PartiallyFailed);
    assert_eq!(snapshot.total_value_usd, dec!(0));
}

#[tokio::test]
async fn pruned_block_fails_balances_only() {
    let chain = chain_with_token_a().with_pruned_before(900);

    let snapshot = aggregator(chain)
        .build_snapshot(OWNER, BuildOptions::default().at(SnapshotAt::Block(100)))
        .await
        .unwrap();

    assert_eq!(snapshot.as_of_block, BlockRef::Number(100));
    let line = snapshot.line(&token_a()).unwrap();
    assert_eq!(line.error, Some(ErrorKind::HistoricalStateUnavailable));
    assert_eq!(line.status, LineStatus::Failed);
    assert_eq!(line.symbol(), "AAA");
}

#[tokio::test]
async fn historical_snapshot_by_timestamp() {
    let genesis = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap();
    let chain = InMemoryChainClient::new(1_000)
        .with_block_times(genesis, 12)
        .with_token(token_a(), "AAA", "Token A", 6)
        .with_transfer(token_a(), counterparty(), owner(), 10)
        .with_transfer(token_a(), counterparty(), owner(), 600)
        .with_balance_from(token_a(), owner(), 10, U256::from(500_000u64))
        .with_balance_from(token_a(), owner(), 600, U256::from(1_500_000u64));

    let at = genesis + chrono::Duration::seconds(12 * 300);
    let snapshot = aggregator(chain)
        .build_snapshot(OWNER, BuildOptions::default().at(SnapshotAt::Timestamp(at)))
        .await
        .unwrap();

    assert_eq!(snapshot.as_of_block, BlockRef::Number(300));
    assert_eq!(
        snapshot.lines[0].balance.as_ref().unwrap().amount(),
        "0.5"
    );
    assert_eq!(snapshot.total_value_usd, dec!(1.00));
}

#[tokio::test]
async fn tokens_after_pinned_block_are_not_discovered() {
    let chain = chain_with_token_a()
        .with_token(token_c(), "CCC", "Token C", 18)
        .with_transfer(token_c(), counterparty(), owner(), 800);

    let snapshot = aggregator(chain)
        .build_snapshot(OWNER, BuildOptions::default().at(SnapshotAt::Block(500)))
        .await
        .unwrap();

    assert!(snapshot.line(&token_c()).is_none());
    assert!(snapshot.line(&token_a()).is_some());
}

#[tokio::test]
async fn discovery_gap_is_a_snapshot_warning() {
    let chain = chain_with_token_a().with_failing_log_block(700);

    let snapshot = aggregator(chain)
        .build_snapshot(OWNER, BuildOptions::default())
        .await
        .unwrap();

    assert!(snapshot.is_partial());
    assert!(snapshot
        .warnings
        .iter()
        .all(|warning| warning.kind == ErrorKind::DiscoveryPartial));
    assert_eq!(snapshot.line(&token_a()).unwrap().status, LineStatus::Resolved);
}

#[tokio::test(start_paused = true)]
async fn deadline_marks_unfinished_tokens_cancelled() {
    let chain = chain_with_token_a()
        .with_token(token_b(), "BBB", "Token B", 18)
        .with_transfer(token_b(), counterparty(), owner(), 20)
        .with_balance(token_b(), owner(), U256::exp10(18))
        .with_call_delay(token_b(), Duration::from_secs(60));

    let aggregator = aggregator_with(
        chain,
        prices().with_price("BBB", dec!(1)),
        TokenDirectory::default(),
    );
    let snapshot = aggregator
        .build_snapshot(
            OWNER,
            BuildOptions::default().with_deadline(Duration::from_secs(5)),
        )
        .await
        .unwrap();

    assert_eq!(snapshot.lines.len(), 2);
    let slow = snapshot.line(&token_b()).unwrap();
    assert_eq!(slow.error, Some(ErrorKind::Cancelled));
    assert_eq!(slow.status, LineStatus::Failed);
    let fast = snapshot.line(&token_a()).unwrap();
    assert_eq!(fast.balance.as_ref().unwrap().amount(), "1.5");
    assert!(fast.value_usd.is_none() || fast.value_usd == Some(dec!(3.00)));
}

#[tokio::test]
async fn caller_cancellation_before_start_cancels_every_line() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let directory = TokenDirectory::new([DirectoryEntry {
        chain_id: 1,
        symbol: "AAA".to_string(),
        address: token_a(),
        decimals: 6,
    }]);

    let snapshot = aggregator_with(chain_with_token_a(), prices(), directory)
        .build_snapshot(
            OWNER,
            BuildOptions::default()
                .watching(WatchList::from_symbols(["AAA"]))
                .cancelled_by(cancel),
        )
        .await
        .unwrap();

    assert!(snapshot.is_partial());
    assert_eq!(snapshot.warnings[0].kind, ErrorKind::Cancelled);
    assert_eq!(snapshot.as_of_block, BlockRef::Latest);
    assert_eq!(snapshot.lines.len(), 1);
    assert_eq!(snapshot.lines[0].error, Some(ErrorKind::Cancelled));
    assert_eq!(snapshot.total_value_usd, dec!(0));
}

#[tokio::test]
async fn metadata_cache_is_shared_across_builds() {
    let chain = Arc::new(chain_with_token_a());
    let aggregator = PortfolioAggregator::new(
        chain.clone(),
        Arc::new(PriceOracleAdapter::new(Arc::new(prices()), Duration::from_secs(1))),
        Arc::new(TokenDirectory::default()),
        AggregatorConfig::default(),
    );

    for _ in 0..3 {
        aggregator
            .build_snapshot(OWNER, BuildOptions::default())
            .await
            .unwrap();
    }

    assert_eq!(chain.calls(TokenMethod::Symbol), 1);
    assert_eq!(chain.calls(TokenMethod::BalanceOf), 3);
    assert_eq!(aggregator.metadata().cache_len(), 1);
}

fn shared_aggregator(chain: Arc<InMemoryChainClient>) -> PortfolioAggregator {
    PortfolioAggregator::new(
        chain,
        Arc::new(PriceOracleAdapter::new(Arc::new(prices()), Duration::from_secs(1))),
        Arc::new(TokenDirectory::mainnet_defaults()),
        AggregatorConfig::default(),
    )
}

fn watching_eth() -> BuildOptions {
    BuildOptions::default().watching(WatchList::from_symbols(["ETH"]))
}

#[tokio::test(start_paused = true)]
async fn deadline_covers_a_stalled_head_lookup() {
    let chain = chain_with_token_a()
        .with_native_balance(owner(), 0, U256::exp10(18))
        .with_head_delay(Duration::from_secs(3600));
    let aggregator = aggregator_with(chain, prices(), TokenDirectory::mainnet_defaults());

    let started = tokio::time::Instant::now();
    let snapshot = aggregator
        .build_snapshot(OWNER, watching_eth().with_deadline(Duration::from_secs(5)))
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(snapshot.as_of_block, BlockRef::Latest);
    assert_eq!(snapshot.warnings.len(), 1);
    assert_eq!(snapshot.warnings[0].kind, ErrorKind::Cancelled);
    assert!(snapshot.line(&token_a()).is_none());
    let eth = snapshot.line(&NATIVE_TOKEN_ADDRESS).unwrap();
    assert_eq!(eth.status, LineStatus::Failed);
    assert_eq!(eth.error, Some(ErrorKind::Cancelled));
    assert_eq!(snapshot.total_value_usd, dec!(0));
}

#[tokio::test]
async fn unmappable_timestamp_skips_discovery_and_balances() {
    let chain = Arc::new(
        chain_with_token_a()
            .with_native_balance(owner(), 0, U256::exp10(18))
            .with_failing_block_times(),
    );
    let at = Utc.with_ymd_and_hms(2020, 1, 1, 1, 0, 0).unwrap();

    let snapshot = shared_aggregator(chain.clone())
        .build_snapshot(OWNER, watching_eth().at(SnapshotAt::Timestamp(at)))
        .await
        .unwrap();

    assert_eq!(snapshot.as_of_block, BlockRef::Latest);
    assert_eq!(snapshot.warnings.len(), 1);
    assert_eq!(snapshot.warnings[0].kind, ErrorKind::HistoricalStateUnavailable);
    assert_eq!(chain.log_queries(), 0);
    assert!(snapshot.line(&token_a()).is_none());
    let eth = snapshot.line(&NATIVE_TOKEN_ADDRESS).unwrap();
    assert_eq!(eth.status, LineStatus::Failed);
    assert_eq!(eth.error, Some(ErrorKind::HistoricalStateUnavailable));
    assert!(eth.balance.is_none());
    assert_eq!(snapshot.total_value_usd, dec!(0));
}

#[tokio::test]
async fn unavailable_head_still_reads_watched_balances() {
    let chain = Arc::new(
        chain_with_token_a()
            .with_native_balance(owner(), 0, U256::exp10(18))
            .with_failing_head(),
    );

    let snapshot = shared_aggregator(chain.clone())
        .build_snapshot(OWNER, watching_eth())
        .await
        .unwrap();

    assert_eq!(snapshot.as_of_block, BlockRef::Latest);
    assert!(snapshot.is_partial());
    assert_eq!(snapshot.warnings[0].kind, ErrorKind::DiscoveryPartial);
    assert_eq!(chain.log_queries(), 0);
    assert!(snapshot.line(&token_a()).is_none());
    let eth = snapshot.line(&NATIVE_TOKEN_ADDRESS).unwrap();
    assert_eq!(eth.status, LineStatus::Resolved);
    assert_eq!(eth.value_usd, Some(dec!(3000)));
}

#[tokio::test]
async fn block_past_head_is_rejected_before_any_read() {
    let chain = Arc::new(chain_with_token_a().with_pruned_before(500));

    let err = shared_aggregator(chain.clone())
        .build_snapshot(OWNER, watching_eth().at(SnapshotAt::Block(5_000)))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PortfolioError::BlockAhead {
            requested: 5_000,
            latest: 1_000
        }
    ));
    assert_eq!(err.kind(), ErrorKind::InvalidBlock);
    assert_eq!(chain.log_queries(), 0);
    assert_eq!(chain.calls(TokenMethod::BalanceOf), 0);
}

#[tokio::test]
async fn overflowing_value_keeps_the_quote() {
    let chain = chain_with_token_a()
        .with_token(token_b(), "BBB", "Token B", 0)
        .with_transfer(token_b(), counterparty(), owner(), 20)
        .with_balance(token_b(), owner(), U256::MAX);

    let snapshot = aggregator_with(
        chain,
        prices().with_price("BBB", dec!(1)),
        TokenDirectory::default(),
    )
    .build_snapshot(OWNER, BuildOptions::default())
    .await
    .unwrap();

    let huge = snapshot.line(&token_b()).unwrap();
    assert_eq!(huge.status, LineStatus::PartiallyFailed);
    assert_eq!(huge.error, Some(ErrorKind::ValueOverflow));
    assert_eq!(huge.quote.as_ref().and_then(|q| q.usd_unit_price), Some(dec!(1)));
    assert!(huge.value_usd.is_none());
    assert_eq!(snapshot.total_value_usd, dec!(3.00));
}
