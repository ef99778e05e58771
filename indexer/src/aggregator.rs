use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};

use domain::{
    Address, BlockRef, ErrorKind, LineStatus, PortfolioSnapshot, PriceQuote, RawBalance,
    SnapshotAt, SnapshotWarning, TokenLine, TokenMetadata,
};
use futures::{stream, StreamExt};
use tokio::{task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    balance::BalanceFetcher,
    chain::ChainClient,
    directory::TokenDirectory,
    discovery::{DiscoveryPolicy, HoldingDiscoverer},
    error::{ChainError, PortfolioError},
    metadata::{MetadataPolicy, TokenMetadataResolver},
    price::PriceOracleAdapter,
    watchlist::WatchList,
};

#[derive(Debug, Clone, Copy)]
pub struct AggregatorConfig {
    pub chain_id: u64,
    /// Tokens whose pipelines run at the same time.
    pub max_concurrency: usize,
    /// Deadline applied when a request names none.
    pub snapshot_timeout: Duration,
    pub since_block: u64,
    pub metadata: MetadataPolicy,
    pub discovery: DiscoveryPolicy,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            chain_id: 1,
            max_concurrency: 8,
            snapshot_timeout: Duration::from_secs(30),
            since_block: 0,
            metadata: MetadataPolicy::default(),
            discovery: DiscoveryPolicy::default(),
        }
    }
}

/// Per-request knobs for [`PortfolioAggregator::build_snapshot`].
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub at: SnapshotAt,
    pub watch: WatchList,
    pub since_block: Option<u64>,
    pub deadline: Option<Duration>,
    pub cancel: CancellationToken,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            at: SnapshotAt::Latest,
            watch: WatchList::default(),
            since_block: None,
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl BuildOptions {
    pub fn at(mut self, at: SnapshotAt) -> Self {
        self.at = at;
        self
    }

    pub fn watching(mut self, watch: WatchList) -> Self {
        self.watch = watch;
        self
    }

    pub fn since_block(mut self, block: u64) -> Self {
        self.since_block = Some(block);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn cancelled_by(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

enum Fetched {
    Loaded {
        metadata: TokenMetadata,
        balance: RawBalance,
    },
    Failed {
        metadata: Option<TokenMetadata>,
        kind: ErrorKind,
    },
}

/// Where a build reads balances, and whether discovery may scan up to `as_of`.
struct Pinned {
    as_of: BlockRef,
    balances_at: Option<BlockRef>,
    discover: bool,
}

/// Cancels the build when the deadline passes; disarmed on drop.
struct Deadline(JoinHandle<()>);

impl Deadline {
    fn arm(cancel: CancellationToken, after: Duration) -> Self {
        Self(tokio::spawn(async move {
            sleep(after).await;
            cancel.cancel();
        }))
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// One chain's engine: discovery, metadata, balances and prices folded into snapshots.
pub struct PortfolioAggregator {
    config: AggregatorConfig,
    metadata: Arc<TokenMetadataResolver>,
    balances: BalanceFetcher,
    discoverer: HoldingDiscoverer,
    prices: Arc<PriceOracleAdapter>,
    directory: Arc<TokenDirectory>,
}

impl PortfolioAggregator {
    pub fn new(
        client: Arc<dyn ChainClient>,
        prices: Arc<PriceOracleAdapter>,
        directory: Arc<TokenDirectory>,
        config: AggregatorConfig,
    ) -> Self {
        let metadata = Arc::new(
            TokenMetadataResolver::new(client.clone(), config.metadata).for_chain(config.chain_id),
        );
        Self {
            balances: BalanceFetcher::new(client.clone(), metadata.clone()),
            discoverer: HoldingDiscoverer::new(client, config.discovery),
            config: AggregatorConfig {
                max_concurrency: config.max_concurrency.max(1),
                ..config
            },
            metadata,
            prices,
            directory,
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    pub fn balances(&self) -> &BalanceFetcher {
        &self.balances
    }

    pub fn metadata(&self) -> &TokenMetadataResolver {
        &self.metadata
    }

    pub fn directory(&self) -> &TokenDirectory {
        &self.directory
    }

    pub fn prices(&self) -> &PriceOracleAdapter {
        &self.prices
    }

    /// Builds a snapshot of `owner`. Only a malformed address or a block past
    /// the chain head is an error; every other failure is recorded on the snapshot.
    pub async fn build_snapshot(
        &self,
        owner: &str,
        options: BuildOptions,
    ) -> Result<PortfolioSnapshot, PortfolioError> {
        let owner = Address::parse(owner).map_err(|source| PortfolioError::InvalidAddress {
            input: owner.to_string(),
            source,
        })?;
        let id = Uuid::new_v4();
        let span = info_span!(
            "build_snapshot",
            owner = %owner,
            snapshot_id = %id,
            chain_id = self.config.chain_id
        );
        self.build(id, owner, options).instrument(span).await
    }

    async fn build(
        &self,
        id: Uuid,
        owner: Address,
        options: BuildOptions,
    ) -> Result<PortfolioSnapshot, PortfolioError> {
        let cancel = options.cancel.child_token();
        let _deadline = Deadline::arm(
            cancel.clone(),
            options.deadline.unwrap_or(self.config.snapshot_timeout),
        );
        let mut warnings = Vec::new();

        let pinned = self.pin(options.at, &cancel, &mut warnings).await?;
        let mut tokens = BTreeSet::new();
        if let (true, Some(until_block)) = (pinned.discover, pinned.as_of.number()) {
            let since_block = options.since_block.unwrap_or(self.config.since_block);
            let discovery = self
                .discoverer
                .discover(owner, since_block, until_block, &cancel)
                .await;
            tokens.extend(discovery.contracts);
            warnings.extend(discovery.warnings);
        }
        let watched = options.watch.resolve(&self.directory, self.config.chain_id);
        tokens.extend(watched.contracts);

        let mut fetched = self.fetch_all(owner, &tokens, pinned.balances_at, &cancel).await;
        let quotes = self.quote(&fetched, &cancel).await;

        let lines: Vec<TokenLine> = tokens
            .iter()
            .map(|token| match fetched.remove(token) {
                Some(Fetched::Loaded { metadata, balance }) => {
                    let quote = quotes
                        .get(&metadata.symbol.to_uppercase())
                        .cloned()
                        .map(|mut quote| {
                            quote.symbol = metadata.symbol.clone();
                            quote
                        })
                        .unwrap_or_else(|| PriceQuote::unavailable(metadata.symbol.clone()));
                    let formatted = balance.format(metadata.decimals);
                    let line = TokenLine::priced(metadata, formatted, quote);
                    if line.error == Some(ErrorKind::ValueOverflow) {
                        warn!(
                            token = %token,
                            symbol = line.symbol(),
                            "usd value overflows; line left unvalued"
                        );
                    }
                    line
                }
                Some(Fetched::Failed { metadata, kind }) => TokenLine::failed(*token, metadata, kind),
                None => TokenLine::failed(*token, self.metadata.cached(token), ErrorKind::Cancelled),
            })
            .collect();

        let snapshot = PortfolioSnapshot::assemble(
            id,
            owner,
            self.config.chain_id,
            pinned.as_of,
            lines,
            warnings,
            watched.unresolved,
        );
        let count = |status: LineStatus| snapshot.lines.iter().filter(|l| l.status == status).count();
        info!(
            block = %snapshot.as_of_block,
            lines = snapshot.lines.len(),
            resolved = count(LineStatus::Resolved),
            partially_failed = count(LineStatus::PartiallyFailed),
            failed = count(LineStatus::Failed),
            warnings = snapshot.warnings.len(),
            total_value_usd = %snapshot.total_value_usd,
            "portfolio snapshot built"
        );
        Ok(snapshot)
    }

    /// Resolves the requested point in time before any token work starts.
    /// Only a block past the head is fatal; other failures become warnings.
    async fn pin(
        &self,
        at: SnapshotAt,
        cancel: &CancellationToken,
        warnings: &mut Vec<SnapshotWarning>,
    ) -> Result<Pinned, PortfolioError> {
        let resolved = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            resolved = self.balances.resolve_block(at) => Some(resolved),
        };
        let Some(resolved) = resolved else {
            warn!(at = ?at, "deadline reached before the snapshot was pinned to a block");
            warnings.push(SnapshotWarning {
                kind: ErrorKind::Cancelled,
                message: "deadline reached before the snapshot was pinned to a block".to_string(),
                from_block: None,
                to_block: None,
            });
            return Ok(Pinned {
                as_of: BlockRef::Latest,
                balances_at: None,
                discover: false,
            });
        };

        let err = match resolved {
            Ok(block) => {
                return Ok(Pinned {
                    as_of: block,
                    balances_at: Some(block),
                    discover: true,
                })
            }
            Err(ChainError::BlockAhead { requested, latest }) => {
                return Err(PortfolioError::BlockAhead { requested, latest })
            }
            Err(err) => err,
        };
        warn!(error = %err, at = ?at, "could not pin snapshot to a block");
        let (kind, message, pinned) = match at {
            SnapshotAt::Timestamp(timestamp) => (
                ErrorKind::HistoricalStateUnavailable,
                format!("no block found for {timestamp}; balances and discovery skipped: {err}"),
                Pinned {
                    as_of: BlockRef::Latest,
                    balances_at: None,
                    discover: false,
                },
            ),
            SnapshotAt::Block(number) => (
                ErrorKind::DiscoveryPartial,
                format!("chain head unavailable; discovery skipped: {err}"),
                Pinned {
                    as_of: BlockRef::Number(number),
                    balances_at: Some(BlockRef::Number(number)),
                    discover: false,
                },
            ),
            SnapshotAt::Latest => (
                ErrorKind::DiscoveryPartial,
                format!("latest block unavailable; discovery skipped: {err}"),
                Pinned {
                    as_of: BlockRef::Latest,
                    balances_at: Some(BlockRef::Latest),
                    discover: false,
                },
            ),
        };
        warnings.push(SnapshotWarning {
            kind,
            message,
            from_block: None,
            to_block: None,
        });
        Ok(pinned)
    }

    async fn fetch_all(
        &self,
        owner: Address,
        tokens: &BTreeSet<Address>,
        at: Option<BlockRef>,
        cancel: &CancellationToken,
    ) -> HashMap<Address, Fetched> {
        let mut results = HashMap::with_capacity(tokens.len());
        let pipeline = stream::iter(tokens.iter().copied())
            .map(move |token| async move { (token, self.fetch_token(owner, token, at).await) })
            .buffer_unordered(self.config.max_concurrency);
        tokio::pin!(pipeline);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(
                        finished = results.len(),
                        abandoned = tokens.len() - results.len(),
                        "snapshot cancelled; abandoning in-flight token fetches"
                    );
                    break;
                }
                next = pipeline.next() => match next {
                    Some((token, outcome)) => {
                        results.insert(token, outcome);
                    }
                    None => break,
                },
            }
        }
        results
    }

    async fn fetch_token(&self, owner: Address, token: Address, at: Option<BlockRef>) -> Fetched {
        let Some(at) = at else {
            return Fetched::Failed {
                metadata: self.metadata.resolve(token).await.ok(),
                kind: ErrorKind::HistoricalStateUnavailable,
            };
        };
        let (metadata, balance) = tokio::join!(
            self.metadata.resolve(token),
            self.balances.fetch_balance(owner, token, at),
        );
        match (metadata, balance) {
            (Ok(metadata), Ok(balance)) => Fetched::Loaded { metadata, balance },
            (Err(err), _) => Fetched::Failed {
                metadata: None,
                kind: err.kind(),
            },
            (Ok(metadata), Err(err)) => {
                warn!(token = %token, error = %err, "balance unavailable");
                Fetched::Failed {
                    metadata: Some(metadata),
                    kind: err.kind(),
                }
            }
        }
    }

    async fn quote(
        &self,
        fetched: &HashMap<Address, Fetched>,
        cancel: &CancellationToken,
    ) -> HashMap<String, PriceQuote> {
        let symbols: Vec<String> = fetched
            .values()
            .filter_map(|outcome| match outcome {
                Fetched::Loaded { metadata, .. } => Some(metadata.symbol.clone()),
                Fetched::Failed { .. } => None,
            })
            .collect();
        if symbols.is_empty() {
            return HashMap::new();
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => HashMap::new(),
            quotes = self.prices.quote_many(&symbols) => quotes,
        }
    }
}
