use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use domain::{Address, BlockRef};
use ethers::types::U256;
use tokio::time::sleep;

use crate::{
    chain::{ChainClient, TransferLog, TransferSide},
    error::ChainError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenMethod {
    Symbol,
    Name,
    Decimals,
    BalanceOf,
    Allowance,
}

#[derive(Debug, Clone)]
struct TokenState {
    symbol: String,
    name: String,
    decimals: u8,
}

/// Deterministic chain held in memory: scripted tokens, balances, transfer
/// history and failure modes. Backs offline mode and the test suites.
pub struct InMemoryChainClient {
    latest: u64,
    genesis: DateTime<Utc>,
    block_time_secs: i64,
    tokens: HashMap<Address, TokenState>,
    reverting: HashSet<(Address, TokenMethod)>,
    transient: Mutex<HashMap<(Address, TokenMethod), usize>>,
    balances: HashMap<(Address, Address), BTreeMap<u64, U256>>,
    native: HashMap<Address, BTreeMap<u64, U256>>,
    allowances: HashMap<(Address, Address, Address), U256>,
    transfers: Vec<TransferLog>,
    pruned_before: Option<u64>,
    max_log_range: Option<u64>,
    failing_log_blocks: HashSet<u64>,
    delays: HashMap<Address, Duration>,
    head_delay: Option<Duration>,
    failing_head: bool,
    failing_block_times: bool,
    calls: Mutex<HashMap<TokenMethod, usize>>,
    log_queries: AtomicUsize,
}

impl InMemoryChainClient {
    pub fn new(latest: u64) -> Self {
        Self {
            latest,
            genesis: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).single().unwrap_or_default(),
            block_time_secs: 12,
            tokens: HashMap::new(),
            reverting: HashSet::new(),
            transient: Mutex::new(HashMap::new()),
            balances: HashMap::new(),
            native: HashMap::new(),
            allowances: HashMap::new(),
            transfers: Vec::new(),
            pruned_before: None,
            max_log_range: None,
            failing_log_blocks: HashSet::new(),
            delays: HashMap::new(),
            head_delay: None,
            failing_head: false,
            failing_block_times: false,
            calls: Mutex::new(HashMap::new()),
            log_queries: AtomicUsize::new(0),
        }
    }

    pub fn with_block_times(mut self, genesis: DateTime<Utc>, block_time_secs: i64) -> Self {
        self.genesis = genesis;
        self.block_time_secs = block_time_secs.max(1);
        self
    }

    pub fn with_token(mut self, token: Address, symbol: &str, name: &str, decimals: u8) -> Self {
        self.tokens.insert(
            token,
            TokenState {
                symbol: symbol.to_string(),
                name: name.to_string(),
                decimals,
            },
        );
        self
    }

    pub fn with_reverting(mut self, token: Address, method: TokenMethod) -> Self {
        self.reverting.insert((token, method));
        self
    }

    /// The next `failures` calls of `method` on `token` fail with a transport error.
    pub fn with_transient_failures(self, token: Address, method: TokenMethod, failures: usize) -> Self {
        if let Ok(mut transient) = self.transient.lock() {
            transient.insert((token, method), failures);
        }
        self
    }

    pub fn with_balance(self, token: Address, owner: Address, raw: U256) -> Self {
        self.with_balance_from(token, owner, 0, raw)
    }

    /// Balance that holds from `block` until a later entry replaces it.
    pub fn with_balance_from(mut self, token: Address, owner: Address, block: u64, raw: U256) -> Self {
        self.balances
            .entry((token, owner))
            .or_default()
            .insert(block, raw);
        self
    }

    pub fn with_native_balance(mut self, owner: Address, block: u64, raw: U256) -> Self {
        self.native.entry(owner).or_default().insert(block, raw);
        self
    }

    pub fn with_allowance(mut self, token: Address, owner: Address, spender: Address, raw: U256) -> Self {
        self.allowances.insert((token, owner, spender), raw);
        self
    }

    pub fn with_transfer(mut self, token: Address, from: Address, to: Address, block: u64) -> Self {
        self.transfers.push(TransferLog {
            token,
            from,
            to,
            block_number: block,
        });
        self
    }

    /// Reads pinned below `block` fail as a pruned node would.
    pub fn with_pruned_before(mut self, block: u64) -> Self {
        self.pruned_before = Some(block);
        self
    }

    /// Log queries spanning more than `span` blocks are refused.
    pub fn with_max_log_range(mut self, span: u64) -> Self {
        self.max_log_range = Some(span.max(1));
        self
    }

    /// Every log query whose range covers `block` fails.
    pub fn with_failing_log_block(mut self, block: u64) -> Self {
        self.failing_log_blocks.insert(block);
        self
    }

    /// Token reads on `token` take `delay` before answering.
    pub fn with_call_delay(mut self, token: Address, delay: Duration) -> Self {
        self.delays.insert(token, delay);
        self
    }

    /// `latest_block` takes `delay` before answering.
    pub fn with_head_delay(mut self, delay: Duration) -> Self {
        self.head_delay = Some(delay);
        self
    }

    /// `latest_block` fails; pinned reads still answer.
    pub fn with_failing_head(mut self) -> Self {
        self.failing_head = true;
        self
    }

    /// Block timestamp lookups fail, so no timestamp maps to a block.
    pub fn with_failing_block_times(mut self) -> Self {
        self.failing_block_times = true;
        self
    }

    pub fn calls(&self, method: TokenMethod) -> usize {
        self.calls
            .lock()
            .map(|calls| calls.get(&method).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn log_queries(&self) -> usize {
        self.log_queries.load(Ordering::SeqCst)
    }

    fn resolve(&self, at: BlockRef) -> Result<u64, ChainError> {
        let block = at.number().unwrap_or(self.latest);
        if block > self.latest {
            return Err(ChainError::BlockNotFound(block));
        }
        if let (BlockRef::Number(_), Some(pruned)) = (at, self.pruned_before) {
            if block < pruned {
                return Err(ChainError::HistoricalStateUnavailable {
                    block: at,
                    message: format!("missing trie node (state pruned before block {pruned})"),
                });
            }
        }
        Ok(block)
    }

    async fn enter(&self, token: Address, method: TokenMethod) -> Result<&TokenState, ChainError> {
        if let Ok(mut calls) = self.calls.lock() {
            *calls.entry(method).or_default() += 1;
        }
        if let Some(delay) = self.delays.get(&token) {
            sleep(*delay).await;
        }
        if let Ok(mut transient) = self.transient.lock() {
            if let Some(remaining) = transient.get_mut(&(token, method)) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ChainError::Transport("upstream temporarily unavailable".to_string()));
                }
            }
        }
        if self.reverting.contains(&(token, method)) {
            return Err(ChainError::Reverted("execution reverted".to_string()));
        }
        self.tokens
            .get(&token)
            .ok_or_else(|| ChainError::Decode(format!("no contract code at {token}")))
    }
}

fn effective(history: Option<&BTreeMap<u64, U256>>, block: u64) -> U256 {
    history
        .and_then(|entries| entries.range(..=block).next_back())
        .map(|(_, raw)| *raw)
        .unwrap_or_default()
}

#[async_trait]
impl ChainClient for InMemoryChainClient {
    async fn latest_block(&self) -> Result<u64, ChainError> {
        if let Some(delay) = self.head_delay {
            sleep(delay).await;
        }
        if self.failing_head {
            return Err(ChainError::Transport("eth_blockNumber failed".to_string()));
        }
        Ok(self.latest)
    }

    async fn block_timestamp(&self, number: u64) -> Result<DateTime<Utc>, ChainError> {
        if self.failing_block_times {
            return Err(ChainError::Transport("eth_getBlockByNumber failed".to_string()));
        }
        if number > self.latest {
            return Err(ChainError::BlockNotFound(number));
        }
        Ok(self.genesis + ChronoDuration::seconds(self.block_time_secs * number as i64))
    }

    async fn transfer_logs(
        &self,
        owner: Address,
        side: TransferSide,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TransferLog>, ChainError> {
        self.log_queries.fetch_add(1, Ordering::SeqCst);
        if from_block > to_block {
            return Ok(Vec::new());
        }
        if let Some(max) = self.max_log_range {
            if to_block - from_block + 1 > max {
                return Err(ChainError::Transport(format!(
                    "query returned more than 10000 results; block range exceeds {max}"
                )));
            }
        }
        if self
            .failing_log_blocks
            .iter()
            .any(|block| (from_block..=to_block).contains(block))
        {
            return Err(ChainError::Transport("eth_getLogs failed".to_string()));
        }
        Ok(self
            .transfers
            .iter()
            .filter(|log| (from_block..=to_block).contains(&log.block_number))
            .filter(|log| match side {
                TransferSide::Received => log.to == owner,
                TransferSide::Sent => log.from == owner,
            })
            .cloned()
            .collect())
    }

    async fn symbol(&self, token: Address) -> Result<String, ChainError> {
        Ok(self.enter(token, TokenMethod::Symbol).await?.symbol.clone())
    }

    async fn name(&self, token: Address) -> Result<String, ChainError> {
        Ok(self.enter(token, TokenMethod::Name).await?.name.clone())
    }

    async fn decimals(&self, token: Address) -> Result<u8, ChainError> {
        Ok(self.enter(token, TokenMethod::Decimals).await?.decimals)
    }

    async fn balance_of(
        &self,
        token: Address,
        owner: Address,
        at: BlockRef,
    ) -> Result<U256, ChainError> {
        self.enter(token, TokenMethod::BalanceOf).await?;
        let block = self.resolve(at)?;
        Ok(effective(self.balances.get(&(token, owner)), block))
    }

    async fn allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
        at: BlockRef,
    ) -> Result<U256, ChainError> {
        self.enter(token, TokenMethod::Allowance).await?;
        self.resolve(at)?;
        Ok(self
            .allowances
            .get(&(token, owner, spender))
            .copied()
            .unwrap_or_default())
    }

    async fn native_balance(&self, owner: Address, at: BlockRef) -> Result<U256, ChainError> {
        let block = self.resolve(at)?;
        Ok(effective(self.native.get(&owner), block))
    }
}
