use domain::{Address, AddressError, BlockRef, ErrorKind};
use thiserror::Error;

/// Failure of a single read against the chain.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("call reverted: {0}")]
    Reverted(String),
    #[error("state for block {block} is not available on this node: {message}")]
    HistoricalStateUnavailable { block: BlockRef, message: String },
    #[error("chain call timed out")]
    Timeout,
    #[error("block {0} not found")]
    BlockNotFound(u64),
    #[error("block {requested} is ahead of the chain head {latest}")]
    BlockAhead { requested: u64, latest: u64 },
    #[error("could not decode response: {0}")]
    Decode(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl ChainError {
    /// Sorts a provider error message into the variants callers act on.
    pub fn classify(message: impl Into<String>, at: BlockRef) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        const PRUNED: &[&str] = &[
            "missing trie node",
            "header not found",
            "pruned",
            "historical state",
            "state is not available",
            "state histories haven't been fully indexed",
            "distance to target block exceeds maximum",
        ];
        if PRUNED.iter().any(|needle| lower.contains(needle)) {
            return ChainError::HistoricalStateUnavailable { block: at, message };
        }
        if lower.contains("revert") {
            return ChainError::Reverted(message);
        }
        if lower.contains("timed out") || lower.contains("timeout") {
            return ChainError::Timeout;
        }
        if lower.contains("decode") || lower.contains("invalid data") || lower.contains("abi error") {
            return ChainError::Decode(message);
        }
        ChainError::Transport(message)
    }

    /// Whether repeating the same call could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChainError::Timeout | ChainError::Transport(_))
    }
}

/// Per-token soft failure; recorded on the snapshot line, never propagated.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("metadata unavailable for {contract}: {source}")]
    MetadataUnavailable {
        contract: Address,
        source: ChainError,
    },
    #[error("balance unavailable for {contract}: {source}")]
    BalanceUnavailable {
        contract: Address,
        source: ChainError,
    },
    #[error("historical state unavailable for {contract} at block {block}")]
    HistoricalStateUnavailable { contract: Address, block: BlockRef },
}

impl TokenError {
    pub fn balance(contract: Address, source: ChainError) -> Self {
        match source {
            ChainError::HistoricalStateUnavailable { block, .. } => {
                TokenError::HistoricalStateUnavailable { contract, block }
            }
            other => TokenError::BalanceUnavailable {
                contract,
                source: other,
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TokenError::MetadataUnavailable { .. } => ErrorKind::MetadataUnavailable,
            TokenError::BalanceUnavailable { .. } => ErrorKind::BalanceUnavailable,
            TokenError::HistoricalStateUnavailable { .. } => ErrorKind::HistoricalStateUnavailable,
        }
    }
}

/// Errors that abort a snapshot build before any work starts.
#[derive(Debug, Error)]
pub enum PortfolioError {
    #[error("invalid address {input:?}: {source}")]
    InvalidAddress { input: String, source: AddressError },
    #[error("block {requested} is ahead of the chain head {latest}")]
    BlockAhead { requested: u64, latest: u64 },
}

impl PortfolioError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PortfolioError::InvalidAddress { .. } => ErrorKind::InvalidAddress,
            PortfolioError::BlockAhead { .. } => ErrorKind::InvalidBlock,
        }
    }
}
