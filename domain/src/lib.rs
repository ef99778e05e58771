use std::fmt;

use chrono::{DateTime, Utc};
use ethers::types::U256;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

mod address;
mod units;

pub use address::{Address, AddressError, NATIVE_TOKEN_ADDRESS};
pub use units::{FormattedBalance, UnitsError, USD_VALUE_SCALE};

/// Decimals of every EVM chain's native coin.
pub const NATIVE_DECIMALS: u8 = 18;

/// Point in chain history a read is pinned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockRef {
    Latest,
    Number(u64),
}

impl BlockRef {
    pub fn number(&self) -> Option<u64> {
        match self {
            BlockRef::Latest => None,
            BlockRef::Number(n) => Some(*n),
        }
    }
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockRef::Latest => f.write_str("latest"),
            BlockRef::Number(n) => write!(f, "{n}"),
        }
    }
}

impl Serialize for BlockRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            BlockRef::Latest => serializer.serialize_str("latest"),
            BlockRef::Number(n) => serializer.serialize_u64(*n),
        }
    }
}

/// What a caller asks a snapshot to be pinned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotAt {
    Latest,
    Block(u64),
    Timestamp(DateTime<Utc>),
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InvalidAddress,
    /// Requested block is past the chain head.
    InvalidBlock,
    MetadataUnavailable,
    BalanceUnavailable,
    HistoricalStateUnavailable,
    PriceUnavailable,
    /// Priced, but balance times price does not fit a decimal.
    ValueOverflow,
    DiscoveryPartial,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::InvalidAddress => "invalid address",
            ErrorKind::InvalidBlock => "invalid block",
            ErrorKind::MetadataUnavailable => "metadata unavailable",
            ErrorKind::BalanceUnavailable => "balance unavailable",
            ErrorKind::HistoricalStateUnavailable => "historical state unavailable",
            ErrorKind::PriceUnavailable => "price unavailable",
            ErrorKind::ValueOverflow => "value overflow",
            ErrorKind::DiscoveryPartial => "discovery partial",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenMetadata {
    pub contract_address: Address,
    pub symbol: String,
    pub name: String,
    pub decimals: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBalance {
    pub contract_address: Address,
    pub owner_address: Address,
    pub raw_amount: U256,
    pub at_block: BlockRef,
}

impl RawBalance {
    pub fn format(&self, decimals: u8) -> FormattedBalance {
        FormattedBalance::new(self.raw_amount, decimals)
    }
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PriceQuote {
    pub symbol: String,
    pub usd_unit_price: Option<Decimal>,
    pub as_of: DateTime<Utc>,
}

impl PriceQuote {
    pub fn unavailable(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            usd_unit_price: None,
            as_of: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LineStatus {
    Resolved,
    PartiallyFailed,
    Failed,
}

/// One row of a snapshot: a discovered or watched token and what could be learned about it.
#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TokenLine {
    pub contract_address: Address,
    pub metadata: Option<TokenMetadata>,
    pub balance: Option<FormattedBalance>,
    pub quote: Option<PriceQuote>,
    pub value_usd: Option<Decimal>,
    pub status: LineStatus,
    pub error: Option<ErrorKind>,
}

impl TokenLine {
    /// Metadata and balance known; value present only when the quote carries a price.
    pub fn priced(metadata: TokenMetadata, balance: FormattedBalance, quote: PriceQuote) -> Self {
        let value_usd = quote
            .usd_unit_price
            .and_then(|price| balance.value_at(price));
        let (status, error) = match (value_usd, quote.usd_unit_price) {
            (Some(_), _) => (LineStatus::Resolved, None),
            (None, Some(_)) => (LineStatus::PartiallyFailed, Some(ErrorKind::ValueOverflow)),
            (None, None) => (LineStatus::PartiallyFailed, Some(ErrorKind::PriceUnavailable)),
        };
        Self {
            contract_address: metadata.contract_address,
            metadata: Some(metadata),
            balance: Some(balance),
            quote: Some(quote),
            value_usd,
            status,
            error,
        }
    }

    /// A token whose metadata or balance could not be determined.
    pub fn failed(
        contract_address: Address,
        metadata: Option<TokenMetadata>,
        error: ErrorKind,
    ) -> Self {
        Self {
            contract_address,
            metadata,
            balance: None,
            quote: None,
            value_usd: None,
            status: LineStatus::Failed,
            error: Some(error),
        }
    }

    pub fn symbol(&self) -> &str {
        self.metadata
            .as_ref()
            .map(|m| m.symbol.as_str())
            .unwrap_or("")
    }

    /// The amount this line adds to the snapshot total.
    pub fn counted_value(&self) -> Option<Decimal> {
        match self.status {
            LineStatus::Resolved => self.value_usd,
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotWarning {
    pub kind: ErrorKind,
    pub message: String,
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioSnapshot {
    pub id: Uuid,
    pub owner: Address,
    pub chain_id: u64,
    pub as_of_block: BlockRef,
    pub generated_at: DateTime<Utc>,
    pub lines: Vec<TokenLine>,
    pub total_value_usd: Decimal,
    pub warnings: Vec<SnapshotWarning>,
    pub unresolved_watch_symbols: Vec<String>,
}

impl PortfolioSnapshot {
    /// Orders the lines and derives the total; the result is never mutated afterwards.
    pub fn assemble(
        id: Uuid,
        owner: Address,
        chain_id: u64,
        as_of_block: BlockRef,
        mut lines: Vec<TokenLine>,
        warnings: Vec<SnapshotWarning>,
        unresolved_watch_symbols: Vec<String>,
    ) -> Self {
        lines.sort_by(|a, b| {
            a.symbol()
                .to_lowercase()
                .cmp(&b.symbol().to_lowercase())
                .then_with(|| a.contract_address.cmp(&b.contract_address))
        });
        let total_value_usd = lines
            .iter()
            .filter_map(TokenLine::counted_value)
            .fold(Decimal::ZERO, |acc, value| acc.saturating_add(value));
        Self {
            id,
            owner,
            chain_id,
            as_of_block,
            generated_at: Utc::now(),
            lines,
            total_value_usd,
            warnings,
            unresolved_watch_symbols,
        }
    }

    pub fn line(&self, contract_address: &Address) -> Option<&TokenLine> {
        self.lines
            .iter()
            .find(|line| line.contract_address == *contract_address)
    }

    /// Whether the holding set may be incomplete: discovery left gaps or never ran.
    pub fn is_partial(&self) -> bool {
        self.warnings.iter().any(|warning| {
            matches!(warning.kind, ErrorKind::DiscoveryPartial | ErrorKind::Cancelled)
        })
    }
}
