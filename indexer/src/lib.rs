mod aggregator;
mod balance;
mod chain;
mod directory;
mod discovery;
mod error;
mod in_memory;
mod metadata;
mod price;
mod throttle;
mod watchlist;

pub use aggregator::{AggregatorConfig, BuildOptions, PortfolioAggregator};
pub use balance::BalanceFetcher;
pub use chain::{
    transfer_topic, ChainClient, EthersChainClient, TransferLog, TransferSide,
    TRANSFER_EVENT_SIGNATURE,
};
pub use directory::{native_metadata, native_symbol, DirectoryEntry, TokenDirectory};
pub use discovery::{Discovery, DiscoveryPolicy, HoldingDiscoverer};
pub use error::{ChainError, PortfolioError, TokenError};
pub use in_memory::{InMemoryChainClient, TokenMethod};
pub use metadata::{MetadataPolicy, TokenMetadataResolver};
pub use price::{PriceOracleAdapter, PriceSource, PriceSourceError, StaticPriceSource};
pub use throttle::{ThrottlePolicy, ThrottledChainClient};
pub use watchlist::{WatchList, WatchListError, WatchResolution};

pub use tokio_util::sync::CancellationToken;
