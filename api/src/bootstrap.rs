use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use domain::Address;
use ethers::providers::{Http, Provider};
use indexer::{
    AggregatorConfig, ChainClient, DirectoryEntry, DiscoveryPolicy, EthersChainClient,
    MetadataPolicy, PortfolioAggregator, PriceOracleAdapter, PriceSource, StaticPriceSource,
    ThrottlePolicy, ThrottledChainClient, TokenDirectory,
};
use tracing::{info, warn};

use crate::{
    config::{AppConfig, Erc20TokenConfig},
    services::{demo_chain, demo_prices, CoingeckoPriceSource, FallbackPriceSource},
    state::{AppState, ChainEngines},
};

pub fn build_state(config: &AppConfig) -> Result<AppState> {
    let directory = Arc::new(build_directory(&config.erc20_tokens));
    let prices = Arc::new(PriceOracleAdapter::new(
        build_price_source(config),
        config.price_timeout,
    ));

    let mut engines = Vec::new();
    if config.offline_mode {
        warn!(chain_id = config.default_chain_id, "offline mode: serving the in-memory demo chain");
        let chain = demo_chain(&directory, config.default_chain_id);
        engines.push(build_engine(config, config.default_chain_id, Arc::new(chain), prices.clone(), directory.clone()));
    } else {
        for (chain_id, url) in config.rpc_urls() {
            let provider = Provider::<Http>::try_from(url.as_str())
                .with_context(|| format!("invalid RPC url for chain {chain_id}"))?
                .interval(Duration::from_millis(500));
            let client = ThrottledChainClient::new(
                EthersChainClient::new(Arc::new(provider)),
                ThrottlePolicy {
                    max_in_flight: config.rpc_max_in_flight,
                    min_interval: config.rpc_min_interval,
                },
            );
            info!(chain_id, "chain engine ready");
            engines.push(build_engine(config, chain_id, Arc::new(client), prices.clone(), directory.clone()));
        }
    }

    Ok(AppState {
        config: config.clone(),
        engines: Arc::new(ChainEngines::new(config.default_chain_id, engines)),
        directory,
    })
}

/// Wires one chain's aggregator with the tuning from `config`.
pub fn build_engine(
    config: &AppConfig,
    chain_id: u64,
    client: Arc<dyn ChainClient>,
    prices: Arc<PriceOracleAdapter>,
    directory: Arc<TokenDirectory>,
) -> Arc<PortfolioAggregator> {
    Arc::new(PortfolioAggregator::new(
        client,
        prices,
        directory,
        aggregator_config(config, chain_id),
    ))
}

pub fn aggregator_config(config: &AppConfig, chain_id: u64) -> AggregatorConfig {
    AggregatorConfig {
        chain_id,
        max_concurrency: config.portfolio_max_concurrency,
        snapshot_timeout: config.snapshot_timeout,
        since_block: config.discovery_since_block,
        metadata: MetadataPolicy {
            call_timeout: config.metadata_timeout,
            retry_backoff: config.metadata_retry_backoff,
        },
        discovery: DiscoveryPolicy {
            block_range: config.discovery_block_range,
            min_block_range: config.discovery_min_block_range,
        },
    }
}

/// `ERC20_TOKENS` when set, otherwise the built-in mainnet table.
pub fn build_directory(tokens: &[Erc20TokenConfig]) -> TokenDirectory {
    if tokens.is_empty() {
        return TokenDirectory::mainnet_defaults();
    }
    let entries = tokens.iter().filter_map(|token| match Address::parse(&token.address) {
        Ok(address) => Some(DirectoryEntry {
            chain_id: token.chain_id,
            symbol: token.symbol.clone(),
            address,
            decimals: token.decimals,
        }),
        Err(err) => {
            warn!(symbol = %token.symbol, address = %token.address, error = %err, "skipping ERC20_TOKENS entry");
            None
        }
    });
    TokenDirectory::new(entries)
}

fn build_price_source(config: &AppConfig) -> Arc<dyn PriceSource> {
    if config.offline_mode {
        return Arc::new(demo_prices(&config.token_prices));
    }
    let coingecko = Arc::new(CoingeckoPriceSource::new(
        config.coingecko_api_base.clone(),
        config.token_price_ids.clone(),
        config.price_cache_ttl,
    ));
    if config.token_prices.is_empty() {
        return coingecko;
    }
    let table = Arc::new(StaticPriceSource::new(
        config
            .token_prices
            .iter()
            .map(|(symbol, price)| (symbol.clone(), *price)),
    ));
    Arc::new(FallbackPriceSource::new(coingecko, table))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_erc20_list;

    #[test]
    fn directory_skips_malformed_addresses() {
        let tokens = parse_erc20_list(
            "USDC:0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48:6,BAD:0x1234,BUSD:0xe9e7cea3dedca5984780bafc599bd69add087d56:18:56",
        );
        let directory = build_directory(&tokens);
        assert_eq!(directory.len(), 2);
        assert_eq!(directory.by_symbol(1, "usdc").map(|e| e.decimals), Some(6));
        assert!(directory.by_symbol(56, "BUSD").is_some());
        assert!(directory.by_symbol(1, "BAD").is_none());
    }

    #[test]
    fn empty_token_list_uses_mainnet_table() {
        let directory = build_directory(&[]);
        assert!(directory.by_symbol(1, "WETH").is_some());
        assert!(directory.by_symbol(1, "USDC").is_some());
    }
}
