use std::collections::HashMap;

use chrono::{Duration as ChronoDuration, Utc};
use domain::Address;
use ethers::types::{H160, U256};
use indexer::{InMemoryChainClient, StaticPriceSource, TokenDirectory, TokenMethod};
use rust_decimal::Decimal;

/// Head of the offline chain; blocks are 12 s apart and the head is "now".
pub const DEMO_LATEST_BLOCK: u64 = 120_000;
const DEMO_BLOCK_TIME_SECS: i64 = 12;

/// Wallet that holds the offline demo portfolio.
pub const DEMO_WALLET: H160 = H160([0x42; 20]);

/// Offline chain for `OFFLINE_MODE`: the demo wallet holds native coin plus a
/// handful of directory tokens, and one unlisted contract whose `symbol()` reverts.
pub fn demo_chain(directory: &TokenDirectory, chain_id: u64) -> InMemoryChainClient {
    let wallet = Address::from(DEMO_WALLET);
    let counterparty = Address::from(H160::from_low_u64_be(0xc0ffee));
    let genesis = Utc::now() - ChronoDuration::seconds(DEMO_LATEST_BLOCK as i64 * DEMO_BLOCK_TIME_SECS);

    let mut chain = InMemoryChainClient::new(DEMO_LATEST_BLOCK)
        .with_block_times(genesis, DEMO_BLOCK_TIME_SECS)
        .with_native_balance(wallet, 0, whole(5, 17));

    let holdings: [(&str, u64, u64); 4] = [
        ("USDC", 2_500, 40_000),
        ("WETH", 2, 55_000),
        ("DAI", 120, 80_000),
        ("LINK", 35, 110_000),
    ];
    for (symbol, units, block) in holdings {
        let Some(entry) = directory.by_symbol(chain_id, symbol) else {
            continue;
        };
        chain = chain
            .with_token(entry.address, &entry.symbol, &entry.symbol, entry.decimals)
            .with_transfer(entry.address, counterparty, wallet, block)
            .with_balance_from(entry.address, wallet, block, whole(units, entry.decimals as usize));
    }

    let rug = Address::from(H160::from_low_u64_be(0xdead));
    chain
        .with_token(rug, "RUG", "Rug Token", 18)
        .with_reverting(rug, TokenMethod::Symbol)
        .with_transfer(rug, counterparty, wallet, 90_000)
        .with_balance_from(rug, wallet, 90_000, whole(1_000_000, 18))
}

/// Static quotes for offline mode, overridden by `TOKEN_PRICES`.
pub fn demo_prices(overrides: &HashMap<String, Decimal>) -> StaticPriceSource {
    let defaults = [
        ("ETH", Decimal::new(3_000, 0)),
        ("WETH", Decimal::new(3_000, 0)),
        ("USDC", Decimal::ONE),
        ("USDT", Decimal::ONE),
        ("DAI", Decimal::ONE),
        ("WBTC", Decimal::new(60_000, 0)),
        ("LINK", Decimal::new(1_450, 2)),
    ];
    overrides
        .iter()
        .fold(StaticPriceSource::new(defaults), |source, (symbol, price)| {
            source.with_price(symbol, *price)
        })
}

fn whole(units: u64, decimals: usize) -> U256 {
    U256::from(units) * U256::exp10(decimals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{ErrorKind, LineStatus};
    use indexer::{AggregatorConfig, BuildOptions, PortfolioAggregator, PriceOracleAdapter, WatchList};
    use rust_decimal_macros::dec;
    use std::{sync::Arc, time::Duration};

    fn demo_aggregator(prices: StaticPriceSource) -> PortfolioAggregator {
        let directory = Arc::new(TokenDirectory::mainnet_defaults());
        let chain = demo_chain(&directory, 1);
        PortfolioAggregator::new(
            Arc::new(chain),
            Arc::new(PriceOracleAdapter::new(Arc::new(prices), Duration::from_secs(1))),
            directory,
            AggregatorConfig::default(),
        )
    }

    #[tokio::test]
    async fn demo_wallet_isolates_the_reverting_contract() {
        let aggregator = demo_aggregator(demo_prices(&HashMap::new()));
        let snapshot = aggregator
            .build_snapshot(&Address::from(DEMO_WALLET).to_string(), BuildOptions::default())
            .await
            .unwrap();

        assert_eq!(snapshot.lines.len(), 5);
        let rug = snapshot.line(&Address::from(H160::from_low_u64_be(0xdead))).unwrap();
        assert_eq!(rug.status, LineStatus::Failed);
        assert_eq!(rug.error, Some(ErrorKind::MetadataUnavailable));
        // 2500 USDC + 2 WETH @3000 + 120 DAI + 35 LINK @14.50
        assert_eq!(snapshot.total_value_usd, dec!(9127.50));
    }

    #[tokio::test]
    async fn price_overrides_and_native_watch() {
        let overrides = HashMap::from([("ETH".to_string(), dec!(2000)), ("WETH".to_string(), dec!(2000))]);
        let aggregator = demo_aggregator(demo_prices(&overrides));
        let options = BuildOptions::default().watching(WatchList::from_symbols(["ETH"]));
        let snapshot = aggregator
            .build_snapshot(&Address::from(DEMO_WALLET).to_string(), options)
            .await
            .unwrap();

        let native = snapshot.line(&domain::NATIVE_TOKEN_ADDRESS).unwrap();
        assert_eq!(native.status, LineStatus::Resolved);
        assert_eq!(native.value_usd, Some(dec!(1000)));
        // 1000 native + 2500 + 4000 + 120 + 507.50
        assert_eq!(snapshot.total_value_usd, dec!(8127.50));
    }
}
