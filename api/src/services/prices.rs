use std::{
    collections::{BTreeMap, HashMap},
    str::FromStr,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use indexer::{PriceSource, PriceSourceError};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// CoinGecko `/simple/price`, one request per batch of symbols, with an
/// in-process TTL cache. A stale entry is served when the upstream is down.
#[derive(Clone)]
pub struct CoingeckoPriceSource {
    client: Client,
    api_base: String,
    ids: HashMap<String, String>,
    cache: Arc<RwLock<HashMap<String, CachedPrice>>>,
    ttl: Duration,
}

#[derive(Clone, Copy)]
struct CachedPrice {
    price: Decimal,
    fetched_at: Instant,
}

impl CoingeckoPriceSource {
    pub fn new(api_base: String, ids: HashMap<String, String>, ttl: Duration) -> Self {
        Self {
            client: Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            ids,
            cache: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    fn coingecko_id(&self, symbol: &str) -> String {
        let upper = symbol.to_uppercase();
        if let Some(mapped) = self.ids.get(&upper) {
            return mapped.clone();
        }
        match upper.as_str() {
            "ETH" | "WETH" => "ethereum".to_string(),
            "BTC" => "bitcoin".to_string(),
            "WBTC" => "wrapped-bitcoin".to_string(),
            "USDC" => "usd-coin".to_string(),
            "USDT" => "tether".to_string(),
            "DAI" => "dai".to_string(),
            "BNB" => "binancecoin".to_string(),
            "MATIC" => "matic-network".to_string(),
            "UNI" => "uniswap".to_string(),
            "LINK" => "chainlink".to_string(),
            "AAVE" => "aave".to_string(),
            "MKR" => "maker".to_string(),
            "LDO" => "lido-dao".to_string(),
            "1INCH" => "1inch".to_string(),
            "GRT" => "the-graph".to_string(),
            "CRV" => "curve-dao-token".to_string(),
            "COMP" => "compound-governance-token".to_string(),
            "SUSHI" => "sushi".to_string(),
            "BAT" => "basic-attention-token".to_string(),
            "YFI" => "yearn-finance".to_string(),
            _ => upper.to_lowercase(),
        }
    }

    async fn request(&self, ids: &[String]) -> Result<serde_json::Value, PriceSourceError> {
        let url = format!("{}/simple/price", self.api_base);
        let joined = ids.join(",");
        let resp = self
            .client
            .get(url)
            .query(&[("ids", joined.as_str()), ("vs_currencies", "usd")])
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    PriceSourceError::Timeout
                } else {
                    PriceSourceError::Upstream(err.to_string())
                }
            })?;
        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(PriceSourceError::RateLimited);
        }
        if !status.is_success() {
            return Err(PriceSourceError::Status(status.as_u16()));
        }
        resp.json()
            .await
            .map_err(|err| PriceSourceError::Decode(err.to_string()))
    }
}

fn decimal_from_json(value: &serde_json::Value) -> Option<Decimal> {
    let text = value.as_number()?.to_string();
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}

#[async_trait]
impl PriceSource for CoingeckoPriceSource {
    async fn usd_prices(
        &self,
        symbols: &[String],
    ) -> Result<HashMap<String, Option<Decimal>>, PriceSourceError> {
        let mut prices = HashMap::with_capacity(symbols.len());
        let mut stale = HashMap::new();
        // several symbols may share one id (ETH, WETH)
        let mut wanted: BTreeMap<String, Vec<String>> = BTreeMap::new();
        {
            let cache = self.cache.read().await;
            for symbol in symbols {
                let symbol = symbol.to_uppercase();
                match cache.get(&symbol) {
                    Some(entry) if entry.fetched_at.elapsed() <= self.ttl => {
                        prices.insert(symbol, Some(entry.price));
                    }
                    cached => {
                        if let Some(entry) = cached {
                            stale.insert(symbol.clone(), entry.price);
                        }
                        wanted
                            .entry(self.coingecko_id(&symbol))
                            .or_default()
                            .push(symbol);
                    }
                }
            }
        }
        if wanted.is_empty() {
            return Ok(prices);
        }

        let ids: Vec<String> = wanted.keys().cloned().collect();
        let body = match self.request(&ids).await {
            Ok(body) => body,
            Err(err) if !stale.is_empty() => {
                warn!(error = %err, stale = stale.len(), "coingecko unavailable, serving stale prices");
                for symbols in wanted.into_values() {
                    for symbol in symbols {
                        let price = stale.get(&symbol).copied();
                        prices.insert(symbol, price);
                    }
                }
                return Ok(prices);
            }
            Err(err) => return Err(err),
        };

        let mut cache = self.cache.write().await;
        for (id, symbols) in wanted {
            let price = body
                .get(&id)
                .and_then(|entry| entry.get("usd"))
                .and_then(decimal_from_json);
            if price.is_none() {
                debug!(%id, "coingecko has no usd price");
            }
            for symbol in symbols {
                if let Some(price) = price {
                    cache.insert(
                        symbol.clone(),
                        CachedPrice {
                            price,
                            fetched_at: Instant::now(),
                        },
                    );
                }
                prices.insert(symbol, price);
            }
        }
        Ok(prices)
    }
}

/// Asks `primary` first and fills whatever it left unpriced from `fallback`.
pub struct FallbackPriceSource {
    primary: Arc<dyn PriceSource>,
    fallback: Arc<dyn PriceSource>,
}

impl FallbackPriceSource {
    pub fn new(primary: Arc<dyn PriceSource>, fallback: Arc<dyn PriceSource>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl PriceSource for FallbackPriceSource {
    fn supports_batch(&self) -> bool {
        self.primary.supports_batch() && self.fallback.supports_batch()
    }

    async fn usd_prices(
        &self,
        symbols: &[String],
    ) -> Result<HashMap<String, Option<Decimal>>, PriceSourceError> {
        let (mut prices, primary_error) = match self.primary.usd_prices(symbols).await {
            Ok(prices) => (prices, None),
            Err(err) => {
                warn!(error = %err, "primary price source failed, using fallback");
                (HashMap::new(), Some(err))
            }
        };

        let gaps: Vec<String> = symbols
            .iter()
            .map(|symbol| symbol.to_uppercase())
            .filter(|symbol| {
                !prices
                    .get(symbol)
                    .copied()
                    .flatten()
                    .is_some_and(|price| price > Decimal::ZERO)
            })
            .collect();
        if gaps.is_empty() {
            return Ok(prices);
        }

        match self.fallback.usd_prices(&gaps).await {
            Ok(filled) => {
                for (symbol, price) in filled {
                    if price.is_some() {
                        prices.insert(symbol.to_uppercase(), price);
                    }
                }
                Ok(prices)
            }
            Err(err) => match primary_error {
                Some(primary) => Err(primary),
                None => {
                    warn!(error = %err, missing = gaps.len(), "fallback price source failed");
                    Ok(prices)
                }
            },
        }
    }
}
