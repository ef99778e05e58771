use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use domain::PriceQuote;
use futures::future::join_all;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PriceSourceError {
    #[error("price request timed out")]
    Timeout,
    #[error("price source rate limited the request")]
    RateLimited,
    #[error("price source returned status {0}")]
    Status(u16),
    #[error("price source request failed: {0}")]
    Upstream(String),
    #[error("could not decode price response: {0}")]
    Decode(String),
}

/// Upstream USD price feed. Symbols it does not know map to `None`.
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Whether one `usd_prices` call may carry several symbols.
    fn supports_batch(&self) -> bool {
        true
    }

    async fn usd_prices(
        &self,
        symbols: &[String],
    ) -> Result<HashMap<String, Option<Decimal>>, PriceSourceError>;
}

/// Turns a fallible price feed into quotes that are always present, with
/// `usd_unit_price = None` standing in for every failure.
pub struct PriceOracleAdapter {
    source: Arc<dyn PriceSource>,
    request_timeout: Duration,
}

impl PriceOracleAdapter {
    pub fn new(source: Arc<dyn PriceSource>, request_timeout: Duration) -> Self {
        Self {
            source,
            request_timeout,
        }
    }

    pub async fn quote(&self, symbol: &str) -> PriceQuote {
        let key = symbol.trim().to_uppercase();
        let mut quotes = self.quote_many(std::slice::from_ref(&key)).await;
        let mut quote = quotes
            .remove(&key)
            .unwrap_or_else(|| PriceQuote::unavailable(key.clone()));
        quote.symbol = symbol.to_string();
        quote
    }

    /// Quotes keyed by upper-cased symbol; one entry per distinct input symbol.
    pub async fn quote_many(&self, symbols: &[String]) -> HashMap<String, PriceQuote> {
        let wanted: Vec<String> = symbols
            .iter()
            .map(|symbol| symbol.trim().to_uppercase())
            .filter(|symbol| !symbol.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if wanted.is_empty() {
            return HashMap::new();
        }

        let prices = if self.source.supports_batch() {
            self.fetch(&wanted).await
        } else {
            let singles = join_all(
                wanted
                    .iter()
                    .map(|symbol| self.fetch(std::slice::from_ref(symbol))),
            )
            .await;
            singles.into_iter().flatten().collect()
        };

        let as_of = Utc::now();
        wanted
            .into_iter()
            .map(|symbol| {
                let usd_unit_price = prices
                    .get(&symbol)
                    .copied()
                    .flatten()
                    .filter(|price| price.is_sign_positive() && !price.is_zero());
                let quote = PriceQuote {
                    symbol: symbol.clone(),
                    usd_unit_price,
                    as_of,
                };
                (symbol, quote)
            })
            .collect()
    }

    async fn fetch(&self, symbols: &[String]) -> HashMap<String, Option<Decimal>> {
        let outcome = timeout(self.request_timeout, self.source.usd_prices(symbols))
            .await
            .unwrap_or(Err(PriceSourceError::Timeout));
        match outcome {
            Ok(prices) => {
                debug!(requested = symbols.len(), returned = prices.len(), "prices fetched");
                prices
                    .into_iter()
                    .map(|(symbol, price)| (symbol.to_uppercase(), price))
                    .collect()
            }
            Err(err) => {
                warn!(symbols = ?symbols, error = %err, "price source failed; quoting as unavailable");
                HashMap::new()
            }
        }
    }
}

/// Fixed price table. Backs offline mode and the configured `TOKEN_PRICES` fallback.
pub struct StaticPriceSource {
    prices: HashMap<String, Decimal>,
}

impl StaticPriceSource {
    pub fn new<I, S>(prices: I) -> Self
    where
        I: IntoIterator<Item = (S, Decimal)>,
        S: Into<String>,
    {
        Self {
            prices: prices
                .into_iter()
                .map(|(symbol, price)| (symbol.into().trim().to_uppercase(), price))
                .collect(),
        }
    }

    pub fn with_price(mut self, symbol: &str, price: Decimal) -> Self {
        self.prices.insert(symbol.trim().to_uppercase(), price);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

#[async_trait]
impl PriceSource for StaticPriceSource {
    async fn usd_prices(
        &self,
        symbols: &[String],
    ) -> Result<HashMap<String, Option<Decimal>>, PriceSourceError> {
        Ok(symbols
            .iter()
            .map(|symbol| {
                let key = symbol.to_uppercase();
                let price = self.prices.get(&key).copied();
                (key, price)
            })
            .collect())
    }
}
