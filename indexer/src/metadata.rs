use std::{future::Future, sync::Arc, time::Duration};

use dashmap::DashMap;
use domain::{Address, TokenMetadata};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::{
    chain::ChainClient,
    directory::native_metadata,
    error::{ChainError, TokenError},
};

#[derive(Debug, Clone, Copy)]
pub struct MetadataPolicy {
    pub call_timeout: Duration,
    pub retry_backoff: Duration,
}

impl Default for MetadataPolicy {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(4),
            retry_backoff: Duration::from_millis(250),
        }
    }
}

/// Resolves `{symbol, name, decimals}` per contract and keeps every success for
/// the life of the process. Failures are not cached so the next request retries.
pub struct TokenMetadataResolver {
    client: Arc<dyn ChainClient>,
    cache: DashMap<Address, TokenMetadata>,
    policy: MetadataPolicy,
    native: TokenMetadata,
}

impl TokenMetadataResolver {
    pub fn new(client: Arc<dyn ChainClient>, policy: MetadataPolicy) -> Self {
        Self {
            client,
            cache: DashMap::new(),
            policy,
            native: native_metadata(1),
        }
    }

    /// Native coin metadata answered for the sentinel address without a chain call.
    pub fn for_chain(mut self, chain_id: u64) -> Self {
        self.native = native_metadata(chain_id);
        self
    }

    pub fn cached(&self, contract: &Address) -> Option<TokenMetadata> {
        self.cache.get(contract).map(|entry| entry.value().clone())
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub async fn resolve(&self, contract: Address) -> Result<TokenMetadata, TokenError> {
        if contract.is_native() {
            return Ok(self.native.clone());
        }
        if let Some(hit) = self.cached(&contract) {
            return Ok(hit);
        }

        let client = &self.client;
        let (symbol, name, decimals) = tokio::try_join!(
            self.read(contract, "symbol", move || client.symbol(contract)),
            self.read(contract, "name", move || client.name(contract)),
            self.read(contract, "decimals", move || client.decimals(contract)),
        )
        .map_err(|source| {
            warn!(token = %contract, error = %source, "token metadata unavailable");
            TokenError::MetadataUnavailable { contract, source }
        })?;

        let metadata = TokenMetadata {
            contract_address: contract,
            symbol: symbol.trim().to_string(),
            name: name.trim().to_string(),
            decimals,
        };
        // a concurrent request may have won the race; keep whichever landed first
        let stored = self
            .cache
            .entry(contract)
            .or_insert(metadata)
            .value()
            .clone();
        debug!(token = %contract, symbol = %stored.symbol, decimals = stored.decimals, "token metadata cached");
        Ok(stored)
    }

    async fn read<T, F, Fut>(
        &self,
        contract: Address,
        method: &'static str,
        call: F,
    ) -> Result<T, ChainError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ChainError>>,
    {
        match self.bounded(call()).await {
            Err(err) if err.is_transient() => {
                debug!(token = %contract, method, error = %err, "metadata read failed, retrying once");
                sleep(self.policy.retry_backoff).await;
                self.bounded(call()).await
            }
            other => other,
        }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, ChainError>>,
    ) -> Result<T, ChainError> {
        timeout(self.policy.call_timeout, call)
            .await
            .unwrap_or(Err(ChainError::Timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::{InMemoryChainClient, TokenMethod};

    fn token() -> Address {
        Address::parse("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa").unwrap()
    }

    fn resolver(client: Arc<InMemoryChainClient>) -> TokenMetadataResolver {
        TokenMetadataResolver::new(
            client,
            MetadataPolicy {
                call_timeout: Duration::from_millis(500),
                retry_backoff: Duration::from_millis(10),
            },
        )
    }

    #[tokio::test]
    async fn caches_successful_resolution() {
        let client = Arc::new(InMemoryChainClient::new(10).with_token(token(), "USDC", "USD Coin", 6));
        let resolver = resolver(client.clone());

        let first = resolver.resolve(token()).await.unwrap();
        let second = resolver.resolve(token()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.decimals, 6);
        assert_eq!(client.calls(TokenMethod::Symbol), 1);
        assert_eq!(client.calls(TokenMethod::Decimals), 1);
        assert_eq!(resolver.cache_len(), 1);
    }

    #[tokio::test]
    async fn reverting_symbol_is_not_cached() {
        let client = Arc::new(
            InMemoryChainClient::new(10)
                .with_token(token(), "BAD", "Bad", 18)
                .with_reverting(token(), TokenMethod::Symbol),
        );
        let resolver = resolver(client.clone());

        let err = resolver.resolve(token()).await.unwrap_err();
        assert_eq!(err.kind(), domain::ErrorKind::MetadataUnavailable);
        assert!(resolver.cached(&token()).is_none());
        // reverts are deterministic: no retry
        assert_eq!(client.calls(TokenMethod::Symbol), 1);

        resolver.resolve(token()).await.unwrap_err();
        assert_eq!(client.calls(TokenMethod::Symbol), 2);
    }

    #[tokio::test]
    async fn transient_failure_is_retried_once() {
        let client = Arc::new(
            InMemoryChainClient::new(10)
                .with_token(token(), "DAI", "Dai", 18)
                .with_transient_failures(token(), TokenMethod::Decimals, 1),
        );
        let resolver = resolver(client.clone());

        let metadata = resolver.resolve(token()).await.unwrap();
        assert_eq!(metadata.symbol, "DAI");
        assert_eq!(client.calls(TokenMethod::Decimals), 2);
    }

    #[tokio::test]
    async fn two_transient_failures_give_up() {
        let client = Arc::new(
            InMemoryChainClient::new(10)
                .with_token(token(), "DAI", "Dai", 18)
                .with_transient_failures(token(), TokenMethod::Name, 2),
        );
        let resolver = resolver(client.clone());

        assert!(resolver.resolve(token()).await.is_err());
        assert_eq!(client.calls(TokenMethod::Name), 2);
    }

    #[tokio::test]
    async fn native_sentinel_needs_no_chain_call() {
        let client = Arc::new(InMemoryChainClient::new(10));
        let resolver = resolver(client.clone()).for_chain(56);

        let metadata = resolver.resolve(domain::NATIVE_TOKEN_ADDRESS).await.unwrap();
        assert_eq!(metadata.symbol, "BNB");
        assert_eq!(metadata.decimals, 18);
        assert_eq!(client.calls(TokenMethod::Symbol), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_call_times_out() {
        let client = Arc::new(
            InMemoryChainClient::new(10)
                .with_token(token(), "SLOW", "Slow", 18)
                .with_call_delay(token(), Duration::from_secs(5)),
        );
        let resolver = resolver(client);

        let err = resolver.resolve(token()).await.unwrap_err();
        assert!(matches!(
            err,
            TokenError::MetadataUnavailable {
                source: ChainError::Timeout,
                ..
            }
        ));
    }
}
