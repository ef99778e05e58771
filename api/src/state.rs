use std::{collections::HashMap, sync::Arc};

use indexer::{PortfolioAggregator, TokenDirectory};

use crate::{
    config::{parse_chain_id, AppConfig},
    error::{ApiError, ApiResult},
};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub engines: Arc<ChainEngines>,
    pub directory: Arc<TokenDirectory>,
}

/// One aggregator per configured chain; each keeps its own metadata cache.
pub struct ChainEngines {
    default_chain: u64,
    engines: HashMap<u64, Arc<PortfolioAggregator>>,
}

impl ChainEngines {
    pub fn new(default_chain: u64, engines: impl IntoIterator<Item = Arc<PortfolioAggregator>>) -> Self {
        Self {
            default_chain,
            engines: engines
                .into_iter()
                .map(|engine| (engine.chain_id(), engine))
                .collect(),
        }
    }

    /// Picks the engine a request's `chain` parameter names, or the default chain.
    pub fn resolve(&self, chain: Option<&str>) -> ApiResult<Arc<PortfolioAggregator>> {
        let chain_id = match chain.map(str::trim).filter(|raw| !raw.is_empty()) {
            Some(raw) => parse_chain_id(raw).ok_or_else(|| ApiError::UnknownChain(raw.to_string()))?,
            None => self.default_chain,
        };
        self.engines
            .get(&chain_id)
            .cloned()
            .ok_or_else(|| ApiError::UnknownChain(chain_id.to_string()))
    }

    pub fn chains(&self) -> Vec<u64> {
        let mut chains: Vec<u64> = self.engines.keys().copied().collect();
        chains.sort_unstable();
        chains
    }
}

#[allow(dead_code)]
fn _assert_state_bounds() {
    fn assert_bounds<T: Clone + Send + Sync + 'static>() {}
    assert_bounds::<AppState>();
}
