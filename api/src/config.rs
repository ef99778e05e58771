use std::{collections::HashMap, env, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Erc20TokenConfig {
    pub symbol: String,
    pub address: String,
    pub decimals: u8,
    pub chain_id: u64,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub rpc_url: String,
    pub chain_rpc_urls: HashMap<u64, String>,
    pub default_chain_id: u64,
    pub port: u16,
    pub frontend_origins: Vec<String>,
    pub coingecko_api_base: String,
    pub token_price_ids: HashMap<String, String>,
    pub token_prices: HashMap<String, Decimal>,
    pub price_cache_ttl: Duration,
    pub price_timeout: Duration,
    pub erc20_tokens: Vec<Erc20TokenConfig>,
    pub portfolio_max_concurrency: usize,
    pub rpc_max_in_flight: usize,
    pub rpc_min_interval: Duration,
    pub metadata_timeout: Duration,
    pub metadata_retry_backoff: Duration,
    pub discovery_block_range: u64,
    pub discovery_min_block_range: u64,
    pub discovery_since_block: u64,
    pub snapshot_timeout: Duration,
    pub offline_mode: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            rpc_url: env::var("RPC_URL").unwrap_or_else(|_| "http://localhost:8545".to_string()),
            chain_rpc_urls: parse_chain_urls("CHAIN_RPC_URLS"),
            default_chain_id: parse_u64("DEFAULT_CHAIN_ID", 1),
            port: env::var("PORT")
                .unwrap_or_else(|_| "5000".to_string())
                .parse()
                .context("PORT must be a valid u16")?,
            frontend_origins: parse_origins(),
            coingecko_api_base: env::var("COINGECKO_API_BASE")
                .unwrap_or_else(|_| "https://api.coingecko.com/api/v3".to_string()),
            token_price_ids: parse_token_price_ids("TOKEN_PRICE_IDS"),
            token_prices: parse_token_prices("TOKEN_PRICES"),
            price_cache_ttl: parse_duration_seconds("PRICE_CACHE_TTL_SECS", 60),
            price_timeout: parse_duration_millis("PRICE_TIMEOUT_MS", 5_000),
            erc20_tokens: parse_erc20_tokens("ERC20_TOKENS"),
            portfolio_max_concurrency: parse_usize("PORTFOLIO_MAX_CONCURRENCY", 8).clamp(1, 64),
            rpc_max_in_flight: parse_usize("RPC_MAX_IN_FLIGHT", 8),
            rpc_min_interval: parse_duration_millis("RPC_MIN_INTERVAL_MS", 25),
            metadata_timeout: parse_duration_millis("METADATA_TIMEOUT_MS", 4_000),
            metadata_retry_backoff: parse_duration_millis("METADATA_RETRY_BACKOFF_MS", 250),
            discovery_block_range: parse_u64("DISCOVERY_BLOCK_RANGE", 5_000).max(1),
            discovery_min_block_range: parse_u64("DISCOVERY_MIN_BLOCK_RANGE", 16).max(1),
            discovery_since_block: env::var("DISCOVERY_SINCE_BLOCK")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0),
            snapshot_timeout: parse_duration_seconds("SNAPSHOT_TIMEOUT_SECS", 30),
            offline_mode: parse_bool("OFFLINE_MODE", false),
        })
    }

    /// RPC endpoint per chain; `RPC_URL` serves the default chain unless overridden.
    pub fn rpc_urls(&self) -> HashMap<u64, String> {
        let mut urls = self.chain_rpc_urls.clone();
        urls.entry(self.default_chain_id)
            .or_insert_with(|| self.rpc_url.clone());
        urls
    }
}

/// Accepts `1`, `0x1`, or a well-known alias such as `eth` or `polygon`.
pub fn parse_chain_id(raw: &str) -> Option<u64> {
    let value = raw.trim().to_lowercase();
    if let Some(hex) = value.strip_prefix("0x") {
        return u64::from_str_radix(hex, 16).ok();
    }
    if let Ok(id) = u64::from_str(&value) {
        return Some(id);
    }
    match value.as_str() {
        "eth" | "ethereum" | "mainnet" => Some(1),
        "bsc" | "bnb" => Some(56),
        "polygon" | "matic" => Some(137),
        "arbitrum" => Some(42161),
        "base" => Some(8453),
        "optimism" => Some(10),
        "sepolia" => Some(11155111),
        _ => None,
    }
}

fn parse_origins() -> Vec<String> {
    if let Ok(list) = env::var("FRONTEND_ORIGINS") {
        split_origins(&list)
    } else if let Ok(origin) = env::var("FRONTEND_ORIGIN") {
        split_origins(&origin)
    } else {
        vec!["http://localhost:3000".to_string()]
    }
}

fn split_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .filter_map(|item| {
            let trimmed = item.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
        .collect()
}

fn parse_duration_seconds(key: &str, default: u64) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or_else(|| Duration::from_secs(default))
}

fn parse_duration_millis(key: &str, default: u64) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or_else(|| Duration::from_millis(default))
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn parse_erc20_tokens(key: &str) -> Vec<Erc20TokenConfig> {
    env::var(key)
        .map(|raw| parse_erc20_list(&raw))
        .unwrap_or_default()
}

/// `SYMBOL:address[:decimals[:chainId]]`, comma separated.
pub(crate) fn parse_erc20_list(raw: &str) -> Vec<Erc20TokenConfig> {
    raw.split(',')
        .filter_map(|item| {
            let trimmed = item.trim();
            if trimmed.is_empty() {
                return None;
            }
            let parts: Vec<_> = trimmed.split(':').collect();
            if parts.len() < 2 {
                return None;
            }
            let symbol = parts[0].trim().to_uppercase();
            let address = parts[1].trim().to_string();
            let decimals = parts
                .get(2)
                .and_then(|d| d.trim().parse::<u8>().ok())
                .unwrap_or(18);
            let chain_id = parts
                .get(3)
                .and_then(|c| parse_chain_id(c))
                .unwrap_or(1);
            if symbol.is_empty() || address.is_empty() {
                return None;
            }
            Some(Erc20TokenConfig {
                symbol,
                address,
                decimals,
                chain_id,
            })
        })
        .collect()
}

fn parse_token_prices(key: &str) -> HashMap<String, Decimal> {
    let raw = match env::var(key) {
        Ok(v) => v,
        Err(_) => return HashMap::new(),
    };

    raw.split(',')
        .filter_map(|item| {
            let (symbol, value) = item.split_once('=')?;
            let price = Decimal::from_str(value.trim()).ok()?;
            let symbol = symbol.trim().to_uppercase();
            if symbol.is_empty() {
                return None;
            }
            Some((symbol, price))
        })
        .collect()
}

fn parse_token_price_ids(key: &str) -> HashMap<String, String> {
    let raw = match env::var(key) {
        Ok(v) => v,
        Err(_) => return HashMap::new(),
    };

    raw.split(',')
        .filter_map(|item| {
            let (symbol, id) = item.split_once(':')?;
            let symbol = symbol.trim().to_uppercase();
            let id = id.trim().to_lowercase();
            if symbol.is_empty() || id.is_empty() {
                return None;
            }
            Some((symbol, id))
        })
        .collect()
}

fn parse_chain_urls(key: &str) -> HashMap<u64, String> {
    let raw = match env::var(key) {
        Ok(v) => v,
        Err(_) => return HashMap::new(),
    };

    raw.split(',')
        .filter_map(|item| {
            let (chain, url) = item.split_once('=')?;
            let chain_id = parse_chain_id(chain)?;
            let url = url.trim();
            if url.is_empty() {
                return None;
            }
            Some((chain_id, url.to_string()))
        })
        .collect()
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes" | "on"))
        .unwrap_or(default)
}
