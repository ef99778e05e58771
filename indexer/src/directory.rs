use std::collections::HashMap;

use domain::{Address, TokenMetadata, NATIVE_DECIMALS, NATIVE_TOKEN_ADDRESS};
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    pub chain_id: u64,
    pub symbol: String,
    pub address: Address,
    pub decimals: u8,
}

/// Known tokens per chain, keyed by symbol and by address. Built once at
/// startup and shared read-only; distinct from the per-contract metadata cache.
#[derive(Debug, Clone, Default)]
pub struct TokenDirectory {
    entries: Vec<DirectoryEntry>,
    by_symbol: HashMap<(u64, String), usize>,
    by_address: HashMap<(u64, Address), usize>,
}

impl TokenDirectory {
    /// Later entries with an already-known `(chain, symbol)` are dropped.
    pub fn new(entries: impl IntoIterator<Item = DirectoryEntry>) -> Self {
        let mut directory = Self::default();
        for mut entry in entries {
            entry.symbol = entry.symbol.trim().to_uppercase();
            let symbol_key = (entry.chain_id, entry.symbol.clone());
            if entry.symbol.is_empty() || directory.by_symbol.contains_key(&symbol_key) {
                warn!(chain_id = entry.chain_id, symbol = %entry.symbol, "skipping duplicate token directory entry");
                continue;
            }
            let index = directory.entries.len();
            directory.by_symbol.insert(symbol_key, index);
            directory
                .by_address
                .entry((entry.chain_id, entry.address))
                .or_insert(index);
            directory.entries.push(entry);
        }
        directory
    }

    /// Well-known Ethereum mainnet tokens, used when no directory is configured.
    pub fn mainnet_defaults() -> Self {
        const MAINNET: &[(&str, &str, u8)] = &[
            ("ETH", "0xeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee", 18),
            ("WETH", "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2", 18),
            ("DAI", "0x6b175474e89094c44da98b954eedeac495271d0f", 18),
            ("USDC", "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48", 6),
            ("USDT", "0xdac17f958d2ee523a2206206994597c13d831ec7", 6),
            ("WBTC", "0x2260fac5e5542a773aa44fbcfedf7c193bc2c599", 8),
            ("UNI", "0x1f9840a85d5af5bf1d1762f925bdaddc4201f984", 18),
            ("LINK", "0x514910771af9ca656af840dff83e8264ecf986ca", 18),
            ("MKR", "0x9f8f72aa9304c8b593d555f12ef6589cc3a579a2", 18),
            ("SUSHI", "0x6b3595068778dd592e39a122f4f5a5cf09c90fe2", 18),
            ("BAT", "0x0d8775f648430679a709e98d2b0cb6250d2887ef", 18),
            ("COMP", "0xc00e94cb662c3520282e6f5717214004a7f26888", 18),
            ("AAVE", "0x7fc66500c84a76ad7e9c93437bfc5ac33e2ddae9", 18),
            ("CRV", "0xd533a949740bb3306d119cc777fa900ba034cd52", 18),
            ("YFI", "0x0bc529c00c6401aef6d220be8c6ea1667f6ad93e", 18),
            ("LDO", "0x5a98fcbea516cf06857215779fd812ca3bef1b32", 18),
            ("1INCH", "0x111111111117dc0aa78b770fa6a738034120c302", 18),
            ("GRT", "0xc944e90c64b2c07662a292be6244bdf05cda44a7", 18),
        ];
        Self::new(MAINNET.iter().filter_map(|(symbol, address, decimals)| {
            Address::parse(address).ok().map(|address| DirectoryEntry {
                chain_id: 1,
                symbol: symbol.to_string(),
                address,
                decimals: *decimals,
            })
        }))
    }

    pub fn by_symbol(&self, chain_id: u64, symbol: &str) -> Option<&DirectoryEntry> {
        self.by_symbol
            .get(&(chain_id, symbol.trim().to_uppercase()))
            .map(|index| &self.entries[*index])
    }

    pub fn by_address(&self, chain_id: u64, address: &Address) -> Option<&DirectoryEntry> {
        self.by_address
            .get(&(chain_id, *address))
            .map(|index| &self.entries[*index])
    }

    /// Contract address for `symbol`, falling back to the native sentinel for
    /// the chain's own coin.
    pub fn resolve_symbol(&self, chain_id: u64, symbol: &str) -> Option<Address> {
        if let Some(entry) = self.by_symbol(chain_id, symbol) {
            return Some(entry.address);
        }
        symbol
            .trim()
            .eq_ignore_ascii_case(native_symbol(chain_id))
            .then_some(NATIVE_TOKEN_ADDRESS)
    }

    pub fn entries(&self) -> &[DirectoryEntry] {
        &self.entries
    }

    pub fn for_chain(&self, chain_id: u64) -> impl Iterator<Item = &DirectoryEntry> {
        self.entries
            .iter()
            .filter(move |entry| entry.chain_id == chain_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn native_symbol(chain_id: u64) -> &'static str {
    match chain_id {
        56 | 97 => "BNB",
        137 | 80001 => "MATIC",
        _ => "ETH",
    }
}

/// Metadata for the chain's native coin, addressed by the sentinel.
pub fn native_metadata(chain_id: u64) -> TokenMetadata {
    let symbol = native_symbol(chain_id);
    let name = match symbol {
        "BNB" => "BNB",
        "MATIC" => "Polygon",
        _ => "Ether",
    };
    TokenMetadata {
        contract_address: NATIVE_TOKEN_ADDRESS,
        symbol: symbol.to_string(),
        name: name.to_string(),
        decimals: NATIVE_DECIMALS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mainnet_defaults_resolve_by_symbol_and_address() {
        let directory = TokenDirectory::mainnet_defaults();
        let usdc = directory.by_symbol(1, "usdc").unwrap();
        assert_eq!(usdc.decimals, 6);
        assert_eq!(
            usdc.address.to_string(),
            "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"
        );
        assert_eq!(directory.by_address(1, &usdc.address).unwrap().symbol, "USDC");
        assert!(directory.by_symbol(56, "USDC").is_none());
        assert_eq!(directory.resolve_symbol(1, "eth"), Some(NATIVE_TOKEN_ADDRESS));
    }

    #[test]
    fn native_symbol_resolves_without_entry() {
        let directory = TokenDirectory::default();
        assert_eq!(directory.resolve_symbol(56, "BNB"), Some(NATIVE_TOKEN_ADDRESS));
        assert_eq!(directory.resolve_symbol(56, "ETH"), None);
        assert_eq!(native_metadata(137).symbol, "MATIC");
    }

    #[test]
    fn duplicate_symbols_keep_first_entry() {
        let first = Address::parse("0x00000000000000000000000000000000000000aa").unwrap();
        let second = Address::parse("0x00000000000000000000000000000000000000bb").unwrap();
        let directory = TokenDirectory::new([
            DirectoryEntry {
                chain_id: 1,
                symbol: "foo".to_string(),
                address: first,
                decimals: 18,
            },
            DirectoryEntry {
                chain_id: 1,
                symbol: "FOO".to_string(),
                address: second,
                decimals: 6,
            },
        ]);
        assert_eq!(directory.len(), 1);
        assert_eq!(directory.by_symbol(1, "Foo").unwrap().address, first);
    }
}
