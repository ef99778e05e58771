use std::collections::BTreeSet;

use domain::Address;
use thiserror::Error;

use crate::directory::TokenDirectory;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WatchListError {
    #[error("symbol must not be empty")]
    Empty,
    #[error("{0} is already on the watch list")]
    AlreadyPresent(String),
}

/// Symbols the caller always wants in a snapshot, whether or not discovery finds them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchList {
    symbols: BTreeSet<String>,
}

/// Outcome of mapping a watch list onto contract addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchResolution {
    pub contracts: BTreeSet<Address>,
    pub unresolved: Vec<String>,
}

impl WatchList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lenient constructor for query strings: blanks and repeats are ignored.
    pub fn from_symbols<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut list = Self::new();
        for symbol in symbols {
            let _ = list.add(symbol.as_ref());
        }
        list
    }

    pub fn add(&mut self, symbol: &str) -> Result<(), WatchListError> {
        let symbol = normalize(symbol).ok_or(WatchListError::Empty)?;
        if self.symbols.contains(&symbol) {
            return Err(WatchListError::AlreadyPresent(symbol));
        }
        self.symbols.insert(symbol);
        Ok(())
    }

    pub fn remove(&mut self, symbol: &str) -> bool {
        normalize(symbol).is_some_and(|symbol| self.symbols.remove(&symbol))
    }

    pub fn contains(&self, symbol: &str) -> bool {
        normalize(symbol).is_some_and(|symbol| self.symbols.contains(&symbol))
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.symbols.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn resolve(&self, directory: &TokenDirectory, chain_id: u64) -> WatchResolution {
        let mut resolution = WatchResolution::default();
        for symbol in &self.symbols {
            match directory.resolve_symbol(chain_id, symbol) {
                Some(address) => {
                    resolution.contracts.insert(address);
                }
                None => resolution.unresolved.push(symbol.clone()),
            }
        }
        resolution
    }
}

fn normalize(symbol: &str) -> Option<String> {
    let trimmed = symbol.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_uppercase())
}
