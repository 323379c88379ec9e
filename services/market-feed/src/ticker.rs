//! Latest ticker per market
//!
//! Records are replaced whole; a record whose sequence is not newer than
//! the stored one is dropped.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use types::ids::MarketId;

/// Last price and 24h statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticker {
    pub last: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub volume: Decimal,
    pub sequence: u64,
    /// Unix millis of the update.
    pub timestamp: i64,
}

/// Result of offering a ticker record to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickerUpdate {
    Applied,
    Duplicate,
}

#[derive(Debug, Default)]
pub struct TickerCache {
    tickers: BTreeMap<MarketId, Ticker>,
}

impl TickerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the record if `ticker.sequence` is newer than the stored one.
    pub fn update(&mut self, market: &MarketId, ticker: Ticker) -> TickerUpdate {
        match self.tickers.get(market) {
            Some(current) if ticker.sequence <= current.sequence => TickerUpdate::Duplicate,
            _ => {
                self.tickers.insert(market.clone(), ticker);
                TickerUpdate::Applied
            }
        }
    }

    /// Store unconditionally; used for the first record of a new sequence space.
    pub fn replace(&mut self, market: &MarketId, ticker: Ticker) {
        self.tickers.insert(market.clone(), ticker);
    }

    pub fn snapshot(&self, market: &MarketId) -> Option<Ticker> {
        self.tickers.get(market).cloned()
    }

    pub fn remove(&mut self, market: &MarketId) -> bool {
        self.tickers.remove(market).is_some()
    }
}
