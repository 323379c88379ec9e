//! Published, immutable feed state
//!
//! The worker publishes a new `PublishedState` after every accepted
//! mutation. Per-market views are `Arc`-shared, so a publish only rebuilds
//! the markets that changed; readers hold their copy for as long as they
//! like without blocking the worker.
//!
//! Each view carries a SHA-256 checksum over its depth levels and sequence
//! so consumers can compare two snapshots cheaply.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use types::ids::MarketId;

use crate::depth::{BookStatus, DepthSnapshot};
use crate::events::Channel;
use crate::reconnect::ConnectionState;
use crate::ticker::Ticker;
use crate::trades::Trade;

/// One market's state at publication time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketView {
    pub depth: DepthSnapshot,
    pub book_status: Option<BookStatus>,
    pub trades: Vec<Trade>,
    pub ticker: Option<Ticker>,
    /// Subscribed channels (empty while in the eviction grace period).
    pub channels: BTreeSet<Channel>,
    /// A channel is degraded or the book is waiting for a snapshot.
    pub resyncing: bool,
    pub checksum: String,
}

/// A versioned, copy-on-publish image of the whole engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedState {
    pub version: u64,
    pub connection_state: ConnectionState,
    pub epoch: u64,
    pub markets: BTreeMap<MarketId, Arc<MarketView>>,
}

impl PublishedState {
    /// State before anything has been published.
    pub fn initial() -> Self {
        Self {
            version: 0,
            connection_state: ConnectionState::Disconnected,
            epoch: 0,
            markets: BTreeMap::new(),
        }
    }

    /// Snapshot for one market. Always returns a value: unknown or evicted
    /// markets come back empty and stale.
    pub fn snapshot(&self, market: &MarketId) -> FeedSnapshot {
        let connected = self.connection_state.is_ready();
        match self.markets.get(market) {
            Some(view) => FeedSnapshot {
                market: market.clone(),
                version: self.version,
                connection_state: self.connection_state,
                depth: view.depth.clone(),
                trades: view.trades.clone(),
                ticker: view.ticker.clone(),
                stale: view.resyncing || !connected,
                checksum: view.checksum.clone(),
            },
            None => {
                let depth = DepthSnapshot::empty(market.clone());
                let checksum = compute_checksum(&depth);
                FeedSnapshot {
                    market: market.clone(),
                    version: self.version,
                    connection_state: self.connection_state,
                    depth,
                    trades: Vec::new(),
                    ticker: None,
                    stale: true,
                    checksum,
                }
            }
        }
    }

    pub fn view(&self, market: &MarketId) -> Option<&MarketView> {
        self.markets.get(market).map(|v| v.as_ref())
    }
}

/// Everything a consumer needs to render one market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedSnapshot {
    pub market: MarketId,
    pub version: u64,
    pub connection_state: ConnectionState,
    pub depth: DepthSnapshot,
    /// Most recent first.
    pub trades: Vec<Trade>,
    pub ticker: Option<Ticker>,
    /// Values may lag the market while disconnected or resyncing.
    pub stale: bool,
    pub checksum: String,
}

impl FeedSnapshot {
    pub fn best_bid(&self) -> Option<Decimal> {
        self.depth.best_bid().map(|l| l.price.as_decimal())
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.depth.best_ask().map(|l| l.price.as_decimal())
    }

    pub fn spread(&self) -> Option<Decimal> {
        self.depth.spread()
    }

    pub fn mid_price(&self) -> Option<Decimal> {
        self.depth.mid_price()
    }

    pub fn recent_trades(&self, limit: usize) -> &[Trade] {
        &self.trades[..limit.min(self.trades.len())]
    }

    /// Ticker last price, falling back to the latest trade.
    pub fn last_price(&self) -> Option<Decimal> {
        self.ticker
            .as_ref()
            .map(|t| t.last)
            .or_else(|| self.trades.first().map(|t| t.price.as_decimal()))
    }

    /// Recompute the depth checksum and compare.
    pub fn verify_checksum(&self) -> bool {
        self.checksum == compute_checksum(&self.depth)
    }
}

/// SHA-256 over the levels (bids, then asks) and sequence.
pub fn compute_checksum(depth: &DepthSnapshot) -> String {
    let mut hasher = Sha256::new();

    for side in [&depth.bids, &depth.asks] {
        for level in side {
            hasher.update(level.price.to_string().as_bytes());
            hasher.update(b":");
            hasher.update(level.amount.to_string().as_bytes());
            hasher.update(b"|");
        }
        hasher.update(b"---");
    }
    hasher.update(depth.sequence.to_le_bytes());

    format!("{:x}", hasher.finalize())
}
