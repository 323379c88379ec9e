//! Per-market order book depth
//!
//! Holds the bid/ask price-level maps for every tracked market. Uses
//! `BTreeMap` keyed by price so levels are always iterable in price order:
//! bids descending (best bid first), asks ascending (best ask first).
//!
//! A book only accepts diffs while `Live`. Until a snapshot lands (first
//! subscribe, after a gap, after a reconnect) diffs are parked in a bounded
//! buffer and replayed in sequence order once the snapshot is applied.
//!
//! Zero-amount levels are never stored.

use std::collections::{BTreeMap, VecDeque};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use types::ids::MarketId;
use types::numeric::{Price, Quantity};
use types::order::Side;

/// A single price level on one side of the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Price,
    /// Total amount resting at this price.
    pub amount: Quantity,
}

/// One incremental change to a price level. `amount == 0` removes the level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelChange {
    pub side: Side,
    pub price: Price,
    pub amount: Quantity,
}

/// A diff parked while the book waits for a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedDiff {
    pub sequence: u64,
    pub changes: Vec<LevelChange>,
    pub timestamp: i64,
}

/// Immutable copy of a market's depth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthSnapshot {
    pub market: MarketId,
    /// Bids in descending price order (best first).
    pub bids: Vec<PriceLevel>,
    /// Asks in ascending price order (best first).
    pub asks: Vec<PriceLevel>,
    /// Sequence of the last update included.
    pub sequence: u64,
    /// Unix milliseconds of the last update included.
    pub last_updated: i64,
}

/// A depth chart point: a level plus the running total up to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthPoint {
    pub price: Price,
    pub amount: Quantity,
    pub total: Decimal,
}

impl DepthSnapshot {
    /// Empty depth for a market with no data yet.
    pub fn empty(market: MarketId) -> Self {
        Self {
            market,
            bids: Vec::new(),
            asks: Vec::new(),
            sequence: 0,
            last_updated: 0,
        }
    }

    pub fn levels(&self, side: Side) -> &[PriceLevel] {
        match side {
            Side::Bid => &self.bids,
            Side::Ask => &self.asks,
        }
    }

    pub fn best_bid(&self) -> Option<&PriceLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&PriceLevel> {
        self.asks.first()
    }

    /// Spread between best ask and best bid.
    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask.price.as_decimal() - bid.price.as_decimal()),
            _ => None,
        }
    }

    /// Mid-market price (average of best bid and best ask).
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => {
                Some((bid.price.as_decimal() + ask.price.as_decimal()) / Decimal::from(2))
            }
            _ => None,
        }
    }

    /// The best `max_levels` levels per side.
    pub fn top(&self, max_levels: usize) -> DepthSnapshot {
        DepthSnapshot {
            market: self.market.clone(),
            bids: self.bids.iter().take(max_levels).copied().collect(),
            asks: self.asks.iter().take(max_levels).copied().collect(),
            sequence: self.sequence,
            last_updated: self.last_updated,
        }
    }

    /// Accumulated volume per level, walking away from the best price.
    pub fn cumulative(&self, side: Side) -> Vec<DepthPoint> {
        let mut total = Decimal::ZERO;
        self.levels(side)
            .iter()
            .map(|level| {
                total += level.amount.as_decimal();
                DepthPoint {
                    price: level.price,
                    amount: level.amount,
                    total,
                }
            })
            .collect()
    }

    /// Largest accumulated volume across both sides (depth chart scale).
    pub fn max_cumulative_volume(&self) -> Decimal {
        let side_total = |levels: &[PriceLevel]| {
            levels
                .iter()
                .map(|l| l.amount.as_decimal())
                .sum::<Decimal>()
        };
        side_total(self.bids.as_slice()).max(side_total(self.asks.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

/// Lifecycle of one market's book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookStatus {
    /// No data yet; waiting for the first snapshot.
    AwaitingSnapshot,
    /// Confirmed state; diffs apply directly.
    Live,
    /// Last-known levels kept readable while a fresh snapshot is pending.
    Stale,
}

/// Outcome of parking a diff in the resync buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferOutcome {
    Buffered,
    /// Buffer was full; every parked diff (and this one) was discarded.
    Overflow { dropped: usize },
}

#[derive(Debug, Clone)]
struct BookState {
    /// Bid levels: price → amount (ascending; reversed when read).
    bids: BTreeMap<Price, Quantity>,
    /// Ask levels: price → amount (ascending = best ask first).
    asks: BTreeMap<Price, Quantity>,
    sequence: u64,
    last_updated: i64,
    status: BookStatus,
    pending: VecDeque<BufferedDiff>,
}

impl BookState {
    fn new() -> Self {
        Self {
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            sequence: 0,
            last_updated: 0,
            status: BookStatus::AwaitingSnapshot,
            pending: VecDeque::new(),
        }
    }

    fn side_mut(&mut self, side: Side) -> &mut BTreeMap<Price, Quantity> {
        match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        }
    }

    fn apply_change(&mut self, change: &LevelChange) {
        let levels = self.side_mut(change.side);
        if change.amount.is_zero() {
            levels.remove(&change.price);
        } else {
            levels.insert(change.price, change.amount);
        }
    }

    fn to_snapshot(&self, market: &MarketId) -> DepthSnapshot {
        DepthSnapshot {
            market: market.clone(),
            bids: self
                .bids
                .iter()
                .rev() // Descending for bids (best bid = highest price)
                .map(|(&price, &amount)| PriceLevel { price, amount })
                .collect(),
            asks: self
                .asks
                .iter()
                .map(|(&price, &amount)| PriceLevel { price, amount })
                .collect(),
            sequence: self.sequence,
            last_updated: self.last_updated,
        }
    }
}

/// Depth books for every tracked market.
#[derive(Debug)]
pub struct DepthStore {
    books: BTreeMap<MarketId, BookState>,
    /// Max diffs parked per market while awaiting a snapshot.
    buffer_capacity: usize,
}

impl DepthStore {
    pub fn new(buffer_capacity: usize) -> Self {
        Self {
            books: BTreeMap::new(),
            buffer_capacity,
        }
    }

    /// Start tracking a market (no-op if already tracked).
    pub fn track(&mut self, market: &MarketId) {
        self.books
            .entry(market.clone())
            .or_insert_with(BookState::new);
    }

    /// Replace a market's book wholesale.
    ///
    /// Snapshots are authoritative and always accepted. Returns the parked
    /// diffs newer than the snapshot, sorted by sequence, for replay.
    pub fn apply_snapshot(&mut self, snapshot: DepthSnapshot) -> Vec<BufferedDiff> {
        let book = self
            .books
            .entry(snapshot.market.clone())
            .or_insert_with(BookState::new);

        book.bids = snapshot
            .bids
            .iter()
            .filter(|l| !l.amount.is_zero())
            .map(|l| (l.price, l.amount))
            .collect();
        book.asks = snapshot
            .asks
            .iter()
            .filter(|l| !l.amount.is_zero())
            .map(|l| (l.price, l.amount))
            .collect();
        book.sequence = snapshot.sequence;
        book.last_updated = snapshot.last_updated;
        book.status = BookStatus::Live;

        let mut replay: Vec<BufferedDiff> = book
            .pending
            .drain(..)
            .filter(|diff| diff.sequence > snapshot.sequence)
            .collect();
        replay.sort_by_key(|diff| diff.sequence);
        replay.dedup_by_key(|diff| diff.sequence);

        info!(
            market = %snapshot.market,
            sequence = snapshot.sequence,
            bid_levels = book.bids.len(),
            ask_levels = book.asks.len(),
            replay = replay.len(),
            "Depth snapshot applied"
        );

        replay
    }

    /// Apply one level change. Requires the sequencer to have accepted `sequence`.
    ///
    /// Returns `false` (and changes nothing) if the book is not live.
    pub fn apply_diff(
        &mut self,
        market: &MarketId,
        side: Side,
        price: Price,
        amount: Quantity,
        sequence: u64,
        timestamp: i64,
    ) -> bool {
        self.apply_changes(
            market,
            &[LevelChange {
                side,
                price,
                amount,
            }],
            sequence,
            timestamp,
        )
    }

    /// Apply a batch of level changes sharing one sequence number.
    pub fn apply_changes(
        &mut self,
        market: &MarketId,
        changes: &[LevelChange],
        sequence: u64,
        timestamp: i64,
    ) -> bool {
        let Some(book) = self.books.get_mut(market) else {
            return false;
        };
        if book.status != BookStatus::Live {
            return false;
        }

        for change in changes {
            book.apply_change(change);
        }
        book.sequence = sequence;
        book.last_updated = timestamp;

        debug!(%market, sequence, changes = changes.len(), "Depth diff applied");
        true
    }

    /// Park a diff until the next snapshot arrives.
    pub fn buffer_diff(&mut self, market: &MarketId, diff: BufferedDiff) -> BufferOutcome {
        let capacity = self.buffer_capacity;
        let book = self
            .books
            .entry(market.clone())
            .or_insert_with(BookState::new);

        if book.pending.len() >= capacity {
            let dropped = book.pending.len() + 1;
            book.pending.clear();
            warn!(%market, capacity, dropped, "Depth diff buffer overflow");
            return BufferOutcome::Overflow { dropped };
        }

        book.pending.push_back(diff);
        BufferOutcome::Buffered
    }

    /// Flag a live book as stale pending a fresh snapshot.
    pub fn mark_stale(&mut self, market: &MarketId) {
        if let Some(book) = self.books.get_mut(market) {
            if book.status == BookStatus::Live {
                book.status = BookStatus::Stale;
            }
        }
    }

    /// Connection lost: every live book becomes stale and parked diffs
    /// (which belong to the old connection) are dropped.
    pub fn mark_all_stale(&mut self) {
        for book in self.books.values_mut() {
            if book.status == BookStatus::Live {
                book.status = BookStatus::Stale;
            }
            book.pending.clear();
        }
    }

    /// Drop all levels and parked diffs, keeping the market tracked.
    pub fn clear(&mut self, market: &MarketId) {
        if let Some(book) = self.books.get_mut(market) {
            *book = BookState::new();
        }
    }

    /// Stop tracking a market entirely.
    pub fn remove(&mut self, market: &MarketId) -> bool {
        self.books.remove(market).is_some()
    }

    pub fn status(&self, market: &MarketId) -> Option<BookStatus> {
        self.books.get(market).map(|b| b.status)
    }

    pub fn is_live(&self, market: &MarketId) -> bool {
        self.status(market) == Some(BookStatus::Live)
    }

    /// Immutable copy of a market's depth.
    pub fn snapshot(&self, market: &MarketId) -> Option<DepthSnapshot> {
        self.books.get(market).map(|b| b.to_snapshot(market))
    }
}
