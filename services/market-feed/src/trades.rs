//! Trade tape: bounded history of recent public trades per market
//!
//! Each market keeps a ring of the most recent trades, newest at the
//! front. Pushing past capacity evicts the oldest print.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use types::ids::{MarketId, TradeId};
use types::numeric::{Price, Quantity};
use types::order::TakerSide;

/// A public trade print.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeId,
    /// Execution price.
    pub price: Price,
    /// Traded amount.
    pub amount: Quantity,
    /// Aggressor side.
    pub side: TakerSide,
    /// Execution timestamp (Unix millis).
    pub timestamp: i64,
}

/// Recent trades for every tracked market.
#[derive(Debug)]
pub struct TradeTape {
    tapes: BTreeMap<MarketId, VecDeque<Trade>>,
    /// Maximum trades retained per market.
    capacity: usize,
}

impl TradeTape {
    pub fn new(capacity: usize) -> Self {
        Self {
            tapes: BTreeMap::new(),
            capacity,
        }
    }

    /// Record a trade as the most recent print.
    pub fn push(&mut self, market: &MarketId, trade: Trade) {
        let capacity = self.capacity;
        let tape = self
            .tapes
            .entry(market.clone())
            .or_insert_with(|| VecDeque::with_capacity(capacity));

        // Evict oldest if at capacity
        if tape.len() >= capacity {
            tape.pop_back();
        }
        tape.push_front(trade);
    }

    /// Replace a market's tape wholesale (trades given most recent first).
    pub fn replace(&mut self, market: &MarketId, trades: Vec<Trade>) {
        let tape: VecDeque<Trade> = trades.into_iter().take(self.capacity).collect();
        self.tapes.insert(market.clone(), tape);
    }

    /// Read-only copy, most recent first.
    pub fn snapshot(&self, market: &MarketId) -> Vec<Trade> {
        self.recent(market, self.capacity)
    }

    /// Up to `limit` most recent trades.
    pub fn recent(&self, market: &MarketId, limit: usize) -> Vec<Trade> {
        self.tapes
            .get(market)
            .map(|tape| tape.iter().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub fn remove(&mut self, market: &MarketId) -> bool {
        self.tapes.remove(market).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn btcusd() -> MarketId {
        MarketId::new("btcusd")
    }

    fn trade(id: u64) -> Trade {
        Trade {
            id: TradeId::new(id),
            price: Price::from_u64(50000),
            amount: "0.5".parse().unwrap(),
            side: TakerSide::Buy,
            timestamp: 1708123456789 + id as i64,
        }
    }

    #[test]
    fn test_push_most_recent_first() {
        let mut tape = TradeTape::new(100);
        for id in 1..=3 {
            tape.push(&btcusd(), trade(id));
        }

        let trades = tape.snapshot(&btcusd());
        assert_eq!(trades.len(), 3);
        assert_eq!(trades[0].id, TradeId::new(3));
        assert_eq!(trades[2].id, TradeId::new(1));
    }

    #[test]
    fn test_eviction_drops_oldest() {
        let mut tape = TradeTape::new(3);
        for id in 1..=5 {
            tape.push(&btcusd(), trade(id));
        }

        let trades = tape.snapshot(&btcusd());
        assert_eq!(trades.len(), 3);
        assert_eq!(trades[0].id, TradeId::new(5));
        assert_eq!(trades[2].id, TradeId::new(3));
    }

    #[test]
    fn test_recent_limit() {
        let mut tape = TradeTape::new(100);
        for id in 1..=10 {
            tape.push(&btcusd(), trade(id));
        }
        let recent = tape.recent(&btcusd(), 2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].id, TradeId::new(9));
    }

    #[test]
    fn test_replace_truncates_to_capacity() {
        let mut tape = TradeTape::new(2);
        tape.push(&btcusd(), trade(1));
        tape.replace(&btcusd(), vec![trade(9), trade(8), trade(7)]);

        let trades = tape.snapshot(&btcusd());
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].id, TradeId::new(9));
    }

    #[test]
    fn test_unknown_market_is_empty() {
        let tape = TradeTape::new(10);
        assert!(tape.snapshot(&btcusd()).is_empty());
    }

    proptest! {
        #[test]
        fn prop_never_exceeds_capacity(capacity in 1usize..50, pushes in 0u64..300) {
            let mut tape = TradeTape::new(capacity);
            for id in 0..pushes {
                tape.push(&btcusd(), trade(id));
                prop_assert!(tape.snapshot(&btcusd()).len() <= capacity);
            }
            if pushes > 0 {
                // Newest retained, oldest evicted first
                let trades = tape.snapshot(&btcusd());
                prop_assert_eq!(trades[0].id, TradeId::new(pushes - 1));
                let oldest_kept = pushes.saturating_sub(capacity as u64);
                prop_assert_eq!(trades.last().unwrap().id, TradeId::new(oldest_kept));
            }
        }
    }
}
