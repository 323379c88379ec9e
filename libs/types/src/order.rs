//! Book side and trade direction

use serde::{Deserialize, Serialize};

/// Side of an order book
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Buy interest (bids), best price = highest
    Bid,
    /// Sell interest (asks), best price = lowest
    Ask,
}

/// Direction of the aggressor in a public trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TakerSide {
    Buy,
    Sell,
}
