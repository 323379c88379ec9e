//! Errors surfaced synchronously to callers of the feed engine
//!
//! Feed anomalies (gaps, duplicates, malformed frames, transport drops) are
//! healed inside the engine and never appear here.

use thiserror::Error;
use types::ids::MarketId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    #[error("invalid market: {0}")]
    InvalidMarket(MarketId),

    #[error("feed engine has shut down")]
    Shutdown,

    #[error("invalid configuration: {0}")]
    Config(String),
}
