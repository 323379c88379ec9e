//! Types library for the market feed services
//!
//! Shared vocabulary for everything that reads or produces market data,
//! keeping decimal arithmetic deterministic and identifiers validated.
//!
//! # Modules
//! - `ids`: Identifiers (MarketId, TradeId)
//! - `numeric`: Fixed-point decimal types (Price, Quantity)
//! - `order`: Book side and trade direction
//! - `fee`: Maker/taker fee schedule
//! - `market`: Trading-pair metadata and the market reference table
//! - `errors`: Error taxonomy

pub mod errors;
pub mod fee;
pub mod ids;
pub mod market;
pub mod numeric;
pub mod order;
