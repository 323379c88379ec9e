//! Fee schedule attached to a market

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Maker/taker rates for a market
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub maker_rate: Decimal, // Can be negative (rebate)
    pub taker_rate: Decimal,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            maker_rate: Decimal::new(2, 4), // 0.02%
            taker_rate: Decimal::new(5, 4), // 0.05%
        }
    }
}
