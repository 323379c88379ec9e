//! Trading-pair metadata and the market reference table
//!
//! Markets are loaded once from configuration and treated as read-only
//! by every consumer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::TypeError;
use crate::fee::FeeSchedule;
use crate::ids::MarketId;

/// Immutable trading-pair metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Market {
    pub id: MarketId,
    pub base_unit: String,
    pub quote_unit: String,
    /// Decimal places for prices
    pub price_precision: u32,
    /// Decimal places for amounts
    pub amount_precision: u32,
    #[serde(default)]
    pub fees: FeeSchedule,
}

impl Market {
    pub fn new(
        id: MarketId,
        base_unit: impl Into<String>,
        quote_unit: impl Into<String>,
        price_precision: u32,
        amount_precision: u32,
    ) -> Self {
        Self {
            id,
            base_unit: base_unit.into(),
            quote_unit: quote_unit.into(),
            price_precision,
            amount_precision,
            fees: FeeSchedule::default(),
        }
    }

    /// Human readable pair name, e.g. "BTC/USD"
    pub fn display_name(&self) -> String {
        format!(
            "{}/{}",
            self.base_unit.to_uppercase(),
            self.quote_unit.to_uppercase()
        )
    }
}

/// Read-only reference table keyed by market id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarketTable {
    markets: BTreeMap<MarketId, Market>,
}

impl MarketTable {
    /// Build the table, rejecting duplicate ids
    pub fn from_markets(markets: impl IntoIterator<Item = Market>) -> Result<Self, TypeError> {
        let mut table = BTreeMap::new();
        for market in markets {
            if table.contains_key(&market.id) {
                return Err(TypeError::DuplicateMarket(market.id.to_string()));
            }
            table.insert(market.id.clone(), market);
        }
        Ok(Self { markets: table })
    }

    pub fn get(&self, id: &MarketId) -> Option<&Market> {
        self.markets.get(id)
    }

    pub fn contains(&self, id: &MarketId) -> bool {
        self.markets.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.markets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markets.is_empty()
    }

    /// Markets in key order
    pub fn iter(&self) -> impl Iterator<Item = &Market> {
        self.markets.values()
    }
}
