//! Identifier types for feed entities
//!
//! Market keys follow the ranger stream naming (`"btcusd"`), so they are
//! restricted to lowercase ASCII letters and digits.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

use crate::errors::TypeError;

/// Market identifier (trading pair key)
///
/// Format: lowercase alphanumeric, base unit followed by quote unit
/// (e.g., "btcusd", "ethbtc").
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct MarketId(String);

impl MarketId {
    /// Create a new MarketId from a string
    ///
    /// # Panics
    /// Panics if the key is empty or contains anything other than
    /// lowercase ASCII letters and digits
    pub fn new(key: impl Into<String>) -> Self {
        match Self::try_new(key) {
            Ok(id) => id,
            Err(err) => panic!("{err}"),
        }
    }

    /// Try to create a MarketId, rejecting malformed keys
    pub fn try_new(key: impl Into<String>) -> Result<Self, TypeError> {
        let s = key.into();
        let valid = !s.is_empty()
            && s
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
        if valid {
            Ok(Self(s))
        } else {
            Err(TypeError::InvalidMarketId(s))
        }
    }

    /// Get the key string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MarketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for MarketId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        MarketId::try_new(raw).map_err(serde::de::Error::custom)
    }
}

/// Trade identifier as assigned by the upstream feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TradeId(u64);

impl TradeId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TradeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
