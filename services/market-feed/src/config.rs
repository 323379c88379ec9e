//! Feed engine configuration
//!
//! One struct per component, each with production defaults. The binary
//! reads a JSON document shaped like `FeedConfig`; every field is optional.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;
use types::market::Market;

use crate::error::FeedError;

/// Environment variable naming the config file when no CLI argument is given.
pub const CONFIG_ENV: &str = "MARKET_FEED_CONFIG";

/// Reconnect backoff: `min(base * factor^n, cap) * (1 ± jitter)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub factor: f64,
    pub cap_ms: u64,
    /// Relative jitter, e.g. 0.2 for ±20%.
    pub jitter: f64,
    /// Fixed RNG seed for reproducible jitter (tests, replays).
    pub seed: Option<u64>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            factor: 2.0,
            cap_ms: 30_000,
            jitter: 0.2,
            seed: None,
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Trades retained per market.
    pub trade_capacity: usize,
    /// Depth diffs parked per market while awaiting a snapshot.
    pub diff_buffer_capacity: usize,
    /// How long an unsubscribed channel's data is kept for a quick resubscribe.
    pub eviction_grace_ms: u64,
    /// Bound of the single inbound queue (commands + transport events).
    pub inbound_capacity: usize,
    pub backoff: BackoffConfig,
    /// Upstream WebSocket endpoint.
    pub ranger_url: String,
    /// Bearer token for authenticated connections.
    pub auth_token: Option<String>,
    /// HTTP read API bind address.
    pub listen_addr: String,
    /// Market reference table.
    pub markets: Vec<Market>,
    /// Subscriptions opened at start-up, as ranger stream names (`btcusd.depth`).
    pub streams: Vec<String>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            trade_capacity: 100,
            diff_buffer_capacity: 100,
            eviction_grace_ms: 30_000,
            inbound_capacity: 1_024,
            backoff: BackoffConfig::default(),
            ranger_url: "ws://127.0.0.1:8081/api/v2/ranger/public".to_string(),
            auth_token: None,
            listen_addr: "0.0.0.0:8082".to_string(),
            markets: Vec::new(),
            streams: Vec::new(),
        }
    }
}

impl FeedConfig {
    /// Load from a JSON file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, FeedError> {
        if !path.exists() {
            info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)
            .map_err(|e| FeedError::Config(format!("{}: {}", path.display(), e)))?;
        let config = Self::from_json(&raw)?;
        info!(path = %path.display(), markets = config.markets.len(), "Config loaded");
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self, FeedError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| FeedError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), FeedError> {
        let fail = |msg: &str| Err(FeedError::Config(msg.to_string()));

        if self.trade_capacity == 0 {
            return fail("trade_capacity must be > 0");
        }
        if self.diff_buffer_capacity == 0 {
            return fail("diff_buffer_capacity must be > 0");
        }
        if self.inbound_capacity == 0 {
            return fail("inbound_capacity must be > 0");
        }
        if self.backoff.factor.is_nan() || self.backoff.factor < 1.0 {
            return fail("backoff.factor must be >= 1");
        }
        if !(0.0..1.0).contains(&self.backoff.jitter) {
            return fail("backoff.jitter must be in [0, 1)");
        }
        if self.backoff.cap_ms < self.backoff.base_ms {
            return fail("backoff.cap_ms must be >= backoff.base_ms");
        }
        Ok(())
    }

    pub fn eviction_grace(&self) -> Duration {
        Duration::from_millis(self.eviction_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = FeedConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.trade_capacity, 100);
        assert_eq!(config.eviction_grace(), Duration::from_secs(30));
        assert_eq!(config.backoff.cap_ms, 30_000);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = FeedConfig::from_json(
            r#"{"trade_capacity": 50, "backoff": {"seed": 7},
                "markets": [{"id":"btcusd","base_unit":"btc","quote_unit":"usd",
                             "price_precision":2,"amount_precision":6}]}"#,
        )
        .unwrap();

        assert_eq!(config.trade_capacity, 50);
        assert_eq!(config.diff_buffer_capacity, 100);
        assert_eq!(config.backoff.seed, Some(7));
        assert_eq!(config.backoff.factor, 2.0);
        assert_eq!(config.markets.len(), 1);
    }

    #[test]
    fn test_validation_rejects_bad_backoff() {
        let err = FeedConfig::from_json(r#"{"backoff": {"jitter": 1.5}}"#).unwrap_err();
        assert!(matches!(err, FeedError::Config(_)));

        let err = FeedConfig::from_json(r#"{"backoff": {"base_ms": 5000, "cap_ms": 1000}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("cap_ms"));

        assert!(FeedConfig::from_json(r#"{"trade_capacity": 0}"#).is_err());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = FeedConfig::load(Path::new("/nonexistent/market-feed.json")).unwrap();
        assert_eq!(config, FeedConfig::default());
    }
}
