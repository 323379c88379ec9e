//! Error types for the shared type definitions

use thiserror::Error;

/// Validation failures when constructing domain types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid market id: {0:?}")]
    InvalidMarketId(String),

    #[error("invalid price: {0}")]
    InvalidPrice(String),

    #[error("invalid quantity: {0}")]
    InvalidQuantity(String),

    #[error("duplicate market: {0}")]
    DuplicateMarket(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TypeError::InvalidPrice("negative".to_string());
        assert_eq!(err.to_string(), "invalid price: negative");

        let err = TypeError::InvalidMarketId("BTC/USD".to_string());
        assert_eq!(err.to_string(), "invalid market id: \"BTC/USD\"");
    }
}
