//! Exchange adapter error types
//!
//! All exchange-related errors are wrapped in ExchangeError enum
//! which implements thiserror for consistent error handling.

use thiserror::Error;

/// Exchange-specific error types for adapter operations
#[derive(Error, Debug)]
pub enum ExchangeError {
    /// Connection to exchange failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Exchange rejected our credentials or token
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Exchange asked us to slow down
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Exchange refused a subscription request
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),

    /// Network operation timed out
    #[error("Network timeout after {0}ms")]
    NetworkTimeout(u64),

    /// Invalid or unexpected response from exchange
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Order was rejected by the exchange
    #[error("Order rejected: {0}")]
    OrderRejected(String),

    /// WebSocket protocol error (boxed to reduce enum size)
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
}

/// Result type alias for exchange operations
pub type ExchangeResult<T> = std::result::Result<T, ExchangeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_failed_display() {
        let err = ExchangeError::ConnectionFailed("timeout".to_string());
        assert_eq!(err.to_string(), "Connection failed: timeout");
    }

    #[test]
    fn test_subscription_failed_display() {
        let err = ExchangeError::SubscriptionFailed("unknown product".to_string());
        assert_eq!(err.to_string(), "Subscription failed: unknown product");
    }

    #[test]
    fn test_network_timeout_display() {
        let err = ExchangeError::NetworkTimeout(5000);
        assert_eq!(err.to_string(), "Network timeout after 5000ms");
    }

    #[test]
    fn test_order_rejected_display() {
        let err = ExchangeError::OrderRejected("insufficient funds".to_string());
        assert_eq!(err.to_string(), "Order rejected: insufficient funds");
    }
}
