use thiserror::Error;

/// Main error type for the trading engine
#[derive(Error, Debug)]
pub enum GambitError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Validation failed: {0}")]
    Validation(String),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Rate limit permit not acquired for {broker} after waiting {waited_ms}ms")]
    RateLimitTimeout { broker: String, waited_ms: u64 },

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Broker errors
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Transient broker error: {0}")]
    TransientBroker(String),

    #[error("Order rejected by broker: {0}")]
    RejectedOrder(String),

    #[error("Market data unavailable: {0}")]
    DataUnavailable(String),

    #[error("Broker suspended: {0}")]
    BrokerSuspended(String),

    // Order execution errors
    #[error("Order execution failed: {0}")]
    OrderExecution(String),

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl GambitError {
    /// Errors worth retrying with backoff. Everything else is terminal
    /// for the attempt that produced it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GambitError::TransientBroker(_)
                | GambitError::RateLimitTimeout { .. }
                | GambitError::Http(_)
        )
    }

    /// Auth rejections trigger the invalidate-and-retry-once path in the
    /// broker adapter and broker suspension when exhausted.
    pub fn is_auth(&self) -> bool {
        matches!(self, GambitError::Auth(_))
    }
}

/// Result type alias for GambitError
pub type Result<T> = std::result::Result<T, GambitError>;

/// Specific error types for order execution
#[derive(Error, Debug, Clone)]
pub enum OrderError {
    #[error("Order not found: {order_id}")]
    NotFound { order_id: String },

    #[error("Order already in flight for strategy {strategy_id}")]
    AlreadyInFlight { strategy_id: String },

    #[error("Timeout after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Max retries exceeded: {attempts}")]
    MaxRetriesExceeded { attempts: u32 },
}

impl From<OrderError> for GambitError {
    fn from(err: OrderError) -> Self {
        GambitError::OrderExecution(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(GambitError::TransientBroker("502".into()).is_transient());
        assert!(GambitError::RateLimitTimeout {
            broker: "kis".into(),
            waited_ms: 1000
        }
        .is_transient());
        assert!(!GambitError::RejectedOrder("insufficient funds".into()).is_transient());
        assert!(!GambitError::Auth("expired".into()).is_transient());
    }

    #[test]
    fn auth_classification() {
        assert!(GambitError::Auth("401".into()).is_auth());
        assert!(!GambitError::DataUnavailable("no quote".into()).is_auth());
    }
}
