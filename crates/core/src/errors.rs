use thiserror::Error;

/// Top-level error for every fallible operation in the library.
#[derive(Error, Debug)]
pub enum KewError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to serialize message: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Failed to deserialize message: {0}")]
    Deserialize(#[source] serde_json::Error),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Coordination error: {0}")]
    Coordination(String),

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Shutting down")]
    Shutdown,
}

impl KewError {
    /// Whether this failure counts toward the consumer circuit breaker.
    ///
    /// Consume-protocol errors and cancellation are expected conditions and
    /// never trip the breaker; everything else does.
    pub fn counts_toward_breaker(&self) -> bool {
        !matches!(
            self,
            KewError::Shutdown | KewError::Broker(BrokerError::Consume(_))
        )
    }
}

/// Errors raised by a broker binding (Kafka client or in-memory double).
#[derive(Error, Debug, Clone)]
pub enum BrokerError {
    #[error("Broker transport error: {0}")]
    Transport(String),

    #[error("Message delivery failed: {0}")]
    Delivery(String),

    #[error("Consumer error: {0}")]
    Consume(String),

    #[error("Admin operation failed: {0}")]
    Admin(String),
}

/// Errors raised by the host store binding.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Transaction failed: {0}")]
    Transaction(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Session is no longer usable")]
    SessionClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_protocol_errors_do_not_trip_breaker() {
        let err = KewError::Broker(BrokerError::Consume("poll failed".to_string()));
        assert!(!err.counts_toward_breaker());
        assert!(!KewError::Shutdown.counts_toward_breaker());
    }

    #[test]
    fn handler_and_deserialize_errors_trip_breaker() {
        assert!(KewError::Handler("boom".to_string()).counts_toward_breaker());
        let bad = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(KewError::Deserialize(bad).counts_toward_breaker());
    }
}
