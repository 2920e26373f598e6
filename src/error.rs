//! Error types for transaction and savepoint management
//!
//! State-machine violations get their own variants so callers can tell a
//! nesting-discipline bug apart from a driver failure. Driver errors are
//! never wrapped or retried; they pass through the `Driver` variant
//! unchanged.

/// Result type alias for transaction operations
pub type TxResult<T> = Result<T, TxError>;

/// Error types for transaction and savepoint operations
#[derive(Debug, thiserror::Error)]
pub enum TxError {
    /// Operation invalid for the current transaction state: double-begin,
    /// commit while nested scopes are still open, resolve-after-resolve.
    #[error("Transaction state error: {0}")]
    TransactionState(String),

    /// Attempt to resolve a savepoint that is not the innermost open one.
    /// Nested scopes must resolve strictly inside-out.
    #[error("Savepoint '{name}' is not the innermost open savepoint")]
    OutOfOrderResolution { name: String },

    /// Attempt to resolve a savepoint that an enclosing rollback already
    /// invalidated at the driver level.
    #[error("Savepoint '{name}' was invalidated by an enclosing rollback")]
    StaleSavepoint { name: String },

    /// Attempt to change session parameters while a transaction is open.
    #[error("Session state error: {0}")]
    SessionState(String),

    /// Failure surfaced by the underlying connection, propagated unchanged.
    #[error(transparent)]
    Driver(Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl TxError {
    /// Wrap a driver-level failure for propagation through the core.
    pub fn driver<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        TxError::Driver(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("connection reset")]
    struct FakeDriverError;

    #[test]
    fn test_driver_errors_pass_through_unchanged() {
        let err = TxError::driver(FakeDriverError);
        assert_eq!(err.to_string(), "connection reset");
    }

    #[test]
    fn test_state_error_messages() {
        let err = TxError::OutOfOrderResolution {
            name: "sp_2".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Savepoint 'sp_2' is not the innermost open savepoint"
        );

        let err = TxError::StaleSavepoint {
            name: "sp_3".to_string(),
        };
        assert!(err.to_string().contains("invalidated"));
    }
}
