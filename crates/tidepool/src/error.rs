//! Pool error types.
//!
//! The variants are what an embedding service maps to status codes:
//! [`PoolError::Exhausted`] is backpressure (retry later), while
//! [`PoolError::Connection`] means the target could not be reached.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors that can occur while acquiring a pooled connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// The connection factory failed to open a physical connection.
    /// Not retried by the pool.
    #[error("failed to connect to {target}: {reason}")]
    Connection { target: String, reason: String },

    /// The caller waited in the queue for its whole timeout.
    #[error("connection pool exhausted for {target} (waited {waited:?})")]
    Exhausted { target: String, waited: Duration },

    /// The target pool was evicted or retired while the caller used it.
    /// The broker re-resolves once before surfacing this as `Exhausted`.
    #[error("connection pool for {target} was evicted")]
    Evicted { target: String },

    #[error("connection pool is shutting down")]
    ShuttingDown,
}

impl PoolError {
    /// Whether the failure is a capacity problem the client should retry later.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, PoolError::Exhausted { .. } | PoolError::Evicted { .. })
    }

    /// Whether the failure came from the target itself.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, PoolError::Connection { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_backpressure_and_hard_failures() {
        let exhausted = PoolError::Exhausted {
            target: "app@db:5432/app".into(),
            waited: Duration::from_millis(50),
        };
        let refused = PoolError::Connection {
            target: "app@db:5432/app".into(),
            reason: "connection refused".into(),
        };

        assert!(exhausted.is_backpressure());
        assert!(!exhausted.is_connection_failure());
        assert!(refused.is_connection_failure());
        assert!(!refused.is_backpressure());
        assert!(!PoolError::ShuttingDown.is_backpressure());
    }

    #[test]
    fn messages_name_the_target() {
        let err = PoolError::Connection {
            target: "app@db:5432/app".into(),
            reason: "connection refused".into(),
        };
        assert_eq!(
            err.to_string(),
            "failed to connect to app@db:5432/app: connection refused"
        );
        assert!(
            PoolError::Evicted { target: "x".into() }
                .to_string()
                .contains("evicted")
        );
    }
}
