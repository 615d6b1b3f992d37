//! Pool error types.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Shared, cloneable cause of a failed physical connect.
pub type ConnectSource = Arc<dyn std::error::Error + Send + Sync>;

/// Errors that can occur while obtaining a connection.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    /// Every pooled connection stayed in use for the whole wait.
    #[error(
        "timeout expired after {0:?} obtaining a connection from the pool; all pooled connections were in use and max pool size was reached"
    )]
    PoolTimeout(Duration),

    /// No non-pooled connect slot became free in time.
    #[error("timeout expired after {0:?} waiting for a non-pooled connection slot")]
    NonPooledOpenTimeout(Duration),

    /// The physical connect did not finish in time.
    #[error("connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The physical connect failed.
    #[error("failed to open connection: {0}")]
    Connect(#[source] ConnectSource),

    /// The server did not name a user instance during discovery.
    #[error("server did not return a user instance name")]
    UserInstanceUnavailable,

    /// Resetting a returned connection failed.
    #[error("connection reset failed: {0}")]
    ResetFailed(String),

    /// The factory was shut down.
    #[error("connection factory is shut down")]
    FactoryShutdown,

    /// Pool configuration error.
    #[error("pool configuration error: {0}")]
    Configuration(String),
}

impl PoolError {
    /// Wrap a connector failure.
    pub fn connect(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Connect(Arc::new(source))
    }

    /// Whether the error is one of the timeout kinds.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::PoolTimeout(_) | Self::NonPooledOpenTimeout(_) | Self::ConnectTimeout(_)
        )
    }

    /// Connector failure, if this error wraps one.
    #[must_use]
    pub fn connect_source(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            Self::Connect(source) => Some(source.as_ref()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_kinds_are_distinct() {
        let pool = PoolError::PoolTimeout(Duration::from_secs(15));
        let non_pooled = PoolError::NonPooledOpenTimeout(Duration::from_secs(15));

        assert!(pool.is_timeout());
        assert!(non_pooled.is_timeout());
        assert_ne!(pool.to_string(), non_pooled.to_string());
        assert!(pool.to_string().contains("max pool size"));
        assert!(non_pooled.to_string().contains("non-pooled"));
    }

    #[test]
    fn test_connect_source_is_shared() {
        let err = PoolError::connect(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        let copy = err.clone();
        assert!(copy.connect_source().is_some());
        assert!(!copy.is_timeout());
    }
}
