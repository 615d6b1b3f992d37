//! Client error types.

use std::time::Duration;

use sqlclient_pool::PoolError;
use tds_protocol::{ProtocolError, ServerError};
use tds_session::SessionError;
use thiserror::Error;

/// Errors that can occur during client operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Every pooled connection stayed in use for the whole wait.
    #[error(
        "timeout expired after {0:?} obtaining a connection from the pool; all pooled connections were in use and max pool size was reached"
    )]
    PoolTimeout(Duration),

    /// The non-pooled connect throttle did not admit the open in time.
    #[error("timeout expired after {0:?} waiting for a non-pooled connection slot")]
    NonPooledOpenTimeout(Duration),

    /// Opening the physical connection timed out.
    #[error("connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The command did not complete within its timeout.
    #[error("command timed out after {0:?}")]
    CommandTimeout(Duration),

    /// Transparent reconnection did not finish within the remaining budget.
    #[error("reconnection did not complete within {0:?}")]
    ReconnectTimeout(Duration),

    /// The command was cancelled by the caller.
    #[error("operation cancelled by user")]
    Cancelled,

    /// A synchronous execution produced a pending write.
    #[error("a synchronous call produced a pending operation")]
    SyncCallPended,

    /// Server returned an error.
    #[error("server error {number}: {message}")]
    Server {
        /// Error number.
        number: i32,
        /// Error class/severity (0-25).
        class: u8,
        /// Error state.
        state: u8,
        /// Error message.
        message: String,
        /// Server name where error occurred.
        server: Option<String>,
        /// Stored procedure name (if applicable).
        procedure: Option<String>,
        /// Line number in the SQL batch or procedure.
        line: u32,
    },

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Session or packet-buffer failure.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Connection closed unexpectedly.
    #[error("connection closed")]
    ConnectionClosed,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Connection pool failure other than a timeout.
    #[error("pool error: {0}")]
    Pool(PoolError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error is transient and may succeed on retry.
    ///
    /// Transient errors include connection-level timeouts, dropped
    /// connections, and server errors whose number appears in the transient
    /// list used by [`ExponentialRetryProvider`](crate::retry::ExponentialRetryProvider).
    /// A command timeout is not transient: the server may have applied part
    /// of the batch before the client gave up.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::PoolTimeout(_)
            | Self::NonPooledOpenTimeout(_)
            | Self::ConnectTimeout(_)
            | Self::ReconnectTimeout(_)
            | Self::ConnectionClosed
            | Self::Io(_) => true,
            Self::Server { number, .. } => crate::retry::is_transient_number(*number),
            Self::Session(e) => matches!(
                e,
                SessionError::ConnectionClosed | SessionError::Io(_)
            ),
            Self::Pool(PoolError::Connect(_)) => true,
            _ => false,
        }
    }

    /// Check if this error is one of the timeout kinds.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::PoolTimeout(_)
                | Self::NonPooledOpenTimeout(_)
                | Self::ConnectTimeout(_)
                | Self::CommandTimeout(_)
                | Self::ReconnectTimeout(_)
        )
    }

    /// Check if the connection that produced this error is unusable.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Protocol(_) | Self::ConnectionClosed | Self::SyncCallPended => true,
            Self::Session(e) => e.is_fatal(),
            Self::Server { class, .. } => *class >= 20,
            _ => false,
        }
    }

    /// Server error number, if this is a server error.
    ///
    /// Login failures reported by the pool carry the server error as their
    /// connect source; its number is returned too.
    #[must_use]
    pub fn server_number(&self) -> Option<i32> {
        match self {
            Self::Server { number, .. } => Some(*number),
            Self::Pool(pool) => pool
                .connect_source()
                .and_then(|source| source.downcast_ref::<Error>())
                .and_then(Error::server_number),
            _ => None,
        }
    }

    /// Check if this is a server error with a specific number.
    #[must_use]
    pub fn is_server_error(&self, number: i32) -> bool {
        self.server_number() == Some(number)
    }

    /// Get the error class/severity if this is a server error.
    ///
    /// SQL Server error classes range from 0-25:
    /// - 0-10: Informational
    /// - 11-16: User errors
    /// - 17-19: Resource/hardware errors
    /// - 20-25: System errors (connection terminating)
    #[must_use]
    pub fn class(&self) -> Option<u8> {
        match self {
            Self::Server { class, .. } => Some(*class),
            _ => None,
        }
    }
}

impl From<ServerError> for Error {
    fn from(err: ServerError) -> Self {
        let non_empty = |s: String| (!s.is_empty()).then_some(s);
        Self::Server {
            number: err.number,
            class: err.class,
            state: err.state,
            message: err.message,
            server: non_empty(err.server),
            procedure: non_empty(err.procedure),
            line: err.line.max(0) as u32,
        }
    }
}

impl From<PoolError> for Error {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::PoolTimeout(d) => Self::PoolTimeout(d),
            PoolError::NonPooledOpenTimeout(d) => Self::NonPooledOpenTimeout(d),
            PoolError::ConnectTimeout(d) => Self::ConnectTimeout(d),
            PoolError::Configuration(msg) => Self::Config(msg),
            other => Self::Pool(other),
        }
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn server_error(number: i32, class: u8) -> Error {
        Error::Server {
            number,
            class,
            state: 1,
            message: "boom".into(),
            server: None,
            procedure: None,
            line: 1,
        }
    }

    #[test]
    fn test_timeout_kinds_are_distinct() {
        let pool = Error::from(PoolError::PoolTimeout(Duration::from_secs(15)));
        let throttle = Error::from(PoolError::NonPooledOpenTimeout(Duration::from_secs(15)));

        assert!(matches!(pool, Error::PoolTimeout(_)));
        assert!(matches!(throttle, Error::NonPooledOpenTimeout(_)));
        assert_ne!(pool.to_string(), throttle.to_string());
        assert!(pool.is_timeout() && throttle.is_timeout());
        assert!(Error::ReconnectTimeout(Duration::from_secs(5)).is_timeout());
        assert!(!Error::Cancelled.is_timeout());
    }

    #[test]
    fn test_server_error_classification() {
        let deadlock = server_error(1205, 13);
        assert!(deadlock.is_transient());
        assert_eq!(deadlock.server_number(), Some(1205));
        assert!(deadlock.is_server_error(1205));
        assert!(!deadlock.is_fatal());

        let syntax = server_error(102, 15);
        assert!(!syntax.is_transient());
        assert_eq!(syntax.class(), Some(15));

        assert!(server_error(0, 20).is_fatal());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::Session(SessionError::CorruptedStream("bad length".into())).is_fatal());
        assert!(Error::Protocol(ProtocolError::UnexpectedEof).is_fatal());
        assert!(!Error::Session(SessionError::Timeout).is_fatal());
        assert!(!Error::Cancelled.is_fatal());
        assert!(!Error::Cancelled.is_transient());
    }

    #[test]
    fn test_command_timeout_is_not_transient() {
        let timeout = Error::CommandTimeout(Duration::from_secs(30));
        assert!(timeout.is_timeout());
        assert!(!timeout.is_transient());
        assert!(!Error::Session(SessionError::Timeout).is_transient());
        assert!(Error::ReconnectTimeout(Duration::from_secs(5)).is_transient());
    }

    #[test]
    fn test_from_server_error_drops_empty_names() {
        let err = Error::from(ServerError {
            number: 547,
            state: 0,
            class: 16,
            message: "constraint".into(),
            server: "sql1".into(),
            procedure: String::new(),
            line: 3,
        });
        match err {
            Error::Server {
                server, procedure, line, ..
            } => {
                assert_eq!(server.as_deref(), Some("sql1"));
                assert!(procedure.is_none());
                assert_eq!(line, 3);
            }
            other => unreachable!("unexpected {other:?}"),
        }
    }
}
