//! Session error types.

use tds_protocol::ProtocolError;
use thiserror::Error;

/// Errors raised by the packet buffer and session layer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SessionError {
    /// Packet framing is corrupt; the connection must be torn down.
    #[error("corrupted TDS stream: {0}")]
    CorruptedStream(String),

    /// Protocol-level decode failure.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transport I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// The session deadline passed while waiting on the network.
    #[error("timeout expired while waiting on the network")]
    Timeout,

    /// The operation was cancelled by the caller.
    #[error("operation cancelled by user")]
    OperationCancelled,

    /// Another operation is already reading or writing this session.
    #[error("session is busy with another operation")]
    SessionBusy,

    /// The activation counter left the 0/1 range.
    #[error("invalid session activation transition from {found}")]
    InvalidActivation {
        /// Counter value observed.
        found: u32,
    },

    /// Packet size can only be renegotiated on the primary session.
    #[error("packet size can only be changed on the primary session")]
    NotPrimary,

    /// The output buffer holds more bytes than the new packet size.
    #[error("cannot resize the output buffer while {0} bytes are pending")]
    PendingOutput(usize),

    /// The session was marked broken by an earlier failure.
    #[error("session is broken")]
    Broken,

    /// The session pool was disposed.
    #[error("session pool is disposed")]
    PoolDisposed,

    /// The transport does not support multiplexed sessions.
    #[error("multiplexed sessions are not supported by this transport")]
    MultiplexingUnsupported,
}

impl SessionError {
    /// Whether the error leaves the physical connection unusable.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::CorruptedStream(_)
                | Self::Protocol(_)
                | Self::Io(_)
                | Self::ConnectionClosed
                | Self::Broken
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(SessionError::CorruptedStream("negative length".into()).is_fatal());
        assert!(SessionError::ConnectionClosed.is_fatal());
        assert!(!SessionError::Timeout.is_fatal());
        assert!(!SessionError::OperationCancelled.is_fatal());
    }
}
