//! Transport abstraction.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::SessionError;
use crate::state::SessionId;

/// Byte transport a session runs over.
pub trait TdsStream: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static {}

impl<T> TdsStream for T where T: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static {}

/// Type-erased transport.
pub type BoxStream = Box<dyn TdsStream>;

/// Opens transports for additional sessions on one physical connection.
///
/// The physical connection implements this for multiplexed sessions; tests
/// use in-memory pipes.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Open the transport for session `id`.
    async fn open_session(&self, id: SessionId) -> Result<BoxStream, SessionError>;
}

/// Provider for transports without multiplexing support.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMultiplexing;

#[async_trait]
impl SessionProvider for NoMultiplexing {
    async fn open_session(&self, _id: SessionId) -> Result<BoxStream, SessionError> {
        Err(SessionError::MultiplexingUnsupported)
    }
}
