//! Connection lifecycle traits.
//!
//! The pool is generic over how physical connections are made. A
//! [`Connector`] opens them; the resulting [`InternalConnection`] tells the
//! pool whether it is still usable and prepares itself for the next owner.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::PoolError;

/// What a physical connect should log in to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectTarget {
    /// The server named by the connection options.
    Server,
    /// The parent instance, asking it to start a user instance and report
    /// its name.
    UserInstanceDiscovery,
    /// A user instance discovered earlier.
    UserInstance(Arc<str>),
}

/// Opens physical connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connection options shared by every connection of a pool.
    type Options: Send + Sync + 'static;

    /// Physical connection type.
    type Connection: InternalConnection;

    /// Whether these options ask for a user instance.
    fn wants_user_instance(&self, options: &Self::Options) -> bool;

    /// Open and log in a connection within `timeout`.
    async fn connect(
        &self,
        options: &Self::Options,
        target: ConnectTarget,
        timeout: Duration,
    ) -> Result<Self::Connection, PoolError>;
}

/// Physical connection as seen by the pool.
#[async_trait]
pub trait InternalConnection: Send + Sync + 'static {
    /// Whether the transport is still open and the session sound.
    fn is_alive(&self) -> bool;

    /// User instance name reported by the server at login.
    fn user_instance(&self) -> Option<Arc<str>>;

    /// Drain leftover results and clear per-owner state before reuse.
    async fn reset(&mut self) -> Result<(), PoolError>;

    /// Close the transport.
    async fn close(&mut self);
}

/// How the caller waits for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenMode {
    /// The caller's thread is dedicated to this open; backoff sleeps block it.
    #[default]
    Sync,
    /// The caller awaits a future; non-pooled opens go through the throttle.
    Async,
}
