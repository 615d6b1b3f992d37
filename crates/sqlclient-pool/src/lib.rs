//! # sqlclient-pool
//!
//! Connection factory and pooling for the SQL Server client core.
//!
//! Connections are grouped by a normalized connection key. Each
//! [`PoolGroup`] holds one [`ConnectionPool`] per caller identity, and the
//! [`ConnectionFactory`] maps keys to groups, checks connections out, and
//! retires idle groups from a periodic prune timer.
//!
//! ## Features
//!
//! - Bounded checkout retry when a pool shuts down mid-checkout
//! - Fail-fast blocking period after connect errors, 5s doubling to 60s
//! - Non-pooled opens throttled through one slot per processor
//! - Two-phase user-instance login with the instance name cached per pool
//! - `clear_pool` / `clear_all_pools` with draining of lent connections
//!
//! The pool does not know how to talk to a server. Callers plug in a
//! [`Connector`] that opens physical connections implementing
//! [`InternalConnection`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use sqlclient_pool::{ConnectionFactory, ConnectionRequest, PoolGroupOptions, PoolKey};
//!
//! let factory = ConnectionFactory::new(my_connector);
//! let request = ConnectionRequest::new(
//!     PoolKey::new(normalized, redacted),
//!     PoolGroupOptions::new().with_max_pool_size(20),
//!     Arc::new(connect_options),
//! );
//! let conn = factory.try_get_connection(&request).await?;
//! // Use connection...
//! conn.release().await;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod factory;
pub mod group;
pub mod lifecycle;
pub mod pool;

pub use config::{PoolGroupOptions, PoolIdentity, PoolKey};
pub use error::PoolError;
pub use factory::{ConnectionFactory, ConnectionRequest, FactoryConnection, MAX_POOL_RETRIES};
pub use group::{PoolGroup, PoolGroupState};
pub use lifecycle::{ConnectTarget, Connector, InternalConnection, OpenMode};
pub use pool::{ConnectionPool, PoolStatus, PooledConnection};
