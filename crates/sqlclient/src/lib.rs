//! # sqlclient
//!
//! Command execution core of the SQL Server client.
//!
//! This crate ties the layers together: it logs in over TCP, hands
//! physical connections to the pool in `sqlclient-pool`, and runs commands
//! on `tds-session` sessions through a resumable token parser.
//!
//! ## Features
//!
//! - **One pipeline, three drivers**: async, blocking, and split
//!   begin/end execution share the same session machinery
//! - **Cooperative cancellation**: ATTENTION is sent only once bytes are on
//!   the wire, and acknowledged before the session is reused
//! - **Connection resiliency**: broken connections are replaced by a shared
//!   reconnect task bounded by the command's remaining budget
//! - **Retry providers**: transient failures re-run the whole write and
//!   read unit
//! - **Statistics and tracing**: opt-in counters, a `sqlclient.execute`
//!   span per execution, and a pluggable event sink
//!
//! ## Execution states
//!
//! ```text
//! Idle -> Validating -> Writing -> [Reconnecting] -> Reading -> Completed | Faulted
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use sqlclient::{Client, Config};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_connection_string(
//!         "Server=localhost;Database=test;User Id=sa;Password=Password123;Max Pool Size=20",
//!     )?;
//!
//!     let client = Client::new();
//!     let mut conn = client.connect(config).await?;
//!
//!     let rows = conn.execute("UPDATE users SET active = 1 WHERE id = 7").await?;
//!     println!("updated {rows} rows");
//!
//!     let mut reader = conn.command("SELECT id, name FROM users").execute_reader_async().await?;
//!     while reader.read().await? {
//!         println!("{:?}", reader.get_bytes(1));
//!     }
//!     reader.close().await?;
//!
//!     conn.close().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod client;
pub mod command;
pub mod config;
pub mod connection;
pub mod connector;
pub mod error;
pub mod instrumentation;
pub mod parser;
pub mod reader;
pub mod retry;
pub mod statistics;

pub use client::{Client, Connection};
pub use command::{Command, CompletionHook, PendingNonQuery, RunMode};
pub use config::{Config, RetryPolicy, TimeoutConfig};
pub use connection::PhysicalConnection;
pub use connector::TcpConnector;
pub use error::{Error, Result};
pub use instrumentation::{
    EventSink, ExecutionEvent, ExecutionOutcome, SanitizationConfig, SinkError, TracingSink,
};
pub use reader::DataReader;
pub use retry::{ExponentialRetryProvider, NoneRetryProvider, RetryLogicProvider};
pub use statistics::{Statistics, StatisticsSnapshot};

// Re-export the layers callers configure directly.
pub use sqlclient_pool::{PoolError, PoolGroupOptions};
pub use tds_session::CancelHandle;
pub use tokio_util::sync::CancellationToken;
