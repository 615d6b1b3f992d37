//! # tds-session
//!
//! Packet buffers, per-session state and session pooling for the SQL
//! Server client core.
//!
//! ## Features
//!
//! - Packet framing with headers that may straddle network reads
//! - Resumable `try_*` reads with snapshot/replay
//! - NBC row null bitmaps
//! - Timeout state machine and ATTENTION-based cancellation
//! - Multiplexed session pool with drain-on-return
//!
//! ## Architecture
//!
//! ```text
//! Transport → SessionState (InBuffer / OutBuffer) → token parser
//!                  ↑
//!            CancelHandle (ATTENTION from another task)
//! ```
//!
//! A session is split into read and write halves so a cancel can be sent
//! while the owner is blocked reading a large result.
//!
//! ```rust,ignore
//! use tds_session::{SessionState, ExecutionMode};
//!
//! let mut session = SessionState::primary(tcp_stream);
//! let cancel = session.cancel_handle();
//!
//! tokio::spawn(async move {
//!     cancel.cancel().await?;
//! });
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod buffer;
pub mod cancel;
pub mod error;
pub mod null_bitmap;
pub mod pool;
mod shared;
mod snapshot;
pub mod state;
pub mod stream;
pub mod timeout;

pub use buffer::{InBuffer, OutBuffer};
pub use cancel::CancelHandle;
pub use error::SessionError;
pub use null_bitmap::NullBitmap;
pub use pool::{MAX_INACTIVE_SESSIONS, SessionPool};
pub use shared::{IoCounters, IoSnapshot};
pub use state::{
    DEFAULT_ATTENTION_TIMEOUT, FlushMode, OwnerId, Ownership, SessionFlags, SessionId,
    SessionRole, SessionState,
};
pub use stream::{BoxStream, NoMultiplexing, SessionProvider, TdsStream};
pub use timeout::{ExecutionMode, TimeoutState, TimeoutTimer};
