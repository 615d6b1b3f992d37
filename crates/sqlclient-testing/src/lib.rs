//! # sqlclient-testing
//!
//! Test infrastructure for the SQL Server client core.
//!
//! The crate ships an in-process mock TDS server that runs on loopback TCP,
//! so pipeline tests need neither Docker nor a real SQL Server.
//!
//! ## Features
//!
//! - PRELOGIN / LOGIN7 handshake with packet-size and user-instance ENVCHANGEs
//! - Canned responses keyed by SQL text, including NBC rows and errors
//! - Delayed responses that honour ATTENTION
//! - Fault injection: slow logins, failed logins, dropped connections
//!
//! ## Mock Server Example
//!
//! ```rust,ignore
//! use sqlclient_testing::mock_server::{MockTdsServer, MockResponse, MockColumn, ScalarValue};
//!
//! #[tokio::test]
//! async fn test_with_mock_server() {
//!     let server = MockTdsServer::builder()
//!         .with_response(
//!             "SELECT * FROM users WHERE id = 1",
//!             MockResponse::rows(
//!                 vec![MockColumn::int("id"), MockColumn::nvarchar("name", 50)],
//!                 vec![vec![ScalarValue::Int(1), ScalarValue::String("Alice".into())]],
//!             ),
//!         )
//!         .build()
//!         .await
//!         .unwrap();
//!
//!     // Connect your client to server.addr()
//!     let addr = server.addr();
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod mock_server;

pub use mock_server::{
    MockColumn, MockResponse, MockServerBuilder, MockServerConfig, MockServerError, MockTdsServer,
    ScalarValue,
};
