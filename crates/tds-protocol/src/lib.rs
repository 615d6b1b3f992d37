//! # tds-protocol
//!
//! MS-TDS (Tabular Data Stream) wire structures used by the SQL Server
//! client core.
//!
//! This crate is IO-agnostic. It knows how packets are framed, how the
//! login handshake and SQL batch requests are laid out, and how
//! length-prefixed tokens decode. Resumable reads across packet boundaries
//! live in `tds-session`.
//!
//! ## Example
//!
//! ```rust
//! use tds_protocol::{PacketHeader, PacketStatus, PacketType};
//!
//! let header = PacketHeader::new(PacketType::SqlBatch, PacketStatus::END_OF_MESSAGE, 100);
//! assert_eq!(header.body_length().unwrap(), 92);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod codec;
pub mod error;
pub mod login7;
pub mod packet;
pub mod prelogin;
pub mod sql_batch;
pub mod token;
pub mod types;
pub mod version;

pub use error::ProtocolError;
pub use login7::Login7;
pub use packet::{
    DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE, MIN_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader,
    PacketStatus, PacketType, attention_packet, validate_packet_size,
};
pub use prelogin::{EncryptionLevel, PreLogin, PreLoginOption};
pub use sql_batch::{ALL_HEADERS_SIZE, SqlBatch, encode_sql_batch};
pub use token::{
    ColMetaData, ColumnData, Done, DoneKind, DoneStatus, EnvChange, EnvChangeType,
    EnvChangeValue, LoginAck, Order, RowData, ServerError, ServerInfo, Token, TokenType,
};
pub use types::{
    BuiltinMetaTypes, Collation, ColumnFlags, MetaTypeService, TypeId, TypeInfo, TypeInfoLayout,
    ValueEncoding,
};
pub use version::TdsVersion;
