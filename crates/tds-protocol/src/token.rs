//! TDS token stream definitions.
//!
//! A response message is a stream of tokens. Each token starts with a
//! one-byte type. Most tokens then carry a two-byte little-endian length and
//! can be decoded once that many bytes are in hand; the `decode` functions
//! here take such complete token bodies. COLMETADATA and ROW/NBCROW have no
//! length prefix and are decoded incrementally by the client parser.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes};

use crate::codec::{read_b_varchar, read_us_varchar};
use crate::error::ProtocolError;
use crate::types::{ColumnFlags, TypeId, TypeInfo};

/// Token type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TokenType {
    /// Column metadata (COLMETADATA).
    ColMetaData = 0x81,
    /// Error message (ERROR).
    Error = 0xAA,
    /// Informational message (INFO).
    Info = 0xAB,
    /// Login acknowledgment (LOGINACK).
    LoginAck = 0xAD,
    /// Row data (ROW).
    Row = 0xD1,
    /// Null bitmap compressed row (NBCROW).
    NbcRow = 0xD2,
    /// Environment change (ENVCHANGE).
    EnvChange = 0xE3,
    /// SSPI authentication (SSPI).
    Sspi = 0xED,
    /// Done (DONE).
    Done = 0xFD,
    /// Done in procedure (DONEINPROC).
    DoneInProc = 0xFF,
    /// Done procedure (DONEPROC).
    DoneProc = 0xFE,
    /// Return status (RETURNSTATUS).
    ReturnStatus = 0x79,
    /// Return value (RETURNVALUE).
    ReturnValue = 0xAC,
    /// Order (ORDER).
    Order = 0xA9,
    /// Feature extension acknowledgment (FEATUREEXTACK).
    FeatureExtAck = 0xAE,
    /// Session state (SESSIONSTATE).
    SessionState = 0xE4,
    /// Column info (COLINFO).
    ColInfo = 0xA5,
    /// Table name (TABNAME).
    TabName = 0xA4,
}

impl TokenType {
    /// Create a token type from a raw byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x81 => Some(Self::ColMetaData),
            0xAA => Some(Self::Error),
            0xAB => Some(Self::Info),
            0xAD => Some(Self::LoginAck),
            0xD1 => Some(Self::Row),
            0xD2 => Some(Self::NbcRow),
            0xE3 => Some(Self::EnvChange),
            0xED => Some(Self::Sspi),
            0xFD => Some(Self::Done),
            0xFF => Some(Self::DoneInProc),
            0xFE => Some(Self::DoneProc),
            0x79 => Some(Self::ReturnStatus),
            0xAC => Some(Self::ReturnValue),
            0xA9 => Some(Self::Order),
            0xAE => Some(Self::FeatureExtAck),
            0xE4 => Some(Self::SessionState),
            0xA5 => Some(Self::ColInfo),
            0xA4 => Some(Self::TabName),
            _ => None,
        }
    }

    /// Whether the token body starts with a two-byte length.
    #[must_use]
    pub const fn is_length_prefixed(self) -> bool {
        matches!(
            self,
            Self::Error
                | Self::Info
                | Self::LoginAck
                | Self::EnvChange
                | Self::Sspi
                | Self::Order
                | Self::ColInfo
                | Self::TabName
        )
    }
}

/// A decoded token, as yielded by the client parser.
#[derive(Debug, Clone)]
pub enum Token {
    /// Column metadata describing the next result set.
    ColMetaData(ColMetaData),
    /// One row of the current result set.
    Row(RowData),
    /// Completion of a statement, procedure, or statement within a procedure.
    Done(Done),
    /// Return status from a stored procedure.
    ReturnStatus(i32),
    /// Error message from server.
    Error(ServerError),
    /// Informational message from server.
    Info(ServerInfo),
    /// Login acknowledgment.
    LoginAck(LoginAck),
    /// Environment change notification.
    EnvChange(EnvChange),
    /// Column ordering information.
    Order(Order),
}

/// Column metadata token.
#[derive(Debug, Clone, Default)]
pub struct ColMetaData {
    /// Column definitions.
    pub columns: Vec<ColumnData>,
}

impl ColMetaData {
    /// Column count meaning "no metadata follows".
    pub const NO_METADATA: u16 = 0xFFFF;
}

/// Column definition within metadata.
#[derive(Debug, Clone)]
pub struct ColumnData {
    /// Column name.
    pub name: String,
    /// Column data type.
    pub type_id: TypeId,
    /// Column flags.
    pub flags: ColumnFlags,
    /// User type ID.
    pub user_type: u32,
    /// Type-specific metadata.
    pub type_info: TypeInfo,
}

impl ColumnData {
    /// Whether the column is declared nullable.
    #[must_use]
    pub fn is_nullable(&self) -> bool {
        self.flags.contains(ColumnFlags::NULLABLE)
    }
}

/// Raw column values of one row; `None` is SQL NULL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowData {
    /// Value bytes per column, without length prefixes.
    pub values: Vec<Option<Bytes>>,
}

bitflags! {
    /// DONE status bits.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct DoneStatus: u16 {
        /// More results follow.
        const MORE = 0x0001;
        /// The statement failed.
        const ERROR = 0x0002;
        /// A transaction is in progress.
        const IN_XACT = 0x0004;
        /// The row count is valid.
        const COUNT = 0x0010;
        /// Acknowledges an ATTENTION.
        const ATTN = 0x0020;
        /// A server error terminated the statement.
        const SRVERROR = 0x0100;
    }
}

/// Which of the three DONE tokens was received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneKind {
    /// DONE: end of a SQL statement.
    Done,
    /// DONEPROC: end of a stored procedure.
    Proc,
    /// DONEINPROC: end of a statement inside a stored procedure.
    InProc,
}

impl DoneKind {
    /// Token type carrying this kind.
    #[must_use]
    pub const fn token_type(self) -> TokenType {
        match self {
            Self::Done => TokenType::Done,
            Self::Proc => TokenType::DoneProc,
            Self::InProc => TokenType::DoneInProc,
        }
    }
}

/// DONE, DONEPROC or DONEINPROC token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Done {
    /// Token variant.
    pub kind: DoneKind,
    /// Status flags.
    pub status: DoneStatus,
    /// Current command.
    pub cur_cmd: u16,
    /// Row count, valid when `status` has `COUNT`.
    pub row_count: u64,
}

impl Done {
    /// Body size in bytes (excluding the token type byte).
    pub const SIZE: usize = 12;

    /// Decode a DONE-family body.
    pub fn decode(kind: DoneKind, src: &mut impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() < Self::SIZE {
            return Err(ProtocolError::IncompletePacket {
                expected: Self::SIZE,
                actual: src.remaining(),
            });
        }

        Ok(Self {
            kind,
            status: DoneStatus::from_bits_retain(src.get_u16_le()),
            cur_cmd: src.get_u16_le(),
            row_count: src.get_u64_le(),
        })
    }

    /// Encode the token including its type byte.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.kind.token_type() as u8);
        dst.put_u16_le(self.status.bits());
        dst.put_u16_le(self.cur_cmd);
        dst.put_u64_le(self.row_count);
    }

    /// More results follow this token.
    #[must_use]
    pub const fn has_more(&self) -> bool {
        self.status.contains(DoneStatus::MORE)
    }

    /// Row count, if the server marked it valid.
    #[must_use]
    pub const fn rows_affected(&self) -> Option<u64> {
        if self.status.contains(DoneStatus::COUNT) {
            Some(self.row_count)
        } else {
            None
        }
    }

    /// This token acknowledges an ATTENTION.
    #[must_use]
    pub const fn is_attention_ack(&self) -> bool {
        self.status.contains(DoneStatus::ATTN)
    }
}

/// Server error message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    /// Error number.
    pub number: i32,
    /// Error state.
    pub state: u8,
    /// Severity class.
    pub class: u8,
    /// Message text.
    pub message: String,
    /// Server name.
    pub server: String,
    /// Procedure name.
    pub procedure: String,
    /// Line number.
    pub line: i32,
}

/// Server informational message.
pub type ServerInfo = ServerError;

impl ServerError {
    /// Decode an ERROR or INFO token body (starting at its length field).
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() < 8 {
            return Err(ProtocolError::UnexpectedEof);
        }
        let _length = src.get_u16_le();
        let number = src.get_i32_le();
        let state = src.get_u8();
        let class = src.get_u8();

        let message = read_us_varchar(src).ok_or(ProtocolError::UnexpectedEof)?;
        let server = read_b_varchar(src).ok_or(ProtocolError::UnexpectedEof)?;
        let procedure = read_b_varchar(src).ok_or(ProtocolError::UnexpectedEof)?;

        if src.remaining() < 4 {
            return Err(ProtocolError::UnexpectedEof);
        }
        let line = src.get_i32_le();

        Ok(Self {
            number,
            state,
            class,
            message,
            server,
            procedure,
            line,
        })
    }

    /// Severity 20 and above closes the connection.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        self.class >= 20
    }

    /// Severity 11 and above is an error rather than a message.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.class > 10
    }
}

/// Login acknowledgment token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginAck {
    /// Interface type.
    pub interface: u8,
    /// Negotiated TDS version.
    pub tds_version: u32,
    /// Server program name.
    pub prog_name: String,
    /// Server program version.
    pub prog_version: u32,
}

impl LoginAck {
    /// Decode a LOGINACK token body (starting at its length field).
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() < 7 {
            return Err(ProtocolError::UnexpectedEof);
        }
        let _length = src.get_u16_le();
        let interface = src.get_u8();
        let tds_version = src.get_u32();
        let prog_name = read_b_varchar(src).ok_or(ProtocolError::UnexpectedEof)?;
        if src.remaining() < 4 {
            return Err(ProtocolError::UnexpectedEof);
        }
        let prog_version = src.get_u32();

        Ok(Self {
            interface,
            tds_version,
            prog_name,
            prog_version,
        })
    }

    /// Negotiated protocol version.
    #[must_use]
    pub fn tds_version(&self) -> crate::version::TdsVersion {
        crate::version::TdsVersion::new(self.tds_version)
    }
}

/// Environment change type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EnvChangeType {
    /// Database changed.
    Database = 1,
    /// Language changed.
    Language = 2,
    /// Character set changed.
    CharacterSet = 3,
    /// Packet size changed.
    PacketSize = 4,
    /// Unicode sorting locale ID.
    UnicodeSortingLocalId = 5,
    /// Unicode comparison flags.
    UnicodeComparisonFlags = 6,
    /// SQL collation.
    SqlCollation = 7,
    /// Begin transaction.
    BeginTransaction = 8,
    /// Commit transaction.
    CommitTransaction = 9,
    /// Rollback transaction.
    RollbackTransaction = 10,
    /// Enlist DTC transaction.
    EnlistDtcTransaction = 11,
    /// Defect DTC transaction.
    DefectTransaction = 12,
    /// Real-time log shipping.
    RealTimeLogShipping = 13,
    /// Promote transaction.
    PromoteTransaction = 15,
    /// Transaction manager address.
    TransactionManagerAddress = 16,
    /// Transaction ended.
    TransactionEnded = 17,
    /// Reset connection completion acknowledgment.
    ResetConnectionAck = 18,
    /// User instance started; carries the user instance name.
    UserInstanceStarted = 19,
    /// Routing information.
    Routing = 20,
}

impl EnvChangeType {
    /// Create from raw byte value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Database),
            2 => Some(Self::Language),
            3 => Some(Self::CharacterSet),
            4 => Some(Self::PacketSize),
            5 => Some(Self::UnicodeSortingLocalId),
            6 => Some(Self::UnicodeComparisonFlags),
            7 => Some(Self::SqlCollation),
            8 => Some(Self::BeginTransaction),
            9 => Some(Self::CommitTransaction),
            10 => Some(Self::RollbackTransaction),
            11 => Some(Self::EnlistDtcTransaction),
            12 => Some(Self::DefectTransaction),
            13 => Some(Self::RealTimeLogShipping),
            15 => Some(Self::PromoteTransaction),
            16 => Some(Self::TransactionManagerAddress),
            17 => Some(Self::TransactionEnded),
            18 => Some(Self::ResetConnectionAck),
            19 => Some(Self::UserInstanceStarted),
            20 => Some(Self::Routing),
            _ => None,
        }
    }

    const fn is_binary(self) -> bool {
        matches!(
            self,
            Self::SqlCollation
                | Self::BeginTransaction
                | Self::CommitTransaction
                | Self::RollbackTransaction
                | Self::EnlistDtcTransaction
                | Self::DefectTransaction
                | Self::PromoteTransaction
                | Self::TransactionManagerAddress
                | Self::TransactionEnded
        )
    }
}

/// Environment change value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvChangeValue {
    /// String value.
    String(String),
    /// Binary value.
    Binary(Bytes),
}

/// Environment change token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvChange {
    /// Type of environment change.
    pub env_type: EnvChangeType,
    /// New value.
    pub new_value: EnvChangeValue,
    /// Old value.
    pub old_value: EnvChangeValue,
}

impl EnvChange {
    /// Decode an ENVCHANGE token body (starting at its length field).
    ///
    /// Returns `Ok(None)` for change types this driver does not track;
    /// the body is consumed either way.
    pub fn decode(src: &mut impl Buf) -> Result<Option<Self>, ProtocolError> {
        if src.remaining() < 3 {
            return Err(ProtocolError::UnexpectedEof);
        }
        let length = src.get_u16_le() as usize;
        if src.remaining() < length {
            return Err(ProtocolError::IncompletePacket {
                expected: length,
                actual: src.remaining(),
            });
        }
        let mut body = src.copy_to_bytes(length);

        let type_byte = body.get_u8();
        let Some(env_type) = EnvChangeType::from_u8(type_byte) else {
            return Ok(None);
        };
        if env_type == EnvChangeType::Routing {
            return Ok(None);
        }

        let (new_value, old_value) = if env_type.is_binary() {
            (read_binary_value(&mut body)?, read_binary_value(&mut body)?)
        } else {
            (
                EnvChangeValue::String(read_b_varchar(&mut body).ok_or(ProtocolError::UnexpectedEof)?),
                EnvChangeValue::String(read_b_varchar(&mut body).unwrap_or_default()),
            )
        };

        Ok(Some(Self {
            env_type,
            new_value,
            old_value,
        }))
    }

    fn new_string(&self) -> Option<&str> {
        match &self.new_value {
            EnvChangeValue::String(s) => Some(s),
            EnvChangeValue::Binary(_) => None,
        }
    }

    /// New packet size, for a PacketSize change.
    #[must_use]
    pub fn packet_size(&self) -> Option<usize> {
        if self.env_type != EnvChangeType::PacketSize {
            return None;
        }
        self.new_string()?.parse().ok()
    }

    /// New database name, for a Database change.
    #[must_use]
    pub fn new_database(&self) -> Option<&str> {
        (self.env_type == EnvChangeType::Database)
            .then(|| self.new_string())
            .flatten()
    }

    /// User instance name, for a UserInstanceStarted change.
    #[must_use]
    pub fn user_instance(&self) -> Option<&str> {
        (self.env_type == EnvChangeType::UserInstanceStarted)
            .then(|| self.new_string())
            .flatten()
    }

    /// Descriptor of a transaction that began.
    #[must_use]
    pub fn begun_transaction(&self) -> Option<u64> {
        if self.env_type != EnvChangeType::BeginTransaction {
            return None;
        }
        match &self.new_value {
            EnvChangeValue::Binary(raw) if raw.len() == 8 => {
                Some(u64::from_le_bytes(raw[..].try_into().ok()?))
            }
            _ => None,
        }
    }

    /// Whether this change ends the current transaction.
    #[must_use]
    pub fn ends_transaction(&self) -> bool {
        matches!(
            self.env_type,
            EnvChangeType::CommitTransaction
                | EnvChangeType::RollbackTransaction
                | EnvChangeType::TransactionEnded
                | EnvChangeType::DefectTransaction
        )
    }
}

fn read_binary_value(src: &mut Bytes) -> Result<EnvChangeValue, ProtocolError> {
    if !src.has_remaining() {
        return Err(ProtocolError::UnexpectedEof);
    }
    let len = src.get_u8() as usize;
    if src.remaining() < len {
        return Err(ProtocolError::UnexpectedEof);
    }
    Ok(EnvChangeValue::Binary(src.split_to(len)))
}

/// Column ordering information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    /// Ordered column ordinals.
    pub columns: Vec<u16>,
}

impl Order {
    /// Decode an ORDER token body (starting at its length field).
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() < 2 {
            return Err(ProtocolError::UnexpectedEof);
        }
        let length = src.get_u16_le() as usize;
        if src.remaining() < length {
            return Err(ProtocolError::IncompletePacket {
                expected: length,
                actual: src.remaining(),
            });
        }
        let columns = (0..length / 2).map(|_| src.get_u16_le()).collect();
        Ok(Self { columns })
    }
}
