//! Protocol-level error type.

use thiserror::Error;

/// Errors raised while decoding or encoding TDS wire structures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// Not enough bytes to decode a structure.
    #[error("incomplete data: expected {expected} bytes, got {actual}")]
    IncompletePacket {
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Unknown packet type byte.
    #[error("invalid packet type: 0x{0:02X}")]
    InvalidPacketType(u8),

    /// Unknown packet status bits.
    #[error("invalid packet status: 0x{0:02X}")]
    InvalidPacketStatus(u8),

    /// A packet header declared a length shorter than the header itself.
    #[error("invalid packet length {0}: shorter than the packet header")]
    NegativeBodyLength(u16),

    /// A packet exceeded the negotiated maximum size.
    #[error("packet length {length} exceeds maximum {max}")]
    PacketTooLarge {
        /// Declared packet length.
        length: usize,
        /// Negotiated maximum.
        max: usize,
    },

    /// Packet size outside the protocol bounds.
    #[error("packet size {size} outside the allowed range {min}..={max}")]
    InvalidPacketSize {
        /// Requested size.
        size: usize,
        /// Protocol minimum.
        min: usize,
        /// Protocol maximum.
        max: usize,
    },

    /// Unknown token type byte.
    #[error("invalid token type: 0x{0:02X}")]
    InvalidTokenType(u8),

    /// Unknown data type byte in column metadata.
    #[error("invalid data type: 0x{0:02X}")]
    InvalidDataType(u8),

    /// Unknown pre-login option.
    #[error("invalid pre-login option: 0x{0:02X}")]
    InvalidPreloginOption(u8),

    /// Malformed UTF-16 text.
    #[error("string encoding error: {0}")]
    StringEncoding(String),

    /// Unexpected end of token data.
    #[error("unexpected end of data")]
    UnexpectedEof,

    /// A decoded field carried a value the protocol does not allow.
    #[error("invalid {field}: {value}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// Offending value.
        value: u32,
    },
}
