//! TDS packet header definitions.
//!
//! Every TDS message is split into packets of at most the negotiated packet
//! size. Each packet starts with an 8-byte header:
//!
//! | offset | field      | encoding    |
//! |--------|------------|-------------|
//! | 0      | type       | u8          |
//! | 1      | status     | u8 bitflags |
//! | 2      | length     | u16 BE      |
//! | 4      | SPID       | u16 BE      |
//! | 6      | packet id  | u8          |
//! | 7      | window     | u8          |

use bitflags::bitflags;
use bytes::{Buf, BufMut};

use crate::error::ProtocolError;

/// TDS packet header size in bytes.
pub const PACKET_HEADER_SIZE: usize = 8;

/// Smallest packet size a server will negotiate.
pub const MIN_PACKET_SIZE: usize = 512;

/// Largest packet size a server will negotiate.
pub const MAX_PACKET_SIZE: usize = 32767;

/// Packet size used for PRELOGIN and LOGIN7 before renegotiation.
pub const DEFAULT_PACKET_SIZE: usize = 4096;

/// TDS packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// SQL batch request.
    SqlBatch = 0x01,
    /// Remote procedure call.
    Rpc = 0x03,
    /// Tabular response.
    TabularResult = 0x04,
    /// Attention signal.
    Attention = 0x06,
    /// Bulk load data.
    BulkLoad = 0x07,
    /// Transaction manager request.
    TransactionManager = 0x0E,
    /// TDS7+ login packet.
    Tds7Login = 0x10,
    /// SSPI authentication.
    Sspi = 0x11,
    /// Pre-login packet.
    PreLogin = 0x12,
}

impl PacketType {
    /// Create a packet type from a raw byte value.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x01 => Ok(Self::SqlBatch),
            0x03 => Ok(Self::Rpc),
            0x04 => Ok(Self::TabularResult),
            0x06 => Ok(Self::Attention),
            0x07 => Ok(Self::BulkLoad),
            0x0E => Ok(Self::TransactionManager),
            0x10 => Ok(Self::Tds7Login),
            0x11 => Ok(Self::Sspi),
            0x12 => Ok(Self::PreLogin),
            _ => Err(ProtocolError::InvalidPacketType(value)),
        }
    }
}

bitflags! {
    /// TDS packet status flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PacketStatus: u8 {
        /// Normal packet, more packets to follow.
        const NORMAL = 0x00;
        /// End of message (last packet).
        const END_OF_MESSAGE = 0x01;
        /// The receiver must discard the message this packet terminates.
        const IGNORE_EVENT = 0x02;
        /// Reset connection before processing the request.
        const RESET_CONNECTION = 0x08;
        /// Reset connection but keep transaction state.
        const RESET_CONNECTION_KEEP_TRANSACTION = 0x10;
    }
}

/// TDS packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Type of packet.
    pub packet_type: PacketType,
    /// Status flags.
    pub status: PacketStatus,
    /// Total packet length including header.
    pub length: u16,
    /// Server process ID (SPID).
    pub spid: u16,
    /// Packet sequence number, wraps at 255.
    pub packet_id: u8,
    /// Window (unused, always 0).
    pub window: u8,
}

impl PacketHeader {
    /// Create a new packet header.
    #[must_use]
    pub const fn new(packet_type: PacketType, status: PacketStatus, length: u16) -> Self {
        Self {
            packet_type,
            status,
            length,
            spid: 0,
            packet_id: 0,
            window: 0,
        }
    }

    /// Parse a packet header from bytes.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() < PACKET_HEADER_SIZE {
            return Err(ProtocolError::IncompletePacket {
                expected: PACKET_HEADER_SIZE,
                actual: src.remaining(),
            });
        }

        let packet_type = PacketType::from_u8(src.get_u8())?;
        let status_byte = src.get_u8();
        let status = PacketStatus::from_bits(status_byte)
            .ok_or(ProtocolError::InvalidPacketStatus(status_byte))?;
        let length = src.get_u16();
        let spid = src.get_u16();
        let packet_id = src.get_u8();
        let window = src.get_u8();

        Ok(Self {
            packet_type,
            status,
            length,
            spid,
            packet_id,
            window,
        })
    }

    /// Parse a header from a fixed 8-byte array.
    pub fn from_array(raw: &[u8; PACKET_HEADER_SIZE]) -> Result<Self, ProtocolError> {
        Self::decode(&mut &raw[..])
    }

    /// Encode the packet header to bytes.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.packet_type as u8);
        dst.put_u8(self.status.bits());
        dst.put_u16(self.length);
        dst.put_u16(self.spid);
        dst.put_u8(self.packet_id);
        dst.put_u8(self.window);
    }

    /// Write the header into the first 8 bytes of an output buffer.
    pub fn write_into(&self, dst: &mut [u8]) {
        let mut slot = &mut dst[..PACKET_HEADER_SIZE];
        self.encode(&mut slot);
    }

    /// Body length declared by this header.
    ///
    /// A declared length shorter than the header is a corrupted stream.
    pub fn body_length(&self) -> Result<usize, ProtocolError> {
        if (self.length as usize) < PACKET_HEADER_SIZE {
            return Err(ProtocolError::NegativeBodyLength(self.length));
        }
        Ok(self.length as usize - PACKET_HEADER_SIZE)
    }

    /// Check if this is the last packet in a message.
    #[must_use]
    pub const fn is_end_of_message(&self) -> bool {
        self.status.contains(PacketStatus::END_OF_MESSAGE)
    }

    /// Check if the message terminated by this packet must be discarded.
    #[must_use]
    pub const fn is_ignore(&self) -> bool {
        self.status.contains(PacketStatus::IGNORE_EVENT)
    }

    /// Set the packet ID (sequence number).
    #[must_use]
    pub const fn with_packet_id(mut self, id: u8) -> Self {
        self.packet_id = id;
        self
    }

    /// Set the SPID.
    #[must_use]
    pub const fn with_spid(mut self, spid: u16) -> Self {
        self.spid = spid;
        self
    }
}

/// Validate a packet size against the protocol bounds.
pub fn validate_packet_size(size: usize) -> Result<usize, ProtocolError> {
    if !(MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&size) {
        return Err(ProtocolError::InvalidPacketSize {
            size,
            min: MIN_PACKET_SIZE,
            max: MAX_PACKET_SIZE,
        });
    }
    Ok(size)
}

/// Build a complete, header-only ATTENTION packet.
#[must_use]
pub fn attention_packet() -> [u8; PACKET_HEADER_SIZE] {
    let mut raw = [0u8; PACKET_HEADER_SIZE];
    PacketHeader::new(
        PacketType::Attention,
        PacketStatus::END_OF_MESSAGE,
        PACKET_HEADER_SIZE as u16,
    )
    .with_packet_id(1)
    .write_into(&mut raw);
    raw
}
