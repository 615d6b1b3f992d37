//! TDS pre-login message.
//!
//! PRELOGIN is the first exchange on a new physical connection. The client
//! announces its version, encryption capability, target instance and MARS
//! preference; the server answers with the same option layout.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::version::TdsVersion;

/// Pre-login option types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PreLoginOption {
    /// Version information.
    Version = 0x00,
    /// Encryption negotiation.
    Encryption = 0x01,
    /// Instance name.
    Instance = 0x02,
    /// Client thread ID.
    ThreadId = 0x03,
    /// MARS support.
    Mars = 0x04,
    /// Trace ID.
    TraceId = 0x05,
    /// Federated authentication required.
    FedAuthRequired = 0x06,
    /// Nonce.
    Nonce = 0x07,
    /// End of option list.
    Terminator = 0xFF,
}

impl PreLoginOption {
    /// Create from raw byte value.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x00 => Ok(Self::Version),
            0x01 => Ok(Self::Encryption),
            0x02 => Ok(Self::Instance),
            0x03 => Ok(Self::ThreadId),
            0x04 => Ok(Self::Mars),
            0x05 => Ok(Self::TraceId),
            0x06 => Ok(Self::FedAuthRequired),
            0x07 => Ok(Self::Nonce),
            0xFF => Ok(Self::Terminator),
            _ => Err(ProtocolError::InvalidPreloginOption(value)),
        }
    }
}

/// Encryption level negotiated in PRELOGIN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum EncryptionLevel {
    /// Encrypt the login packet only.
    Off = 0x00,
    /// Encrypt the whole connection.
    On = 0x01,
    /// The peer has no TLS support.
    #[default]
    NotSupported = 0x02,
    /// The peer insists on encryption.
    Required = 0x03,
}

impl EncryptionLevel {
    /// Create from raw byte value; unknown values map to `Required`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => Self::Off,
            0x01 => Self::On,
            0x02 => Self::NotSupported,
            _ => Self::Required,
        }
    }

    /// Whether a connection at this level needs TLS.
    #[must_use]
    pub const fn needs_tls(&self) -> bool {
        matches!(self, Self::Off | Self::On | Self::Required)
    }
}

/// PRELOGIN request or response.
#[derive(Debug, Clone, Default)]
pub struct PreLogin {
    /// Client: TDS version requested. Server: product version.
    pub version: TdsVersion,
    /// Sub-build number.
    pub sub_build: u16,
    /// Encryption level.
    pub encryption: EncryptionLevel,
    /// Target instance name; the server echoes a status byte.
    pub instance: Option<String>,
    /// Client thread ID.
    pub thread_id: Option<u32>,
    /// MARS requested / granted.
    pub mars: bool,
}

impl PreLogin {
    /// Create a client request with encryption not supported.
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: TdsVersion::V7_4,
            ..Self::default()
        }
    }

    /// Set the encryption level.
    #[must_use]
    pub fn with_encryption(mut self, level: EncryptionLevel) -> Self {
        self.encryption = level;
        self
    }

    /// Request MARS.
    #[must_use]
    pub fn with_mars(mut self, enabled: bool) -> Self {
        self.mars = enabled;
        self
    }

    /// Target a named instance.
    #[must_use]
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Set the client thread id.
    #[must_use]
    pub fn with_thread_id(mut self, thread_id: u32) -> Self {
        self.thread_id = Some(thread_id);
        self
    }

    /// Encode the message payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut entries: Vec<(PreLoginOption, Vec<u8>)> = Vec::with_capacity(5);

        let mut version = Vec::with_capacity(6);
        version.extend_from_slice(&self.version.raw().to_be_bytes());
        version.extend_from_slice(&self.sub_build.to_le_bytes());
        entries.push((PreLoginOption::Version, version));
        entries.push((PreLoginOption::Encryption, vec![self.encryption as u8]));

        // The option is always sent; an empty name selects the default instance.
        let mut instance = self.instance.clone().unwrap_or_default().into_bytes();
        instance.push(0);
        entries.push((PreLoginOption::Instance, instance));

        if let Some(thread_id) = self.thread_id {
            entries.push((PreLoginOption::ThreadId, thread_id.to_be_bytes().to_vec()));
        }
        entries.push((PreLoginOption::Mars, vec![u8::from(self.mars)]));

        let header_size = entries.len() * 5 + 1;
        let data_size: usize = entries.iter().map(|(_, data)| data.len()).sum();
        let mut buf = BytesMut::with_capacity(header_size + data_size);

        let mut offset = header_size as u16;
        for (option, data) in &entries {
            buf.put_u8(*option as u8);
            buf.put_u16(offset);
            buf.put_u16(data.len() as u16);
            offset += data.len() as u16;
        }
        buf.put_u8(PreLoginOption::Terminator as u8);
        for (_, data) in &entries {
            buf.put_slice(data);
        }

        buf.freeze()
    }

    /// Decode a PRELOGIN payload.
    ///
    /// Offsets in the option table are absolute from the start of the payload.
    pub fn decode(mut src: impl Buf) -> Result<Self, ProtocolError> {
        let mut prelogin = Self::default();

        let mut options = Vec::new();
        loop {
            if src.remaining() < 1 {
                return Err(ProtocolError::UnexpectedEof);
            }
            let option_type = src.get_u8();
            if option_type == PreLoginOption::Terminator as u8 {
                break;
            }
            if src.remaining() < 4 {
                return Err(ProtocolError::UnexpectedEof);
            }
            let offset = src.get_u16() as usize;
            let length = src.get_u16() as usize;
            options.push((PreLoginOption::from_u8(option_type)?, offset, length));
        }

        let header_size = options.len() * 5 + 1;
        let data = src.copy_to_bytes(src.remaining());

        for (option, offset, length) in options {
            let Some(start) = offset.checked_sub(header_size) else {
                continue;
            };
            let Some(value) = data.get(start..start + length) else {
                continue;
            };

            match option {
                PreLoginOption::Version if length >= 4 => {
                    prelogin.version =
                        TdsVersion::new(u32::from_be_bytes([value[0], value[1], value[2], value[3]]));
                    if length >= 6 {
                        prelogin.sub_build = u16::from_le_bytes([value[4], value[5]]);
                    }
                }
                PreLoginOption::Encryption if length >= 1 => {
                    prelogin.encryption = EncryptionLevel::from_u8(value[0]);
                }
                PreLoginOption::Instance if length >= 1 => {
                    let name = value.split(|b| *b == 0).next().unwrap_or_default();
                    if !name.is_empty() {
                        prelogin.instance = Some(String::from_utf8_lossy(name).into_owned());
                    }
                }
                PreLoginOption::ThreadId if length >= 4 => {
                    prelogin.thread_id =
                        Some(u32::from_be_bytes([value[0], value[1], value[2], value[3]]));
                }
                PreLoginOption::Mars if length >= 1 => {
                    prelogin.mars = value[0] != 0;
                }
                _ => {}
            }
        }

        Ok(prelogin)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_prelogin_decode_own_encoding() {
        let original = PreLogin::new()
            .with_encryption(EncryptionLevel::NotSupported)
            .with_instance("SQLEXPRESS")
            .with_mars(true);

        let decoded = PreLogin::decode(original.encode()).unwrap();
        assert_eq!(decoded.version, TdsVersion::V7_4);
        assert_eq!(decoded.encryption, EncryptionLevel::NotSupported);
        assert_eq!(decoded.instance.as_deref(), Some("SQLEXPRESS"));
        assert!(decoded.mars);
    }

    #[test]
    fn test_prelogin_decode_options_out_of_order() {
        let mut buf = BytesMut::new();
        let header_size: u16 = 11;

        buf.put_u8(PreLoginOption::Encryption as u8);
        buf.put_u16(header_size);
        buf.put_u16(1);
        buf.put_u8(PreLoginOption::Version as u8);
        buf.put_u16(header_size + 1);
        buf.put_u16(6);
        buf.put_u8(PreLoginOption::Terminator as u8);

        buf.put_u8(0x02);
        buf.put_slice(&[0x10, 0x00, 0x00, 0x00]);
        buf.put_u16_le(7);

        let decoded = PreLogin::decode(buf.freeze()).unwrap();
        assert_eq!(decoded.encryption, EncryptionLevel::NotSupported);
        assert_eq!(decoded.version.raw(), 0x1000_0000);
        assert_eq!(decoded.sub_build, 7);
    }

    #[test]
    fn test_prelogin_truncated() {
        assert_eq!(
            PreLogin::decode(&[0x00u8, 0x00][..]).unwrap_err(),
            ProtocolError::UnexpectedEof
        );
    }

    #[test]
    fn test_encryption_level() {
        assert!(!EncryptionLevel::NotSupported.needs_tls());
        assert!(EncryptionLevel::Required.needs_tls());
        assert_eq!(EncryptionLevel::from_u8(0x80), EncryptionLevel::Required);
    }

    proptest::proptest! {
        #[test]
        fn test_prelogin_decode_never_panics(raw in proptest::collection::vec(proptest::num::u8::ANY, 0..256)) {
            let _ = PreLogin::decode(Bytes::from(raw));
        }
    }
}
