//! TDS LOGIN7 message construction.
//!
//! LOGIN7 carries client identity, SQL credentials and the requested packet
//! size. It is a 94-byte fixed header followed by a block of UTF-16LE
//! strings addressed through (offset, length) pairs in the header.
//!
//! The password is obfuscated, not encrypted.

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::write_utf16_string;
use crate::version::TdsVersion;

/// Fixed portion of the LOGIN7 message.
pub const LOGIN7_HEADER_SIZE: usize = 94;

bitflags! {
    /// LOGIN7 OptionFlags1.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OptionFlags1: u8 {
        /// Warn when the initial database cannot be used.
        const USE_DB_NOTIFY = 0x20;
        /// Fail the login when the initial database cannot be used.
        const DATABASE_FATAL = 0x40;
        /// Warn when the language changes.
        const SET_LANG_NOTIFY = 0x80;
    }
}

bitflags! {
    /// LOGIN7 OptionFlags2.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OptionFlags2: u8 {
        /// Fail the login when the language cannot be set.
        const LANGUAGE_FATAL = 0x01;
        /// ODBC-style session defaults.
        const ODBC = 0x02;
        /// Integrated (SSPI) security.
        const INTEGRATED_SECURITY = 0x80;
    }
}

bitflags! {
    /// LOGIN7 OptionFlags3.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OptionFlags3: u8 {
        /// Change password request.
        const CHANGE_PASSWORD = 0x01;
        /// Ask the server to spawn (or reuse) a user instance.
        const USER_INSTANCE = 0x04;
        /// Accept unknown collations.
        const UNKNOWN_COLLATION_HANDLING = 0x08;
        /// A feature extension block follows.
        const EXTENSION = 0x10;
    }
}

/// LOGIN7 message builder.
#[derive(Debug, Clone)]
pub struct Login7 {
    /// Requested TDS version.
    pub tds_version: TdsVersion,
    /// Requested packet size.
    pub packet_size: u32,
    /// Client process ID.
    pub client_pid: u32,
    /// Option flags 1.
    pub option_flags1: OptionFlags1,
    /// Option flags 2.
    pub option_flags2: OptionFlags2,
    /// Option flags 3.
    pub option_flags3: OptionFlags3,
    /// Client LCID.
    pub client_lcid: u32,
    /// Client machine name.
    pub hostname: String,
    /// SQL login name.
    pub username: String,
    /// SQL login password.
    pub password: String,
    /// Application name.
    pub app_name: String,
    /// Server name as the client addressed it.
    pub server_name: String,
    /// Client library name.
    pub library_name: String,
    /// Initial language.
    pub language: String,
    /// Initial database.
    pub database: String,
    /// Database file to attach.
    pub attach_db_file: String,
}

impl Default for Login7 {
    fn default() -> Self {
        Self {
            tds_version: TdsVersion::V7_4,
            packet_size: crate::packet::DEFAULT_PACKET_SIZE as u32,
            client_pid: std::process::id(),
            option_flags1: OptionFlags1::USE_DB_NOTIFY | OptionFlags1::DATABASE_FATAL,
            option_flags2: OptionFlags2::LANGUAGE_FATAL | OptionFlags2::ODBC,
            option_flags3: OptionFlags3::UNKNOWN_COLLATION_HANDLING,
            client_lcid: 0x0409,
            hostname: String::new(),
            username: String::new(),
            password: String::new(),
            app_name: String::from("sqlclient"),
            server_name: String::new(),
            library_name: String::from("sqlclient"),
            language: String::new(),
            database: String::new(),
            attach_db_file: String::new(),
        }
    }
}

impl Login7 {
    /// Create a LOGIN7 builder with default flags.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set SQL authentication credentials.
    #[must_use]
    pub fn with_sql_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self.option_flags2.remove(OptionFlags2::INTEGRATED_SECURITY);
        self
    }

    /// Set the initial database.
    #[must_use]
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Set the client machine name.
    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Set the application name.
    #[must_use]
    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self
    }

    /// Set the server name.
    #[must_use]
    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = server_name.into();
        self
    }

    /// Set the requested packet size.
    #[must_use]
    pub fn with_packet_size(mut self, packet_size: u32) -> Self {
        self.packet_size = packet_size;
        self
    }

    /// Request a user instance.
    #[must_use]
    pub fn with_user_instance(mut self, enabled: bool) -> Self {
        self.option_flags3.set(OptionFlags3::USER_INSTANCE, enabled);
        self
    }

    /// Encode the LOGIN7 payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        // Order matches the offset table in the fixed header.
        let fields: [(&str, bool); 10] = [
            (self.hostname.as_str(), false),
            (self.username.as_str(), false),
            (self.password.as_str(), true),
            (self.app_name.as_str(), false),
            (self.server_name.as_str(), false),
            ("", false),
            (self.library_name.as_str(), false),
            (self.language.as_str(), false),
            (self.database.as_str(), false),
            (self.attach_db_file.as_str(), false),
        ];

        let mut var_data = BytesMut::new();
        let mut table: Vec<(u16, u16)> = Vec::with_capacity(fields.len());
        for (value, obfuscate) in fields {
            let offset = (LOGIN7_HEADER_SIZE + var_data.len()) as u16;
            let chars = value.encode_utf16().count() as u16;
            if obfuscate {
                write_obfuscated_password(&mut var_data, value);
            } else {
                write_utf16_string(&mut var_data, value);
            }
            table.push((offset, chars));
        }
        let tail_offset = (LOGIN7_HEADER_SIZE + var_data.len()) as u16;

        let total_length = LOGIN7_HEADER_SIZE + var_data.len();
        let mut buf = BytesMut::with_capacity(total_length);

        buf.put_u32_le(total_length as u32);
        buf.put_u32_le(self.tds_version.raw());
        buf.put_u32_le(self.packet_size);
        buf.put_u32_le(0); // client program version
        buf.put_u32_le(self.client_pid);
        buf.put_u32_le(0); // connection id
        buf.put_u8(self.option_flags1.bits());
        buf.put_u8(self.option_flags2.bits());
        buf.put_u8(0); // type flags
        buf.put_u8(self.option_flags3.bits());
        buf.put_i32_le(0); // client timezone
        buf.put_u32_le(self.client_lcid);

        // hostname .. database
        for &(offset, chars) in &table[..9] {
            buf.put_u16_le(offset);
            buf.put_u16_le(chars);
        }
        buf.put_slice(&[0u8; 6]); // client id
        buf.put_u16_le(tail_offset); // sspi
        buf.put_u16_le(0);
        let (attach_offset, attach_chars) = table[9];
        buf.put_u16_le(attach_offset);
        buf.put_u16_le(attach_chars);
        buf.put_u16_le(tail_offset); // change password
        buf.put_u16_le(0);
        buf.put_u32_le(0); // long sspi

        buf.put_slice(&var_data);
        buf.freeze()
    }
}

/// Swap the nibbles of every byte, then XOR with 0xA5.
fn write_obfuscated_password(dst: &mut impl BufMut, password: &str) {
    for c in password.encode_utf16() {
        for byte in c.to_le_bytes() {
            dst.put_u8(byte.rotate_right(4) ^ 0xA5);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn u16_at(raw: &[u8], at: usize) -> u16 {
        u16::from_le_bytes([raw[at], raw[at + 1]])
    }

    #[test]
    fn test_login7_layout() {
        let login = Login7::new()
            .with_hostname("HOST")
            .with_sql_auth("sa", "pw")
            .with_database("db");

        let encoded = login.encode();
        let total = u32::from_le_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(total as usize, encoded.len());
        assert_eq!(
            u32::from_le_bytes([encoded[4], encoded[5], encoded[6], encoded[7]]),
            TdsVersion::V7_4.raw()
        );

        // Hostname entry points right after the fixed header.
        assert_eq!(u16_at(&encoded, 36) as usize, LOGIN7_HEADER_SIZE);
        assert_eq!(u16_at(&encoded, 38), 4);
        // Username follows the hostname.
        assert_eq!(u16_at(&encoded, 40) as usize, LOGIN7_HEADER_SIZE + 8);
        assert_eq!(u16_at(&encoded, 42), 2);
    }

    #[test]
    fn test_password_obfuscation() {
        let mut buf = BytesMut::new();
        write_obfuscated_password(&mut buf, "a");
        assert_eq!(&buf[..], &[0xB3, 0xA5]);
    }

    #[test]
    fn test_user_instance_flag() {
        let login = Login7::new().with_user_instance(true);
        let encoded = login.encode();
        assert_ne!(encoded[27] & OptionFlags3::USER_INSTANCE.bits(), 0);
    }
}
