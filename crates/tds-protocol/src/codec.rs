//! Low-level string helpers shared by token decoding and request encoding.
//!
//! TDS strings are UTF-16LE. Lengths are counted in characters (two bytes
//! each), prefixed with one byte (`B_VARCHAR`) or two bytes (`US_VARCHAR`).

use bytes::{Buf, BufMut};

use crate::error::ProtocolError;

/// Read a `B_VARCHAR`: 1-byte character count followed by UTF-16LE.
pub fn read_b_varchar(src: &mut impl Buf) -> Option<String> {
    if src.remaining() < 1 {
        return None;
    }
    let len = src.get_u8() as usize;
    read_utf16_string(src, len)
}

/// Read a `US_VARCHAR`: 2-byte character count followed by UTF-16LE.
pub fn read_us_varchar(src: &mut impl Buf) -> Option<String> {
    if src.remaining() < 2 {
        return None;
    }
    let len = src.get_u16_le() as usize;
    read_utf16_string(src, len)
}

/// Read a UTF-16LE string of `char_count` characters.
pub fn read_utf16_string(src: &mut impl Buf, char_count: usize) -> Option<String> {
    let byte_count = char_count * 2;
    if src.remaining() < byte_count {
        return None;
    }

    let mut chars = Vec::with_capacity(char_count);
    for _ in 0..char_count {
        chars.push(src.get_u16_le());
    }

    String::from_utf16(&chars).ok()
}

/// Decode a complete UTF-16LE byte slice.
pub fn decode_utf16_le(raw: &[u8]) -> Result<String, ProtocolError> {
    if raw.len() % 2 != 0 {
        return Err(ProtocolError::StringEncoding(format!(
            "odd UTF-16 byte length {}",
            raw.len()
        )));
    }
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|e| ProtocolError::StringEncoding(e.to_string()))
}

/// Write a `B_VARCHAR`, truncating at 255 characters.
pub fn write_b_varchar(dst: &mut impl BufMut, s: &str) {
    let chars: Vec<u16> = s.encode_utf16().take(255).collect();
    dst.put_u8(chars.len() as u8);
    for c in chars {
        dst.put_u16_le(c);
    }
}

/// Write a `US_VARCHAR`, truncating at 65535 characters.
pub fn write_us_varchar(dst: &mut impl BufMut, s: &str) {
    let chars: Vec<u16> = s.encode_utf16().take(65535).collect();
    dst.put_u16_le(chars.len() as u16);
    for c in chars {
        dst.put_u16_le(c);
    }
}

/// Write a UTF-16LE string without length prefix.
pub fn write_utf16_string(dst: &mut impl BufMut, s: &str) {
    for c in s.encode_utf16() {
        dst.put_u16_le(c);
    }
}

/// Byte length of a string once encoded as UTF-16.
#[must_use]
pub fn utf16_byte_len(s: &str) -> usize {
    s.encode_utf16().count() * 2
}
