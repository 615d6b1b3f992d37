//! SQL batch request encoding.
//!
//! A SQL_BATCH payload is an ALL_HEADERS block followed by the statement
//! text in UTF-16LE. The only header written is the transaction descriptor
//! header, which also carries the outstanding request count used when
//! several sessions share one connection.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::write_utf16_string;

/// Size of the ALL_HEADERS block written by [`SqlBatch::encode`].
pub const ALL_HEADERS_SIZE: usize = 22;

const TRANSACTION_DESCRIPTOR_HEADER: u16 = 0x0002;

/// SQL batch request.
#[derive(Debug, Clone)]
pub struct SqlBatch<'a> {
    sql: &'a str,
    transaction_descriptor: u64,
    outstanding_requests: u32,
}

impl<'a> SqlBatch<'a> {
    /// Create an auto-commit batch.
    #[must_use]
    pub fn new(sql: &'a str) -> Self {
        Self {
            sql,
            transaction_descriptor: 0,
            outstanding_requests: 1,
        }
    }

    /// Run inside the transaction announced by a BeginTransaction ENVCHANGE.
    #[must_use]
    pub fn with_transaction(mut self, descriptor: u64) -> Self {
        self.transaction_descriptor = descriptor;
        self
    }

    /// Number of requests in flight on the connection, this one included.
    #[must_use]
    pub fn with_outstanding_requests(mut self, count: u32) -> Self {
        self.outstanding_requests = count.max(1);
        self
    }

    /// Statement text.
    #[must_use]
    pub fn sql(&self) -> &str {
        self.sql
    }

    /// Encoded payload length in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        ALL_HEADERS_SIZE + crate::codec::utf16_byte_len(self.sql)
    }

    /// Encode the payload (without packet headers).
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());

        buf.put_u32_le(ALL_HEADERS_SIZE as u32);
        buf.put_u32_le((ALL_HEADERS_SIZE - 4) as u32);
        buf.put_u16_le(TRANSACTION_DESCRIPTOR_HEADER);
        buf.put_u64_le(self.transaction_descriptor);
        buf.put_u32_le(self.outstanding_requests);

        write_utf16_string(&mut buf, self.sql);
        buf.freeze()
    }
}

/// Encode an auto-commit batch.
#[must_use]
pub fn encode_sql_batch(sql: &str) -> Bytes {
    SqlBatch::new(sql).encode()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_sql_batch() {
        let payload = encode_sql_batch("SELECT 1");

        assert_eq!(payload.len(), ALL_HEADERS_SIZE + 16);
        assert_eq!(&payload[0..4], &[22, 0, 0, 0]);
        assert_eq!(&payload[4..8], &[18, 0, 0, 0]);
        assert_eq!(&payload[8..10], &[0x02, 0x00]);
        assert_eq!(&payload[18..22], &[1, 0, 0, 0]);
        assert_eq!(&payload[22..24], &[b'S', 0]);
    }

    #[test]
    fn test_transaction_and_outstanding_requests() {
        let payload = SqlBatch::new("")
            .with_transaction(0x0102_0304_0506_0708)
            .with_outstanding_requests(3)
            .encode();

        assert_eq!(payload.len(), ALL_HEADERS_SIZE);
        assert_eq!(&payload[10..18], &0x0102_0304_0506_0708u64.to_le_bytes());
        assert_eq!(&payload[18..22], &[3, 0, 0, 0]);
    }
}
