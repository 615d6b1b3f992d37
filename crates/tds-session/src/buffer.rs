//! Fixed-size packet buffers.
//!
//! The input buffer holds raw bytes exactly as the transport returned them,
//! headers included. Three cursors describe it:
//!
//! ```text
//! 0          used                 read            capacity
//! |----------|--------------------|----------------|
//!  consumed    buffered, unparsed    free
//! ```
//!
//! `packet` counts body bytes left in the current packet, which may extend
//! past `read` into data not received yet. Headers can straddle two network
//! reads, so they are staged in [`PartialHeader`].

use tds_protocol::ProtocolError;
use tds_protocol::packet::{PACKET_HEADER_SIZE, PacketHeader};

/// Inbound packet buffer.
#[derive(Debug)]
pub struct InBuffer {
    buf: Vec<u8>,
    pub(crate) used: usize,
    pub(crate) read: usize,
    pub(crate) packet: usize,
}

impl InBuffer {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            buf: vec![0; size],
            used: 0,
            read: 0,
            packet: 0,
        }
    }

    /// Capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes consumed from the current fill.
    #[must_use]
    pub fn bytes_used(&self) -> usize {
        self.used
    }

    /// Bytes present from the current fill.
    #[must_use]
    pub fn bytes_read(&self) -> usize {
        self.read
    }

    /// Body bytes left in the current packet.
    #[must_use]
    pub fn bytes_packet(&self) -> usize {
        self.packet
    }

    /// Buffered bytes not yet consumed.
    #[must_use]
    pub fn available(&self) -> usize {
        self.read - self.used
    }

    /// Body bytes that can be consumed without another header or read.
    pub(crate) fn body_available(&self) -> usize {
        self.packet.min(self.available())
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.used == self.read
    }

    pub(crate) fn unread(&self) -> &[u8] {
        &self.buf[self.used..self.read]
    }

    pub(crate) fn filled(&self) -> &[u8] {
        &self.buf[..self.read]
    }

    pub(crate) fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..]
    }

    /// Consume `n` body bytes.
    pub(crate) fn advance_body(&mut self, n: usize) {
        debug_assert!(n <= self.body_available());
        self.used += n;
        self.packet -= n;
    }

    /// Consume `n` header bytes.
    pub(crate) fn advance_header(&mut self, n: usize) {
        debug_assert!(n <= self.available());
        self.used += n;
    }

    /// Mark `n` freshly received bytes, replacing the exhausted fill.
    pub(crate) fn set_filled(&mut self, n: usize) {
        self.used = 0;
        self.read = n;
    }

    /// Replace the contents with `chunk`, growing if needed.
    pub(crate) fn load(&mut self, chunk: &[u8]) {
        if chunk.len() > self.buf.len() {
            self.buf.resize(chunk.len(), 0);
        }
        self.buf[..chunk.len()].copy_from_slice(chunk);
        self.set_filled(chunk.len());
    }

    /// Reallocate at `size`, carrying unread bytes over.
    pub(crate) fn resize(&mut self, size: usize) {
        let leftover = self.unread().to_vec();
        let mut buf = vec![0; size.max(leftover.len())];
        buf[..leftover.len()].copy_from_slice(&leftover);
        self.buf = buf;
        self.used = 0;
        self.read = leftover.len();
    }

    pub(crate) fn clear(&mut self) {
        self.used = 0;
        self.read = 0;
        self.packet = 0;
    }
}

/// Outbound packet buffer; bytes `0..8` are reserved for the header.
#[derive(Debug)]
pub struct OutBuffer {
    buf: Vec<u8>,
    pub(crate) used: usize,
}

impl OutBuffer {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            buf: vec![0; size],
            used: PACKET_HEADER_SIZE,
        }
    }

    /// Capacity in bytes, header included.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes used, header included.
    #[must_use]
    pub fn bytes_used(&self) -> usize {
        self.used
    }

    /// Whether no body bytes are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.used == PACKET_HEADER_SIZE
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.used
    }

    /// Append as much of `data` as fits; returns the count copied.
    pub(crate) fn put(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.remaining());
        self.buf[self.used..self.used + n].copy_from_slice(&data[..n]);
        self.used += n;
        n
    }

    /// Stamp `header` and return the finished packet bytes.
    pub(crate) fn seal(&mut self, header: &PacketHeader) -> &[u8] {
        header.write_into(&mut self.buf[..PACKET_HEADER_SIZE]);
        &self.buf[..self.used]
    }

    pub(crate) fn reset(&mut self) {
        self.used = PACKET_HEADER_SIZE;
    }

    /// Reallocate at `size`; buffered bytes are kept when they fit.
    pub(crate) fn resize(&mut self, size: usize) -> bool {
        if self.used > size {
            return false;
        }
        let mut buf = vec![0; size];
        buf[..self.used].copy_from_slice(&self.buf[..self.used]);
        self.buf = buf;
        true
    }
}

/// Scratch space for a header split across network reads.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PartialHeader {
    pub(crate) bytes: [u8; PACKET_HEADER_SIZE],
    pub(crate) len: usize,
}

impl PartialHeader {
    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.len == PACKET_HEADER_SIZE
    }

    /// Copy up to the missing byte count from `src`; returns bytes taken.
    pub(crate) fn fill(&mut self, src: &[u8]) -> usize {
        let n = (PACKET_HEADER_SIZE - self.len).min(src.len());
        self.bytes[self.len..self.len + n].copy_from_slice(&src[..n]);
        self.len += n;
        n
    }

    pub(crate) fn take(&mut self) -> Result<PacketHeader, ProtocolError> {
        self.len = 0;
        PacketHeader::from_array(&self.bytes)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_in_buffer_resize_keeps_unread() {
        let mut input = InBuffer::new(16);
        input.load(&[1, 2, 3, 4, 5, 6]);
        input.packet = 6;
        input.advance_body(4);

        input.resize(8);
        assert_eq!(input.capacity(), 8);
        assert_eq!(input.unread(), &[5, 6]);
        assert_eq!(input.bytes_used(), 0);
    }

    #[test]
    fn test_in_buffer_resize_smaller_than_leftover() {
        let mut input = InBuffer::new(16);
        input.load(&[9; 12]);
        input.resize(4);
        assert_eq!(input.capacity(), 12);
        assert_eq!(input.available(), 12);
    }

    #[test]
    fn test_out_buffer_put_and_reset() {
        let mut out = OutBuffer::new(12);
        assert!(out.is_empty());
        assert_eq!(out.put(&[1, 2, 3, 4, 5, 6]), 4);
        assert_eq!(out.bytes_used(), 12);
        out.reset();
        assert!(out.is_empty());
    }

    #[test]
    fn test_out_buffer_resize_refuses_truncation() {
        let mut out = OutBuffer::new(16);
        out.put(&[0; 8]);
        assert!(!out.resize(12));
        assert!(out.resize(32));
        assert_eq!(out.capacity(), 32);
        assert_eq!(out.bytes_used(), 16);
    }

    #[test]
    fn test_partial_header_fill() {
        let raw = [0x04, 0x01, 0x00, 0x10, 0x00, 0x35, 0x01, 0x00];
        let mut partial = PartialHeader::default();
        assert_eq!(partial.fill(&raw[..3]), 3);
        assert!(!partial.is_complete());
        assert_eq!(partial.fill(&raw[3..]), 5);
        assert!(partial.is_complete());

        let header = partial.take().unwrap();
        assert!(partial.is_empty());
        assert_eq!(header.length, 16);
        assert_eq!(header.spid, 0x35);
    }
}
