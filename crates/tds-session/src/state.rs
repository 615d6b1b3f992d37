//! Per-session TDS state.
//!
//! A [`SessionState`] owns one inbound and one outbound packet buffer over a
//! transport, plus the bookkeeping that decides whether the session can be
//! handed to the next caller: pending-data flags, the activation counter,
//! the timeout timer and the cancel/ATTENTION state.
//!
//! Reads are resumable. Every `try_*` method returns `Ok(None)` (or
//! `Ok(false)`) when the buffered data runs out, and never blocks. Callers
//! drive the network through [`SessionState::run_resumable`], which replays
//! a step from its starting position once more bytes arrive.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use bitflags::bitflags;
use bytes::Bytes;
use tds_protocol::codec::decode_utf16_le;
use tds_protocol::packet::{
    DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader, PacketStatus,
    PacketType, validate_packet_size,
};
use tds_protocol::token::TokenType;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf, ReadHalf};

use crate::buffer::{InBuffer, OutBuffer, PartialHeader};
use crate::cancel::CancelHandle;
use crate::error::SessionError;
use crate::null_bitmap::NullBitmap;
use crate::shared::{CallbackGuard, CancelState, IoSnapshot, SessionShared, WritePhase};
use crate::snapshot::{Cursor, Snapshot};
use crate::stream::{BoxStream, TdsStream};
use crate::timeout::{ExecutionMode, TimeoutState, TimeoutTimer};

/// Default time allowed for the server to acknowledge an ATTENTION.
pub const DEFAULT_ATTENTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Length of a DONE token including its type byte.
const DONE_TOKEN_LEN: usize = 13;

const DONE_ATTN: u16 = 0x0020;

static NEXT_SESSION_ID: AtomicU32 = AtomicU32::new(1);
static NEXT_OWNER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub(crate) u32);

impl SessionId {
    /// Allocate a fresh identifier.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

/// Identifies the logical owner of an active session (a command or reader).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(u64);

impl OwnerId {
    /// Allocate a fresh, non-zero owner identifier.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Who holds a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Idle in its pool.
    Pooled,
    /// Lent to an owner.
    Active(OwnerId),
}

/// Which side of the physical connection a session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// The session created with the physical connection.
    Primary,
    /// An additional multiplexed session.
    Multiplexed,
}

/// How far to push buffered output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Send a full buffer as a non-final packet.
    Soft,
    /// Send the final packet of the message.
    Hard,
}

bitflags! {
    /// Session status flags.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct SessionFlags: u8 {
        /// A request was sent and its response is not fully consumed.
        const PENDING_DATA = 0x01;
        /// A result set is open on this session.
        const OPEN_RESULT = 0x02;
        /// An ERROR token arrived during the current operation.
        const ERROR_TOKEN_RECEIVED = 0x04;
        /// COLMETADATA arrived for the current result.
        const COL_METADATA_RECEIVED = 0x08;
        /// The server acknowledged an ATTENTION.
        const ATTENTION_RECEIVED = 0x10;
    }
}

/// Propagate "need more data" from a `try_*` call.
///
/// `try_ready!(expr)` evaluates a `Result<Option<T>, E>`; `Ok(None)` returns
/// `Ok(None)` from the enclosing function.
#[macro_export]
macro_rules! try_ready {
    ($e:expr) => {
        match $e? {
            Some(value) => value,
            None => return Ok(None),
        }
    };
}

/// How a cancelled write is wound up.
enum Abort {
    /// Nothing of the message was sent.
    Unsent,
    /// Part of the message is on the wire.
    Terminate { attention: bool },
}

/// Packet buffers and bookkeeping for one TDS session.
pub struct SessionState {
    shared: Arc<SessionShared>,
    reader: ReadHalf<BoxStream>,
    role: SessionRole,
    input: InBuffer,
    output: OutBuffer,
    partial: PartialHeader,
    last_eom: bool,
    spid: u16,
    packet_size: usize,
    max_inbound_packet: usize,
    message_type: PacketType,
    reset_connection: bool,
    packet_number: u8,
    flags: SessionFlags,
    null_bitmap: NullBitmap,
    timer: TimeoutTimer,
    attention_timeout: Duration,
    snapshot: Option<Snapshot>,
    replay: VecDeque<Vec<u8>>,
}

impl SessionState {
    /// Create a session over `stream` with the given packet size.
    pub fn new(
        id: SessionId,
        stream: BoxStream,
        packet_size: usize,
        role: SessionRole,
    ) -> Result<Self, SessionError> {
        let packet_size = validate_packet_size(packet_size)?;
        Ok(Self::build(id, stream, packet_size, role))
    }

    /// Create the primary session of a new physical connection at the
    /// login packet size.
    pub fn primary(stream: impl TdsStream) -> Self {
        Self::build(
            SessionId::next(),
            Box::new(stream),
            DEFAULT_PACKET_SIZE,
            SessionRole::Primary,
        )
    }

    fn build(id: SessionId, stream: BoxStream, packet_size: usize, role: SessionRole) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        tracing::debug!(session_id = id.0, packet_size, ?role, "session created");

        Self {
            shared: Arc::new(SessionShared::new(id, writer)),
            reader,
            role,
            input: InBuffer::new(packet_size),
            output: OutBuffer::new(packet_size),
            partial: PartialHeader::default(),
            last_eom: false,
            spid: 0,
            packet_size,
            max_inbound_packet: packet_size,
            message_type: PacketType::SqlBatch,
            reset_connection: false,
            packet_number: 1,
            flags: SessionFlags::empty(),
            null_bitmap: NullBitmap::default(),
            timer: TimeoutTimer::default(),
            attention_timeout: DEFAULT_ATTENTION_TIMEOUT,
            snapshot: None,
            replay: VecDeque::new(),
        }
    }

    /// Set how long a drain waits for an ATTENTION acknowledgment.
    #[must_use]
    pub fn with_attention_timeout(mut self, timeout: Duration) -> Self {
        self.attention_timeout = timeout;
        self
    }

    /// Session identifier.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    /// Primary or multiplexed.
    #[must_use]
    pub fn role(&self) -> SessionRole {
        self.role
    }

    /// Server process id from the most recent packet header.
    #[must_use]
    pub fn spid(&self) -> u16 {
        self.spid
    }

    /// Negotiated packet size.
    #[must_use]
    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Current flags.
    #[must_use]
    pub fn flags(&self) -> SessionFlags {
        self.flags
    }

    /// Set `flags`.
    pub fn set_flags(&mut self, flags: SessionFlags) {
        self.flags.insert(flags);
    }

    /// Clear `flags`.
    pub fn clear_flags(&mut self, flags: SessionFlags) {
        self.flags.remove(flags);
    }

    /// Whether response data is still outstanding.
    #[must_use]
    pub fn has_pending_data(&self) -> bool {
        self.flags.contains(SessionFlags::PENDING_DATA)
    }

    /// Whether a result set is open.
    #[must_use]
    pub fn has_open_result(&self) -> bool {
        self.flags.contains(SessionFlags::OPEN_RESULT)
    }

    /// Inbound buffer cursors.
    #[must_use]
    pub fn in_buffer(&self) -> &InBuffer {
        &self.input
    }

    /// Outbound buffer.
    #[must_use]
    pub fn out_buffer(&self) -> &OutBuffer {
        &self.output
    }

    /// Handle that can cancel the current operation from another task.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Whether an earlier failure left the session unusable.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.shared.is_broken()
    }

    /// Mark the session unusable.
    pub fn mark_broken(&self) {
        self.shared.mark_broken();
    }

    /// Traffic counters.
    #[must_use]
    pub fn io_counters(&self) -> IoSnapshot {
        self.shared.counters.snapshot()
    }

    /// Outstanding reads and writes of the current request. ATTENTION sends
    /// are not included.
    #[must_use]
    pub fn pending_callbacks(&self) -> u32 {
        self.shared.pending_callbacks.load(Ordering::Acquire)
    }

    /// Whether an ATTENTION was sent and not yet acknowledged.
    #[must_use]
    pub fn attention_pending(&self) -> bool {
        self.shared.attention_pending()
    }

    /// Timer state.
    #[must_use]
    pub fn timeout_state(&self) -> TimeoutState {
        self.timer.state()
    }

    /// Time left on the operation deadline.
    #[must_use]
    pub fn remaining_timeout(&self) -> Option<Duration> {
        self.timer.remaining()
    }

    // ----- activation -----

    /// Current ownership.
    #[must_use]
    pub fn ownership(&self) -> Ownership {
        match self.shared.activation.load(Ordering::Acquire) {
            0 => Ownership::Pooled,
            _ => Ownership::Active(OwnerId(self.shared.owner.load(Ordering::Acquire))),
        }
    }

    /// Lend the session to `owner`; the counter must go from 0 to 1.
    pub fn activate(&self, owner: OwnerId) -> Result<(), SessionError> {
        match self
            .shared
            .activation
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                self.shared.owner.store(owner.0, Ordering::Release);
                tracing::debug!(session_id = self.shared.id.0, owner = owner.0, "session activated");
                Ok(())
            }
            Err(found) => Err(SessionError::InvalidActivation { found }),
        }
    }

    /// Take the session back from its owner; the counter must go from 1 to 0.
    pub fn remove_owner(&self) -> Result<(), SessionError> {
        match self
            .shared
            .activation
            .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                self.shared.owner.store(0, Ordering::Release);
                tracing::debug!(session_id = self.shared.id.0, "session owner removed");
                Ok(())
            }
            Err(found) => Err(SessionError::InvalidActivation { found }),
        }
    }

    // ----- operation lifecycle -----

    /// Claim the session for one operation and arm its timeout.
    pub fn begin_operation(
        &mut self,
        timeout: Option<Duration>,
        mode: ExecutionMode,
    ) -> Result<(), SessionError> {
        if self.shared.is_broken() {
            return Err(SessionError::Broken);
        }
        if self
            .shared
            .reading
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SessionError::SessionBusy);
        }
        if self.has_pending_data() || self.shared.attention_pending() {
            self.shared.reading.store(0, Ordering::Release);
            return Err(SessionError::SessionBusy);
        }

        *self.shared.cancel.lock() = CancelState::default();
        self.flags
            .remove(SessionFlags::ERROR_TOKEN_RECEIVED | SessionFlags::ATTENTION_RECEIVED);
        self.timer.start(timeout, mode);
        Ok(())
    }

    /// Release the operation claim taken by [`begin_operation`](Self::begin_operation).
    pub fn end_operation(&mut self) {
        self.shared.reading.store(0, Ordering::Release);
        if self.timer.state() == TimeoutState::Running {
            self.timer.stop();
        }
    }

    /// Whether an operation currently holds the session.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.shared.reading.load(Ordering::Acquire) != 0
    }

    /// The response to the current request has been fully consumed.
    pub fn complete_response(&mut self) {
        self.flags.remove(SessionFlags::PENDING_DATA);
        let mut state = self.shared.cancel.lock();
        if !state.attention_sent {
            state.phase = WritePhase::Idle;
        }
    }

    /// The server acknowledged the outstanding ATTENTION.
    pub fn attention_acknowledged(&mut self) {
        self.flags.insert(SessionFlags::ATTENTION_RECEIVED);
        let mut state = self.shared.cancel.lock();
        state.attention_sent = false;
        state.phase = WritePhase::Idle;
        tracing::debug!(session_id = self.shared.id.0, "attention acknowledged");
    }

    // ----- output -----

    /// Begin a new outgoing message.
    pub fn start_message(&mut self, packet_type: PacketType, reset_connection: bool) {
        self.output.reset();
        self.message_type = packet_type;
        self.reset_connection = reset_connection;
        self.packet_number = 1;
    }

    /// Append message bytes, sending full packets as the buffer fills.
    pub async fn write_bytes(&mut self, mut data: &[u8]) -> Result<(), SessionError> {
        while !data.is_empty() {
            if self.output.remaining() == 0 {
                self.write_packet(FlushMode::Soft).await?;
            }
            let n = self.output.put(data);
            data = &data[n..];
        }
        Ok(())
    }

    /// Send a whole message.
    pub async fn send_message(
        &mut self,
        packet_type: PacketType,
        payload: &[u8],
        reset_connection: bool,
    ) -> Result<(), SessionError> {
        self.start_message(packet_type, reset_connection);
        self.write_bytes(payload).await?;
        self.write_packet(FlushMode::Hard).await
    }

    /// Send the buffered bytes as one packet.
    ///
    /// A cancel observed before any packet of the message went out drops the
    /// buffer and fails with [`SessionError::OperationCancelled`]. Once part
    /// of the message is on the wire, the message is closed with an IGNORE
    /// packet and an ATTENTION follows.
    pub async fn write_packet(&mut self, mode: FlushMode) -> Result<(), SessionError> {
        if self.shared.is_broken() {
            return Err(SessionError::Broken);
        }

        let abort = {
            let mut state = self.shared.cancel.lock();
            if state.cancelled {
                Some(match state.phase {
                    WritePhase::Idle => Abort::Unsent,
                    WritePhase::Writing | WritePhase::AwaitingResponse => {
                        let attention = !state.attention_sent;
                        state.attention_sent = true;
                        state.phase = WritePhase::AwaitingResponse;
                        Abort::Terminate { attention }
                    }
                })
            } else {
                if state.phase == WritePhase::Idle {
                    state.phase = WritePhase::Writing;
                }
                None
            }
        };
        if let Some(abort) = abort {
            return self.abort_message(abort).await;
        }

        let mut status = match mode {
            FlushMode::Soft => PacketStatus::NORMAL,
            FlushMode::Hard => PacketStatus::END_OF_MESSAGE,
        };
        if self.packet_number == 1 && self.reset_connection {
            status |= PacketStatus::RESET_CONNECTION;
        }
        let header = PacketHeader::new(self.message_type, status, self.output.bytes_used() as u16)
            .with_packet_id(self.packet_number);
        self.packet_number = self.packet_number.wrapping_add(1);

        let deadline = self.timer.deadline();
        let packet = self.output.seal(&header);
        let sent = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, self.shared.send(packet))
                .await
                .ok(),
            None => Some(self.shared.send(packet).await),
        };
        match sent {
            None => {
                self.timer.expire();
                self.shared.mark_broken();
                tracing::debug!(session_id = self.shared.id.0, "write timed out");
                return Err(SessionError::Timeout);
            }
            Some(result) => result?,
        }
        self.output.reset();

        if mode == FlushMode::Hard {
            self.flags.insert(SessionFlags::PENDING_DATA);
            self.last_eom = false;
            let attention = {
                let mut state = self.shared.cancel.lock();
                state.phase = WritePhase::AwaitingResponse;
                if state.cancelled && !state.attention_sent {
                    state.attention_sent = true;
                    true
                } else {
                    false
                }
            };
            if attention {
                self.shared.send_attention().await?;
            }
        }
        Ok(())
    }

    async fn abort_message(&mut self, abort: Abort) -> Result<(), SessionError> {
        self.output.reset();
        let Abort::Terminate { attention } = abort else {
            self.packet_number = 1;
            tracing::debug!(
                session_id = self.shared.id.0,
                "request cancelled before any bytes were sent"
            );
            return Err(SessionError::OperationCancelled);
        };

        let mut ignore = [0u8; PACKET_HEADER_SIZE];
        PacketHeader::new(
            self.message_type,
            PacketStatus::END_OF_MESSAGE | PacketStatus::IGNORE_EVENT,
            PACKET_HEADER_SIZE as u16,
        )
        .with_packet_id(self.packet_number)
        .write_into(&mut ignore);
        self.packet_number = 1;

        self.shared.send(&ignore).await?;
        self.flags.insert(SessionFlags::PENDING_DATA);
        self.last_eom = false;
        if attention {
            self.shared.send_attention().await?;
        }
        tracing::debug!(session_id = self.shared.id.0, "partially sent request cancelled");
        Err(SessionError::OperationCancelled)
    }

    // ----- input -----

    /// Accept inbound packets up to `size` before the packet size is
    /// renegotiated (the login response may use the requested size).
    pub fn allow_inbound_packet_size(&mut self, size: usize) {
        self.max_inbound_packet = self.max_inbound_packet.max(size.min(MAX_PACKET_SIZE));
    }

    /// Wait for the next chunk of data from the transport.
    ///
    /// Returns immediately if unread or replay data is still buffered. On
    /// deadline expiry the timer records the expiry, an ATTENTION is sent if
    /// the request is on the wire, and [`SessionError::Timeout`] is returned.
    pub async fn read_network_packet(&mut self) -> Result<(), SessionError> {
        if self.shared.is_broken() {
            return Err(SessionError::Broken);
        }
        if !self.input.is_exhausted() || !self.replay.is_empty() {
            return Ok(());
        }
        if let Some(snapshot) = &mut self.snapshot {
            snapshot.prepare_fill(&self.input);
        }

        let deadline = self.timer.deadline();
        let outcome = {
            let _io = CallbackGuard::new(&self.shared);
            let read = self.reader.read(self.input.spare_mut());
            match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, read).await.ok(),
                None => Some(read.await),
            }
        };

        let n = match outcome {
            None => return Err(self.on_read_timeout().await),
            Some(Ok(0)) => {
                self.shared.mark_broken();
                return Err(SessionError::ConnectionClosed);
            }
            Some(Ok(n)) => n,
            Some(Err(e)) => {
                self.shared.mark_broken();
                return Err(SessionError::Io(e));
            }
        };

        self.input.set_filled(n);
        if let Some(snapshot) = &mut self.snapshot {
            snapshot.push_fill(self.input.filled());
        }
        self.shared.counters.record_read(n);
        tracing::trace!(session_id = self.shared.id.0, bytes = n, "network read");
        Ok(())
    }

    async fn on_read_timeout(&mut self) -> SessionError {
        self.timer.expire();
        tracing::debug!(
            session_id = self.shared.id.0,
            state = ?self.timer.state(),
            "network read timed out"
        );
        if self.shared.claim_attention() {
            if let Err(e) = self.shared.send_attention().await {
                return e;
            }
        }
        SessionError::Timeout
    }

    fn corrupted(&self, reason: String) -> SessionError {
        tracing::error!(session_id = self.shared.id.0, reason = %reason, "corrupted TDS stream");
        self.shared.mark_broken();
        SessionError::CorruptedStream(reason)
    }

    fn try_refill(&mut self) -> bool {
        match self.replay.pop_front() {
            Some(chunk) => {
                self.input.load(&chunk);
                true
            }
            None => false,
        }
    }

    /// Consume the next packet header, which may straddle network reads.
    pub fn try_process_header(&mut self) -> Result<bool, SessionError> {
        while !self.partial.is_complete() {
            if self.input.is_exhausted() && !self.try_refill() {
                return Ok(false);
            }
            let taken = self.partial.fill(self.input.unread());
            self.input.advance_header(taken);
        }

        let header = match self.partial.take() {
            Ok(header) => header,
            Err(e) => return Err(self.corrupted(e.to_string())),
        };
        let body = match header.body_length() {
            Ok(body) => body,
            Err(e) => return Err(self.corrupted(e.to_string())),
        };
        if header.length as usize > self.max_inbound_packet {
            return Err(self.corrupted(format!(
                "packet length {} exceeds negotiated size {}",
                header.length, self.max_inbound_packet
            )));
        }

        self.input.packet = body;
        self.last_eom = header.is_end_of_message();
        self.spid = header.spid;
        tracing::trace!(
            session_id = self.shared.id.0,
            length = header.length,
            eom = self.last_eom,
            "packet header"
        );
        Ok(true)
    }

    /// Make at least one body byte available without blocking.
    ///
    /// Skips over packets with empty bodies.
    pub fn try_prepare_buffer(&mut self) -> Result<bool, SessionError> {
        loop {
            if self.input.packet > 0 {
                if !self.input.is_exhausted() {
                    return Ok(true);
                }
                if !self.try_refill() {
                    return Ok(false);
                }
                continue;
            }
            if !self.try_process_header()? {
                return Ok(false);
            }
        }
    }

    /// Whether the last packet of the current message has been consumed.
    #[must_use]
    pub fn is_message_complete(&self) -> bool {
        self.last_eom && self.input.packet == 0 && self.partial.is_empty()
    }

    /// Read one byte.
    pub fn try_read_byte(&mut self) -> Result<Option<u8>, SessionError> {
        if !self.try_prepare_buffer()? {
            return Ok(None);
        }
        let byte = self.input.unread()[0];
        self.input.advance_body(1);
        Ok(Some(byte))
    }

    /// Look at the next byte without consuming it.
    pub fn try_peek_byte(&mut self) -> Result<Option<u8>, SessionError> {
        if !self.try_prepare_buffer()? {
            return Ok(None);
        }
        Ok(Some(self.input.unread()[0]))
    }

    /// Fill `dst` completely, crossing packet boundaries as needed.
    pub fn try_read_into(&mut self, dst: &mut [u8]) -> Result<bool, SessionError> {
        let mut filled = 0;
        while filled < dst.len() {
            if !self.try_prepare_buffer()? {
                return Ok(false);
            }
            let n = self.input.body_available().min(dst.len() - filled);
            dst[filled..filled + n].copy_from_slice(&self.input.unread()[..n]);
            self.input.advance_body(n);
            filled += n;
        }
        Ok(true)
    }

    fn try_read_array<const N: usize>(&mut self) -> Result<Option<[u8; N]>, SessionError> {
        let mut raw = [0u8; N];
        Ok(self.try_read_into(&mut raw)?.then_some(raw))
    }

    /// Read `len` bytes.
    ///
    /// The buffer grows with the data actually received, so a length taken
    /// from the wire allocates at most one input buffer ahead of it.
    pub fn try_read_bytes(&mut self, len: usize) -> Result<Option<Bytes>, SessionError> {
        let mut raw = Vec::with_capacity(len.min(self.input.capacity()));
        while raw.len() < len {
            if !self.try_prepare_buffer()? {
                return Ok(None);
            }
            let n = self.input.body_available().min(len - raw.len());
            raw.extend_from_slice(&self.input.unread()[..n]);
            self.input.advance_body(n);
        }
        Ok(Some(Bytes::from(raw)))
    }

    /// Skip `len` bytes.
    pub fn try_skip_bytes(&mut self, mut len: usize) -> Result<bool, SessionError> {
        while len > 0 {
            if !self.try_prepare_buffer()? {
                return Ok(false);
            }
            let n = self.input.body_available().min(len);
            self.input.advance_body(n);
            len -= n;
        }
        Ok(true)
    }

    /// Read a little-endian `u16`.
    pub fn try_read_u16_le(&mut self) -> Result<Option<u16>, SessionError> {
        Ok(self.try_read_array()?.map(u16::from_le_bytes))
    }

    /// Read a little-endian `u32`.
    pub fn try_read_u32_le(&mut self) -> Result<Option<u32>, SessionError> {
        Ok(self.try_read_array()?.map(u32::from_le_bytes))
    }

    /// Read a little-endian `i32`.
    pub fn try_read_i32_le(&mut self) -> Result<Option<i32>, SessionError> {
        Ok(self.try_read_array()?.map(i32::from_le_bytes))
    }

    /// Read a little-endian `u64`.
    pub fn try_read_u64_le(&mut self) -> Result<Option<u64>, SessionError> {
        Ok(self.try_read_array()?.map(u64::from_le_bytes))
    }

    /// Read `count` UTF-16 code units as a string.
    pub fn try_read_chars(&mut self, count: usize) -> Result<Option<String>, SessionError> {
        let raw = try_ready!(self.try_read_bytes(count * 2));
        Ok(Some(decode_utf16_le(&raw)?))
    }

    /// Read a string with a one-byte character count.
    pub fn try_read_b_varchar(&mut self) -> Result<Option<String>, SessionError> {
        let count = try_ready!(self.try_read_byte());
        self.try_read_chars(count as usize)
    }

    /// Read a string with a two-byte character count.
    pub fn try_read_us_varchar(&mut self) -> Result<Option<String>, SessionError> {
        let count = try_ready!(self.try_read_u16_le());
        self.try_read_chars(count as usize)
    }

    // ----- rows -----

    /// Prepare for the next row: load the null bitmap of an NBC row of
    /// `column_count` columns, or clear it for a plain row.
    pub fn try_start_new_row(
        &mut self,
        is_nbc_row: bool,
        column_count: usize,
    ) -> Result<bool, SessionError> {
        if !is_nbc_row || column_count == 0 {
            self.null_bitmap.clean();
            return Ok(true);
        }
        let bits = match self.try_read_bytes(NullBitmap::byte_len(column_count))? {
            Some(bits) => bits,
            None => return Ok(false),
        };
        self.null_bitmap.initialize(column_count, &bits);
        Ok(true)
    }

    /// True only when the current NBC row's bitmap proves `column` null.
    #[must_use]
    pub fn is_guaranteed_null(&self, column: usize) -> bool {
        self.null_bitmap.is_guaranteed_null(column)
    }

    /// Null bitmap of the current row.
    #[must_use]
    pub fn null_bitmap(&self) -> &NullBitmap {
        &self.null_bitmap
    }

    // ----- snapshot / replay -----

    fn cursor(&self) -> Cursor {
        Cursor {
            used: self.input.used,
            read: self.input.read,
            packet: self.input.packet,
            partial: self.partial,
            last_eom: self.last_eom,
        }
    }

    fn replay_snapshot(&mut self) {
        if let Some(snapshot) = &self.snapshot {
            let cursor = snapshot.replay(&mut self.input, &mut self.replay);
            self.partial = cursor.partial;
            self.last_eom = cursor.last_eom;
            tracing::trace!(
                session_id = self.shared.id.0,
                retained = snapshot.retained_bytes(),
                "replaying snapshot"
            );
        }
    }

    /// Run `step` until it produces a value, reading from the network and
    /// replaying `step` from its starting position whenever it reports that
    /// it ran out of data.
    ///
    /// `step` must not commit side effects before returning `Some`.
    pub async fn run_resumable<T, E, F>(&mut self, mut step: F) -> Result<T, E>
    where
        F: FnMut(&mut Self) -> Result<Option<T>, E>,
        E: From<SessionError>,
    {
        self.snapshot = Some(Snapshot::new(self.cursor(), &self.input, &self.replay));
        loop {
            match step(self) {
                Ok(Some(value)) => {
                    self.snapshot = None;
                    return Ok(value);
                }
                Ok(None) => {
                    if let Err(e) = self.read_network_packet().await {
                        self.snapshot = None;
                        return Err(e.into());
                    }
                    self.replay_snapshot();
                }
                Err(e) => {
                    self.snapshot = None;
                    return Err(e);
                }
            }
        }
    }

    /// Read the remainder of the current message into memory.
    pub async fn read_message_remainder(&mut self) -> Result<Bytes, SessionError> {
        let mut payload = Vec::new();
        loop {
            while !self.is_message_complete() && self.try_prepare_buffer()? {
                let n = self.input.body_available();
                payload.extend_from_slice(&self.input.unread()[..n]);
                self.input.advance_body(n);
            }
            if self.is_message_complete() {
                return Ok(Bytes::from(payload));
            }
            self.read_network_packet().await?;
        }
    }

    // ----- packet size -----

    /// Renegotiate the packet size; unread input is carried over.
    pub fn set_packet_size(&mut self, size: usize) -> Result<(), SessionError> {
        if self.role != SessionRole::Primary {
            return Err(SessionError::NotPrimary);
        }
        let size = validate_packet_size(size)?;
        if size == self.packet_size {
            return Ok(());
        }
        if !self.output.resize(size) {
            return Err(SessionError::PendingOutput(self.output.bytes_used()));
        }
        self.input.resize(size);
        self.packet_size = size;
        self.max_inbound_packet = size;
        tracing::debug!(session_id = self.shared.id.0, packet_size = size, "packet size changed");
        Ok(())
    }

    // ----- return to pool -----

    /// Prepare the session for its next owner.
    ///
    /// Drains any unread response and outstanding ATTENTION acknowledgment
    /// so the next request starts on a message boundary. Returns `false` if
    /// the session cannot be reused; drain failures are logged, never
    /// returned.
    pub async fn deactivate(&mut self) -> bool {
        if self.shared.is_broken() {
            return false;
        }
        self.snapshot = None;
        self.shared.reading.store(0, Ordering::Release);

        let attention = self.shared.attention_pending();
        if self.has_pending_data() || attention {
            let limit = attention.then_some(self.attention_timeout);
            self.timer.start(limit, ExecutionMode::Sync);
            if let Err(e) = self.drain().await {
                tracing::warn!(
                    session_id = self.shared.id.0,
                    error = %e,
                    "drain failed, session will not be reused"
                );
                self.shared.mark_broken();
                return false;
            }
        }

        self.reset_for_reuse();
        true
    }

    async fn drain(&mut self) -> Result<(), SessionError> {
        tracing::debug!(
            session_id = self.shared.id.0,
            attention = self.shared.attention_pending(),
            "draining session"
        );
        let mut tail: Vec<u8> = Vec::with_capacity(DONE_TOKEN_LEN);
        loop {
            while !self.is_message_complete() && self.try_prepare_buffer()? {
                let n = self.input.body_available();
                keep_tail(&mut tail, &self.input.unread()[..n]);
                self.input.advance_body(n);
            }

            if self.is_message_complete() {
                if !self.shared.attention_pending() {
                    break;
                }
                if is_attention_ack(&tail) {
                    self.attention_acknowledged();
                    break;
                }
                // The acknowledgment arrives in a later message.
                self.last_eom = false;
                tail.clear();
                continue;
            }

            self.read_network_packet().await?;
        }
        self.flags.remove(SessionFlags::PENDING_DATA);
        Ok(())
    }

    fn reset_for_reuse(&mut self) {
        self.flags = SessionFlags::empty();
        self.null_bitmap.clean();
        self.timer.stop();
        self.snapshot = None;
        self.output.reset();
        self.packet_number = 1;
        *self.shared.cancel.lock() = CancelState::default();
    }

    /// Drop buffered input, used after a transport is replaced.
    pub fn clear_input(&mut self) {
        self.input.clear();
        self.partial = PartialHeader::default();
        self.replay.clear();
        self.snapshot = None;
    }

    /// Check an idle session's transport without waiting.
    ///
    /// Returns `false`, and marks the session broken, when the peer closed
    /// the connection or sent bytes while no request was outstanding.
    pub fn probe_idle(&mut self) -> bool {
        if self.shared.is_broken() {
            return false;
        }
        if self.has_pending_data() || !self.input.is_exhausted() {
            return true;
        }
        let mut probe = [0u8; 1];
        let mut buf = ReadBuf::new(&mut probe);
        let mut cx = Context::from_waker(Waker::noop());
        match Pin::new(&mut self.reader).poll_read(&mut cx, &mut buf) {
            Poll::Pending => true,
            Poll::Ready(result) => {
                tracing::debug!(
                    session_id = self.shared.id.0,
                    eof = result.is_ok() && buf.filled().is_empty(),
                    "idle transport is no longer usable"
                );
                self.shared.mark_broken();
                false
            }
        }
    }

    /// Shut the transport down.
    pub async fn close(self) {
        tracing::debug!(session_id = self.shared.id.0, "closing session");
        self.shared.mark_broken();
        self.shared.shutdown().await;
    }

    pub(crate) fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }
}

fn keep_tail(tail: &mut Vec<u8>, data: &[u8]) {
    if data.len() >= DONE_TOKEN_LEN {
        tail.clear();
        tail.extend_from_slice(&data[data.len() - DONE_TOKEN_LEN..]);
        return;
    }
    tail.extend_from_slice(data);
    if tail.len() > DONE_TOKEN_LEN {
        let excess = tail.len() - DONE_TOKEN_LEN;
        tail.drain(..excess);
    }
}

/// A message ending in DONE with the ATTN bit acknowledges an ATTENTION.
fn is_attention_ack(tail: &[u8]) -> bool {
    tail.len() == DONE_TOKEN_LEN
        && tail[0] == TokenType::Done as u8
        && u16::from_le_bytes([tail[1], tail[2]]) & DONE_ATTN != 0
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState")
            .field("id", &self.shared.id)
            .field("role", &self.role)
            .field("packet_size", &self.packet_size)
            .field("flags", &self.flags)
            .field("timeout", &self.timer.state())
            .field("ownership", &self.ownership())
            .finish_non_exhaustive()
    }
}
