//! State shared between a session and its cancel handles.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;
use tds_protocol::packet::attention_packet;
use tokio::io::{AsyncWriteExt, WriteHalf};

use crate::error::SessionError;
use crate::state::SessionId;
use crate::stream::BoxStream;

/// Where the current request stands on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum WritePhase {
    /// Nothing sent for the current operation.
    #[default]
    Idle,
    /// Some packets of the request went out; the last one has not.
    Writing,
    /// The request is complete; the response is outstanding.
    AwaitingResponse,
}

#[derive(Debug, Default)]
pub(crate) struct CancelState {
    pub(crate) cancelled: bool,
    pub(crate) phase: WritePhase,
    pub(crate) attention_sent: bool,
}

/// Network traffic counters.
#[derive(Debug, Default)]
pub struct IoCounters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    network_reads: AtomicU64,
}

/// Point-in-time copy of [`IoCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoSnapshot {
    /// Bytes written, headers included.
    pub bytes_sent: u64,
    /// Bytes received, headers included.
    pub bytes_received: u64,
    /// Packets written.
    pub packets_sent: u64,
    /// Completed network reads.
    pub network_reads: u64,
}

impl IoCounters {
    pub(crate) fn record_send(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_read(&self, bytes: usize) {
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
        self.network_reads.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot.
    #[must_use]
    pub fn snapshot(&self) -> IoSnapshot {
        IoSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            network_reads: self.network_reads.load(Ordering::Relaxed),
        }
    }
}

pub(crate) struct SessionShared {
    pub(crate) id: SessionId,
    writer: tokio::sync::Mutex<WriteHalf<BoxStream>>,
    pub(crate) cancel: Mutex<CancelState>,
    pub(crate) activation: AtomicU32,
    pub(crate) owner: AtomicU64,
    pub(crate) reading: AtomicU32,
    pub(crate) pending_callbacks: AtomicU32,
    broken: AtomicBool,
    pub(crate) counters: IoCounters,
}

impl SessionShared {
    pub(crate) fn new(id: SessionId, writer: WriteHalf<BoxStream>) -> Self {
        Self {
            id,
            writer: tokio::sync::Mutex::new(writer),
            cancel: Mutex::new(CancelState::default()),
            activation: AtomicU32::new(0),
            owner: AtomicU64::new(0),
            reading: AtomicU32::new(0),
            pending_callbacks: AtomicU32::new(0),
            broken: AtomicBool::new(false),
            counters: IoCounters::default(),
        }
    }

    pub(crate) fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    pub(crate) fn mark_broken(&self) {
        if !self.broken.swap(true, Ordering::AcqRel) {
            tracing::debug!(session_id = self.id.0, "session marked broken");
        }
    }

    /// Write one packet of the current request.
    pub(crate) async fn send(&self, packet: &[u8]) -> Result<(), SessionError> {
        let _io = CallbackGuard::new(self);
        self.write_raw(packet).await
    }

    /// ATTENTION may come from a cancel handle on another task, so it is not
    /// counted as a pending request callback.
    pub(crate) async fn send_attention(&self) -> Result<(), SessionError> {
        tracing::debug!(session_id = self.id.0, "sending attention");
        self.write_raw(&attention_packet()).await
    }

    async fn write_raw(&self, packet: &[u8]) -> Result<(), SessionError> {
        let result = {
            let mut writer = self.writer.lock().await;
            match writer.write_all(packet).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = result {
            self.mark_broken();
            return Err(SessionError::Io(e));
        }
        self.counters.record_send(packet.len());
        tracing::trace!(session_id = self.id.0, length = packet.len(), "packet sent");
        Ok(())
    }

    /// Record a cancel request; returns whether the caller must send
    /// ATTENTION now.
    ///
    /// While a request is partly written the writer terminates it and sends
    /// ATTENTION itself; before anything is sent no ATTENTION is needed.
    pub(crate) fn request_cancel(&self) -> bool {
        let mut state = self.cancel.lock();
        state.cancelled = true;
        if state.phase == WritePhase::AwaitingResponse && !state.attention_sent {
            state.attention_sent = true;
            return true;
        }
        false
    }

    /// Claim the right to send ATTENTION for the outstanding request.
    pub(crate) fn claim_attention(&self) -> bool {
        let mut state = self.cancel.lock();
        if state.phase == WritePhase::Idle || state.attention_sent {
            return false;
        }
        state.attention_sent = true;
        true
    }

    pub(crate) fn attention_pending(&self) -> bool {
        self.cancel.lock().attention_sent
    }

    pub(crate) async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::trace!(session_id = self.id.0, error = %e, "transport shutdown failed");
        }
    }
}

/// Counts an outstanding I/O call for the lifetime of the guard.
pub(crate) struct CallbackGuard<'a>(&'a AtomicU32);

impl<'a> CallbackGuard<'a> {
    pub(crate) fn new(shared: &'a SessionShared) -> Self {
        shared.pending_callbacks.fetch_add(1, Ordering::AcqRel);
        Self(&shared.pending_callbacks)
    }
}

impl Drop for CallbackGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}
