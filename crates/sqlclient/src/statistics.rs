//! Per-connection execution statistics.
//!
//! Collection is opt-in. Counters are atomics so the pipeline can record
//! from whichever task completes an execution.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tds_session::IoSnapshot;

/// Counters kept for one connection.
#[derive(Debug, Default)]
pub struct Statistics {
    enabled: AtomicBool,
    executions: AtomicU64,
    server_roundtrips: AtomicU64,
    buffers_sent: AtomicU64,
    buffers_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    select_count: AtomicU64,
    select_rows: AtomicU64,
    idu_count: AtomicU64,
    idu_rows: AtomicU64,
    result_sets: AtomicU64,
    execution_time_us: AtomicU64,
    connection_resets: AtomicU64,
}

/// Point-in-time copy of [`Statistics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatisticsSnapshot {
    /// Commands executed.
    pub executions: u64,
    /// Request/response exchanges with the server.
    pub server_roundtrips: u64,
    /// Packets sent.
    pub buffers_sent: u64,
    /// Network reads completed.
    pub buffers_received: u64,
    /// Bytes sent, headers included.
    pub bytes_sent: u64,
    /// Bytes received, headers included.
    pub bytes_received: u64,
    /// Result sets returned.
    pub select_count: u64,
    /// Rows read from result sets.
    pub select_rows: u64,
    /// Statements that reported affected rows.
    pub idu_count: u64,
    /// Rows affected by those statements.
    pub idu_rows: u64,
    /// Result sets seen, including empty ones.
    pub result_sets: u64,
    /// Cumulative execution time.
    pub execution_time: Duration,
    /// Connection resets acknowledged by the server.
    pub connection_resets: u64,
}

impl StatisticsSnapshot {
    /// Counters keyed by their conventional names.
    #[must_use]
    pub fn to_map(&self) -> HashMap<&'static str, u64> {
        HashMap::from([
            ("Executions", self.executions),
            ("ServerRoundtrips", self.server_roundtrips),
            ("BuffersSent", self.buffers_sent),
            ("BuffersReceived", self.buffers_received),
            ("BytesSent", self.bytes_sent),
            ("BytesReceived", self.bytes_received),
            ("SelectCount", self.select_count),
            ("SelectRows", self.select_rows),
            ("IduCount", self.idu_count),
            ("IduRows", self.idu_rows),
            ("SumResultSets", self.result_sets),
            ("ExecutionTime", self.execution_time.as_millis() as u64),
            ("ConnectionResets", self.connection_resets),
        ])
    }
}

impl Statistics {
    /// Create counters, collecting when `enabled`.
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        let stats = Self::default();
        stats.enabled.store(enabled, Ordering::Relaxed);
        stats
    }

    /// Whether counters are being collected.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Turn collection on or off; counts are kept.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Zero every counter.
    pub fn reset(&self) {
        for counter in self.counters() {
            counter.store(0, Ordering::Relaxed);
        }
    }

    fn counters(&self) -> [&AtomicU64; 13] {
        [
            &self.executions,
            &self.server_roundtrips,
            &self.buffers_sent,
            &self.buffers_received,
            &self.bytes_sent,
            &self.bytes_received,
            &self.select_count,
            &self.select_rows,
            &self.idu_count,
            &self.idu_rows,
            &self.result_sets,
            &self.execution_time_us,
            &self.connection_resets,
        ]
    }

    fn add(&self, counter: &AtomicU64, value: u64) {
        if self.is_enabled() {
            counter.fetch_add(value, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_execution(&self, elapsed: Duration) {
        self.add(&self.executions, 1);
        self.add(&self.execution_time_us, elapsed.as_micros() as u64);
    }

    pub(crate) fn record_roundtrip(&self) {
        self.add(&self.server_roundtrips, 1);
    }

    /// Record the traffic between two counter snapshots of one session.
    pub(crate) fn record_io(&self, before: IoSnapshot, after: IoSnapshot) {
        self.add(&self.buffers_sent, after.packets_sent.saturating_sub(before.packets_sent));
        self.add(&self.buffers_received, after.network_reads.saturating_sub(before.network_reads));
        self.add(&self.bytes_sent, after.bytes_sent.saturating_sub(before.bytes_sent));
        self.add(&self.bytes_received, after.bytes_received.saturating_sub(before.bytes_received));
    }

    pub(crate) fn record_result_set(&self, rows: u64) {
        self.add(&self.result_sets, 1);
        if rows > 0 {
            self.add(&self.select_count, 1);
            self.add(&self.select_rows, rows);
        }
    }

    pub(crate) fn record_rows_affected(&self, rows: u64) {
        self.add(&self.idu_count, 1);
        self.add(&self.idu_rows, rows);
    }

    pub(crate) fn record_connection_reset(&self) {
        self.add(&self.connection_resets, 1);
    }

    /// Take a snapshot.
    #[must_use]
    pub fn snapshot(&self) -> StatisticsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatisticsSnapshot {
            executions: load(&self.executions),
            server_roundtrips: load(&self.server_roundtrips),
            buffers_sent: load(&self.buffers_sent),
            buffers_received: load(&self.buffers_received),
            bytes_sent: load(&self.bytes_sent),
            bytes_received: load(&self.bytes_received),
            select_count: load(&self.select_count),
            select_rows: load(&self.select_rows),
            idu_count: load(&self.idu_count),
            idu_rows: load(&self.idu_rows),
            result_sets: load(&self.result_sets),
            execution_time: Duration::from_micros(load(&self.execution_time_us)),
            connection_resets: load(&self.connection_resets),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_statistics_do_not_count() {
        let stats = Statistics::new(false);
        stats.record_execution(Duration::from_millis(5));
        stats.record_roundtrip();

        assert_eq!(stats.snapshot(), StatisticsSnapshot::default());
    }

    #[test]
    fn test_io_deltas() {
        let stats = Statistics::new(true);
        let before = IoSnapshot {
            bytes_sent: 100,
            bytes_received: 50,
            packets_sent: 1,
            network_reads: 1,
        };
        let after = IoSnapshot {
            bytes_sent: 4196,
            bytes_received: 8242,
            packets_sent: 3,
            network_reads: 4,
        };
        stats.record_io(before, after);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.bytes_sent, 4096);
        assert_eq!(snapshot.bytes_received, 8192);
        assert_eq!(snapshot.buffers_sent, 2);
        assert_eq!(snapshot.buffers_received, 3);
    }

    #[test]
    fn test_result_sets_and_affected_rows() {
        let stats = Statistics::new(true);
        stats.record_result_set(10);
        stats.record_result_set(0);
        stats.record_rows_affected(4);

        let map = stats.snapshot().to_map();
        assert_eq!(map["SumResultSets"], 2);
        assert_eq!(map["SelectCount"], 1);
        assert_eq!(map["SelectRows"], 10);
        assert_eq!(map["IduRows"], 4);
    }

    #[test]
    fn test_reset_zeroes_counters() {
        let stats = Statistics::new(true);
        stats.record_execution(Duration::from_millis(7));
        stats.record_connection_reset();
        stats.reset();

        assert_eq!(stats.snapshot(), StatisticsSnapshot::default());
        assert!(stats.is_enabled());
    }
}
