//! Execution tracing and the event sink.
//!
//! The pipeline opens a `tracing` span named [`span_names::EXECUTE`] for
//! every execution and reports begin/end events to an [`EventSink`]. A
//! failing sink never fails the execution; its error is recorded at
//! `trace` level and dropped.
//!
//! ## Span fields
//!
//! - `operation_id`: v4 UUID correlating events of one execution
//! - `db.operation`: statement kind (SELECT, INSERT, ...)
//! - `text_len`: length of the command text
//! - `mode`: sync, async or async-write

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::command::RunMode;

/// Database system identifier for SQL Server.
pub const DB_SYSTEM: &str = "mssql";

/// Span names for database operations.
pub mod span_names {
    /// Command execution.
    pub const EXECUTE: &str = "sqlclient.execute";
    /// Physical connection open.
    pub const CONNECT: &str = "sqlclient.connect";
    /// Transparent reconnection.
    pub const RECONNECT: &str = "sqlclient.reconnect";
}

/// Error type sinks report.
pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// Configuration for SQL statement sanitization.
#[derive(Debug, Clone)]
pub struct SanitizationConfig {
    /// Whether to sanitize SQL statements.
    pub enabled: bool,
    /// Maximum length of statement to record.
    pub max_length: usize,
    /// Placeholder to use for sanitized values.
    pub placeholder: String,
}

impl Default for SanitizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_length: 2048,
            placeholder: "?".to_string(),
        }
    }
}

impl SanitizationConfig {
    /// Create a configuration that doesn't sanitize statements.
    #[must_use]
    pub fn no_sanitization() -> Self {
        Self {
            enabled: false,
            max_length: usize::MAX,
            placeholder: String::new(),
        }
    }

    /// Sanitize a SQL statement according to the configuration.
    #[must_use]
    pub fn sanitize(&self, sql: &str) -> String {
        if !self.enabled {
            return truncate_string(sql, self.max_length);
        }
        let sanitized = sanitize_sql(sql, &self.placeholder);
        truncate_string(&sanitized, self.max_length)
    }
}

/// Replace string and numeric literals with a placeholder.
fn sanitize_sql(sql: &str, placeholder: &str) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            if c == '\'' {
                if chars.peek() == Some(&'\'') {
                    chars.next();
                    continue;
                }
                in_string = false;
                result.push_str(placeholder);
            }
            continue;
        }

        if c == '\'' {
            in_string = true;
            continue;
        }

        if c.is_ascii_digit() && !result.ends_with(|ch: char| ch.is_alphanumeric() || ch == '_') {
            while chars
                .peek()
                .is_some_and(|ch| ch.is_ascii_digit() || *ch == '.')
            {
                chars.next();
            }
            result.push_str(placeholder);
            continue;
        }

        result.push(c);
    }

    if in_string {
        result.push_str(placeholder);
    }
    result
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len.saturating_sub(3);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

/// Extract the operation type from a SQL statement.
#[must_use]
pub fn extract_operation(sql: &str) -> &'static str {
    let sql_upper = sql.trim_start().get(..16).unwrap_or(sql.trim_start()).to_uppercase();

    if sql_upper.starts_with("SELECT") {
        "SELECT"
    } else if sql_upper.starts_with("INSERT") {
        "INSERT"
    } else if sql_upper.starts_with("UPDATE") {
        "UPDATE"
    } else if sql_upper.starts_with("DELETE") {
        "DELETE"
    } else if sql_upper.starts_with("EXEC") {
        "EXECUTE"
    } else if sql_upper.starts_with("BEGIN TRAN") {
        "BEGIN"
    } else if sql_upper.starts_with("COMMIT") {
        "COMMIT"
    } else if sql_upper.starts_with("ROLLBACK") {
        "ROLLBACK"
    } else if sql_upper.starts_with("WAITFOR") {
        "WAITFOR"
    } else {
        "OTHER"
    }
}

/// Data passed to [`EventSink::begin_execute`].
#[derive(Debug, Clone)]
pub struct ExecutionEvent {
    /// Correlation id of the execution.
    pub operation_id: Uuid,
    /// Statement kind.
    pub operation: &'static str,
    /// Sanitized command text.
    pub statement: String,
    /// How the caller drives the execution.
    pub mode: RunMode,
}

/// Data passed to [`EventSink::end_execute`].
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// Wall time from validation to completion.
    pub elapsed: Duration,
    /// Rows affected, when the server reported a count.
    pub rows_affected: Option<u64>,
    /// Display form of the error, when the execution failed.
    pub error: Option<String>,
}

impl ExecutionOutcome {
    /// Whether the execution completed without error.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Receiver of execution begin/end events.
pub trait EventSink: Send + Sync {
    /// An execution passed validation and is about to write its request.
    fn begin_execute(&self, event: &ExecutionEvent) -> Result<(), SinkError>;

    /// An execution finished.
    fn end_execute(&self, event: &ExecutionEvent, outcome: &ExecutionOutcome)
    -> Result<(), SinkError>;
}

/// Sink that reports events through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn begin_execute(&self, event: &ExecutionEvent) -> Result<(), SinkError> {
        tracing::debug!(
            operation_id = %event.operation_id,
            db.system = DB_SYSTEM,
            db.operation = event.operation,
            mode = ?event.mode,
            "execution started"
        );
        Ok(())
    }

    fn end_execute(
        &self,
        event: &ExecutionEvent,
        outcome: &ExecutionOutcome,
    ) -> Result<(), SinkError> {
        tracing::debug!(
            operation_id = %event.operation_id,
            elapsed_us = outcome.elapsed.as_micros() as u64,
            rows_affected = outcome.rows_affected,
            error = outcome.error.as_deref(),
            "execution finished"
        );
        Ok(())
    }
}

/// Shared handle to the sink the pipeline reports to.
#[derive(Clone)]
pub(crate) struct Instrumentation {
    sink: Arc<dyn EventSink>,
    sanitization: SanitizationConfig,
}

impl Instrumentation {
    pub(crate) fn new(sink: Arc<dyn EventSink>, sanitization: SanitizationConfig) -> Self {
        Self { sink, sanitization }
    }

    pub(crate) fn event(&self, operation_id: Uuid, sql: &str, mode: RunMode) -> ExecutionEvent {
        ExecutionEvent {
            operation_id,
            operation: extract_operation(sql),
            statement: self.sanitization.sanitize(sql),
            mode,
        }
    }

    pub(crate) fn begin(&self, event: &ExecutionEvent) {
        if let Err(e) = self.sink.begin_execute(event) {
            tracing::trace!(operation_id = %event.operation_id, error = %e, "event sink failed on begin");
        }
    }

    pub(crate) fn end(&self, event: &ExecutionEvent, outcome: &ExecutionOutcome) {
        if let Err(e) = self.sink.end_execute(event, outcome) {
            tracing::trace!(operation_id = %event.operation_id, error = %e, "event sink failed on end");
        }
    }
}

impl Default for Instrumentation {
    fn default() -> Self {
        Self::new(Arc::new(TracingSink), SanitizationConfig::default())
    }
}

impl fmt::Debug for Instrumentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instrumentation")
            .field("sanitization", &self.sanitization)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn test_extract_operation() {
        assert_eq!(extract_operation("SELECT * FROM users"), "SELECT");
        assert_eq!(extract_operation("  insert into t values (1)"), "INSERT");
        assert_eq!(extract_operation("EXEC sp_who"), "EXECUTE");
        assert_eq!(extract_operation("WAITFOR DELAY '00:00:05'"), "WAITFOR");
        assert_eq!(extract_operation("TRUNCATE TABLE t"), "OTHER");
        assert_eq!(extract_operation(""), "OTHER");
    }

    #[test]
    fn test_sanitize_sql() {
        let config = SanitizationConfig::default();
        assert_eq!(
            config.sanitize("SELECT * FROM users WHERE name = 'O''Brien' AND id = 42"),
            "SELECT * FROM users WHERE name = ? AND id = ?"
        );
        assert_eq!(config.sanitize("SELECT col1 FROM t2"), "SELECT col1 FROM t2");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_string("short", 10), "short");
        assert_eq!(truncate_string("ééééé", 6), "é...");
    }

    struct FailingSink(AtomicU32);

    impl EventSink for FailingSink {
        fn begin_execute(&self, _event: &ExecutionEvent) -> Result<(), SinkError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err("sink offline".into())
        }

        fn end_execute(
            &self,
            _event: &ExecutionEvent,
            _outcome: &ExecutionOutcome,
        ) -> Result<(), SinkError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err("sink offline".into())
        }
    }

    #[test]
    fn test_sink_failures_are_swallowed() {
        let sink = Arc::new(FailingSink(AtomicU32::new(0)));
        let instrumentation =
            Instrumentation::new(sink.clone(), SanitizationConfig::no_sanitization());
        let event = instrumentation.event(Uuid::new_v4(), "SELECT 1", RunMode::Async);

        instrumentation.begin(&event);
        instrumentation.end(
            &event,
            &ExecutionOutcome {
                elapsed: Duration::from_millis(1),
                rows_affected: None,
                error: None,
            },
        );

        assert_eq!(sink.0.load(Ordering::SeqCst), 2);
        assert_eq!(event.statement, "SELECT 1");
    }
}
