//! Command execution pipeline.
//!
//! Every execution walks the same states whichever way the caller drives it:
//!
//! ```text
//! Idle -> Validating -> Writing -> [Reconnecting] -> Reading -> Completed | Faulted
//! ```
//!
//! [`Command::execute_non_query_async`] awaits the whole unit,
//! [`Command::execute_non_query_blocking`] blocks the calling thread on the
//! same future, and [`Command::begin_execute_non_query`] returns once the
//! request is written, leaving the read stage to [`PendingNonQuery::end`].
//!
//! An [`Execution`] owns the physical connection while it runs, so the
//! session and its buffers are reachable from exactly one place. Ending an
//! execution hands the connection back to its [`Connection`]; dropping one
//! mid-flight returns the connection to its pool instead.

use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use sqlclient_pool::{FactoryConnection, OpenMode};
use tds_protocol::{PacketType, SqlBatch, Token};
use tds_session::{ExecutionMode, IoSnapshot, OwnerId, SessionError, SessionFlags};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};
use uuid::Uuid;

use crate::client::Connection;
use crate::connection::{LeaseParts, OpenResults, PhysicalConnection, SessionLease};
use crate::connector::TcpConnector;
use crate::error::{Error, Result};
use crate::instrumentation::{ExecutionEvent, ExecutionOutcome, span_names};
use crate::parser::TokenParser;
use crate::reader::DataReader;
use crate::retry::RetryLogicProvider;
use crate::statistics::Statistics;

/// How the caller drives an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// The calling thread blocks until completion.
    Sync,
    /// The caller awaits the whole execution.
    Async,
    /// The write is awaited by `begin`, the read stage by `end`.
    AsyncWrite,
}

impl RunMode {
    /// Name used in span fields.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Async => "async",
            Self::AsyncWrite => "async-write",
        }
    }

    fn execution_mode(self) -> ExecutionMode {
        match self {
            Self::Sync => ExecutionMode::Sync,
            Self::Async | Self::AsyncWrite => ExecutionMode::Async,
        }
    }

    pub(crate) fn open_mode(self) -> OpenMode {
        match self {
            Self::Sync => OpenMode::Sync,
            Self::Async | Self::AsyncWrite => OpenMode::Async,
        }
    }
}

/// Notified once per execution when it completes, successfully or not.
///
/// Dependency tracking and cache invalidation hang off this hook.
pub trait CompletionHook: Send + Sync {
    /// The execution `operation_id` finished with `outcome`.
    fn on_complete(&self, operation_id: Uuid, outcome: &ExecutionOutcome);
}

const MAX_CACHED_CONTEXTS: usize = 16;

static CONTEXT_CACHE: Lazy<Mutex<Vec<ExecutionContext>>> =
    Lazy::new(|| Mutex::new(Vec::with_capacity(MAX_CACHED_CONTEXTS)));

/// Per-execution bookkeeping, recycled through a small process-wide cache.
#[derive(Debug)]
pub(crate) struct ExecutionContext {
    pub(crate) operation_id: Uuid,
    pub(crate) mode: RunMode,
    pub(crate) started: Instant,
    pub(crate) timeout: Option<Duration>,
}

impl ExecutionContext {
    pub(crate) fn acquire(mode: RunMode, timeout: Option<Duration>) -> Self {
        let cached = CONTEXT_CACHE.lock().pop();
        match cached {
            Some(mut ctx) => {
                ctx.operation_id = Uuid::new_v4();
                ctx.mode = mode;
                ctx.started = Instant::now();
                ctx.timeout = timeout;
                ctx
            }
            None => Self {
                operation_id: Uuid::new_v4(),
                mode,
                started: Instant::now(),
                timeout,
            },
        }
    }

    pub(crate) fn recycle(self) {
        let mut cache = CONTEXT_CACHE.lock();
        if cache.len() < MAX_CACHED_CONTEXTS {
            cache.push(self);
        }
    }

    /// Budget left for the execution; `None` means no limit.
    pub(crate) fn remaining(&self) -> Result<Option<Duration>> {
        match self.timeout {
            None => Ok(None),
            Some(timeout) => {
                let left = timeout.saturating_sub(self.started.elapsed());
                if left.is_zero() {
                    Err(Error::CommandTimeout(timeout))
                } else {
                    Ok(Some(left))
                }
            }
        }
    }
}

/// Completion side effects of one execution: statistics, sink events,
/// hooks.
pub(crate) struct Completion {
    ctx: ExecutionContext,
    event: ExecutionEvent,
    hooks: Vec<Arc<dyn CompletionHook>>,
    span: Span,
}

impl Completion {
    fn begin(
        connection: &Connection,
        text: &str,
        mode: RunMode,
        timeout: Option<Duration>,
        hooks: Vec<Arc<dyn CompletionHook>>,
    ) -> Self {
        let ctx = ExecutionContext::acquire(mode, timeout);
        let event = connection
            .instrumentation
            .event(ctx.operation_id, text, mode);
        let span = tracing::debug_span!(
            span_names::EXECUTE,
            operation_id = %ctx.operation_id,
            text_len = text.len(),
            mode = mode.as_str(),
        );
        connection.instrumentation.begin(&event);
        Self {
            ctx,
            event,
            hooks,
            span,
        }
    }

    pub(crate) fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    pub(crate) fn span(&self) -> Span {
        self.span.clone()
    }

    pub(crate) fn finish(self, connection: &Connection, rows_affected: Option<u64>, error: Option<&Error>) {
        let outcome = ExecutionOutcome {
            elapsed: self.ctx.started.elapsed(),
            rows_affected,
            error: error.map(ToString::to_string),
        };
        connection.statistics.record_execution(outcome.elapsed);
        connection.instrumentation.end(&self.event, &outcome);
        for hook in &self.hooks {
            hook.on_complete(self.event.operation_id, &outcome);
        }
        self.ctx.recycle();
    }
}

enum ResultState {
    Closed,
    Open { transaction: Option<u64>, rows: u64 },
}

/// Map session failures to the errors callers see.
fn surface(error: Error, timeout: Option<Duration>) -> Error {
    match error {
        Error::Session(SessionError::Timeout) => Error::CommandTimeout(timeout.unwrap_or_default()),
        Error::Session(SessionError::OperationCancelled) => Error::Cancelled,
        other => other,
    }
}

fn lease_parts<'s>(
    conn: &'s mut Option<FactoryConnection<TcpConnector>>,
    lease: &'s mut Option<SessionLease>,
) -> Result<LeaseParts<'s>> {
    let physical = conn
        .as_mut()
        .map(FactoryConnection::connection_mut)
        .ok_or(Error::ConnectionClosed)?;
    let lease = lease.as_mut().ok_or(Error::ConnectionClosed)?;
    physical.parts(lease)
}

/// Close the open result, if any. Returns whether one was open.
fn close_result(result: &mut ResultState, statistics: &Statistics, counts: &OpenResults) -> bool {
    match std::mem::replace(result, ResultState::Closed) {
        ResultState::Open { transaction, rows } => {
            counts.close(transaction);
            statistics.record_result_set(rows);
            true
        }
        ResultState::Closed => false,
    }
}

/// One request/response exchange on a leased session.
pub(crate) struct Execution {
    conn: Option<FactoryConnection<TcpConnector>>,
    lease: Option<SessionLease>,
    parser: TokenParser,
    statistics: Arc<Statistics>,
    watcher: Option<JoinHandle<()>>,
    reported_timeout: Option<Duration>,
    io_before: Option<IoSnapshot>,
    result: ResultState,
    rows_affected: Option<u64>,
    error: Option<Error>,
    cancelled: bool,
    complete: bool,
}

impl Execution {
    pub(crate) fn new(
        conn: FactoryConnection<TcpConnector>,
        statistics: Arc<Statistics>,
        reported_timeout: Option<Duration>,
    ) -> Self {
        Self {
            conn: Some(conn),
            lease: None,
            parser: TokenParser::new(),
            statistics,
            watcher: None,
            reported_timeout,
            io_before: None,
            result: ResultState::Closed,
            rows_affected: None,
            error: None,
            cancelled: false,
            complete: false,
        }
    }

    fn physical(&mut self) -> Result<&mut PhysicalConnection> {
        self.conn
            .as_mut()
            .map(FactoryConnection::connection_mut)
            .ok_or(Error::ConnectionClosed)
    }

    /// Lease a session and write the request.
    ///
    /// Nothing has been read when this fails, so a fatal error here means
    /// the request never reached a live server. A pending connection reset
    /// stays pending unless the first packet went out.
    pub(crate) async fn start(
        &mut self,
        text: &str,
        mode: RunMode,
        timeout: Option<Duration>,
        cancellation: Option<&CancellationToken>,
    ) -> Result<()> {
        let reset = self.physical()?.take_reset();
        let result = self.write_request(text, mode, timeout, cancellation, reset).await;
        if result.is_err() && reset && !self.request_on_wire() {
            if let Ok(physical) = self.physical() {
                physical.restore_reset();
            }
        }
        result
    }

    async fn write_request(
        &mut self,
        text: &str,
        mode: RunMode,
        timeout: Option<Duration>,
        cancellation: Option<&CancellationToken>,
        reset: bool,
    ) -> Result<()> {
        let reported = self.reported_timeout;
        let lease = self.physical()?.lease(OwnerId::next()).await?;
        self.lease = Some(lease);

        let LeaseParts { session, state, .. } = lease_parts(&mut self.conn, &mut self.lease)?;
        session.begin_operation(timeout, mode.execution_mode())?;
        self.io_before = Some(session.io_counters());

        if let Some(token) = cancellation {
            let handle = session.cancel_handle();
            if token.is_cancelled() {
                // Nothing is on the wire yet: the write below aborts locally.
                handle.cancel().await?;
            } else {
                let token = token.clone();
                self.watcher = Some(tokio::spawn(async move {
                    token.cancelled().await;
                    if let Err(e) = handle.cancel().await {
                        tracing::trace!(session_id = handle.session_id().get(), error = %e, "cancel request failed");
                    }
                }));
            }
        }

        let request = SqlBatch::new(text)
            .with_transaction(state.transaction.unwrap_or(0))
            .encode();
        session
            .send_message(PacketType::SqlBatch, &request, reset)
            .await
            .map_err(|e| surface(e.into(), reported))?;

        if mode == RunMode::Sync && session.pending_callbacks() != 0 {
            tracing::error!(session_id = session.id().get(), "synchronous write left a pending operation");
            session.mark_broken();
            return Err(Error::SyncCallPended);
        }
        self.statistics.record_roundtrip();
        Ok(())
    }

    /// Whether any packet of the current request was written.
    fn request_on_wire(&mut self) -> bool {
        let Some(before) = self.io_before else {
            return false;
        };
        lease_parts(&mut self.conn, &mut self.lease)
            .is_ok_and(|parts| parts.session.io_counters().packets_sent > before.packets_sent)
    }

    /// Next token the caller cares about; `None` once the response is
    /// complete.
    ///
    /// Environment changes, errors and informational messages are applied
    /// here and never surface as tokens.
    pub(crate) async fn next_token(&mut self) -> Result<Option<Token>> {
        loop {
            if self.complete {
                return Ok(None);
            }
            let LeaseParts {
                session,
                state,
                sessions,
            } = lease_parts(&mut self.conn, &mut self.lease)?;

            let token = match self.parser.next_token(session).await {
                Ok(Some(token)) => token,
                Ok(None) => {
                    session.complete_response();
                    self.cancelled |= session.attention_pending();
                    self.complete = true;
                    return Ok(None);
                }
                Err(e) => {
                    self.complete = true;
                    return Err(surface(e, self.reported_timeout));
                }
            };

            match token {
                Token::EnvChange(change) => {
                    if state.apply(session, sessions, &change)? {
                        self.statistics.record_connection_reset();
                    }
                }
                Token::Error(e) => {
                    session.set_flags(SessionFlags::ERROR_TOKEN_RECEIVED);
                    tracing::debug!(number = e.number, class = e.class, message = %e.message, "server error");
                    if self.error.is_none() {
                        self.error = Some(e.into());
                    }
                }
                Token::Info(info) => {
                    tracing::debug!(number = info.number, message = %info.message, "server message");
                }
                Token::ColMetaData(meta) => {
                    close_result(&mut self.result, &self.statistics, &state.open_results);
                    if !meta.columns.is_empty() {
                        session.set_flags(SessionFlags::OPEN_RESULT | SessionFlags::COL_METADATA_RECEIVED);
                        self.result = ResultState::Open {
                            transaction: state.open_results.open(state.transaction),
                            rows: 0,
                        };
                    }
                    return Ok(Some(Token::ColMetaData(meta)));
                }
                Token::Row(row) => {
                    if let ResultState::Open { rows, .. } = &mut self.result {
                        *rows += 1;
                    }
                    return Ok(Some(Token::Row(row)));
                }
                Token::Done(done) => {
                    if done.is_attention_ack() {
                        session.attention_acknowledged();
                        self.cancelled = true;
                    }
                    if close_result(&mut self.result, &self.statistics, &state.open_results) {
                        session.clear_flags(SessionFlags::OPEN_RESULT);
                    } else if let Some(rows) = done.rows_affected() {
                        self.rows_affected = Some(self.rows_affected.unwrap_or(0) + rows);
                        self.statistics.record_rows_affected(rows);
                    }
                    return Ok(Some(Token::Done(done)));
                }
                other => return Ok(Some(other)),
            }
        }
    }

    /// Consume the rest of the response.
    pub(crate) async fn drain(&mut self) -> Result<()> {
        while self.next_token().await?.is_some() {}
        Ok(())
    }

    /// Final verdict once the response is complete: cancellation wins over
    /// a server error.
    pub(crate) fn outcome(&mut self) -> Result<()> {
        if self.cancelled {
            return Err(Error::Cancelled);
        }
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Rows affected by statements that returned no result set.
    pub(crate) fn rows_affected(&self) -> Option<u64> {
        self.rows_affected
    }

    /// Give the session back to the connection. Releasing twice is a no-op.
    pub(crate) async fn release(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        let Some(mut lease) = self.lease.take() else {
            return;
        };
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        let physical = conn.connection_mut();
        close_result(&mut self.result, &self.statistics, physical.result_counts());
        if let (Some(before), Ok(parts)) = (self.io_before.take(), physical.parts(&mut lease)) {
            self.statistics.record_io(before, parts.session.io_counters());
        }
        if !physical.release(lease).await {
            tracing::debug!(connection_id = physical.id(), "session not reusable after execution");
        }
    }

    /// Release and hand the connection back.
    pub(crate) async fn into_connection(mut self) -> Option<FactoryConnection<TcpConnector>> {
        self.release().await;
        self.conn.take()
    }

    /// Release without waiting and hand the connection back.
    pub(crate) fn into_connection_now(mut self) -> Option<FactoryConnection<TcpConnector>> {
        self.release_now();
        self.conn.take()
    }

    fn release_now(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        if let (Some(lease), Some(conn)) = (self.lease.take(), self.conn.as_mut()) {
            let physical = conn.connection_mut();
            close_result(&mut self.result, &self.statistics, physical.result_counts());
            physical.release_now(lease);
        }
    }
}

impl Drop for Execution {
    fn drop(&mut self) {
        self.release_now();
    }
}

/// Read stage of a non-query.
///
/// `is_internal` marks a nested end call whose caller releases the session
/// itself; only the outer end releases.
async fn end_non_query(exec: &mut Execution, is_internal: bool) -> Result<u64> {
    let drained = exec.drain().await;
    if !is_internal {
        exec.release().await;
    }
    drained?;
    exec.outcome()?;
    Ok(exec.rows_affected().unwrap_or(0))
}

/// Run `future` to completion on the current Tokio runtime, blocking the
/// calling thread.
pub(crate) fn block_on<F: std::future::Future>(future: F) -> Result<F::Output> {
    use tokio::runtime::{Handle, RuntimeFlavor};

    let handle = Handle::try_current()
        .map_err(|_| Error::Config("blocking calls need a Tokio runtime".into()))?;
    if handle.runtime_flavor() != RuntimeFlavor::MultiThread {
        return Err(Error::Config(
            "blocking calls need the multi-thread Tokio runtime".into(),
        ));
    }
    Ok(tokio::task::block_in_place(|| handle.block_on(future)))
}

/// A SQL batch bound to a connection.
///
/// ```rust,ignore
/// let rows = conn
///     .command("UPDATE accounts SET balance = 0 WHERE id = 7")
///     .with_timeout(Duration::from_secs(5))
///     .execute_non_query_async()
///     .await?;
/// ```
pub struct Command<'c> {
    connection: &'c mut Connection,
    text: String,
    timeout: Option<Duration>,
    hooks: Vec<Arc<dyn CompletionHook>>,
    cancellation: Option<CancellationToken>,
    retry: Option<Arc<dyn RetryLogicProvider>>,
}

impl<'c> Command<'c> {
    pub(crate) fn new(connection: &'c mut Connection, text: impl Into<String>) -> Self {
        let timeout = connection.config().timeouts.command_limit();
        Self {
            connection,
            text: text.into(),
            timeout,
            hooks: Vec::new(),
            cancellation: None,
            retry: None,
        }
    }

    /// Command text.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Time allowed for the execution; `None` waits forever.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Set the timeout. Zero waits forever.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Notify `hook` when the execution completes.
    #[must_use]
    pub fn with_hook(mut self, hook: Arc<dyn CompletionHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Cancel the execution when `token` fires.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Retry transient failures with `provider` instead of the
    /// connection's provider.
    #[must_use]
    pub fn with_retry_logic(mut self, provider: Arc<dyn RetryLogicProvider>) -> Self {
        self.retry = Some(provider);
        self
    }

    /// Execute and return the number of rows affected.
    pub async fn execute_non_query_async(mut self) -> Result<u64> {
        self.run_non_query(RunMode::Async).await
    }

    /// Execute on the calling thread, blocking it until completion.
    ///
    /// Needs the multi-thread Tokio runtime the connection was opened on.
    pub fn execute_non_query_blocking(mut self) -> Result<u64> {
        block_on(self.run_non_query(RunMode::Sync))?
    }

    /// Write the request and return without reading the response.
    ///
    /// The split call is not retried: a retry has to re-run the whole
    /// write and read unit.
    pub async fn begin_execute_non_query(self) -> Result<PendingNonQuery<'c>> {
        let Self {
            connection,
            text,
            timeout,
            hooks,
            cancellation,
            ..
        } = self;
        let completion = Completion::begin(connection, &text, RunMode::AsyncWrite, timeout, hooks);
        let started = connection
            .begin_execution(&text, completion.context(), cancellation.as_ref())
            .instrument(completion.span())
            .await;
        match started {
            Ok(exec) => Ok(PendingNonQuery {
                connection,
                exec: Some(exec),
                completion: Some(completion),
            }),
            Err(e) => {
                completion.finish(connection, None, Some(&e));
                Err(e)
            }
        }
    }

    /// Execute and stream the results.
    ///
    /// Readers are not retried; rows may already have reached the caller.
    pub async fn execute_reader_async(self) -> Result<DataReader<'c>> {
        let Self {
            connection,
            text,
            timeout,
            hooks,
            cancellation,
            ..
        } = self;
        let completion = Completion::begin(connection, &text, RunMode::Async, timeout, hooks);
        let started = connection
            .begin_execution(&text, completion.context(), cancellation.as_ref())
            .instrument(completion.span())
            .await;
        match started {
            Ok(exec) => DataReader::open(connection, exec, completion).await,
            Err(e) => {
                completion.finish(connection, None, Some(&e));
                Err(e)
            }
        }
    }

    async fn run_non_query(&mut self, mode: RunMode) -> Result<u64> {
        let provider = self
            .retry
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.connection.retry));
        let mut attempt = 0;
        loop {
            match self.non_query_once(mode).await {
                Ok(rows) => return Ok(rows),
                Err(error) => {
                    attempt += 1;
                    let Some(delay) = provider.next_delay(attempt, &error) else {
                        return Err(error);
                    };
                    tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %error, "retrying execution");
                    match mode {
                        RunMode::Sync => std::thread::sleep(delay),
                        RunMode::Async | RunMode::AsyncWrite => tokio::time::sleep(delay).await,
                    }
                }
            }
        }
    }

    /// One write-and-read unit. Holds no state across calls, so the retry
    /// loop can re-run it from scratch.
    async fn non_query_once(&mut self, mode: RunMode) -> Result<u64> {
        let completion = Completion::begin(
            self.connection,
            &self.text,
            mode,
            self.timeout,
            self.hooks.clone(),
        );
        let span = completion.span();
        let result = async {
            let mut exec = self
                .connection
                .begin_execution(&self.text, completion.context(), self.cancellation.as_ref())
                .await?;
            let result = end_non_query(&mut exec, true).await;
            let conn = exec.into_connection().await;
            self.connection.end_execution(conn);
            result
        }
        .instrument(span)
        .await;

        match &result {
            Ok(rows) => completion.finish(self.connection, Some(*rows), None),
            Err(e) => completion.finish(self.connection, None, Some(e)),
        }
        result
    }
}

impl std::fmt::Debug for Command<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("text_len", &self.text.len())
            .field("timeout", &self.timeout)
            .field("hooks", &self.hooks.len())
            .finish_non_exhaustive()
    }
}

/// A non-query whose request has been written.
///
/// Dropping it without calling [`end`](Self::end) returns the session to
/// the connection; the unread response is drained by the next execution.
pub struct PendingNonQuery<'c> {
    connection: &'c mut Connection,
    exec: Option<Execution>,
    completion: Option<Completion>,
}

impl PendingNonQuery<'_> {
    /// Correlation id of the execution.
    #[must_use]
    pub fn operation_id(&self) -> Option<Uuid> {
        self.completion.as_ref().map(|c| c.context().operation_id)
    }

    /// Read the response and return the number of rows affected.
    pub async fn end(mut self) -> Result<u64> {
        let (Some(mut exec), Some(completion)) = (self.exec.take(), self.completion.take()) else {
            return Err(Error::ConnectionClosed);
        };
        let result = end_non_query(&mut exec, false)
            .instrument(completion.span())
            .await;
        let conn = exec.into_connection().await;
        self.connection.end_execution(conn);
        match &result {
            Ok(rows) => completion.finish(self.connection, Some(*rows), None),
            Err(e) => completion.finish(self.connection, None, Some(e)),
        }
        result
    }
}

impl Drop for PendingNonQuery<'_> {
    fn drop(&mut self) {
        if let Some(exec) = self.exec.take() {
            let conn = exec.into_connection_now();
            self.connection.end_execution(conn);
        }
        if let Some(completion) = self.completion.take() {
            completion.finish(self.connection, None, Some(&Error::Cancelled));
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_run_mode_names() {
        assert_eq!(RunMode::Sync.as_str(), "sync");
        assert_eq!(RunMode::AsyncWrite.as_str(), "async-write");
        assert_eq!(RunMode::Sync.open_mode(), OpenMode::Sync);
        assert_eq!(RunMode::AsyncWrite.open_mode(), OpenMode::Async);
    }

    #[test]
    fn test_context_cache_refreshes_recycled_contexts() {
        let first = ExecutionContext::acquire(RunMode::Async, None);
        let first_id = first.operation_id;
        first.recycle();

        let second = ExecutionContext::acquire(RunMode::Sync, Some(Duration::from_secs(3)));
        assert_ne!(second.operation_id, first_id);
        assert_eq!(second.mode, RunMode::Sync);
        assert_eq!(second.timeout, Some(Duration::from_secs(3)));
        second.recycle();

        assert!(CONTEXT_CACHE.lock().len() <= MAX_CACHED_CONTEXTS);
    }

    #[test]
    fn test_remaining_budget() {
        let unlimited = ExecutionContext::acquire(RunMode::Async, None);
        assert_eq!(unlimited.remaining().unwrap(), None);

        let mut expired = ExecutionContext::acquire(RunMode::Async, Some(Duration::from_millis(5)));
        expired.started = Instant::now() - Duration::from_millis(10);
        assert!(matches!(expired.remaining(), Err(Error::CommandTimeout(t)) if t == Duration::from_millis(5)));
    }

    #[test]
    fn test_surface_maps_session_errors() {
        let timeout = surface(SessionError::Timeout.into(), Some(Duration::from_secs(30)));
        assert!(matches!(timeout, Error::CommandTimeout(t) if t == Duration::from_secs(30)));
        assert!(matches!(
            surface(SessionError::OperationCancelled.into(), None),
            Error::Cancelled
        ));
        assert!(matches!(
            surface(SessionError::Broken.into(), None),
            Error::Session(SessionError::Broken)
        ));
    }

    #[test]
    fn test_close_result_counts_rows_once() {
        let statistics = Statistics::new(true);
        let counts = OpenResults::default();
        let mut result = ResultState::Open {
            transaction: counts.open(None),
            rows: 3,
        };

        assert!(close_result(&mut result, &statistics, &counts));
        assert!(!close_result(&mut result, &statistics, &counts));
        assert_eq!(counts.non_transacted(), 0);
        assert_eq!(statistics.snapshot().select_rows, 3);
    }
}
