//! Client and connection handles.
//!
//! A [`Client`] owns the connection factory, and with it every pool. A
//! [`Connection`] is one caller's handle on a physical connection taken
//! from it; commands run through the handle one at a time.
//!
//! ## Connection resiliency
//!
//! Before each execution the handle checks its physical connection. A
//! broken one is replaced by a reconnect task that tries
//! `connect_retry_count` times, `connect_retry_interval` apart. The
//! execution waits for the task at most `min(remaining command budget,
//! connect timeout)` and fails with [`Error::ReconnectTimeout`] past that;
//! the task keeps running and the next execution joins it. A connection
//! that dies inside a transaction is never replaced silently.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use sqlclient_pool::{
    ConnectionFactory, ConnectionRequest, FactoryConnection, InternalConnection, PoolError,
};
use tds_protocol::TdsVersion;
use tds_session::CancelHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::command::{Command, Execution, ExecutionContext, RunMode, block_on};
use crate::config::Config;
use crate::connection::PhysicalConnection;
use crate::connector::TcpConnector;
use crate::error::{Error, Result};
use crate::instrumentation::{EventSink, Instrumentation, SanitizationConfig, TracingSink, span_names};
use crate::retry::{ExponentialRetryProvider, NoneRetryProvider, RetryLogicProvider};
use crate::statistics::{Statistics, StatisticsSnapshot};

type Pooled = FactoryConnection<TcpConnector>;
type ReconnectSlot = Arc<Mutex<Option<Pooled>>>;
type ReconnectTask = Shared<BoxFuture<'static, std::result::Result<ReconnectSlot, PoolError>>>;

/// Entry point: opens connections and administers their pools.
///
/// Cloning is cheap; clones share the factory.
#[derive(Clone)]
pub struct Client {
    factory: Arc<ConnectionFactory<TcpConnector>>,
    sink: Arc<dyn EventSink>,
    sanitization: SanitizationConfig,
    retry: Option<Arc<dyn RetryLogicProvider>>,
}

impl Client {
    /// Create a client with its own connection factory.
    ///
    /// Call from within a Tokio runtime so the pool pruning timer starts.
    #[must_use]
    pub fn new() -> Self {
        Self::with_connector(TcpConnector::new())
    }

    /// Create a client that opens connections through `connector`.
    #[must_use]
    pub fn with_connector(connector: TcpConnector) -> Self {
        Self {
            factory: ConnectionFactory::new(connector),
            sink: Arc::new(TracingSink),
            sanitization: SanitizationConfig::default(),
            retry: None,
        }
    }

    /// Report execution events to `sink`.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Control how command text is sanitized before reaching the sink.
    #[must_use]
    pub fn with_sanitization(mut self, sanitization: SanitizationConfig) -> Self {
        self.sanitization = sanitization;
        self
    }

    /// Retry transient failures of every connection with `provider`.
    ///
    /// Overrides the policy in [`Config::retry`].
    #[must_use]
    pub fn with_retry_logic(mut self, provider: Arc<dyn RetryLogicProvider>) -> Self {
        self.retry = Some(provider);
        self
    }

    /// The connection factory.
    #[must_use]
    pub fn factory(&self) -> &Arc<ConnectionFactory<TcpConnector>> {
        &self.factory
    }

    /// Open a connection.
    pub async fn connect(&self, config: Config) -> Result<Connection> {
        self.open(config, RunMode::Async).await
    }

    /// Open a connection, blocking the calling thread.
    ///
    /// Needs the multi-thread Tokio runtime.
    pub fn connect_blocking(&self, config: Config) -> Result<Connection> {
        block_on(self.open(config, RunMode::Sync))?
    }

    async fn open(&self, config: Config, mode: RunMode) -> Result<Connection> {
        config.validate()?;
        let config = Arc::new(config);
        let request = ConnectionRequest::new(
            config.pool_key(),
            config.pool.clone(),
            Arc::clone(&config),
        )
        .with_identity(config.identity())
        .with_mode(mode.open_mode());

        let inner = self.factory.try_get_connection(&request).await?;
        let retry: Arc<dyn RetryLogicProvider> = match (&self.retry, &config.retry) {
            (Some(provider), _) => Arc::clone(provider),
            (None, Some(policy)) => Arc::new(ExponentialRetryProvider::new(policy.clone())),
            (None, None) => Arc::new(NoneRetryProvider),
        };
        tracing::debug!(
            key = request.key.redacted(),
            pooled = inner.is_pooled(),
            connection_id = inner.connection().id(),
            "connection opened"
        );

        Ok(Connection {
            factory: Arc::clone(&self.factory),
            statistics: Arc::new(Statistics::new(config.statistics_enabled)),
            config,
            request,
            inner: Some(inner),
            reconnect: None,
            retry,
            instrumentation: Instrumentation::new(Arc::clone(&self.sink), self.sanitization.clone()),
        })
    }

    /// Shut down the pools built for `config`.
    pub async fn clear_pool(&self, config: &Config) {
        self.factory.clear_pool(&config.pool_key()).await;
    }

    /// Shut down every pool.
    pub async fn clear_all_pools(&self) {
        self.factory.clear_all_pools().await;
    }

    /// Shut down the factory; later opens fail.
    pub async fn shutdown(&self) {
        self.factory.shutdown().await;
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("pool_groups", &self.factory.pool_group_count())
            .finish_non_exhaustive()
    }
}

/// One caller's handle on a physical connection.
pub struct Connection {
    factory: Arc<ConnectionFactory<TcpConnector>>,
    config: Arc<Config>,
    request: ConnectionRequest<TcpConnector>,
    inner: Option<Pooled>,
    reconnect: Option<ReconnectTask>,
    pub(crate) statistics: Arc<Statistics>,
    pub(crate) retry: Arc<dyn RetryLogicProvider>,
    pub(crate) instrumentation: Instrumentation,
}

impl Connection {
    /// Bind a command to this connection.
    pub fn command(&mut self, text: impl Into<String>) -> Command<'_> {
        Command::new(self, text)
    }

    /// Execute `text` and return the number of rows affected.
    pub async fn execute(&mut self, text: &str) -> Result<u64> {
        self.command(text).execute_non_query_async().await
    }

    /// Configuration the connection was opened with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn physical(&self) -> Option<&PhysicalConnection> {
        self.inner.as_ref().map(FactoryConnection::connection)
    }

    /// Current database.
    #[must_use]
    pub fn database(&self) -> Option<&str> {
        self.physical().and_then(PhysicalConnection::database)
    }

    /// Whether a transaction is open.
    #[must_use]
    pub fn is_in_transaction(&self) -> bool {
        self.physical()
            .is_some_and(PhysicalConnection::is_in_transaction)
    }

    /// TDS version acknowledged at login.
    #[must_use]
    pub fn tds_version(&self) -> Option<TdsVersion> {
        self.physical().map(PhysicalConnection::tds_version)
    }

    /// Server program name.
    #[must_use]
    pub fn server_name(&self) -> Option<&str> {
        self.physical().map(PhysicalConnection::server_name)
    }

    /// Negotiated packet size.
    #[must_use]
    pub fn packet_size(&self) -> Option<usize> {
        self.physical().map(PhysicalConnection::packet_size)
    }

    /// Whether the physical connection came from a pool.
    #[must_use]
    pub fn is_pooled(&self) -> bool {
        self.inner.as_ref().is_some_and(FactoryConnection::is_pooled)
    }

    /// Whether a physical connection is attached and sound.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.physical().is_some_and(InternalConnection::is_alive)
    }

    /// Whether a reconnect task is in flight.
    #[must_use]
    pub fn is_reconnecting(&self) -> bool {
        self.reconnect.is_some()
    }

    /// Handle that cancels whatever runs on the primary session.
    ///
    /// Per-command cancellation is usually simpler through
    /// [`Command::with_cancellation`].
    #[must_use]
    pub fn cancel_handle(&self) -> Option<CancelHandle> {
        self.physical().and_then(PhysicalConnection::cancel_handle)
    }

    /// Turn statistics collection on or off.
    pub fn set_statistics_enabled(&self, enabled: bool) {
        self.statistics.set_enabled(enabled);
    }

    /// Zero the statistics counters.
    pub fn reset_statistics(&self) {
        self.statistics.reset();
    }

    /// Snapshot of the statistics counters.
    #[must_use]
    pub fn retrieve_statistics(&self) -> StatisticsSnapshot {
        self.statistics.snapshot()
    }

    /// Live statistics counters.
    #[must_use]
    pub fn statistics(&self) -> &Arc<Statistics> {
        &self.statistics
    }

    /// Return the physical connection to its pool, or close it.
    pub async fn close(mut self) {
        if let Some(inner) = self.inner.take() {
            if inner.connection().is_alive() {
                inner.release().await;
            } else {
                inner.discard().await;
            }
        }
    }

    /// Take the physical connection for one execution, reconnecting first
    /// if needed, and write the request.
    ///
    /// A write that fails on a dead transport is reissued once on a fresh
    /// connection with the budget that is left.
    pub(crate) async fn begin_execution(
        &mut self,
        text: &str,
        ctx: &ExecutionContext,
        cancellation: Option<&CancellationToken>,
    ) -> Result<Execution> {
        self.ensure_open(ctx.mode, ctx.remaining()?).await?;
        let mut reissued = false;
        loop {
            let remaining = ctx.remaining()?;
            let inner = self.inner.take().ok_or(Error::ConnectionClosed)?;
            let mut exec = Execution::new(inner, Arc::clone(&self.statistics), ctx.timeout);
            let Err(error) = exec.start(text, ctx.mode, remaining, cancellation).await else {
                return Ok(exec);
            };
            self.inner = exec.into_connection().await;

            let in_transaction = self.is_in_transaction();
            if reissued || !error.is_fatal() || self.config.connect_retry_count == 0 || in_transaction {
                return Err(error);
            }
            tracing::debug!(error = %error, "request write failed, reconnecting before reissue");
            reissued = true;
            self.ensure_open(ctx.mode, ctx.remaining()?).await?;
        }
    }

    /// Take back the physical connection after an execution.
    pub(crate) fn end_execution(&mut self, inner: Option<Pooled>) {
        if inner.is_none() {
            tracing::debug!("execution ended without its connection");
        }
        self.inner = inner;
    }

    fn needs_reconnect(&mut self) -> bool {
        match self.inner.as_mut() {
            None => true,
            Some(inner) => {
                let physical = inner.connection_mut();
                !physical.is_alive() || !physical.probe()
            }
        }
    }

    /// Make sure a sound physical connection is attached.
    async fn ensure_open(&mut self, mode: RunMode, budget: Option<Duration>) -> Result<()> {
        if self.reconnect.is_none() {
            if !self.needs_reconnect() {
                return Ok(());
            }
            let old = self.inner.take();
            if let Some(old) = old.as_ref() {
                old.connection().mark_broken();
            }
            let in_transaction = old
                .as_ref()
                .is_some_and(|c| c.connection().is_in_transaction());
            if in_transaction || self.config.connect_retry_count == 0 {
                if let Some(old) = old {
                    old.discard().await;
                }
                tracing::debug!(in_transaction, "broken connection cannot be replaced");
                return Err(Error::ConnectionClosed);
            }
            self.reconnect = Some(self.spawn_reconnect(old, mode));
        }

        let Some(task) = self.reconnect.clone() else {
            return Err(Error::ConnectionClosed);
        };
        let connect_timeout = self.config.timeouts.connect_timeout;
        let limit = budget.map_or(connect_timeout, |b| b.min(connect_timeout));
        let started = Instant::now();

        match tokio::time::timeout(limit, task).await {
            Err(_) => {
                tracing::debug!(limit_ms = limit.as_millis() as u64, "reconnect still running past the wait limit");
                Err(Error::ReconnectTimeout(limit))
            }
            Ok(Err(e)) => {
                self.reconnect = None;
                if e.is_timeout() {
                    Err(Error::ReconnectTimeout(limit))
                } else {
                    Err(e.into())
                }
            }
            Ok(Ok(slot)) => {
                self.reconnect = None;
                self.inner = slot.lock().take();
                tracing::debug!(
                    waited_ms = started.elapsed().as_millis() as u64,
                    "reconnected"
                );
                if self.inner.is_some() {
                    Ok(())
                } else {
                    Err(Error::ConnectionClosed)
                }
            }
        }
    }

    fn spawn_reconnect(&self, old: Option<Pooled>, mode: RunMode) -> ReconnectTask {
        let factory = Arc::clone(&self.factory);
        let request = self.request.clone().with_mode(mode.open_mode());
        let attempts = self.config.connect_retry_count;
        let interval = self.config.connect_retry_interval;
        let span = tracing::debug_span!(
            span_names::RECONNECT,
            attempts,
            interval_ms = interval.as_millis() as u64,
        );

        let handle = tokio::spawn(
            async move {
                if let Some(old) = old {
                    old.discard().await;
                }
                let mut last = PoolError::FactoryShutdown;
                for attempt in 1..=attempts {
                    if attempt > 1 {
                        tokio::time::sleep(interval).await;
                    }
                    match factory.try_get_connection(&request).await {
                        Ok(conn) => {
                            tracing::debug!(attempt, "reconnect attempt succeeded");
                            return Ok(Arc::new(Mutex::new(Some(conn))));
                        }
                        Err(e) => {
                            tracing::debug!(attempt, error = %e, "reconnect attempt failed");
                            last = e;
                        }
                    }
                }
                Err(last)
            }
            .instrument(span),
        );

        async move {
            handle
                .await
                .unwrap_or_else(|_| Err(PoolError::FactoryShutdown))
        }
        .boxed()
        .shared()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.request.key)
            .field("physical", &self.physical())
            .field("reconnecting", &self.reconnect.is_some())
            .finish_non_exhaustive()
    }
}
