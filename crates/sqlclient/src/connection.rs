//! Physical connections.
//!
//! A [`PhysicalConnection`] owns the primary session of one logged-in
//! transport, plus a session pool when multiplexing was requested. It
//! tracks the environment the server reports through ENVCHANGE tokens and
//! the number of open result sets per transaction.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlclient_pool::{InternalConnection, PoolError};
use tds_protocol::{EnvChange, EnvChangeType, TdsVersion};
use tds_session::{CancelHandle, OwnerId, SessionError, SessionPool, SessionRole, SessionState};

use crate::error::{Error, Result};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Open result sets, counted outside and inside transactions.
#[derive(Debug, Default)]
struct ResultCounts {
    non_transacted: u32,
    transacted: HashMap<u64, u32>,
}

/// Shared open-result bookkeeping of one physical connection.
///
/// Sessions complete independently, so the counts sit behind their own lock.
#[derive(Debug, Clone, Default)]
pub(crate) struct OpenResults(Arc<Mutex<ResultCounts>>);

impl OpenResults {
    /// Count a result opened under `transaction`; returns the bucket to
    /// close later.
    pub(crate) fn open(&self, transaction: Option<u64>) -> Option<u64> {
        let mut counts = self.0.lock();
        match transaction {
            Some(descriptor) => *counts.transacted.entry(descriptor).or_default() += 1,
            None => counts.non_transacted += 1,
        }
        transaction
    }

    pub(crate) fn close(&self, bucket: Option<u64>) {
        let mut counts = self.0.lock();
        match bucket {
            Some(descriptor) => {
                if let Some(count) = counts.transacted.get_mut(&descriptor) {
                    *count = count.saturating_sub(1);
                }
            }
            None => counts.non_transacted = counts.non_transacted.saturating_sub(1),
        }
    }

    fn end_transaction(&self, descriptor: u64) {
        self.0.lock().transacted.remove(&descriptor);
    }

    fn end_all_transactions(&self) {
        self.0.lock().transacted.clear();
    }

    /// Open results outside any transaction.
    pub(crate) fn non_transacted(&self) -> u32 {
        self.0.lock().non_transacted
    }

    /// Open results inside `descriptor`.
    pub(crate) fn transacted(&self, descriptor: u64) -> u32 {
        self.0.lock().transacted.get(&descriptor).copied().unwrap_or(0)
    }
}

/// Server-reported environment of a connection.
#[derive(Debug, Default)]
pub(crate) struct ConnectionState {
    pub(crate) database: Option<String>,
    pub(crate) language: Option<String>,
    pub(crate) transaction: Option<u64>,
    pub(crate) user_instance: Option<Arc<str>>,
    pub(crate) open_results: OpenResults,
}

impl ConnectionState {
    /// Apply one ENVCHANGE. Returns `true` for a reset acknowledgment.
    pub(crate) fn apply(
        &mut self,
        session: &mut SessionState,
        sessions: Option<&SessionPool>,
        change: &EnvChange,
    ) -> Result<bool> {
        match change.env_type {
            EnvChangeType::PacketSize => {
                if let Some(size) = change.packet_size() {
                    if session.role() == SessionRole::Primary {
                        session.set_packet_size(size)?;
                    }
                    if let Some(pool) = sessions {
                        pool.set_packet_size(size)?;
                    }
                }
            }
            EnvChangeType::Database => {
                self.database = change.new_database().map(str::to_string);
                tracing::debug!(database = ?self.database, "database changed");
            }
            EnvChangeType::Language => {
                if let tds_protocol::EnvChangeValue::String(language) = &change.new_value {
                    self.language = Some(language.clone());
                }
            }
            EnvChangeType::BeginTransaction => {
                self.transaction = change.begun_transaction();
                tracing::debug!(transaction = ?self.transaction, "transaction started");
            }
            EnvChangeType::UserInstanceStarted => {
                self.user_instance = change.user_instance().map(Arc::from);
            }
            EnvChangeType::ResetConnectionAck => {
                tracing::debug!("connection reset acknowledged");
                return Ok(true);
            }
            _ if change.ends_transaction() => {
                if let Some(descriptor) = self.transaction.take() {
                    self.open_results.end_transaction(descriptor);
                    tracing::debug!(transaction = descriptor, kind = ?change.env_type, "transaction ended");
                }
            }
            other => tracing::trace!(kind = ?other, "environment change ignored"),
        }
        Ok(false)
    }
}

/// Session lent to one execution.
#[derive(Debug)]
pub(crate) enum SessionLease {
    /// The connection's primary session.
    Primary,
    /// A session from the connection's multiplexed pool.
    Multiplexed {
        session: SessionState,
        pool: Arc<SessionPool>,
    },
}

/// Borrowed view of a leased session and the connection environment.
pub(crate) struct LeaseParts<'s> {
    pub(crate) session: &'s mut SessionState,
    pub(crate) state: &'s mut ConnectionState,
    pub(crate) sessions: Option<&'s SessionPool>,
}

/// A logged-in connection to SQL Server.
pub struct PhysicalConnection {
    id: u64,
    primary: Option<SessionState>,
    sessions: Option<Arc<SessionPool>>,
    state: ConnectionState,
    tds_version: TdsVersion,
    server_name: String,
    reset_pending: bool,
}

impl PhysicalConnection {
    pub(crate) fn new(
        primary: SessionState,
        sessions: Option<SessionPool>,
        state: ConnectionState,
        tds_version: TdsVersion,
        server_name: String,
    ) -> Self {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            connection_id = id,
            packet_size = primary.packet_size(),
            multiplexed = sessions.is_some(),
            "physical connection established"
        );
        Self {
            id,
            primary: Some(primary),
            sessions: sessions.map(Arc::new),
            state,
            tds_version,
            server_name,
            reset_pending: false,
        }
    }

    /// Connection id used in logs.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current database.
    #[must_use]
    pub fn database(&self) -> Option<&str> {
        self.state.database.as_deref()
    }

    /// Descriptor of the open transaction, if any.
    #[must_use]
    pub fn transaction(&self) -> Option<u64> {
        self.state.transaction
    }

    /// Whether a transaction is open.
    #[must_use]
    pub fn is_in_transaction(&self) -> bool {
        self.state.transaction.is_some()
    }

    /// TDS version acknowledged at login.
    #[must_use]
    pub fn tds_version(&self) -> TdsVersion {
        self.tds_version
    }

    /// Server program name from LOGINACK.
    #[must_use]
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Negotiated packet size.
    #[must_use]
    pub fn packet_size(&self) -> usize {
        self.primary.as_ref().map_or(0, SessionState::packet_size)
    }

    /// Server process id of the primary session.
    #[must_use]
    pub fn spid(&self) -> u16 {
        self.primary.as_ref().map_or(0, SessionState::spid)
    }

    /// Whether a multiplexed session pool is attached.
    #[must_use]
    pub fn is_multiplexed(&self) -> bool {
        self.sessions.is_some()
    }

    /// Open result sets outside any transaction.
    #[must_use]
    pub fn open_result_count(&self) -> u32 {
        self.state.open_results.non_transacted()
    }

    /// Open result sets inside the current transaction.
    #[must_use]
    pub fn open_transacted_result_count(&self) -> u32 {
        self.state
            .transaction
            .map_or(0, |descriptor| self.state.open_results.transacted(descriptor))
    }

    pub(crate) fn result_counts(&self) -> &OpenResults {
        &self.state.open_results
    }

    /// Cancel handle of the primary session.
    #[must_use]
    pub fn cancel_handle(&self) -> Option<CancelHandle> {
        self.primary.as_ref().map(SessionState::cancel_handle)
    }

    /// Check the idle transport without waiting.
    pub fn probe(&mut self) -> bool {
        self.primary.as_mut().is_some_and(SessionState::probe_idle)
    }

    /// Mark the transport unusable.
    pub(crate) fn mark_broken(&self) {
        if let Some(primary) = &self.primary {
            primary.mark_broken();
        }
    }

    /// Take the reset request for the next outgoing message.
    pub(crate) fn take_reset(&mut self) -> bool {
        std::mem::take(&mut self.reset_pending)
    }

    /// Put back a reset request whose message never reached the server.
    pub(crate) fn restore_reset(&mut self) {
        self.reset_pending = true;
    }

    /// Lend a session to `owner`.
    ///
    /// Multiplexed connections ask their session pool first and fall back
    /// to the primary session when the transport cannot multiplex.
    pub(crate) async fn lease(&mut self, owner: OwnerId) -> Result<SessionLease> {
        if let Some(pool) = &self.sessions {
            match pool.get_session(owner).await {
                Ok(session) => {
                    return Ok(SessionLease::Multiplexed {
                        session,
                        pool: Arc::clone(pool),
                    });
                }
                Err(SessionError::MultiplexingUnsupported) => {
                    tracing::trace!(connection_id = self.id, "transport cannot multiplex, using primary session");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let primary = self.primary.as_mut().ok_or(Error::ConnectionClosed)?;
        if primary.has_pending_data() || primary.attention_pending() {
            tracing::debug!(connection_id = self.id, "draining abandoned response");
            if !primary.deactivate().await {
                return Err(SessionError::Broken.into());
            }
        }
        primary.activate(owner)?;
        Ok(SessionLease::Primary)
    }

    /// Resolve `lease` to its session, alongside the environment.
    pub(crate) fn parts<'s>(&'s mut self, lease: &'s mut SessionLease) -> Result<LeaseParts<'s>> {
        match lease {
            SessionLease::Primary => Ok(LeaseParts {
                session: self.primary.as_mut().ok_or(Error::ConnectionClosed)?,
                state: &mut self.state,
                sessions: self.sessions.as_deref(),
            }),
            SessionLease::Multiplexed { session, pool } => Ok(LeaseParts {
                session,
                state: &mut self.state,
                sessions: Some(&**pool),
            }),
        }
    }

    /// Take back a lease, draining any unread response.
    ///
    /// Returns `false` if the session cannot be reused.
    pub(crate) async fn release(&mut self, lease: SessionLease) -> bool {
        match lease {
            SessionLease::Primary => {
                let Some(session) = self.primary.as_mut() else {
                    return false;
                };
                session.end_operation();
                if let Err(e) = session.remove_owner() {
                    tracing::warn!(connection_id = self.id, error = %e, "primary session released twice");
                }
                if session.has_pending_data() || session.attention_pending() {
                    session.deactivate().await
                } else {
                    !session.is_broken()
                }
            }
            SessionLease::Multiplexed { mut session, pool } => {
                session.end_operation();
                let reusable = !session.is_broken();
                pool.put_session(session).await;
                reusable
            }
        }
    }

    /// Take back a lease without waiting.
    ///
    /// The primary session keeps its pending response; the next lease
    /// drains it. A multiplexed session is returned on a background task.
    pub(crate) fn release_now(&mut self, lease: SessionLease) {
        match lease {
            SessionLease::Primary => {
                if let Some(session) = self.primary.as_mut() {
                    session.end_operation();
                    if let Err(e) = session.remove_owner() {
                        tracing::warn!(connection_id = self.id, error = %e, "primary session released twice");
                    }
                }
            }
            SessionLease::Multiplexed { mut session, pool } => {
                session.end_operation();
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn(async move { pool.put_session(session).await });
                    }
                    Err(_) => {
                        tracing::debug!(
                            connection_id = self.id,
                            "no runtime to return session, dropping it"
                        );
                        session.mark_broken();
                    }
                }
            }
        }
    }
}

#[async_trait]
impl InternalConnection for PhysicalConnection {
    fn is_alive(&self) -> bool {
        self.primary.as_ref().is_some_and(|p| !p.is_broken())
    }

    fn user_instance(&self) -> Option<Arc<str>> {
        self.state.user_instance.clone()
    }

    async fn reset(&mut self) -> std::result::Result<(), PoolError> {
        let primary = self
            .primary
            .as_mut()
            .ok_or_else(|| PoolError::ResetFailed("connection is closed".to_string()))?;
        if !primary.deactivate().await {
            return Err(PoolError::ResetFailed(
                "pending response could not be drained".to_string(),
            ));
        }
        if self.state.transaction.take().is_some() {
            tracing::debug!(connection_id = self.id, "open transaction abandoned by its owner");
        }
        self.state.open_results.end_all_transactions();
        self.reset_pending = true;
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(pool) = self.sessions.take() {
            pool.dispose().await;
        }
        if let Some(primary) = self.primary.take() {
            tracing::debug!(connection_id = self.id, "closing physical connection");
            primary.close().await;
        }
    }
}

impl std::fmt::Debug for PhysicalConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalConnection")
            .field("id", &self.id)
            .field("database", &self.state.database)
            .field("transaction", &self.state.transaction)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use bytes::Bytes;
    use tds_protocol::EnvChangeValue;

    use super::*;

    fn change(env_type: EnvChangeType, new_value: EnvChangeValue) -> EnvChange {
        EnvChange {
            env_type,
            new_value,
            old_value: EnvChangeValue::String(String::new()),
        }
    }

    fn begin(descriptor: u64) -> EnvChange {
        change(
            EnvChangeType::BeginTransaction,
            EnvChangeValue::Binary(Bytes::copy_from_slice(&descriptor.to_le_bytes())),
        )
    }

    fn session() -> SessionState {
        let (client, _server) = tokio::io::duplex(1024);
        SessionState::primary(client)
    }

    #[tokio::test]
    async fn test_packet_size_change_resizes_primary() {
        let mut state = ConnectionState::default();
        let mut session = session();

        state
            .apply(
                &mut session,
                None,
                &change(EnvChangeType::PacketSize, EnvChangeValue::String("8000".into())),
            )
            .unwrap();

        assert_eq!(session.packet_size(), 8000);
    }

    #[tokio::test]
    async fn test_transaction_lifecycle_resets_transacted_count() {
        let mut state = ConnectionState::default();
        let mut session = session();

        state.apply(&mut session, None, &begin(7)).unwrap();
        assert_eq!(state.transaction, Some(7));

        let bucket = state.open_results.open(state.transaction);
        state.open_results.open(None);
        assert_eq!(state.open_results.transacted(7), 1);

        let commit = change(
            EnvChangeType::CommitTransaction,
            EnvChangeValue::Binary(Bytes::new()),
        );
        state.apply(&mut session, None, &commit).unwrap();

        assert_eq!(state.transaction, None);
        assert_eq!(state.open_results.transacted(7), 0);
        assert_eq!(state.open_results.non_transacted(), 1);

        // Closing into a finished transaction is harmless.
        state.open_results.close(bucket);
        assert_eq!(state.open_results.non_transacted(), 1);
    }

    #[tokio::test]
    async fn test_reset_ack_and_user_instance() {
        let mut state = ConnectionState::default();
        let mut session = session();

        let reset = change(EnvChangeType::ResetConnectionAck, EnvChangeValue::String(String::new()));
        assert!(state.apply(&mut session, None, &reset).unwrap());

        let instance = change(
            EnvChangeType::UserInstanceStarted,
            EnvChangeValue::String("\\\\.\\pipe\\LOCALDB#1\\tsql\\query".into()),
        );
        assert!(!state.apply(&mut session, None, &instance).unwrap());
        assert_eq!(
            state.user_instance.as_deref(),
            Some("\\\\.\\pipe\\LOCALDB#1\\tsql\\query")
        );
    }

    #[test]
    fn test_open_results_are_shared_across_clones() {
        let results = OpenResults::default();
        let other = results.clone();

        let bucket = results.open(None);
        assert_eq!(other.non_transacted(), 1);
        other.close(bucket);
        assert_eq!(results.non_transacted(), 0);
    }
}
