//! Pool of multiplexed sessions over one physical connection.
//!
//! Sessions are lent to exactly one owner at a time. Returning a session
//! drains whatever its owner left unread; sessions that cannot be drained
//! are closed instead of being kept.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tds_protocol::packet::{DEFAULT_PACKET_SIZE, validate_packet_size};

use crate::error::SessionError;
use crate::shared::SessionShared;
use crate::state::{DEFAULT_ATTENTION_TIMEOUT, OwnerId, SessionId, SessionRole, SessionState};
use crate::stream::SessionProvider;

/// Idle sessions kept for reuse; extras are closed on return.
pub const MAX_INACTIVE_SESSIONS: usize = 10;

#[derive(Default)]
struct PoolState {
    free: Vec<SessionState>,
    all: Vec<Arc<SessionShared>>,
    active: usize,
    disposed: bool,
}

/// Hands out multiplexed sessions and takes them back.
pub struct SessionPool {
    provider: Arc<dyn SessionProvider>,
    state: Mutex<PoolState>,
    packet_size: AtomicUsize,
    attention_timeout: Duration,
}

impl SessionPool {
    /// Create an empty pool over `provider`.
    pub fn new(provider: Arc<dyn SessionProvider>) -> Self {
        Self {
            provider,
            state: Mutex::new(PoolState::default()),
            packet_size: AtomicUsize::new(DEFAULT_PACKET_SIZE),
            attention_timeout: DEFAULT_ATTENTION_TIMEOUT,
        }
    }

    /// Set the ATTENTION acknowledgment timeout for new sessions.
    #[must_use]
    pub fn with_attention_timeout(mut self, timeout: Duration) -> Self {
        self.attention_timeout = timeout;
        self
    }

    /// Packet size given to new sessions.
    #[must_use]
    pub fn packet_size(&self) -> usize {
        self.packet_size.load(Ordering::Acquire)
    }

    /// Track the physical connection's renegotiated packet size.
    pub fn set_packet_size(&self, size: usize) -> Result<(), SessionError> {
        let size = validate_packet_size(size)?;
        self.packet_size.store(size, Ordering::Release);
        Ok(())
    }

    /// Lend a session to `owner`, reusing an idle one when possible.
    pub async fn get_session(&self, owner: OwnerId) -> Result<SessionState, SessionError> {
        let packet_size = self.packet_size();
        let mut stale = Vec::new();
        let reused = {
            let mut state = self.state.lock();
            if state.disposed {
                return Err(SessionError::PoolDisposed);
            }
            let mut found = None;
            while let Some(session) = state.free.pop() {
                if session.packet_size() == packet_size && !session.is_broken() {
                    found = Some(session);
                    break;
                }
                stale.push(session);
            }
            found
        };
        for session in stale {
            self.close_session(session).await;
        }

        let session = match reused {
            Some(session) => session,
            None => self.open_session(packet_size).await?,
        };

        if let Err(e) = session.activate(owner) {
            self.close_session(session).await;
            return Err(e);
        }
        self.state.lock().active += 1;
        tracing::debug!(
            session_id = session.id().get(),
            owner = owner.get(),
            "session checked out"
        );
        Ok(session)
    }

    async fn open_session(&self, packet_size: usize) -> Result<SessionState, SessionError> {
        let id = SessionId::next();
        let stream = self.provider.open_session(id).await?;
        let session = SessionState::new(id, stream, packet_size, SessionRole::Multiplexed)?
            .with_attention_timeout(self.attention_timeout);

        let disposed = {
            let mut state = self.state.lock();
            if !state.disposed {
                state.all.push(Arc::clone(session.shared()));
            }
            state.disposed
        };
        if disposed {
            session.close().await;
            return Err(SessionError::PoolDisposed);
        }
        Ok(session)
    }

    /// Take a session back from its owner.
    pub async fn put_session(&self, mut session: SessionState) {
        if let Err(e) = session.remove_owner() {
            tracing::warn!(session_id = session.id().get(), error = %e, "session returned without an owner");
        } else {
            let mut state = self.state.lock();
            state.active = state.active.saturating_sub(1);
        }

        let reusable = session.deactivate().await;
        let rejected = if reusable {
            let mut state = self.state.lock();
            if !state.disposed && state.free.len() < MAX_INACTIVE_SESSIONS {
                state.free.push(session);
                None
            } else {
                Some(session)
            }
        } else {
            Some(session)
        };

        if let Some(session) = rejected {
            self.close_session(session).await;
        }
    }

    async fn close_session(&self, session: SessionState) {
        {
            let mut state = self.state.lock();
            state
                .all
                .retain(|shared| !Arc::ptr_eq(shared, session.shared()));
        }
        session.close().await;
    }

    /// Close idle sessions and mark lent ones broken so they are closed
    /// when returned.
    pub async fn dispose(&self) {
        let (free, all) = {
            let mut state = self.state.lock();
            state.disposed = true;
            (
                std::mem::take(&mut state.free),
                std::mem::take(&mut state.all),
            )
        };
        tracing::debug!(idle = free.len(), total = all.len(), "disposing session pool");
        for shared in &all {
            shared.mark_broken();
        }
        for session in free {
            session.close().await;
        }
    }

    /// Sessions currently lent out.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.state.lock().active
    }

    /// Idle sessions ready for reuse.
    #[must_use]
    pub fn inactive_count(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Open sessions, lent or idle.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.state.lock().all.len()
    }

    /// Whether the pool was disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SessionPool")
            .field("active", &state.active)
            .field("inactive", &state.free.len())
            .field("disposed", &state.disposed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::stream::{BoxStream, NoMultiplexing};
    use async_trait::async_trait;
    use tokio::io::DuplexStream;

    /// Opens in-memory sessions and keeps the server ends alive.
    #[derive(Default)]
    struct PipeProvider {
        peers: Mutex<Vec<DuplexStream>>,
    }

    #[async_trait]
    impl SessionProvider for PipeProvider {
        async fn open_session(&self, _id: SessionId) -> Result<BoxStream, SessionError> {
            let (client, server) = tokio::io::duplex(64 * 1024);
            self.peers.lock().push(server);
            Ok(Box::new(client))
        }
    }

    #[tokio::test]
    async fn test_get_and_put_reuses_session() {
        let pool = SessionPool::new(Arc::new(PipeProvider::default()));

        let owner = OwnerId::next();
        let session = pool.get_session(owner).await.unwrap();
        let id = session.id();
        assert_eq!(session.ownership(), crate::state::Ownership::Active(owner));
        assert_eq!(pool.active_count(), 1);

        pool.put_session(session).await;
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.inactive_count(), 1);

        let again = pool.get_session(OwnerId::next()).await.unwrap();
        assert_eq!(again.id(), id);
        assert!(!again.has_pending_data());
        assert!(!again.has_open_result());
    }

    #[tokio::test]
    async fn test_inactive_sessions_are_capped() {
        let pool = SessionPool::new(Arc::new(PipeProvider::default()));

        let mut sessions = Vec::new();
        for _ in 0..MAX_INACTIVE_SESSIONS + 2 {
            sessions.push(pool.get_session(OwnerId::next()).await.unwrap());
        }
        assert_eq!(pool.session_count(), MAX_INACTIVE_SESSIONS + 2);

        for session in sessions {
            pool.put_session(session).await;
        }
        assert_eq!(pool.inactive_count(), MAX_INACTIVE_SESSIONS);
        assert_eq!(pool.session_count(), MAX_INACTIVE_SESSIONS);
    }

    #[tokio::test]
    async fn test_dispose_rejects_new_checkouts() {
        let pool = SessionPool::new(Arc::new(PipeProvider::default()));
        let lent = pool.get_session(OwnerId::next()).await.unwrap();

        pool.dispose().await;
        assert!(pool.is_disposed());
        assert!(lent.is_broken());
        assert!(matches!(
            pool.get_session(OwnerId::next()).await,
            Err(SessionError::PoolDisposed)
        ));

        pool.put_session(lent).await;
        assert_eq!(pool.inactive_count(), 0);
    }

    #[tokio::test]
    async fn test_packet_size_change_retires_idle_sessions() {
        let pool = SessionPool::new(Arc::new(PipeProvider::default()));
        let session = pool.get_session(OwnerId::next()).await.unwrap();
        let old = session.id();
        pool.put_session(session).await;

        pool.set_packet_size(8192).unwrap();
        let fresh = pool.get_session(OwnerId::next()).await.unwrap();
        assert_ne!(fresh.id(), old);
        assert_eq!(fresh.packet_size(), 8192);
        assert!(pool.set_packet_size(100).is_err());
    }

    #[tokio::test]
    async fn test_provider_without_multiplexing() {
        let pool = SessionPool::new(Arc::new(NoMultiplexing));
        assert!(matches!(
            pool.get_session(OwnerId::next()).await,
            Err(SessionError::MultiplexingUnsupported)
        ));
    }
}
