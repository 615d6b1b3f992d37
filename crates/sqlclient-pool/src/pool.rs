//! Connection pool for one pool key and identity.
//!
//! Capacity is a semaphore with one permit per connection up to the
//! group's max pool size. Idle connections are kept on a LIFO stack so the
//! most recently used ones are handed out first.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::config::{PoolGroupOptions, PoolIdentity, PoolKey};
use crate::error::PoolError;
use crate::factory::create_internal_connection;
use crate::lifecycle::{Connector, InternalConnection};

/// First error-wait window after a failed connect.
pub const BLOCKING_PERIOD_INITIAL: Duration = Duration::from_secs(5);

/// Longest error-wait window.
pub const BLOCKING_PERIOD_MAX: Duration = Duration::from_secs(60);

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Status information about a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Idle connections available.
    pub available: u32,
    /// Connections currently lent out.
    pub in_use: u32,
    /// Open connections.
    pub total: u32,
    /// Maximum allowed connections.
    pub max: u32,
}

struct IdleConnection<T> {
    conn: T,
    created_at: Instant,
}

/// Fail-fast window after a connect failure.
#[derive(Debug)]
struct BlockingPeriod {
    error: Option<PoolError>,
    until: Option<Instant>,
    wait: Duration,
}

impl Default for BlockingPeriod {
    fn default() -> Self {
        Self {
            error: None,
            until: None,
            wait: BLOCKING_PERIOD_INITIAL,
        }
    }
}

impl BlockingPeriod {
    fn check(&self, now: Instant) -> Option<PoolError> {
        match (&self.error, self.until) {
            (Some(error), Some(until)) if now < until => Some(error.clone()),
            _ => None,
        }
    }

    fn enter(&mut self, error: PoolError, now: Instant) {
        self.until = Some(now + self.wait);
        self.error = Some(error);
        self.wait = (self.wait * 2).min(BLOCKING_PERIOD_MAX);
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Pool of physical connections sharing one key and identity.
pub struct ConnectionPool<C: Connector> {
    id: u64,
    key: PoolKey,
    identity: PoolIdentity,
    options: PoolGroupOptions,
    connector: Arc<C>,
    connect_options: Arc<C::Options>,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<IdleConnection<C::Connection>>>,
    shutting_down: AtomicBool,
    total: AtomicUsize,
    blocking: Mutex<BlockingPeriod>,
    user_instance: Mutex<Option<Arc<str>>>,
}

impl<C: Connector> ConnectionPool<C> {
    pub(crate) fn new(
        key: PoolKey,
        identity: PoolIdentity,
        options: PoolGroupOptions,
        connector: Arc<C>,
        connect_options: Arc<C::Options>,
    ) -> Arc<Self> {
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            pool_id = id,
            key = key.redacted(),
            max = options.max_pool_size,
            "connection pool created"
        );
        Arc::new(Self {
            id,
            permits: Arc::new(Semaphore::new(options.max_pool_size as usize)),
            key,
            identity,
            options,
            connector,
            connect_options,
            idle: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
            total: AtomicUsize::new(0),
            blocking: Mutex::new(BlockingPeriod::default()),
            user_instance: Mutex::new(None),
        })
    }

    /// Pool identifier, unique within the process.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Key of the owning pool group.
    #[must_use]
    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// Identity this pool serves.
    #[must_use]
    pub fn identity(&self) -> &PoolIdentity {
        &self.identity
    }

    /// Whether the pool accepts checkouts.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.shutting_down.load(Ordering::Acquire)
    }

    /// User instance name discovered by an earlier connect.
    #[must_use]
    pub fn user_instance(&self) -> Option<Arc<str>> {
        self.user_instance.lock().clone()
    }

    /// Current counts.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let max = self.options.max_pool_size;
        let in_use = if self.is_running() {
            max.saturating_sub(self.permits.available_permits() as u32)
        } else {
            0
        };
        PoolStatus {
            available: self.idle.lock().len() as u32,
            in_use,
            total: self.total.load(Ordering::Acquire) as u32,
            max,
        }
    }

    /// Whether the pool holds no connections at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total.load(Ordering::Acquire) == 0
    }

    /// Whether the pool holds no connections and no checkout is in flight.
    #[must_use]
    pub fn is_unused(&self) -> bool {
        self.is_empty() && self.permits.available_permits() >= self.options.max_pool_size as usize
    }

    /// Check out a connection, waiting up to `timeout` for capacity.
    ///
    /// Returns `Ok(None)` when the pool was shut down concurrently, so the
    /// caller can look the pool up again. A pool that stays full for the
    /// whole wait fails with [`PoolError::PoolTimeout`].
    pub async fn get(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> Result<Option<PooledConnection<C>>, PoolError> {
        if !self.is_running() {
            return Ok(None);
        }
        if let Some(error) = self.blocking.lock().check(Instant::now()) {
            tracing::debug!(pool_id = self.id, "pool in blocking period, failing fast");
            return Err(error);
        }

        let deadline = Instant::now() + timeout;
        let acquire = Arc::clone(&self.permits).acquire_owned();
        let permit = match tokio::time::timeout_at(deadline, acquire).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => return Ok(None),
            Err(_elapsed) => {
                if !self.is_running() {
                    return Ok(None);
                }
                tracing::debug!(pool_id = self.id, ?timeout, "pool exhausted");
                return Err(PoolError::PoolTimeout(timeout));
            }
        };
        if !self.is_running() {
            return Ok(None);
        }

        while let Some(idle) = self.pop_idle() {
            if idle.conn.is_alive() && !self.is_expired(idle.created_at) {
                tracing::trace!(pool_id = self.id, "reusing idle connection");
                return Ok(Some(PooledConnection::new(
                    Arc::clone(self),
                    idle.conn,
                    idle.created_at,
                    permit,
                )));
            }
            self.discard(idle.conn).await;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let conn = self.create(remaining).await?;
        Ok(Some(PooledConnection::new(
            Arc::clone(self),
            conn,
            Instant::now(),
            permit,
        )))
    }

    fn pop_idle(&self) -> Option<IdleConnection<C::Connection>> {
        self.idle.lock().pop()
    }

    fn is_expired(&self, created_at: Instant) -> bool {
        let limit = self.options.load_balance_timeout;
        !limit.is_zero() && created_at.elapsed() > limit
    }

    async fn create(&self, timeout: Duration) -> Result<C::Connection, PoolError> {
        let created = create_internal_connection(
            self.connector.as_ref(),
            &self.connect_options,
            Some(&self.user_instance),
            timeout,
        )
        .await;

        match created {
            Ok(conn) => {
                self.blocking.lock().clear();
                let total = self.total.fetch_add(1, Ordering::AcqRel) + 1;
                tracing::debug!(pool_id = self.id, total, "pooled connection created");
                Ok(conn)
            }
            Err(e) => {
                tracing::debug!(pool_id = self.id, error = %e, "pooled connect failed, entering blocking period");
                self.blocking.lock().enter(e.clone(), Instant::now());
                Err(e)
            }
        }
    }

    async fn discard(&self, mut conn: C::Connection) {
        self.total.fetch_sub(1, Ordering::AcqRel);
        conn.close().await;
        tracing::trace!(pool_id = self.id, "pooled connection closed");
    }

    async fn return_connection(&self, mut conn: C::Connection, created_at: Instant) {
        if !self.is_running() || !conn.is_alive() || self.is_expired(created_at) {
            self.discard(conn).await;
            return;
        }
        if let Err(e) = conn.reset().await {
            tracing::debug!(pool_id = self.id, error = %e, "reset failed, discarding connection");
            self.discard(conn).await;
            return;
        }

        self.idle.lock().push(IdleConnection { conn, created_at });
        if !self.is_running() {
            self.close_idle().await;
        }
    }

    async fn close_idle(&self) {
        let idle = std::mem::take(&mut *self.idle.lock());
        for entry in idle {
            self.discard(entry.conn).await;
        }
    }

    /// Stop handing out connections and close the idle ones.
    ///
    /// Lent connections are closed as they come back.
    pub async fn shutdown(&self) {
        if self.stop() {
            self.close_idle().await;
        }
    }

    /// Stop handing out connections without waiting for idle ones to close.
    ///
    /// Returns `false` if the pool was already stopped. The next prune
    /// closes whatever is idle.
    pub(crate) fn stop(&self) -> bool {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.permits.close();
        tracing::debug!(pool_id = self.id, "connection pool shutting down");
        true
    }

    /// Close dead or over-age idle connections and top the pool up to its
    /// minimum size.
    pub(crate) async fn prune(&self) {
        if !self.is_running() {
            self.close_idle().await;
            return;
        }

        let stale: Vec<_> = {
            let mut idle = self.idle.lock();
            let (keep, stale): (Vec<_>, Vec<_>) = idle
                .drain(..)
                .partition(|entry| entry.conn.is_alive() && !self.is_expired(entry.created_at));
            *idle = keep;
            stale
        };
        if !stale.is_empty() {
            tracing::debug!(pool_id = self.id, closed = stale.len(), "pruning idle connections");
        }
        for entry in stale {
            self.discard(entry.conn).await;
        }

        let min = self.options.min_pool_size as usize;
        while self.is_running() && self.total.load(Ordering::Acquire) < min {
            if self.blocking.lock().check(Instant::now()).is_some() {
                break;
            }
            match self.create(self.options.creation_timeout).await {
                Ok(conn) => self.idle.lock().push(IdleConnection {
                    conn,
                    created_at: Instant::now(),
                }),
                Err(_) => break,
            }
        }
    }
}

impl<C: Connector> std::fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("identity", &self.identity)
            .field("running", &self.is_running())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// A connection lent by a pool.
///
/// Return it with [`release`](Self::release). Dropping it returns it from
/// a spawned task instead, which needs a live Tokio runtime.
pub struct PooledConnection<C: Connector> {
    conn: Option<C::Connection>,
    pool: Arc<ConnectionPool<C>>,
    created_at: Instant,
    permit: Option<OwnedSemaphorePermit>,
}

impl<C: Connector> PooledConnection<C> {
    fn new(
        pool: Arc<ConnectionPool<C>>,
        conn: C::Connection,
        created_at: Instant,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            conn: Some(conn),
            pool,
            created_at,
            permit: Some(permit),
        }
    }

    /// Pool this connection belongs to.
    #[must_use]
    pub fn pool(&self) -> &Arc<ConnectionPool<C>> {
        &self.pool
    }

    /// When the physical connection was opened.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Return the connection to its pool.
    pub async fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.return_connection(conn, self.created_at).await;
        }
        self.permit.take();
    }

    /// Detach the connection from the pool.
    ///
    /// The pool forgets it and frees its slot.
    #[must_use]
    pub fn detach(mut self) -> Option<C::Connection> {
        self.pool.total.fetch_sub(1, Ordering::AcqRel);
        self.permit.take();
        self.conn.take()
    }
}

impl<C: Connector> Deref for PooledConnection<C> {
    type Target = C::Connection;

    fn deref(&self) -> &Self::Target {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<C: Connector> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let pool = Arc::clone(&self.pool);
        let created_at = self.created_at;
        let permit = self.permit.take();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    pool.return_connection(conn, created_at).await;
                    drop(permit);
                });
            }
            Err(_) => {
                pool.total.fetch_sub(1, Ordering::AcqRel);
                tracing::warn!(
                    pool_id = pool.id,
                    "no runtime available, pooled connection dropped without being returned"
                );
            }
        }
    }
}

impl<C: Connector> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool_id", &self.pool.id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_blocking_period_doubles_to_cap() {
        let start = Instant::now();
        let mut period = BlockingPeriod::default();
        assert!(period.check(start).is_none());

        let err = PoolError::ConnectTimeout(Duration::from_secs(1));
        let mut expected = BLOCKING_PERIOD_INITIAL;
        for _ in 0..6 {
            period.enter(err.clone(), start);
            assert_eq!(period.until, Some(start + expected));
            expected = (expected * 2).min(BLOCKING_PERIOD_MAX);
        }
        assert_eq!(period.wait, BLOCKING_PERIOD_MAX);
        assert!(period.check(start).is_some());
        assert!(period.check(start + BLOCKING_PERIOD_MAX).is_none());

        period.clear();
        assert!(period.check(start).is_none());
        assert_eq!(period.wait, BLOCKING_PERIOD_INITIAL);
    }
}
