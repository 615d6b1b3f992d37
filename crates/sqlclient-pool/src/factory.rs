//! Connection factory.
//!
//! The factory maps pool keys to pool groups, checks connections out of
//! pools with a bounded retry when a pool shuts down underneath the caller,
//! throttles non-pooled opens through a fixed set of task slots, and
//! releases retired pools and groups from a periodic prune timer rather
//! than under its own locks.

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::{PoolGroupOptions, PoolIdentity, PoolKey};
use crate::error::PoolError;
use crate::group::PoolGroup;
use crate::lifecycle::{ConnectTarget, Connector, InternalConnection, OpenMode};
use crate::pool::{ConnectionPool, PooledConnection};

/// Checkout retries after a pool shuts down mid-checkout.
pub const MAX_POOL_RETRIES: u32 = 10;

/// Delay before the first checkout retry; doubles on each retry.
pub const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Delay before the first prune tick.
pub const PRUNING_DUE_TIME: Duration = Duration::from_secs(4 * 60);

/// Interval between prune ticks.
pub const PRUNING_PERIOD: Duration = Duration::from_secs(30);

/// Sleeps taken by the checkout retry loop, in order.
pub fn retry_backoff() -> impl Iterator<Item = Duration> {
    (0..MAX_POOL_RETRIES).map(|attempt| INITIAL_RETRY_DELAY * (1u32 << attempt))
}

/// A connection handed out by the factory.
pub enum FactoryConnection<C: Connector> {
    /// Bound to a pool; returned there on release.
    Pooled(PooledConnection<C>),
    /// Owned by the caller; closed on release.
    NonPooled(C::Connection),
}

impl<C: Connector> FactoryConnection<C> {
    /// The physical connection.
    #[must_use]
    pub fn connection(&self) -> &C::Connection {
        match self {
            Self::Pooled(conn) => &**conn,
            Self::NonPooled(conn) => conn,
        }
    }

    /// The physical connection, mutably.
    pub fn connection_mut(&mut self) -> &mut C::Connection {
        match self {
            Self::Pooled(conn) => &mut **conn,
            Self::NonPooled(conn) => conn,
        }
    }

    /// Whether the connection came from a pool.
    #[must_use]
    pub fn is_pooled(&self) -> bool {
        matches!(self, Self::Pooled(_))
    }

    /// Return a pooled connection, or close a non-pooled one.
    pub async fn release(self) {
        match self {
            Self::Pooled(conn) => conn.release().await,
            Self::NonPooled(mut conn) => conn.close().await,
        }
    }

    /// Close the connection without returning it to a pool.
    pub async fn discard(self) {
        let conn = match self {
            Self::Pooled(conn) => conn.detach(),
            Self::NonPooled(conn) => Some(conn),
        };
        if let Some(mut conn) = conn {
            conn.close().await;
        }
    }
}

impl<C: Connector> std::fmt::Debug for FactoryConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pooled(conn) => f.debug_tuple("Pooled").field(conn).finish(),
            Self::NonPooled(_) => f.write_str("NonPooled"),
        }
    }
}

/// Everything the factory needs to produce one connection.
pub struct ConnectionRequest<C: Connector> {
    /// Pool group key.
    pub key: PoolKey,
    /// Pool group settings.
    pub options: PoolGroupOptions,
    /// Options handed to the connector.
    pub connect_options: Arc<C::Options>,
    /// Caller identity.
    pub identity: PoolIdentity,
    /// How the caller waits.
    pub mode: OpenMode,
    /// Time allowed to obtain the connection.
    pub timeout: Duration,
}

impl<C: Connector> ConnectionRequest<C> {
    /// Create a request using the group's creation timeout.
    pub fn new(key: PoolKey, options: PoolGroupOptions, connect_options: Arc<C::Options>) -> Self {
        Self {
            key,
            timeout: options.creation_timeout,
            options,
            connect_options,
            identity: PoolIdentity::shared(),
            mode: OpenMode::Sync,
        }
    }

    /// Set the caller identity.
    #[must_use]
    pub fn with_identity(mut self, identity: PoolIdentity) -> Self {
        self.identity = identity;
        self
    }

    /// Set how the caller waits.
    #[must_use]
    pub fn with_mode(mut self, mode: OpenMode) -> Self {
        self.mode = mode;
        self
    }

    /// Override the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl<C: Connector> Clone for ConnectionRequest<C> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            options: self.options.clone(),
            connect_options: Arc::clone(&self.connect_options),
            identity: self.identity.clone(),
            mode: self.mode,
            timeout: self.timeout,
        }
    }
}

/// Open a physical connection, running the user-instance handshake when
/// the options ask for one.
///
/// Phase one logs in to the parent instance to learn the user instance
/// name; phase two connects to that instance. A name cached in `cache`
/// skips phase one.
pub(crate) async fn create_internal_connection<C: Connector>(
    connector: &C,
    options: &C::Options,
    cache: Option<&Mutex<Option<Arc<str>>>>,
    timeout: Duration,
) -> Result<C::Connection, PoolError> {
    let deadline = Instant::now() + timeout;
    if !connector.wants_user_instance(options) {
        return connect_before(connector, options, ConnectTarget::Server, deadline, timeout).await;
    }

    let cached = cache.and_then(|cache| cache.lock().clone());
    let instance = match cached {
        Some(name) => name,
        None => {
            let mut parent = connect_before(
                connector,
                options,
                ConnectTarget::UserInstanceDiscovery,
                deadline,
                timeout,
            )
            .await?;
            let name = parent.user_instance();
            parent.close().await;
            let name = name.ok_or(PoolError::UserInstanceUnavailable)?;
            tracing::debug!(instance = %name, "user instance discovered");
            if let Some(cache) = cache {
                *cache.lock() = Some(Arc::clone(&name));
            }
            name
        }
    };

    connect_before(
        connector,
        options,
        ConnectTarget::UserInstance(instance),
        deadline,
        timeout,
    )
    .await
}

async fn connect_before<C: Connector>(
    connector: &C,
    options: &C::Options,
    target: ConnectTarget,
    deadline: Instant,
    timeout: Duration,
) -> Result<C::Connection, PoolError> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Err(PoolError::ConnectTimeout(timeout));
    }
    tokio::time::timeout_at(deadline, connector.connect(options, target, remaining))
        .await
        .map_err(|_| PoolError::ConnectTimeout(timeout))?
}

/// Round-robin slots that serialize non-pooled opens.
///
/// Each slot holds the last task scheduled on it; a new task waits for its
/// predecessor, so at most one open per slot runs at a time.
struct ThrottleSlots {
    slots: Mutex<Vec<Option<JoinHandle<()>>>>,
    next: AtomicUsize,
}

impl ThrottleSlots {
    fn new(count: usize) -> Self {
        Self {
            slots: Mutex::new((0..count.max(1)).map(|_| None).collect()),
            next: AtomicUsize::new(0),
        }
    }

    fn len(&self) -> usize {
        self.slots.lock().len()
    }

    fn schedule<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut slots = self.slots.lock();
        let index = self.next.fetch_add(1, Ordering::Relaxed) % slots.len();
        let previous = slots[index].take();
        slots[index] = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            task.await;
        }));
    }

    fn abort_all(&self) {
        for handle in self.slots.lock().iter_mut().filter_map(Option::take) {
            handle.abort();
        }
    }
}

/// Produces pooled and non-pooled connections.
pub struct ConnectionFactory<C: Connector> {
    connector: Arc<C>,
    groups: RwLock<HashMap<PoolKey, Arc<PoolGroup<C>>>>,
    pools_to_release: Mutex<Vec<Arc<ConnectionPool<C>>>>,
    groups_to_release: Mutex<Vec<Arc<PoolGroup<C>>>>,
    throttle: ThrottleSlots,
    prune_task: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl<C: Connector> ConnectionFactory<C> {
    /// Create a factory; the prune timer starts when a Tokio runtime is
    /// available.
    pub fn new(connector: C) -> Arc<Self> {
        let slots = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);
        let factory = Arc::new(Self {
            connector: Arc::new(connector),
            groups: RwLock::new(HashMap::new()),
            pools_to_release: Mutex::new(Vec::new()),
            groups_to_release: Mutex::new(Vec::new()),
            throttle: ThrottleSlots::new(slots),
            prune_task: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        });
        factory.start_prune_timer();
        factory
    }

    fn start_prune_timer(self: &Arc<Self>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("no runtime available, prune timer not started");
            return;
        };
        let factory: Weak<Self> = Arc::downgrade(self);
        let task = handle.spawn(async move {
            let mut ticks =
                tokio::time::interval_at(Instant::now() + PRUNING_DUE_TIME, PRUNING_PERIOD);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                let Some(factory) = factory.upgrade() else {
                    break;
                };
                factory.prune_now().await;
            }
        });
        *self.prune_task.lock() = Some(task);
    }

    /// The connector used for every connection.
    #[must_use]
    pub fn connector(&self) -> &Arc<C> {
        &self.connector
    }

    /// Number of non-pooled throttle slots.
    #[must_use]
    pub fn throttle_slots(&self) -> usize {
        self.throttle.len()
    }

    /// Number of live pool groups.
    #[must_use]
    pub fn pool_group_count(&self) -> usize {
        self.groups.read().len()
    }

    /// Pools and groups waiting for the pruner to release them.
    #[must_use]
    pub fn pending_release(&self) -> (usize, usize) {
        (
            self.pools_to_release.lock().len(),
            self.groups_to_release.lock().len(),
        )
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Look up the group for `key`, replacing a disabled group with a fresh
    /// one built from the same options.
    pub fn get_pool_group(&self, key: &PoolKey, options: &PoolGroupOptions) -> Arc<PoolGroup<C>> {
        if let Some(group) = self.groups.read().get(key) {
            if !group.is_disabled() {
                return Arc::clone(group);
            }
        }

        let mut groups = self.groups.write();
        if let Some(group) = groups.get(key) {
            if !group.is_disabled() {
                return Arc::clone(group);
            }
        }
        let options = match groups.remove(key) {
            Some(disabled) => {
                tracing::debug!(key = key.redacted(), "rebuilding disabled pool group");
                let options = disabled.options().clone();
                let retired = disabled.take_pools();
                for pool in &retired {
                    pool.stop();
                }
                self.pools_to_release.lock().extend(retired);
                self.groups_to_release.lock().push(disabled);
                options
            }
            None => options.clone(),
        };
        let group = PoolGroup::new(key.clone(), options);
        groups.insert(key.clone(), Arc::clone(&group));
        group
    }

    /// The pool serving `request`, or `None` when pooling is off.
    pub fn get_connection_pool(
        &self,
        request: &ConnectionRequest<C>,
    ) -> Option<Arc<ConnectionPool<C>>> {
        if !request.options.pooling {
            return None;
        }
        loop {
            let group = self.get_pool_group(&request.key, &request.options);
            if let Some(pool) = group.get_or_create_pool(
                &request.identity,
                &self.connector,
                &request.connect_options,
            ) {
                return Some(pool);
            }
        }
    }

    /// Obtain a connection for `request`.
    ///
    /// Pooled requests that find their pool shut down retry with a
    /// 1, 2, 4 ... ms backoff, at most [`MAX_POOL_RETRIES`] times, then fail
    /// with [`PoolError::PoolTimeout`]. Sync callers sleep on their own
    /// thread between retries. Non-pooled async requests are queued on the
    /// throttle slots and fail with [`PoolError::NonPooledOpenTimeout`] if
    /// they do not complete in time.
    pub async fn try_get_connection(
        &self,
        request: &ConnectionRequest<C>,
    ) -> Result<FactoryConnection<C>, PoolError> {
        if self.is_shut_down() {
            return Err(PoolError::FactoryShutdown);
        }

        let mut backoff = retry_backoff();
        loop {
            let Some(pool) = self.get_connection_pool(request) else {
                let conn = self.open_non_pooled(request).await?;
                return Ok(FactoryConnection::NonPooled(conn));
            };

            if let Some(conn) = pool.get(request.timeout).await? {
                return Ok(FactoryConnection::Pooled(conn));
            }

            let Some(delay) = backoff.next() else {
                tracing::debug!(
                    pool_id = pool.id(),
                    "pool kept shutting down during checkout, giving up"
                );
                return Err(PoolError::PoolTimeout(request.timeout));
            };
            tracing::trace!(
                pool_id = pool.id(),
                delay_ms = delay.as_millis() as u64,
                "pool shut down during checkout, retrying"
            );
            match request.mode {
                OpenMode::Sync => std::thread::sleep(delay),
                OpenMode::Async => tokio::time::sleep(delay).await,
            }
        }
    }

    /// Close `old` and obtain a replacement for `request`.
    pub async fn replace_connection(
        &self,
        old: FactoryConnection<C>,
        request: &ConnectionRequest<C>,
    ) -> Result<FactoryConnection<C>, PoolError> {
        old.discard().await;
        self.try_get_connection(request).await
    }

    async fn open_non_pooled(
        &self,
        request: &ConnectionRequest<C>,
    ) -> Result<C::Connection, PoolError> {
        let timeout = request.timeout;
        if request.mode == OpenMode::Sync {
            return create_internal_connection(
                self.connector.as_ref(),
                &request.connect_options,
                None,
                timeout,
            )
            .await;
        }

        let (tx, rx) = oneshot::channel();
        let connector = Arc::clone(&self.connector);
        let options = Arc::clone(&request.connect_options);
        self.throttle.schedule(async move {
            let result = create_internal_connection(connector.as_ref(), &options, None, timeout).await;
            if let Err(Ok(mut orphan)) = tx.send(result) {
                tracing::debug!("non-pooled open finished after its caller gave up");
                orphan.close().await;
            }
        });

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_dropped)) => Err(PoolError::FactoryShutdown),
            Err(_elapsed) => {
                tracing::debug!(?timeout, "non-pooled open throttled past its timeout");
                Err(PoolError::NonPooledOpenTimeout(timeout))
            }
        }
    }

    /// Shut down every pool of `key`; lent connections close when returned.
    pub async fn clear_pool(&self, key: &PoolKey) {
        let group = self.groups.read().get(key).cloned();
        if let Some(group) = group {
            tracing::debug!(key = key.redacted(), "clearing pools");
            self.release_pools(group.take_pools()).await;
        }
    }

    /// Shut down every pool of every group.
    pub async fn clear_all_pools(&self) {
        let groups: Vec<_> = self.groups.read().values().cloned().collect();
        for group in groups {
            self.release_pools(group.take_pools()).await;
        }
    }

    async fn release_pools(&self, pools: Vec<Arc<ConnectionPool<C>>>) {
        for pool in pools {
            pool.shutdown().await;
            self.pools_to_release.lock().push(pool);
        }
    }

    /// Run one prune tick now.
    ///
    /// Releases drained pools and retired groups queued earlier, prunes idle
    /// connections, and ages every group one step toward disabled.
    pub async fn prune_now(&self) {
        let queued = std::mem::take(&mut *self.pools_to_release.lock());
        let mut still_open = Vec::new();
        for pool in queued {
            pool.prune().await;
            if pool.is_empty() {
                tracing::debug!(pool_id = pool.id(), "pool released");
            } else {
                still_open.push(pool);
            }
        }
        self.pools_to_release.lock().extend(still_open);
        self.groups_to_release
            .lock()
            .retain(|group| group.pool_count() > 0);

        let groups: Vec<_> = self.groups.read().values().cloned().collect();
        for group in groups {
            for pool in group.pools() {
                pool.prune().await;
            }
            let (released, disabled) = group.prune();
            self.release_pools(released).await;
            if disabled {
                let mut map = self.groups.write();
                if map
                    .get(group.key())
                    .is_some_and(|current| Arc::ptr_eq(current, &group))
                {
                    map.remove(group.key());
                }
                drop(map);
                self.groups_to_release.lock().push(group);
            }
        }
        tracing::trace!(groups = self.pool_group_count(), "prune tick complete");
    }

    /// Stop the prune timer and shut down every pool.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.prune_task.lock().take() {
            task.abort();
        }
        self.throttle.abort_all();
        self.clear_all_pools().await;
        let groups: Vec<_> = self.groups.write().drain().map(|(_, group)| group).collect();
        for group in groups {
            group.disable();
        }
        tracing::debug!("connection factory shut down");
    }

    #[cfg(test)]
    pub(crate) fn disable_group(&self, key: &PoolKey) {
        if let Some(group) = self.groups.read().get(key) {
            group.disable();
        }
    }
}

impl<C: Connector> Drop for ConnectionFactory<C> {
    fn drop(&mut self) {
        if let Some(task) = self.prune_task.lock().take() {
            task.abort();
        }
    }
}

impl<C: Connector> std::fmt::Debug for ConnectionFactory<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionFactory")
            .field("groups", &self.pool_group_count())
            .field("throttle_slots", &self.throttle_slots())
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::group::PoolGroupState;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct CountingConnector {
        opened: AtomicU32,
    }

    struct TestConnection;

    #[async_trait]
    impl InternalConnection for TestConnection {
        fn is_alive(&self) -> bool {
            true
        }

        fn user_instance(&self) -> Option<Arc<str>> {
            None
        }

        async fn reset(&mut self) -> Result<(), PoolError> {
            Ok(())
        }

        async fn close(&mut self) {}
    }

    #[async_trait]
    impl Connector for CountingConnector {
        type Options = ();
        type Connection = TestConnection;

        fn wants_user_instance(&self, _options: &()) -> bool {
            false
        }

        async fn connect(
            &self,
            _options: &(),
            _target: ConnectTarget,
            _timeout: Duration,
        ) -> Result<TestConnection, PoolError> {
            self.opened.fetch_add(1, Ordering::Relaxed);
            Ok(TestConnection)
        }
    }

    fn request() -> ConnectionRequest<CountingConnector> {
        ConnectionRequest::new(
            PoolKey::new("server=a", "server=a"),
            PoolGroupOptions::new().with_max_pool_size(4),
            Arc::new(()),
        )
        .with_mode(OpenMode::Async)
    }

    #[test]
    fn test_retry_backoff_schedule() {
        let delays: Vec<_> = retry_backoff().collect();
        assert_eq!(delays.len(), 10);
        assert_eq!(delays[0], Duration::from_millis(1));
        assert_eq!(delays[9], Duration::from_millis(512));
        assert_eq!(
            delays.iter().sum::<Duration>(),
            Duration::from_millis(1023)
        );
    }

    #[tokio::test]
    async fn test_disabled_group_is_rebuilt_with_same_options() {
        let factory = ConnectionFactory::new(CountingConnector::default());
        let request = request();

        let first = factory.get_pool_group(&request.key, &request.options);
        factory.disable_group(&request.key);
        assert_eq!(first.state(), PoolGroupState::Disabled);

        let conn = factory.try_get_connection(&request).await.unwrap();
        assert!(conn.is_pooled());

        let rebuilt = factory.get_pool_group(&request.key, &request.options);
        assert!(!Arc::ptr_eq(&first, &rebuilt));
        assert_eq!(rebuilt.state(), PoolGroupState::Active);
        assert_eq!(rebuilt.options(), first.options());
        assert_eq!(factory.pending_release().1, 1);
        conn.release().await;
    }

    #[tokio::test]
    async fn test_rebuilt_group_stops_pools_of_disabled_group() {
        let factory = ConnectionFactory::new(CountingConnector::default());
        let request = request();

        let conn = factory.try_get_connection(&request).await.unwrap();
        conn.release().await;
        let old_pool = factory.get_connection_pool(&request).unwrap();
        assert_eq!(old_pool.status().available, 1);

        factory.disable_group(&request.key);
        let conn = factory.try_get_connection(&request).await.unwrap();
        assert!(!old_pool.is_running());
        assert_eq!(factory.pending_release(), (1, 1));
        assert_eq!(factory.connector().opened.load(Ordering::Relaxed), 2);

        // The next prune closes the idle connection and drops both queues.
        factory.prune_now().await;
        assert!(old_pool.is_empty());
        assert_eq!(factory.pending_release(), (0, 0));
        conn.release().await;
    }

    #[tokio::test]
    async fn test_prune_ages_empty_group_to_disabled() {
        let factory = ConnectionFactory::new(CountingConnector::default());
        let request = request();
        let group = factory.get_pool_group(&request.key, &request.options);

        factory.prune_now().await;
        assert_eq!(group.state(), PoolGroupState::Idle);
        factory.prune_now().await;
        assert_eq!(group.state(), PoolGroupState::Disabled);
        assert_eq!(factory.pool_group_count(), 0);
    }

    #[tokio::test]
    async fn test_throttle_slots_match_parallelism() {
        let factory = ConnectionFactory::new(CountingConnector::default());
        let expected = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);
        assert_eq!(factory.throttle_slots(), expected);
    }
}
