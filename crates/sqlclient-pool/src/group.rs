//! Pool groups: every pool sharing one key.
//!
//! A group moves `Active -> Idle` when the pruner finds it without pools and
//! `Idle -> Disabled` on the next tick if it is still empty. A disabled
//! group never hands out pools again; the factory replaces it with a fresh
//! group built from the same options.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{PoolGroupOptions, PoolIdentity, PoolKey};
use crate::lifecycle::Connector;
use crate::pool::ConnectionPool;

/// Lifecycle state of a pool group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolGroupState {
    /// Has, or may create, pools.
    Active,
    /// Found empty by the last prune.
    Idle,
    /// Retired; must be replaced.
    Disabled,
}

struct GroupInner<C: Connector> {
    state: PoolGroupState,
    pools: HashMap<PoolIdentity, Arc<ConnectionPool<C>>>,
}

/// Pools that share one normalized connection key.
pub struct PoolGroup<C: Connector> {
    key: PoolKey,
    options: PoolGroupOptions,
    inner: Mutex<GroupInner<C>>,
}

impl<C: Connector> PoolGroup<C> {
    pub(crate) fn new(key: PoolKey, options: PoolGroupOptions) -> Arc<Self> {
        tracing::debug!(key = key.redacted(), "pool group created");
        Arc::new(Self {
            key,
            options,
            inner: Mutex::new(GroupInner {
                state: PoolGroupState::Active,
                pools: HashMap::new(),
            }),
        })
    }

    /// Group key.
    #[must_use]
    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// Options shared by the group's pools.
    #[must_use]
    pub fn options(&self) -> &PoolGroupOptions {
        &self.options
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> PoolGroupState {
        self.inner.lock().state
    }

    /// Whether the group is disabled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.state() == PoolGroupState::Disabled
    }

    /// Number of pools in the group.
    #[must_use]
    pub fn pool_count(&self) -> usize {
        self.inner.lock().pools.len()
    }

    /// Find or create the pool for `identity`.
    ///
    /// Returns `None` once the group is disabled.
    pub(crate) fn get_or_create_pool(
        &self,
        identity: &PoolIdentity,
        connector: &Arc<C>,
        connect_options: &Arc<C::Options>,
    ) -> Option<Arc<ConnectionPool<C>>> {
        let identity = if self.options.pool_by_identity {
            identity.clone()
        } else {
            PoolIdentity::shared()
        };

        let mut inner = self.inner.lock();
        if inner.state == PoolGroupState::Disabled {
            return None;
        }
        inner.state = PoolGroupState::Active;
        let pool = inner.pools.entry(identity.clone()).or_insert_with(|| {
            ConnectionPool::new(
                self.key.clone(),
                identity,
                self.options.clone(),
                Arc::clone(connector),
                Arc::clone(connect_options),
            )
        });
        Some(Arc::clone(pool))
    }

    /// Remove every pool, returning them for shutdown.
    pub(crate) fn take_pools(&self) -> Vec<Arc<ConnectionPool<C>>> {
        self.inner.lock().pools.drain().map(|(_, pool)| pool).collect()
    }

    /// Retire the group.
    pub(crate) fn disable(&self) {
        let mut inner = self.inner.lock();
        if inner.state != PoolGroupState::Disabled {
            inner.state = PoolGroupState::Disabled;
            tracing::debug!(key = self.key.redacted(), "pool group disabled");
        }
    }

    /// Age the group one prune tick.
    ///
    /// Empty pools are removed and returned for release; returns whether
    /// the group is now disabled.
    pub(crate) fn prune(&self) -> (Vec<Arc<ConnectionPool<C>>>, bool) {
        let mut inner = self.inner.lock();
        let empty: Vec<PoolIdentity> = inner
            .pools
            .iter()
            .filter(|(_, pool)| pool.is_unused())
            .map(|(identity, _)| identity.clone())
            .collect();
        let released: Vec<_> = empty
            .iter()
            .filter_map(|identity| inner.pools.remove(identity))
            .collect();

        if inner.pools.is_empty() {
            inner.state = match inner.state {
                PoolGroupState::Active => PoolGroupState::Idle,
                PoolGroupState::Idle | PoolGroupState::Disabled => PoolGroupState::Disabled,
            };
        } else {
            inner.state = PoolGroupState::Active;
        }
        (released, inner.state == PoolGroupState::Disabled)
    }

    pub(crate) fn pools(&self) -> Vec<Arc<ConnectionPool<C>>> {
        self.inner.lock().pools.values().cloned().collect()
    }
}

impl<C: Connector> std::fmt::Debug for PoolGroup<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PoolGroup")
            .field("key", &self.key)
            .field("state", &inner.state)
            .field("pools", &inner.pools.len())
            .finish_non_exhaustive()
    }
}
