//! Pool group configuration and pool keys.

use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use crate::error::PoolError;

/// Default maximum connections per pool.
pub const DEFAULT_MAX_POOL_SIZE: u32 = 100;

/// Default time allowed to obtain a connection.
pub const DEFAULT_CREATION_TIMEOUT: Duration = Duration::from_secs(15);

/// Settings shared by every pool in a pool group.
///
/// This struct is marked `#[non_exhaustive]` to allow adding new fields
/// in future minor versions without breaking changes. Use the builder
/// methods or [`Default::default()`] to construct instances.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct PoolGroupOptions {
    /// Whether connections are pooled at all.
    pub pooling: bool,

    /// Connections the pruner keeps open.
    pub min_pool_size: u32,

    /// Maximum connections per pool.
    pub max_pool_size: u32,

    /// Time allowed to obtain a connection.
    pub creation_timeout: Duration,

    /// Maximum age of a connection returned to the pool; zero disables
    /// the limit.
    pub load_balance_timeout: Duration,

    /// Keep a separate pool per caller identity.
    pub pool_by_identity: bool,
}

impl Default for PoolGroupOptions {
    fn default() -> Self {
        Self {
            pooling: true,
            min_pool_size: 0,
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            creation_timeout: DEFAULT_CREATION_TIMEOUT,
            load_balance_timeout: Duration::ZERO,
            pool_by_identity: false,
        }
    }
}

impl PoolGroupOptions {
    /// Create options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable pooling.
    #[must_use]
    pub fn with_pooling(mut self, enabled: bool) -> Self {
        self.pooling = enabled;
        self
    }

    /// Set the minimum pool size.
    #[must_use]
    pub fn with_min_pool_size(mut self, size: u32) -> Self {
        self.min_pool_size = size;
        self
    }

    /// Set the maximum pool size.
    #[must_use]
    pub fn with_max_pool_size(mut self, size: u32) -> Self {
        self.max_pool_size = size;
        self
    }

    /// Set the connection creation timeout.
    #[must_use]
    pub fn with_creation_timeout(mut self, timeout: Duration) -> Self {
        self.creation_timeout = timeout;
        self
    }

    /// Set the load-balance timeout.
    #[must_use]
    pub fn with_load_balance_timeout(mut self, timeout: Duration) -> Self {
        self.load_balance_timeout = timeout;
        self
    }

    /// Pool connections separately per identity.
    #[must_use]
    pub fn with_pool_by_identity(mut self, enabled: bool) -> Self {
        self.pool_by_identity = enabled;
        self
    }

    /// Validate the options.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_pool_size == 0 {
            return Err(PoolError::Configuration(
                "max pool size must be greater than 0".into(),
            ));
        }
        if self.min_pool_size > self.max_pool_size {
            return Err(PoolError::Configuration(
                "min pool size cannot be greater than max pool size".into(),
            ));
        }
        Ok(())
    }
}

/// Identifies a pool group: the normalized connection settings.
///
/// The key text may contain credentials; `Debug` prints only the redacted
/// form supplied alongside it.
#[derive(Clone)]
pub struct PoolKey {
    key: Arc<str>,
    redacted: Arc<str>,
}

impl PoolKey {
    /// Create a key from its normalized text and a log-safe rendering.
    pub fn new(key: impl Into<Arc<str>>, redacted: impl Into<Arc<str>>) -> Self {
        Self {
            key: key.into(),
            redacted: redacted.into(),
        }
    }

    /// Log-safe rendering.
    #[must_use]
    pub fn redacted(&self) -> &str {
        &self.redacted
    }
}

impl PartialEq for PoolKey {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for PoolKey {}

impl Hash for PoolKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl std::fmt::Debug for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PoolKey").field(&self.redacted).finish()
    }
}

/// Caller identity used to pick a pool inside a group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PoolIdentity(Option<Arc<str>>);

impl PoolIdentity {
    /// Identity shared by all callers.
    #[must_use]
    pub fn shared() -> Self {
        Self(None)
    }

    /// A named identity, such as an integrated-security account.
    pub fn named(name: impl Into<Arc<str>>) -> Self {
        Self(Some(name.into()))
    }

    /// Identity name, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.0.as_deref()
    }
}
