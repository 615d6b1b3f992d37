//! Client configuration.

use std::fmt;
use std::time::Duration;

use sqlclient_pool::{PoolGroupOptions, PoolIdentity, PoolKey};
use tds_protocol::{DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE, MIN_PACKET_SIZE};
use tds_session::DEFAULT_ATTENTION_TIMEOUT;

use crate::error::Error;

/// Timeout configuration for the phases of connection and command execution.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Time to open and log in a physical connection (default: 15s).
    pub connect_timeout: Duration,
    /// Default timeout for command execution; zero waits forever (default: 30s).
    pub command_timeout: Duration,
    /// Time the server gets to acknowledge a cancel (default: 5s).
    pub attention_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            command_timeout: Duration::from_secs(30),
            attention_timeout: DEFAULT_ATTENTION_TIMEOUT,
        }
    }
}

impl TimeoutConfig {
    /// Create a new timeout configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connection timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the default command execution timeout.
    #[must_use]
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the cancel acknowledgment timeout.
    #[must_use]
    pub fn attention_timeout(mut self, timeout: Duration) -> Self {
        self.attention_timeout = timeout;
        self
    }

    /// Command deadline, or `None` when commands may run forever.
    #[must_use]
    pub fn command_limit(&self) -> Option<Duration> {
        (!self.command_timeout.is_zero()).then_some(self.command_timeout)
    }
}

/// Retry policy for transient error handling.
///
/// Consumed by [`ExponentialRetryProvider`](crate::retry::ExponentialRetryProvider).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (default: 3).
    pub max_retries: u32,
    /// Initial backoff duration before first retry (default: 100ms).
    pub initial_backoff: Duration,
    /// Maximum backoff duration between retries (default: 30s).
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff (default: 2.0).
    pub backoff_multiplier: f64,
    /// Whether to spread backoff times randomly (default: true).
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of retry attempts.
    #[must_use]
    pub fn max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    /// Set the initial backoff duration.
    #[must_use]
    pub fn initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Set the maximum backoff duration.
    #[must_use]
    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    /// Set the backoff multiplier for exponential backoff.
    #[must_use]
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Disable automatic retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Backoff before retry number `attempt` (1-based), without jitter.
    #[must_use]
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base = self.initial_backoff.as_secs_f64()
            * self
                .backoff_multiplier
                .powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32);
        let capped = base.min(self.max_backoff.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_backoff)
    }

    /// Check if more retries are allowed after `attempt` retries.
    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Configuration for connecting to SQL Server.
///
/// This struct is marked `#[non_exhaustive]`; build it from
/// [`Config::default()`] or [`Config::from_connection_string()`] and the
/// `with_*` methods.
#[derive(Clone)]
#[non_exhaustive]
pub struct Config {
    /// Server hostname or IP address.
    pub host: String,

    /// Server port (default: 1433).
    pub port: u16,

    /// Instance name (for named instances).
    pub instance: Option<String>,

    /// Database name.
    pub database: Option<String>,

    /// SQL authentication user.
    pub user: String,

    /// SQL authentication password. Never printed.
    pub password: String,

    /// Use the caller's OS identity instead of SQL authentication.
    pub integrated_security: bool,

    /// Application name (shown in SQL Server management tools).
    pub application_name: String,

    /// Requested TDS packet size.
    pub packet_size: usize,

    /// Whether to enable MARS (Multiple Active Result Sets).
    pub mars: bool,

    /// Whether to log in to a user instance.
    pub user_instance: bool,

    /// Pool behaviour.
    pub pool: PoolGroupOptions,

    /// Timeouts.
    pub timeouts: TimeoutConfig,

    /// Retry policy for transient errors; `None` never retries.
    pub retry: Option<RetryPolicy>,

    /// Reconnect attempts after a broken connection is detected (default: 1).
    pub connect_retry_count: u32,

    /// Delay between reconnect attempts (default: 10s).
    pub connect_retry_interval: Duration,

    /// Collect per-connection statistics.
    pub statistics_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        let timeouts = TimeoutConfig::default();
        Self {
            host: "localhost".to_string(),
            port: 1433,
            instance: None,
            database: None,
            user: String::new(),
            password: String::new(),
            integrated_security: false,
            application_name: "sqlclient".to_string(),
            packet_size: DEFAULT_PACKET_SIZE,
            mars: false,
            user_instance: false,
            pool: PoolGroupOptions::default().with_creation_timeout(timeouts.connect_timeout),
            timeouts,
            retry: None,
            connect_retry_count: 1,
            connect_retry_interval: Duration::from_secs(10),
            statistics_enabled: false,
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, Error> {
    if value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes") || value == "1" {
        Ok(true)
    } else if value.eq_ignore_ascii_case("false") || value.eq_ignore_ascii_case("no") || value == "0"
    {
        Ok(false)
    } else {
        Err(Error::Config(format!("invalid value for {key}: {value}")))
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, Error> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("invalid value for {key}: {value}")))
}

impl Config {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a connection string into configuration.
    ///
    /// Supports ADO.NET-style connection strings:
    /// ```text
    /// Server=localhost,1433;Database=mydb;User Id=sa;Password=secret;Max Pool Size=20
    /// ```
    pub fn from_connection_string(conn_str: &str) -> Result<Self, Error> {
        let mut config = Self::default();
        let mut connect_timeout_set = false;

        for part in conn_str.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| Error::Config(format!("invalid key-value: {part}")))?;

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match key.as_str() {
                "server" | "data source" | "addr" | "address" => {
                    let value = value.strip_prefix("tcp:").unwrap_or(value);
                    let (host, port) = match value.split_once(',') {
                        Some((host, port)) => (host, Some(port.trim())),
                        None => (value, None),
                    };
                    match host.split_once('\\') {
                        Some((host, instance)) => {
                            config.host = host.to_string();
                            config.instance = Some(instance.to_string());
                        }
                        None => config.host = host.to_string(),
                    }
                    if let Some(port) = port {
                        config.port = parse_number(&key, port)?;
                    }
                }
                "database" | "initial catalog" => {
                    config.database = Some(value.to_string());
                }
                "user id" | "uid" | "user" => config.user = value.to_string(),
                "password" | "pwd" => config.password = value.to_string(),
                "application name" | "app" => config.application_name = value.to_string(),
                "integrated security" | "trusted_connection" => {
                    config.integrated_security = value.eq_ignore_ascii_case("sspi")
                        || parse_bool(&key, value)?;
                }
                "connect timeout" | "connection timeout" | "timeout" => {
                    let secs: u64 = parse_number(&key, value)?;
                    config.timeouts.connect_timeout = Duration::from_secs(secs);
                    connect_timeout_set = true;
                }
                "command timeout" => {
                    let secs: u64 = parse_number(&key, value)?;
                    config.timeouts.command_timeout = Duration::from_secs(secs);
                }
                "packet size" => config.packet_size = parse_number(&key, value)?,
                "pooling" => config.pool.pooling = parse_bool(&key, value)?,
                "min pool size" => config.pool.min_pool_size = parse_number(&key, value)?,
                "max pool size" => config.pool.max_pool_size = parse_number(&key, value)?,
                "load balance timeout" | "connection lifetime" => {
                    let secs: u64 = parse_number(&key, value)?;
                    config.pool.load_balance_timeout = Duration::from_secs(secs);
                }
                "multipleactiveresultsets" | "multiple active result sets" | "mars" => {
                    config.mars = parse_bool(&key, value)?;
                }
                "user instance" => config.user_instance = parse_bool(&key, value)?,
                "connectretrycount" | "connect retry count" => {
                    config.connect_retry_count = parse_number(&key, value)?;
                }
                "connectretryinterval" | "connect retry interval" => {
                    let secs: u64 = parse_number(&key, value)?;
                    config.connect_retry_interval = Duration::from_secs(secs);
                }
                _ => {
                    tracing::debug!(key = key, "ignoring unknown connection string option");
                }
            }
        }

        if connect_timeout_set {
            config.pool.creation_timeout = config.timeouts.connect_timeout;
        }
        config.pool.pool_by_identity = config.integrated_security;
        config.validate()?;
        Ok(config)
    }

    /// Check values that the server or the pool would reject.
    pub fn validate(&self) -> Result<(), Error> {
        if !(MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&self.packet_size) {
            return Err(Error::Config(format!(
                "packet size {} is outside {MIN_PACKET_SIZE}..={MAX_PACKET_SIZE}",
                self.packet_size
            )));
        }
        if self.connect_retry_count > 255 {
            return Err(Error::Config(format!(
                "connect retry count {} exceeds 255",
                self.connect_retry_count
            )));
        }
        if !(1..=60).contains(&self.connect_retry_interval.as_secs()) {
            return Err(Error::Config(format!(
                "connect retry interval {:?} is outside 1..=60 seconds",
                self.connect_retry_interval
            )));
        }
        if self.user_instance && self.mars {
            tracing::debug!("user instance requested together with MARS");
        }
        self.pool.validate().map_err(Error::from)
    }

    /// Set the server host.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the server port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the instance name.
    #[must_use]
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Set the database.
    #[must_use]
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Use SQL authentication.
    #[must_use]
    pub fn with_sql_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self.integrated_security = false;
        self.pool.pool_by_identity = false;
        self
    }

    /// Set the application name.
    #[must_use]
    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    /// Set the requested packet size.
    #[must_use]
    pub fn with_packet_size(mut self, size: usize) -> Self {
        self.packet_size = size;
        self
    }

    /// Enable or disable MARS.
    #[must_use]
    pub fn with_mars(mut self, enabled: bool) -> Self {
        self.mars = enabled;
        self
    }

    /// Enable or disable the user-instance login.
    #[must_use]
    pub fn with_user_instance(mut self, enabled: bool) -> Self {
        self.user_instance = enabled;
        self
    }

    /// Set pool options.
    #[must_use]
    pub fn with_pool(mut self, pool: PoolGroupOptions) -> Self {
        self.pool = pool;
        self
    }

    /// Enable or disable pooling.
    #[must_use]
    pub fn with_pooling(mut self, enabled: bool) -> Self {
        self.pool.pooling = enabled;
        self
    }

    /// Set timeouts; the pool creation timeout follows the connect timeout.
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.pool.creation_timeout = timeouts.connect_timeout;
        self.timeouts = timeouts;
        self
    }

    /// Retry transient failures under `retry`.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Set reconnect attempts and the delay between them.
    #[must_use]
    pub fn with_connect_retry(mut self, count: u32, interval: Duration) -> Self {
        self.connect_retry_count = count;
        self.connect_retry_interval = interval;
        self
    }

    /// Enable or disable statistics collection.
    #[must_use]
    pub fn with_statistics(mut self, enabled: bool) -> Self {
        self.statistics_enabled = enabled;
        self
    }

    /// Identity used to partition pools.
    #[must_use]
    pub fn identity(&self) -> PoolIdentity {
        if !self.integrated_security {
            return PoolIdentity::shared();
        }
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_default();
        PoolIdentity::named(user)
    }

    /// Pool key built from the normalized keyword set.
    ///
    /// The password is part of the key; the redacted form used for logs
    /// masks it.
    #[must_use]
    pub fn pool_key(&self) -> PoolKey {
        let render = |password: &str| {
            format!(
                "server={};port={};instance={};database={};user id={};password={};integrated security={};application name={};packet size={};mars={};user instance={}",
                self.host.to_lowercase(),
                self.port,
                self.instance.as_deref().unwrap_or("").to_lowercase(),
                self.database.as_deref().unwrap_or(""),
                self.user,
                password,
                self.integrated_security,
                self.application_name,
                self.packet_size,
                self.mars,
                self.user_instance,
            )
        };
        let redacted = if self.password.is_empty() { "" } else { "*****" };
        PoolKey::new(render(&self.password), render(redacted))
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("instance", &self.instance)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("integrated_security", &self.integrated_security)
            .field("application_name", &self.application_name)
            .field("packet_size", &self.packet_size)
            .field("mars", &self.mars)
            .field("user_instance", &self.user_instance)
            .field("pool", &self.pool)
            .field("timeouts", &self.timeouts)
            .field("retry", &self.retry)
            .field("connect_retry_count", &self.connect_retry_count)
            .field("connect_retry_interval", &self.connect_retry_interval)
            .field("statistics_enabled", &self.statistics_enabled)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_string_parsing() {
        let config = Config::from_connection_string(
            "Server=db.example.com,1444;Database=sales;User Id=app;Password=hunter2;Application Name=billing",
        )
        .unwrap();

        assert_eq!(config.host, "db.example.com");
        assert_eq!(config.port, 1444);
        assert_eq!(config.database.as_deref(), Some("sales"));
        assert_eq!(config.user, "app");
        assert_eq!(config.password, "hunter2");
        assert_eq!(config.application_name, "billing");
    }

    #[test]
    fn test_connection_string_with_instance() {
        let config = Config::from_connection_string("Data Source=.\\SQLEXPRESS;User Instance=true")
            .unwrap();

        assert_eq!(config.host, ".");
        assert_eq!(config.instance.as_deref(), Some("SQLEXPRESS"));
        assert!(config.user_instance);
    }

    #[test]
    fn test_connection_string_pool_keywords() {
        let config = Config::from_connection_string(
            "Server=x;Pooling=false;Min Pool Size=2;Max Pool Size=20;Load Balance Timeout=30;Connect Timeout=5",
        )
        .unwrap();

        assert!(!config.pool.pooling);
        assert_eq!(config.pool.min_pool_size, 2);
        assert_eq!(config.pool.max_pool_size, 20);
        assert_eq!(config.pool.load_balance_timeout, Duration::from_secs(30));
        assert_eq!(config.timeouts.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.pool.creation_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_connection_string_resiliency_keywords() {
        let defaults = Config::from_connection_string("Server=x").unwrap();
        assert_eq!(defaults.connect_retry_count, 1);
        assert_eq!(defaults.connect_retry_interval, Duration::from_secs(10));

        let config =
            Config::from_connection_string("Server=x;ConnectRetryCount=3;ConnectRetryInterval=2")
                .unwrap();
        assert_eq!(config.connect_retry_count, 3);
        assert_eq!(config.connect_retry_interval, Duration::from_secs(2));

        assert!(Config::from_connection_string("Server=x;ConnectRetryInterval=0").is_err());
    }

    #[test]
    fn test_connection_string_rejects_bad_values() {
        assert!(Config::from_connection_string("Server=x;Pooling=maybe").is_err());
        assert!(Config::from_connection_string("Server=x;Packet Size=100").is_err());
        assert!(Config::from_connection_string("Server=x;Min Pool Size=5;Max Pool Size=2").is_err());
        assert!(Config::from_connection_string("Server").is_err());
    }

    #[test]
    fn test_unknown_keywords_are_ignored() {
        let config = Config::from_connection_string("Server=x;Encrypt=strict").unwrap();
        assert_eq!(config.host, "x");
    }

    #[test]
    fn test_integrated_security_pools_by_identity() {
        let config = Config::from_connection_string("Server=x;Integrated Security=SSPI").unwrap();
        assert!(config.integrated_security);
        assert!(config.pool.pool_by_identity);
    }

    #[test]
    fn test_password_never_printed() {
        let config = Config::new().with_sql_auth("sa", "s3cret!");

        assert!(!format!("{config:?}").contains("s3cret!"));
        let key = config.pool_key();
        assert!(!key.redacted().contains("s3cret!"));
        assert!(!format!("{key:?}").contains("s3cret!"));
    }

    #[test]
    fn test_pool_key_includes_password() {
        let a = Config::new().with_sql_auth("sa", "one").pool_key();
        let b = Config::new().with_sql_auth("sa", "two").pool_key();
        assert_ne!(a, b);
        assert_eq!(a.redacted(), b.redacted());
    }

    #[test]
    fn test_pool_key_normalizes_host_case() {
        let a = Config::new().with_host("DB1").pool_key();
        let b = Config::new().with_host("db1").pool_key();
        assert_eq!(a, b);
    }

    #[test]
    fn test_command_limit_zero_means_forever() {
        let timeouts = TimeoutConfig::new().command_timeout(Duration::ZERO);
        assert_eq!(timeouts.command_limit(), None);
        assert_eq!(
            TimeoutConfig::default().command_limit(),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_retry_backoff_is_capped() {
        let policy = RetryPolicy::new()
            .initial_backoff(Duration::from_millis(100))
            .max_backoff(Duration::from_secs(1));

        assert_eq!(policy.backoff_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for_attempt(10), Duration::from_secs(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }
}
