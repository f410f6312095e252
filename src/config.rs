//! Configuration types for attachment-dl
//!
//! Every field has a default, so an empty JSON object, an empty environment or
//! `Config::default()` all yield a working direct-only setup. Environment keys
//! follow the deployment convention (`POST_LIMIT`, `WORKER_LIST`, ...) and are
//! read by [`Config::from_env`].

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Top-level configuration for an [`Orchestrator`](crate::Orchestrator)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Egress descriptors, one worker per valid entry (default: direct only)
    #[serde(default = "default_workers")]
    pub workers: Vec<WorkerConfig>,

    /// Per-worker concurrency gates
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Transfer behaviour (timeout, redirects, skip markers)
    #[serde(default)]
    pub download: DownloadConfig,

    /// Retry policy for failed transfers
    #[serde(default)]
    pub retry: RetryConfig,

    /// Coordination store TTLs and key namespace
    #[serde(default)]
    pub coordination: CoordinationConfig,

    /// Worker health thresholds and recovery cooldown
    #[serde(default)]
    pub health: HealthConfig,

    /// Pooled connection settings per worker identity
    #[serde(default)]
    pub pool: PoolConfig,

    /// Worker selection policy
    #[serde(default)]
    pub strategy: DistributionStrategy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            limits: LimitsConfig::default(),
            download: DownloadConfig::default(),
            retry: RetryConfig::default(),
            coordination: CoordinationConfig::default(),
            health: HealthConfig::default(),
            pool: PoolConfig::default(),
            strategy: DistributionStrategy::default(),
        }
    }
}

/// Per-worker concurrency limits
///
/// Both gates apply to each worker independently, so total throughput scales
/// with the number of registered workers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Parent units (posts) a worker processes at once (default: 2)
    #[serde(default = "default_post_limit")]
    pub post_limit: usize,

    /// File transfers a worker runs at once (default: 4)
    #[serde(default = "default_attachment_limit")]
    pub attachment_limit: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            post_limit: default_post_limit(),
            attachment_limit: default_attachment_limit(),
        }
    }
}

/// Transfer behaviour
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Per-transfer deadline (default: 10 minutes)
    #[serde(default = "default_download_timeout", with = "duration_millis")]
    pub timeout: Duration,

    /// Redirect hops followed before giving up (default: 1)
    #[serde(default = "default_max_redirects")]
    pub max_redirects: u32,

    /// Lifetime of the skip marker written after a timeout (default: 1 hour)
    #[serde(default = "default_skip_cache_ttl", with = "duration_secs")]
    pub skip_cache_ttl: Duration,

    /// User-Agent header sent with every transfer
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            timeout: default_download_timeout(),
            max_redirects: default_max_redirects(),
            skip_cache_ttl: default_skip_cache_ttl(),
            user_agent: default_user_agent(),
        }
    }
}

/// Retry configuration for failed transfers
///
/// The delay before retry `i` (1-based) is
/// `base_delay * backoff_multiplier^(i-1)`, capped at `max_delay`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retry attempts after the first transfer (default: 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry (default: 1 second)
    #[serde(default = "default_base_delay", with = "duration_millis")]
    pub base_delay: Duration,

    /// Exponential base (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Upper bound on a single delay (default: 5 minutes)
    #[serde(default = "default_max_delay", with = "duration_millis")]
    pub max_delay: Duration,

    /// Add random jitter to delays (default: false)
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay: default_base_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay: default_max_delay(),
            jitter: false,
        }
    }
}

/// Coordination store settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Lock and in-progress marker lifetime (default: 1 hour)
    ///
    /// Must outlast the slowest expected transfer plus its retries; it is the
    /// only thing that frees a lock whose holder died.
    #[serde(default = "default_lock_ttl", with = "duration_secs")]
    pub lock_ttl: Duration,

    /// Lifetime of completion and failure records (default: 24 hours)
    #[serde(default = "default_retention_ttl", with = "duration_secs")]
    pub retention_ttl: Duration,

    /// Prepended to every store key, for sharing one store between deployments
    #[serde(default)]
    pub key_prefix: String,

    /// Process-unique tag included in lock holder names (default: random)
    #[serde(default)]
    pub instance_id: Option<String>,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            lock_ttl: default_lock_ttl(),
            retention_ttl: default_retention_ttl(),
            key_prefix: String::new(),
            instance_id: None,
        }
    }
}

/// Worker health thresholds
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Consecutive failures that mark a worker degraded (default: 1)
    #[serde(default = "default_degraded_threshold")]
    pub degraded_threshold: u32,

    /// Consecutive failures that mark a worker unhealthy (default: 3)
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,

    /// Quiet period after the last failure before recovery (default: 5 minutes)
    #[serde(default = "default_recovery_cooldown", with = "duration_millis")]
    pub recovery_cooldown: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            degraded_threshold: default_degraded_threshold(),
            unhealthy_threshold: default_unhealthy_threshold(),
            recovery_cooldown: default_recovery_cooldown(),
        }
    }
}

/// Pooled connection settings, applied to every worker identity
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Idle sockets kept per host (default: 10)
    ///
    /// reqwest has no cap on simultaneous sockets; a worker never has more
    /// transfers open than its attachment gate (`ATTACHMENT_LIMIT`) admits.
    #[serde(default = "default_max_sockets")]
    pub max_sockets: usize,

    /// How long an idle socket stays in the pool (default: 30 seconds)
    #[serde(default = "default_free_socket_timeout", with = "duration_millis")]
    pub free_socket_timeout: Duration,

    /// TCP keep-alive interval (default: 30 seconds)
    #[serde(default = "default_keep_alive", with = "duration_millis")]
    pub keep_alive: Duration,

    /// Connection establishment timeout (default: 30 seconds)
    #[serde(default = "default_connect_timeout", with = "duration_millis")]
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sockets: default_max_sockets(),
            free_socket_timeout: default_free_socket_timeout(),
            keep_alive: default_keep_alive(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

/// Policy used to pick a worker for a new task
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionStrategy {
    /// Cyclic index over the candidates
    RoundRobin,
    /// Candidate with the fewest pending units across both gates
    #[default]
    LoadBalanced,
    /// First candidate in registration order
    FirstAvailable,
}

impl FromStr for DistributionStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" => Ok(Self::RoundRobin),
            "load_balanced" => Ok(Self::LoadBalanced),
            "first_available" => Ok(Self::FirstAvailable),
            other => Err(Error::config(
                "DISTRIBUTION_STRATEGY",
                format!("unknown distribution strategy '{other}'"),
            )),
        }
    }
}

/// Proxy protocol spoken to the forward proxy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyScheme {
    /// Plain HTTP proxy (CONNECT for https targets)
    #[default]
    Http,
    /// Proxy reached over TLS
    Https,
    /// SOCKS5 proxy
    Socks5,
}

impl ProxyScheme {
    fn as_str(self) -> &'static str {
        match self {
            ProxyScheme::Http => "http",
            ProxyScheme::Https => "https",
            ProxyScheme::Socks5 => "socks5",
        }
    }
}

/// Raw worker descriptor as it appears in `WORKER_LIST`
///
/// Either `{"direct": true}` or `{"host": ..., "port": ..., "username"?, "password"?}`.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Use the host's own network connection
    #[serde(default)]
    pub direct: bool,

    /// Proxy hostname
    #[serde(default)]
    pub host: Option<String>,

    /// Proxy port
    #[serde(default)]
    pub port: Option<u16>,

    /// Proxy protocol (default: http)
    #[serde(default)]
    pub protocol: ProxyScheme,

    /// Proxy username
    #[serde(default)]
    pub username: Option<String>,

    /// Proxy password
    #[serde(default)]
    pub password: Option<String>,
}

impl fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("direct", &self.direct)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("protocol", &self.protocol)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl WorkerConfig {
    /// Descriptor for the host's own connection
    pub fn direct() -> Self {
        Self {
            direct: true,
            ..Self::default()
        }
    }

    /// Descriptor for an unauthenticated HTTP proxy
    pub fn proxy(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: Some(host.into()),
            port: Some(port),
            ..Self::default()
        }
    }

    /// Validate the descriptor and resolve it into a worker identity
    ///
    /// Direct egress is always valid. A proxy needs a non-empty host and a
    /// non-zero port; credentials are optional but a password without a
    /// username is ignored.
    pub fn validate(&self) -> Result<WorkerIdentity> {
        if self.direct {
            return Ok(WorkerIdentity::Direct);
        }

        let host = self
            .host
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::config("WORKER_LIST", "proxy worker requires a host"))?;
        let port = self
            .port
            .filter(|p| *p != 0)
            .ok_or_else(|| Error::config("WORKER_LIST", "proxy worker requires a port"))?;

        let credentials = self
            .username
            .as_ref()
            .filter(|u| !u.is_empty())
            .map(|username| ProxyCredentials {
                username: username.clone(),
                password: self.password.clone().unwrap_or_default(),
            });

        Ok(WorkerIdentity::Proxy {
            scheme: self.protocol,
            host: host.to_string(),
            port,
            credentials,
        })
    }
}

/// Proxy credentials; never rendered in logs
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ProxyCredentials {
    /// Proxy username
    pub username: String,
    /// Proxy password
    pub password: String,
}

impl fmt::Debug for ProxyCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Validated egress path; the key of the connection pool cache
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum WorkerIdentity {
    /// The host's own network connection
    Direct,
    /// A forward proxy
    Proxy {
        /// Proxy protocol
        scheme: ProxyScheme,
        /// Proxy hostname
        host: String,
        /// Proxy port
        port: u16,
        /// Optional proxy credentials
        credentials: Option<ProxyCredentials>,
    },
}

impl WorkerIdentity {
    /// Proxy URL without credentials, or `None` for direct egress
    pub fn proxy_url(&self) -> Option<String> {
        match self {
            WorkerIdentity::Direct => None,
            WorkerIdentity::Proxy {
                scheme, host, port, ..
            } => Some(format!("{}://{}:{}", scheme.as_str(), host, port)),
        }
    }
}

impl fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerIdentity::Direct => write!(f, "direct"),
            WorkerIdentity::Proxy { host, port, .. } => write!(f, "proxy:{host}:{port}"),
        }
    }
}

impl Config {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Load configuration from key/value pairs, applying defaults for absent keys
    ///
    /// Empty values count as absent.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(_, v)| !v.trim().is_empty())
            .collect();
        let mut config = Config::default();

        if let Some(v) = parse_var(&vars, "POST_LIMIT")? {
            config.limits.post_limit = v;
        }
        if let Some(v) = parse_var(&vars, "ATTACHMENT_LIMIT")? {
            config.limits.attachment_limit = v;
        }
        if let Some(v) = parse_var(&vars, "DOWNLOAD_TIMEOUT_MS")? {
            config.download.timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse_var(&vars, "MAX_REDIRECTS")? {
            config.download.max_redirects = v;
        }
        if let Some(v) = parse_var(&vars, "SKIP_CACHE_TTL_S")? {
            config.download.skip_cache_ttl = Duration::from_secs(v);
        }
        if let Some(v) = parse_var(&vars, "MAX_RETRIES")? {
            config.retry.max_retries = v;
        }
        if let Some(v) = parse_var(&vars, "RETRY_BACKOFF_MULTIPLIER")? {
            config.retry.backoff_multiplier = v;
        }
        if let Some(v) = parse_var(&vars, "RETRY_BASE_DELAY_MS")? {
            config.retry.base_delay = Duration::from_millis(v);
        }
        if let Some(v) = parse_var(&vars, "LOCK_TTL_S")? {
            config.coordination.lock_ttl = Duration::from_secs(v);
        }
        if let Some(v) = parse_var(&vars, "RETENTION_TTL_S")? {
            config.coordination.retention_ttl = Duration::from_secs(v);
        }
        if let Some(v) = parse_var(&vars, "HEALTH_COOLDOWN_MS")? {
            config.health.recovery_cooldown = Duration::from_millis(v);
        }
        if let Some(v) = vars.get("DISTRIBUTION_STRATEGY") {
            config.strategy = v.parse()?;
        }
        if let Some(raw) = vars.get("WORKER_LIST") {
            config.workers = serde_json::from_str(raw).map_err(|e| {
                Error::config("WORKER_LIST", format!("invalid worker list JSON: {e}"))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.limits.post_limit == 0 {
            return Err(Error::config("POST_LIMIT", "must be at least 1"));
        }
        if self.limits.attachment_limit == 0 {
            return Err(Error::config("ATTACHMENT_LIMIT", "must be at least 1"));
        }
        if self.download.timeout.is_zero() {
            return Err(Error::config("DOWNLOAD_TIMEOUT_MS", "must be greater than 0"));
        }
        if !self.retry.backoff_multiplier.is_finite() || self.retry.backoff_multiplier < 1.0 {
            return Err(Error::config(
                "RETRY_BACKOFF_MULTIPLIER",
                "must be a finite number >= 1",
            ));
        }
        if self.coordination.lock_ttl.is_zero() {
            return Err(Error::config("LOCK_TTL_S", "must be greater than 0"));
        }
        if self.health.unhealthy_threshold < self.health.degraded_threshold {
            return Err(Error::config(
                "health.unhealthy_threshold",
                "must not be below the degraded threshold",
            ));
        }
        Ok(())
    }
}

fn parse_var<T>(vars: &HashMap<String, String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    vars.get(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| Error::config(key, format!("invalid value '{raw}': {e}")))
        })
        .transpose()
}

fn default_workers() -> Vec<WorkerConfig> {
    vec![WorkerConfig::direct()]
}

fn default_post_limit() -> usize {
    2
}

fn default_attachment_limit() -> usize {
    4
}

fn default_download_timeout() -> Duration {
    Duration::from_millis(600_000)
}

fn default_max_redirects() -> u32 {
    1
}

fn default_skip_cache_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_user_agent() -> String {
    concat!("attachment-dl/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_millis(1000)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay() -> Duration {
    Duration::from_secs(300)
}

fn default_lock_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_retention_ttl() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_degraded_threshold() -> u32 {
    1
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_recovery_cooldown() -> Duration {
    Duration::from_secs(300)
}

fn default_max_sockets() -> usize {
    10
}

fn default_free_socket_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(30)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

// Duration serialization helpers
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
