//! Rate limiting configuration structures.

use std::collections::BTreeMap;
use std::time::Duration;

use duration_str::{deserialize_duration, deserialize_option_duration};
use serde::Deserialize;

/// Admission control configuration for the server.
///
/// Per-user limits resolve with the precedence user > group > defaults. Model
/// limits and the two global ceilings are applied independently on top of them.
/// A limit of `0` means unlimited for that dimension.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Whether rate limiting is enabled.
    pub enabled: bool,
    /// Storage backend configuration.
    pub storage: StorageConfig,
    /// Length of the counting window. Counters idle for this long are forgotten.
    #[serde(deserialize_with = "deserialize_duration")]
    pub duration: Duration,
    /// Default ceiling of attempted requests per user within the window.
    pub total_limit: u32,
    /// Default ceiling of successful requests per user within the window.
    pub success_limit: u32,
    /// Ceiling of attempted requests across all users and models.
    pub global_limit: u32,
    /// Group overrides as `[total_limit, success_limit]`.
    pub groups: BTreeMap<String, [u32; 2]>,
    /// User overrides as `[total_limit, success_limit]`. Users win over groups.
    pub users: BTreeMap<String, [u32; 2]>,
    /// Per-user model ceilings as `[total_limit, reserved]`.
    pub models: BTreeMap<String, [u32; 2]>,
    /// Ceilings of attempted requests per model across all users.
    pub global_models: BTreeMap<String, u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            storage: StorageConfig::default(),
            duration: Duration::from_secs(60),
            total_limit: 0,
            success_limit: 1000,
            global_limit: 0,
            groups: BTreeMap::new(),
            users: BTreeMap::new(),
            models: BTreeMap::new(),
            global_models: BTreeMap::new(),
        }
    }
}

/// Storage backend configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (default).
    #[default]
    Memory,
    /// Redis storage with configuration.
    Redis(Box<RedisConfig>),
}

/// Redis storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisConfig {
    /// Redis connection URL (redis:// or rediss:// for TLS).
    pub url: String,
    /// Connection pool configuration.
    #[serde(default)]
    pub pool: RedisPoolConfig,
    /// TLS configuration.
    pub tls: Option<RedisTlsConfig>,
    /// Key prefix for all rate limit keys.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Response timeout for Redis commands.
    #[serde(
        default = "default_response_timeout",
        deserialize_with = "deserialize_option_duration"
    )]
    pub response_timeout: Option<Duration>,
    /// Connection timeout.
    #[serde(
        default = "default_connection_timeout",
        deserialize_with = "deserialize_option_duration"
    )]
    pub connection_timeout: Option<Duration>,
}

fn default_key_prefix() -> String {
    "gateway:rate_limit:".to_string()
}

fn default_response_timeout() -> Option<Duration> {
    Some(Duration::from_secs(1))
}

fn default_connection_timeout() -> Option<Duration> {
    Some(Duration::from_secs(5))
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379/0".to_string(),
            pool: RedisPoolConfig::default(),
            tls: None,
            key_prefix: default_key_prefix(),
            response_timeout: default_response_timeout(),
            connection_timeout: default_connection_timeout(),
        }
    }
}

/// Redis connection pool configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisPoolConfig {
    /// Maximum number of connections.
    pub max_size: Option<usize>,
    /// Timeout for creating connections.
    #[serde(default, deserialize_with = "deserialize_option_duration")]
    pub timeout_create: Option<Duration>,
    /// Timeout for waiting for a connection.
    #[serde(default, deserialize_with = "deserialize_option_duration")]
    pub timeout_wait: Option<Duration>,
    /// Timeout before recycling idle connections.
    #[serde(default, deserialize_with = "deserialize_option_duration")]
    pub timeout_recycle: Option<Duration>,
}

impl Default for RedisPoolConfig {
    fn default() -> Self {
        Self {
            max_size: Some(16),
            timeout_create: Some(Duration::from_secs(5)),
            timeout_wait: Some(Duration::from_secs(5)),
            timeout_recycle: Some(Duration::from_secs(300)),
        }
    }
}

/// Redis TLS configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisTlsConfig {
    /// Enable TLS (automatically enabled for rediss:// URLs).
    pub enabled: bool,
    /// Allow insecure connections (skip certificate validation).
    pub insecure: Option<bool>,
    /// Path to CA certificate file.
    pub ca_cert_path: Option<String>,
    /// Path to client certificate file (for mutual TLS).
    pub client_cert_path: Option<String>,
    /// Path to client key file (for mutual TLS).
    pub client_key_path: Option<String>,
}
