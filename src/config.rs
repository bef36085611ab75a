//! Configuration management for Ratekeeper.
//!
//! Settings come from an optional YAML file, overridden by environment
//! variables such as `RATEKEEPER__LIMITER__POINTS=20`.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{RatekeeperError, Result};
use crate::ratelimit::tags::DEFAULT_TAG_PREFIX;
use crate::ratelimit::{StoreConfig, DEFAULT_PREFIX};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "RATEKEEPER";

/// Main configuration for the Ratekeeper service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RatekeeperConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Limiter and backing store configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Middleware configuration
    #[serde(default)]
    pub middleware: MiddlewareConfig,
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Which backing store buckets live in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process, for a single instance
    #[default]
    Memory,
    /// Redis, shared by every instance
    Redis,
}

/// Limiter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Disable to admit every request without touching a store
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub backend: BackendKind,

    /// Redis connection URL, used with the `redis` backend
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Namespace for bucket keys
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Namespace for tag set keys
    #[serde(default = "default_tag_prefix")]
    pub tag_prefix: String,

    /// Tags buckets are filed under; empty means the default tag
    #[serde(default)]
    pub tags: Vec<String>,

    /// File buckets under tags at all. Reset needs this.
    #[serde(default = "default_enabled")]
    pub tagging: bool,

    /// Points per window
    #[serde(default = "default_points")]
    pub points: u64,

    /// Window length in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Bound on each backend round trip in milliseconds
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,

    /// How often the memory backend sweeps expired buckets, in milliseconds
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Path to per-key exception rules
    #[serde(default)]
    pub exceptions_path: Option<String>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            backend: BackendKind::default(),
            redis_url: default_redis_url(),
            prefix: default_prefix(),
            tag_prefix: default_tag_prefix(),
            tags: Vec::new(),
            tagging: default_enabled(),
            points: default_points(),
            interval_ms: default_interval_ms(),
            op_timeout_ms: default_op_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            exceptions_path: None,
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

fn default_tag_prefix() -> String {
    DEFAULT_TAG_PREFIX.to_string()
}

fn default_points() -> u64 {
    10
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_op_timeout_ms() -> u64 {
    500
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

impl LimiterConfig {
    /// Store settings for a [`SharedStore`](crate::ratelimit::SharedStore).
    pub fn to_store_config(&self) -> StoreConfig {
        let config = StoreConfig::new(self.points, Duration::from_millis(self.interval_ms))
            .prefix(self.prefix.clone())
            .tag_prefix(self.tag_prefix.clone())
            .tags(self.tags.iter().cloned())
            .op_timeout(Duration::from_millis(self.op_timeout_ms));

        if self.tagging {
            config
        } else {
            config.without_tagging()
        }
    }
}

/// Middleware configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiddlewareConfig {
    /// strftime format for `X-RateLimit-Reset` and `Retry-After`
    #[serde(default = "default_date_format")]
    pub date_format: String,

    /// Headers consulted for the client address before the peer address
    #[serde(default)]
    pub ip_headers: Vec<String>,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            date_format: default_date_format(),
            ip_headers: Vec::new(),
        }
    }
}

fn default_date_format() -> String {
    crate::admission::DEFAULT_DATE_FORMAT.to_string()
}

/// Keys that parse as comma-separated lists from the environment.
const LIST_KEYS: [&str; 2] = ["limiter.tags", "middleware.ip_headers"];

fn environment() -> config::Environment {
    LIST_KEYS.iter().fold(
        config::Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
            .list_separator(","),
        |env, key| env.with_list_parse_key(key),
    )
}

impl RatekeeperConfig {
    /// Load configuration from an optional YAML file and the environment.
    ///
    /// List settings take comma-separated values, for example
    /// `RATEKEEPER__LIMITER__TAGS=api,web`.
    pub fn load(path: Option<&str>) -> Result<Self> {
        Self::load_from(path, environment())
    }

    fn load_from(path: Option<&str>, env: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::with_name(path).format(config::FileFormat::Yaml),
            );
        }
        let settings = builder.add_source(env).build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| RatekeeperError::Config(e.to_string()))
    }
}
