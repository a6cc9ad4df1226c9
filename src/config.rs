//! Counter Node Configuration
//!
//! Loaded from TOML with every field optional, then overridden from
//! `COUNTER_*` environment variables.
//!
//! ```toml
//! server_id = "node-1"
//! expire_ms = 5000
//! max_batch = 500
//! flush_mode = "snapshot"
//!
//! [flush_policy]
//! kind = "interval"
//! interval_ms = 1000
//! ```

use crate::cache::CacheConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Error type for configuration loading
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Toml(toml::de::Error),
    /// A value failed validation
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "I/O error: {}", e),
            ConfigError::Toml(e) => write!(f, "TOML error: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Toml(e)
    }
}

/// How the flusher detaches dirty entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    /// Copy dirty entries out; writers keep going during the write
    #[default]
    Snapshot,
    /// Hold the cache for the whole write; writers block
    Locked,
}

impl FlushMode {
    pub fn is_copy(&self) -> bool {
        matches!(self, FlushMode::Snapshot)
    }
}

/// When the background flusher runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlushPolicy {
    /// Fixed period
    Interval { interval_ms: u64 },
    /// Once per dirty signal, after `delay_ms` of coalescing
    Debounced { delay_ms: u64 },
}

impl Default for FlushPolicy {
    fn default() -> Self {
        FlushPolicy::Interval { interval_ms: 1000 }
    }
}

impl FlushPolicy {
    pub fn period(&self) -> Duration {
        match self {
            FlushPolicy::Interval { interval_ms } => Duration::from_millis(*interval_ms),
            FlushPolicy::Debounced { delay_ms } => Duration::from_millis(*delay_ms),
        }
    }
}

/// Per-node counter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CounterConfig {
    /// This node's identity; names its column or label
    pub server_id: String,
    /// Resync window before a cached item is reloaded (default: 5s)
    #[serde(with = "duration_millis", rename = "expire_ms")]
    pub expire: Duration,
    /// How long a missing item is remembered (default: 1s)
    #[serde(with = "duration_millis", rename = "absent_ttl_ms")]
    pub absent_ttl: Duration,
    /// Largest batch handed to one backend write (default: 500)
    pub max_batch: usize,
    /// Soft cache entry limit per counter; 0 is unbounded (default: 100,000)
    pub cache_capacity: usize,
    pub flush_mode: FlushMode,
    /// Label shard count for label-backed counters; 0 disables (default: 0)
    pub label_shards: u32,
    pub flush_policy: FlushPolicy,
}

impl Default for CounterConfig {
    fn default() -> Self {
        CounterConfig {
            server_id: "node-1".to_string(),
            expire: Duration::from_millis(5000),
            absent_ttl: Duration::from_millis(1000),
            max_batch: 500,
            cache_capacity: 100_000,
            flush_mode: FlushMode::Snapshot,
            label_shards: 0,
            flush_policy: FlushPolicy::default(),
        }
    }
}

impl CounterConfig {
    /// Configuration for tests (small batches, fast flushes)
    pub fn test(server_id: &str) -> Self {
        CounterConfig {
            server_id: server_id.to_string(),
            expire: Duration::from_millis(100),
            absent_ttl: Duration::from_millis(50),
            max_batch: 10,
            cache_capacity: 1000,
            flush_mode: FlushMode::Snapshot,
            label_shards: 0,
            flush_policy: FlushPolicy::Interval { interval_ms: 20 },
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: CounterConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Applies `COUNTER_SERVER_ID`, `COUNTER_EXPIRE_MS`, `COUNTER_MAX_BATCH`
    /// and `COUNTER_FLUSH_INTERVAL_MS` from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Same as [`with_env_overrides`](Self::with_env_overrides) with an
    /// explicit variable lookup.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(id) = lookup("COUNTER_SERVER_ID") {
            self.server_id = id;
        }
        if let Some(ms) = lookup("COUNTER_EXPIRE_MS") {
            self.expire = Duration::from_millis(parse_number("COUNTER_EXPIRE_MS", &ms)?);
        }
        if let Some(n) = lookup("COUNTER_MAX_BATCH") {
            self.max_batch = parse_number("COUNTER_MAX_BATCH", &n)? as usize;
        }
        if let Some(ms) = lookup("COUNTER_FLUSH_INTERVAL_MS") {
            let interval_ms = parse_number("COUNTER_FLUSH_INTERVAL_MS", &ms)?;
            self.flush_policy = FlushPolicy::Interval { interval_ms };
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_id.is_empty() {
            return Err(ConfigError::Invalid("server_id must not be empty".into()));
        }
        if !self
            .server_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(ConfigError::Invalid(format!(
                "server_id {:?} may only contain [A-Za-z0-9_-]",
                self.server_id
            )));
        }
        if self.max_batch == 0 {
            return Err(ConfigError::Invalid("max_batch must be at least 1".into()));
        }
        if self.expire.is_zero() {
            return Err(ConfigError::Invalid("expire_ms must be positive".into()));
        }
        if let FlushPolicy::Interval { interval_ms: 0 } = self.flush_policy {
            return Err(ConfigError::Invalid("flush interval must be positive".into()));
        }
        Ok(())
    }

    /// Cache settings derived from this config.
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            absent_ttl: self.absent_ttl,
            capacity: self.cache_capacity,
            ..CacheConfig::default()
        }
    }
}

fn parse_number(name: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{} must be a number, got {:?}", name, value)))
}

/// Serde helper for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
