//! Configuration
//!
//! Every knob has a default, can be loaded from TOML, and can be overridden
//! from `OPSYNC_*` environment variables (12-factor style).
//!
//! ```toml
//! [queue]
//! fsync_policy = "always"
//! max_segment_size = 1048576
//!
//! [consumer]
//! poll_interval = 250
//!
//! [sync]
//! root = "/var/lib/app/.opsync"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default root directory for queue state
pub const DEFAULT_ROOT: &str = ".opsync";

/// Error type for configuration loading
#[derive(Debug)]
pub enum ConfigError {
    /// TOML could not be parsed into a configuration
    Parse(String),
    /// An environment override holds an unusable value
    InvalidEnv { key: String, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Parse(msg) => write!(f, "Invalid configuration: {}", msg),
            ConfigError::InvalidEnv { key, value } => {
                write!(f, "Invalid value for {}: {:?}", key, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// When appended records are forced to stable storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsyncPolicy {
    /// Fsync after every put, before it returns.
    Always,
    /// Fsync at most once per `fsync_interval`; a crash may lose the tail.
    #[default]
    EverySecond,
    /// Never fsync explicitly; the OS decides.
    No,
}

impl std::str::FromStr for FsyncPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always" => Ok(FsyncPolicy::Always),
            "every_second" | "everysec" => Ok(FsyncPolicy::EverySecond),
            "no" | "never" => Ok(FsyncPolicy::No),
            other => Err(format!("unknown fsync policy: {}", other)),
        }
    }
}

/// Operation queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub fsync_policy: FsyncPolicy,
    /// Segment size that triggers rotation to a new segment (default: 64MB)
    pub max_segment_size: u64,
    /// Interval for `FsyncPolicy::EverySecond` (default: 1s)
    #[serde(with = "duration_millis")]
    pub fsync_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            fsync_policy: FsyncPolicy::EverySecond,
            max_segment_size: 64 * 1024 * 1024,
            fsync_interval: Duration::from_secs(1),
        }
    }
}

impl QueueConfig {
    /// Small segments so tests rotate quickly
    pub fn test() -> Self {
        QueueConfig {
            fsync_policy: FsyncPolicy::Always,
            max_segment_size: 1024,
            fsync_interval: Duration::from_millis(10),
        }
    }
}

/// Background consumer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Upper bound on an idle wait before re-reading the queue (default: 1s)
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
    /// First backoff after a retryable failure (default: 100ms)
    #[serde(with = "duration_millis")]
    pub retry_initial_backoff: Duration,
    /// Backoff cap; doubling stops here (default: 30s)
    #[serde(with = "duration_millis")]
    pub retry_max_backoff: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        ConsumerConfig {
            poll_interval: Duration::from_secs(1),
            retry_initial_backoff: Duration::from_millis(100),
            retry_max_backoff: Duration::from_secs(30),
        }
    }
}

impl ConsumerConfig {
    pub fn test() -> Self {
        ConsumerConfig {
            poll_interval: Duration::from_millis(20),
            retry_initial_backoff: Duration::from_millis(1),
            retry_max_backoff: Duration::from_millis(10),
        }
    }
}

/// Reconciliation (sync/clear tooling) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Root holding `async/` and `offline/` queue trees
    pub root: PathBuf,
    /// Longest a single queue may take to drain during sync (default: 10m)
    #[serde(with = "duration_millis")]
    pub sync_timeout: Duration,
    /// Remove a queue directory once sync drained it completely
    pub delete_after_sync: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            root: PathBuf::from(DEFAULT_ROOT),
            sync_timeout: Duration::from_secs(600),
            delete_after_sync: true,
        }
    }
}

impl SyncConfig {
    pub fn test(root: PathBuf) -> Self {
        SyncConfig {
            root,
            sync_timeout: Duration::from_secs(5),
            delete_after_sync: true,
        }
    }
}

/// Complete configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OpsyncConfig {
    pub queue: QueueConfig,
    pub consumer: ConsumerConfig,
    pub sync: SyncConfig,
}

impl OpsyncConfig {
    pub fn test(root: PathBuf) -> Self {
        OpsyncConfig {
            queue: QueueConfig::test(),
            consumer: ConsumerConfig::test(),
            sync: SyncConfig::test(root),
        }
    }

    /// Parse a TOML document; missing sections and keys keep their defaults
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Defaults overridden by `OPSYNC_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        OpsyncConfig::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from a variable lookup:
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `OPSYNC_ROOT` | `sync.root` |
    /// | `OPSYNC_FSYNC` | `queue.fsync_policy` |
    /// | `OPSYNC_MAX_SEGMENT_SIZE` | `queue.max_segment_size` |
    /// | `OPSYNC_POLL_INTERVAL_MS` | `consumer.poll_interval` |
    /// | `OPSYNC_RETRY_MAX_BACKOFF_MS` | `consumer.retry_max_backoff` |
    /// | `OPSYNC_SYNC_TIMEOUT_MS` | `sync.sync_timeout` |
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup("OPSYNC_ROOT") {
            self.sync.root = PathBuf::from(root);
        }
        if let Some(policy) = lookup("OPSYNC_FSYNC") {
            self.queue.fsync_policy = parse_env("OPSYNC_FSYNC", &policy)?;
        }
        if let Some(size) = lookup("OPSYNC_MAX_SEGMENT_SIZE") {
            self.queue.max_segment_size = parse_env("OPSYNC_MAX_SEGMENT_SIZE", &size)?;
        }
        if let Some(ms) = lookup("OPSYNC_POLL_INTERVAL_MS") {
            self.consumer.poll_interval =
                Duration::from_millis(parse_env("OPSYNC_POLL_INTERVAL_MS", &ms)?);
        }
        if let Some(ms) = lookup("OPSYNC_RETRY_MAX_BACKOFF_MS") {
            self.consumer.retry_max_backoff =
                Duration::from_millis(parse_env("OPSYNC_RETRY_MAX_BACKOFF_MS", &ms)?);
        }
        if let Some(ms) = lookup("OPSYNC_SYNC_TIMEOUT_MS") {
            self.sync.sync_timeout =
                Duration::from_millis(parse_env("OPSYNC_SYNC_TIMEOUT_MS", &ms)?);
        }
        Ok(self)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
    })
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = OpsyncConfig::default();
        assert_eq!(config.queue.fsync_policy, FsyncPolicy::EverySecond);
        assert_eq!(config.queue.max_segment_size, 64 * 1024 * 1024);
        assert_eq!(config.sync.root, PathBuf::from(".opsync"));
        assert!(config.consumer.retry_initial_backoff < config.consumer.retry_max_backoff);
    }

    #[test]
    fn test_from_toml_partial() {
        let config = OpsyncConfig::from_toml_str(
            r#"
            [queue]
            fsync_policy = "always"

            [consumer]
            poll_interval = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.queue.fsync_policy, FsyncPolicy::Always);
        assert_eq!(config.queue.max_segment_size, 64 * 1024 * 1024);
        assert_eq!(config.consumer.poll_interval, Duration::from_millis(250));
        assert_eq!(config.sync.sync_timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_from_toml_rejects_bad_policy() {
        let result = OpsyncConfig::from_toml_str("[queue]\nfsync_policy = \"sometimes\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("OPSYNC_ROOT", "/tmp/q"),
            ("OPSYNC_FSYNC", "no"),
            ("OPSYNC_POLL_INTERVAL_MS", "75"),
        ]
        .into_iter()
        .collect();
        let config = OpsyncConfig::default()
            .with_env_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.sync.root, PathBuf::from("/tmp/q"));
        assert_eq!(config.queue.fsync_policy, FsyncPolicy::No);
        assert_eq!(config.consumer.poll_interval, Duration::from_millis(75));
    }

    #[test]
    fn test_env_override_invalid() {
        let result = OpsyncConfig::default().with_env_overrides(|k| {
            (k == "OPSYNC_MAX_SEGMENT_SIZE").then(|| "lots".to_string())
        });
        assert!(matches!(result, Err(ConfigError::InvalidEnv { .. })));
    }

    #[test]
    fn test_config_serialization() {
        let config = OpsyncConfig::test(PathBuf::from("/tmp/opsync-test"));
        let json = serde_json::to_string(&config).unwrap();
        let parsed: OpsyncConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.queue.fsync_policy, parsed.queue.fsync_policy);
        assert_eq!(config.consumer.poll_interval, parsed.consumer.poll_interval);
        assert_eq!(config.sync.root, parsed.sync.root);
    }
}
