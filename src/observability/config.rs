//! Logging Configuration
//!
//! Loaded from environment variables for 12-factor compliance.
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | OPSYNC_LOG | `RUST_LOG`, else `info` | `EnvFilter` directives |
//! | OPSYNC_LOG_FORMAT | `text` | `text` or `json` |
//! | OPSYNC_LOG_TARGET | `true` | include the module path in each line |

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Filter directives, e.g. `info,opsync::queue=debug`
    pub filter: String,
    pub format: LogFormat,
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            filter: "info".to_string(),
            format: LogFormat::Text,
            with_target: true,
        }
    }
}

impl LoggingConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = LoggingConfig::default();
        LoggingConfig {
            filter: lookup("OPSYNC_LOG")
                .or_else(|| lookup("RUST_LOG"))
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.filter),
            format: match lookup("OPSYNC_LOG_FORMAT").as_deref().map(str::trim) {
                Some(f) if f.eq_ignore_ascii_case("json") => LogFormat::Json,
                _ => LogFormat::Text,
            },
            with_target: lookup("OPSYNC_LOG_TARGET")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(defaults.with_target),
        }
    }
}
