//! Logging setup
//!
//! The library only emits `tracing` events. Embedding applications and
//! tooling call `init_tracing` once at startup to print them.

pub mod config;

pub use config::{LogFormat, LoggingConfig};

use tracing_subscriber::EnvFilter;

/// Install a global `fmt` subscriber. Returns `false` if one was already set.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.with_target);

    match config.format {
        LogFormat::Json => builder.json().try_init().is_ok(),
        LogFormat::Text => builder.try_init().is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice() {
        let config = LoggingConfig {
            filter: "not a [valid filter".to_string(),
            ..LoggingConfig::default()
        };
        // First call may lose to another test's subscriber; the second never wins
        let _ = init_tracing(&config);
        assert!(!init_tracing(&LoggingConfig::default()));
    }
}
