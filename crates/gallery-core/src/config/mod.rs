//! Application configuration schemas.
//!
//! All configuration structs are deserialized via the `config` crate from
//! `config/default.toml`, an environment overlay, and `GALLERY__*`
//! environment variables. Each sub-module represents a logical section.

pub mod broker;
pub mod logging;
pub mod moderation;
pub mod queue;

use serde::{Deserialize, Serialize};

use self::broker::BrokerConfig;
use self::logging::LoggingConfig;
use self::moderation::ModerationConfig;
use self::queue::QueueConfig;

use crate::error::AppError;

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Broker connection settings.
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Job queue and worker pool settings.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Moderation service settings.
    #[serde(default)]
    pub moderation: ModerationConfig,
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from TOML files.
    ///
    /// Merges `config/default`, the `config/<env>` overlay, and environment
    /// variables prefixed with `GALLERY` (e.g. `GALLERY__QUEUE__ENABLED=false`).
    pub fn load(env: &str) -> Result<Self, AppError> {
        Self::load_from("config", env)
    }

    /// Load configuration from an explicit directory.
    pub fn load_from(dir: &str, env: &str) -> Result<Self, AppError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(&format!("{dir}/default")).required(false))
            .add_source(config::File::with_name(&format!("{dir}/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("GALLERY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| AppError::configuration(format!("Failed to build config: {e}")))?;

        config
            .try_deserialize()
            .map_err(|e| AppError::configuration(format!("Failed to deserialize config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_files() {
        let config = AppConfig::load_from("does/not/exist", "test").unwrap();
        assert_eq!(config.broker.provider, "redis");
        assert_eq!(config.broker.connect_attempts, 3);
        assert_eq!(config.queue.drain_timeout_seconds, 30);
        assert_eq!(config.queue.retry_base_delay_ms, 1000);
        assert_eq!(config.queue.retry_max_delay_ms, 60_000);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_queue_overrides_from_toml() {
        let toml = r#"
            [queue]
            default_concurrency = 4

            [queue.queues.thumbnails]
            concurrency = 2
            max_attempts = 5
        "#;
        let config: AppConfig = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        let thumbs = config.queue.settings_for("thumbnails");
        assert_eq!(thumbs.concurrency, 2);
        assert_eq!(thumbs.max_attempts, 5);

        let other = config.queue.settings_for("moderation");
        assert_eq!(other.concurrency, 4);
        assert_eq!(other.max_attempts, 3);
    }
}
