//! Broker connection configuration.

use serde::{Deserialize, Serialize};

/// Broker provider and connection retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker provider: `"redis"` or `"memory"`.
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Number of connection attempts before giving up.
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    /// Delay before the second connection attempt, in milliseconds.
    #[serde(default = "default_connect_base_delay")]
    pub connect_base_delay_ms: u64,
    /// Upper bound for the delay between connection attempts, in milliseconds.
    #[serde(default = "default_connect_max_delay")]
    pub connect_max_delay_ms: u64,
    /// How long completed job records are retained, in seconds.
    #[serde(default = "default_completed_ttl")]
    pub completed_ttl_seconds: u64,
    /// Redis-specific settings.
    #[serde(default)]
    pub redis: RedisBrokerConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            connect_attempts: default_connect_attempts(),
            connect_base_delay_ms: default_connect_base_delay(),
            connect_max_delay_ms: default_connect_max_delay(),
            completed_ttl_seconds: default_completed_ttl(),
            redis: RedisBrokerConfig::default(),
        }
    }
}

/// Redis broker backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisBrokerConfig {
    /// Redis connection URL.
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Key prefix for all queue keys.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisBrokerConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_provider() -> String {
    "redis".to_string()
}

fn default_connect_attempts() -> u32 {
    3
}

fn default_connect_base_delay() -> u64 {
    500
}

fn default_connect_max_delay() -> u64 {
    4000
}

fn default_completed_ttl() -> u64 {
    3600
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_key_prefix() -> String {
    "gallery:".to_string()
}
