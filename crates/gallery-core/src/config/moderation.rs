//! Content-moderation service configuration.

use serde::{Deserialize, Serialize};

/// Settings for the external moderation scanner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationConfig {
    /// Scan endpoint that accepts `POST { media_id, url }`.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            timeout_seconds: default_timeout(),
        }
    }
}

fn default_endpoint() -> String {
    "http://localhost:8090/v1/scan".to_string()
}

fn default_timeout() -> u64 {
    30
}
