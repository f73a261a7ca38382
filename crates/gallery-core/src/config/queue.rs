//! Job queue and worker pool configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Scheduler-wide queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Whether the queueing subsystem is enabled at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Interval between lease attempts on an idle queue, in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// How long shutdown waits for in-flight jobs, in seconds.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_seconds: u64,
    /// Age after which an `Active` lease is considered abandoned, in seconds.
    #[serde(default = "default_lease_timeout")]
    pub lease_timeout_seconds: u64,
    /// Capacity of the job event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Concurrency for queues without an explicit override.
    #[serde(default = "default_concurrency")]
    pub default_concurrency: usize,
    /// Max attempts for queues without an explicit override.
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,
    /// Base retry backoff, in milliseconds.
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
    /// Retry backoff cap, in milliseconds.
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,
    /// Per-queue overrides keyed by queue name.
    #[serde(default)]
    pub queues: HashMap<String, QueueOverride>,
}

/// Per-queue overrides. Unset fields fall back to the queue defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueOverride {
    /// Max simultaneously active jobs.
    pub concurrency: Option<usize>,
    /// Max execution attempts before dead-lettering.
    pub max_attempts: Option<u32>,
    /// Base retry backoff, in milliseconds.
    pub retry_base_delay_ms: Option<u64>,
    /// Retry backoff cap, in milliseconds.
    pub retry_max_delay_ms: Option<u64>,
}

/// Fully resolved settings for one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    /// Max simultaneously active jobs.
    pub concurrency: usize,
    /// Max execution attempts before dead-lettering.
    pub max_attempts: u32,
    /// Base retry backoff, in milliseconds.
    pub retry_base_delay_ms: u64,
    /// Retry backoff cap, in milliseconds.
    pub retry_max_delay_ms: u64,
}

impl QueueConfig {
    /// Resolve the effective settings for a queue.
    pub fn settings_for(&self, queue: &str) -> QueueSettings {
        let over = self.queues.get(queue).cloned().unwrap_or_default();
        QueueSettings {
            concurrency: over.concurrency.unwrap_or(self.default_concurrency),
            max_attempts: over.max_attempts.unwrap_or(self.default_max_attempts),
            retry_base_delay_ms: over.retry_base_delay_ms.unwrap_or(self.retry_base_delay_ms),
            retry_max_delay_ms: over.retry_max_delay_ms.unwrap_or(self.retry_max_delay_ms),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            poll_interval_ms: default_poll_interval(),
            drain_timeout_seconds: default_drain_timeout(),
            lease_timeout_seconds: default_lease_timeout(),
            event_capacity: default_event_capacity(),
            default_concurrency: default_concurrency(),
            default_max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            queues: HashMap::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    500
}

fn default_drain_timeout() -> u64 {
    30
}

fn default_lease_timeout() -> u64 {
    600
}

fn default_event_capacity() -> usize {
    256
}

fn default_concurrency() -> usize {
    2
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    1000
}

fn default_retry_max_delay() -> u64 {
    60_000
}
