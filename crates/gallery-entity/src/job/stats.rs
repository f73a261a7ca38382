//! Queue statistics value type.

use serde::{Deserialize, Serialize};

/// Point-in-time counts for one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Queue name.
    pub queue: String,
    /// Jobs waiting for a lease, including those delayed by retry backoff.
    pub pending: u64,
    /// Jobs currently leased.
    pub active: u64,
    /// Jobs completed since the broker was created.
    pub completed: u64,
    /// Jobs that failed permanently.
    pub failed: u64,
    /// Jobs that exhausted their retries.
    pub dead_lettered: u64,
}
