//! Broker key builders.
//!
//! Keys are relative; the Redis client applies the configured prefix.
//! Centralising key construction makes it easy to find every key the
//! scheduler writes.

use gallery_core::types::JobId;

/// Key holding the JSON record of a job.
pub fn job(id: JobId) -> String {
    format!("job:{id}")
}

/// Sorted set of pending job ids, scored by `run_at` in epoch milliseconds.
pub fn pending(queue: &str) -> String {
    format!("queue:{queue}:pending")
}

/// Sorted set of leased job ids, scored by lease time in epoch milliseconds.
pub fn active(queue: &str) -> String {
    format!("queue:{queue}:active")
}

/// Sorted set of permanently failed job ids, scored by finish time.
pub fn failed(queue: &str) -> String {
    format!("queue:{queue}:failed")
}

/// Sorted set of dead-lettered job ids, scored by finish time.
pub fn dead(queue: &str) -> String {
    format!("queue:{queue}:dead")
}

/// Counter of completed jobs.
pub fn completed(queue: &str) -> String {
    format!("queue:{queue}:completed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_job_key() {
        let id = JobId::from_str("00000000-0000-0000-0000-000000000000").unwrap();
        assert_eq!(job(id), "job:00000000-0000-0000-0000-000000000000");
    }

    #[test]
    fn test_queue_keys() {
        assert_eq!(pending("thumbnails"), "queue:thumbnails:pending");
        assert_eq!(active("thumbnails"), "queue:thumbnails:active");
        assert_eq!(dead("scan"), "queue:scan:dead");
    }
}
