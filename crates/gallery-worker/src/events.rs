//! Job completion events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use gallery_core::types::JobId;

/// Outcome of a single execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEventKind {
    /// The handler succeeded.
    Completed,
    /// A transient failure; the job runs again at `run_at`.
    Retrying {
        /// When the job becomes eligible again.
        run_at: DateTime<Utc>,
    },
    /// A non-retriable failure.
    Failed,
    /// Transient failures exhausted every attempt.
    DeadLettered,
}

/// Published after a job outcome has been persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    /// Job id.
    pub job_id: JobId,
    /// Owning queue.
    pub queue: String,
    /// What happened.
    pub kind: JobEventKind,
    /// Attempts made so far.
    pub attempts: u32,
    /// Failure reason, if any.
    pub error: Option<String>,
}
