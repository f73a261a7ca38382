//! Job state enumeration.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting to be leased by a worker.
    Pending,
    /// Leased by exactly one worker slot and executing.
    Active,
    /// Handler succeeded.
    Completed,
    /// Handler reported a non-retriable failure.
    Failed,
    /// Transient failures exhausted every attempt.
    DeadLettered,
}

impl JobState {
    /// Check if the state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::DeadLettered)
    }

    /// Check if the state carries a failure reason.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::DeadLettered)
    }

    /// Return the state as a snake_case string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
