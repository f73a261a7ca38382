//! Queue-facing error taxonomy.

use thiserror::Error;

use gallery_core::error::AppError;
use gallery_core::types::JobId;
use gallery_entity::job::{JobState, NotReplayable};

use crate::registry::QueueMode;

/// Errors returned by the queue registry.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The broker could not be reached or rejected the write.
    #[error("Broker unavailable: {0}")]
    Connection(#[source] AppError),

    /// No queue with this name was registered.
    #[error("Unknown queue: '{0}'")]
    UnknownQueue(String),

    /// A queue with this name is already registered.
    #[error("Queue '{0}' is already registered")]
    DuplicateQueue(String),

    /// The subsystem is not accepting jobs.
    #[error("Queueing is disabled (mode: {mode})")]
    QueueDisabled {
        /// Mode at the time of the call.
        mode: QueueMode,
    },

    /// A queue definition failed validation.
    #[error("Invalid definition for queue '{name}': {reason}")]
    InvalidDefinition {
        /// Queue name.
        name: String,
        /// What was wrong.
        reason: String,
    },

    /// No job record with this id exists.
    #[error("Job not found: {0}")]
    NotFound(JobId),

    /// Only failed or dead-lettered jobs can be replayed.
    #[error("Job {id} cannot be replayed from state {state}")]
    NotReplayable {
        /// Job id.
        id: JobId,
        /// State the job is in.
        state: JobState,
    },
}

impl From<AppError> for QueueError {
    fn from(err: AppError) -> Self {
        Self::Connection(err)
    }
}

impl From<NotReplayable> for QueueError {
    fn from(err: NotReplayable) -> Self {
        Self::NotReplayable {
            id: err.id,
            state: err.state,
        }
    }
}
