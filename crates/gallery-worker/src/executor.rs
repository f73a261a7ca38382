//! Job handler contract and panic-safe invocation.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;

use gallery_core::error::AppError;
use gallery_entity::job::JobRecord;

/// Trait for job handler implementations.
///
/// Delivery is at-least-once: a job may reach `handle` more than once (after
/// a crash or an expired lease), so handlers must tolerate re-delivery.
#[async_trait]
pub trait JobHandler: Send + Sync + std::fmt::Debug + 'static {
    /// Execute the job. The returned value is stored on the completed record.
    async fn handle(&self, job: &JobRecord) -> Result<Option<Value>, JobExecutionError>;
}

/// Error from job execution
#[derive(Debug, thiserror::Error)]
pub enum JobExecutionError {
    /// Permanent failure, do not retry
    #[error("Permanent job failure: {0}")]
    Permanent(String),

    /// Transient failure, may retry
    #[error("Transient job failure: {0}")]
    Transient(String),

    /// Infrastructure error raised inside the handler
    #[error("Internal error: {0}")]
    Internal(#[from] AppError),
}

impl JobExecutionError {
    /// Whether the job should be attempted again.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, Self::Permanent(_))
    }
}

/// Run `handler` on `job`, turning a panic into a transient failure.
pub(crate) async fn execute(
    handler: &dyn JobHandler,
    job: &JobRecord,
) -> Result<Option<Value>, JobExecutionError> {
    match AssertUnwindSafe(handler.handle(job)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => Err(JobExecutionError::Transient(format!(
            "Handler panicked: {}",
            panic_message(panic.as_ref())
        ))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic"
    }
}
