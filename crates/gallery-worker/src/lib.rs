//! Background job scheduling for the media gallery.
//!
//! This crate provides:
//! - A queue registry that the API layer enqueues work through
//! - Per-queue worker pools that lease and execute jobs with bounded concurrency
//! - A lifecycle controller with ordered startup and time-bounded drain
//! - Built-in handlers for thumbnails, moderation scans and notifications

pub mod error;
pub mod events;
pub mod executor;
pub mod jobs;
pub mod lifecycle;
pub mod pool;
pub mod registry;
pub mod retry;
pub mod shutdown;

pub use error::QueueError;
pub use events::{JobEvent, JobEventKind};
pub use executor::{JobExecutionError, JobHandler};
pub use lifecycle::{Scheduler, SchedulerState};
pub use registry::{QueueDefinition, QueueMode, QueueRegistry};
pub use retry::RetryPolicy;
pub use shutdown::ShutdownCoordinator;
