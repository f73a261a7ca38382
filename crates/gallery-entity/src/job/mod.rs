//! Background job domain entities.

pub mod model;
pub mod state;
pub mod stats;

pub use model::{InvalidTransition, JobRecord, NotReplayable};
pub use state::JobState;
pub use stats::QueueStats;
