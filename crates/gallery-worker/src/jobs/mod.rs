//! Built-in job handler implementations.

pub mod moderation;
pub mod notification;
pub mod thumbnail;

pub use moderation::ModerationJobHandler;
pub use notification::{NotificationJobHandler, NotificationSink, TracingNotificationSink};
pub use thumbnail::ThumbnailJobHandler;

use serde::de::DeserializeOwned;

use gallery_entity::job::JobRecord;

use crate::executor::JobExecutionError;

/// Queue served by [`ThumbnailJobHandler`].
pub const THUMBNAILS_QUEUE: &str = "thumbnails";
/// Queue served by [`ModerationJobHandler`].
pub const MODERATION_QUEUE: &str = "moderation";
/// Queue served by [`NotificationJobHandler`].
pub const NOTIFICATIONS_QUEUE: &str = "notifications";
/// Every queue the server registers.
pub const BUILTIN_QUEUES: [&str; 3] = [THUMBNAILS_QUEUE, MODERATION_QUEUE, NOTIFICATIONS_QUEUE];

/// Decode a job payload; malformed payloads never succeed on retry.
pub(crate) fn decode_payload<T: DeserializeOwned>(job: &JobRecord) -> Result<T, JobExecutionError> {
    serde_json::from_value(job.payload.clone()).map_err(|e| {
        JobExecutionError::Permanent(format!("Invalid {} payload: {e}", job.queue))
    })
}
