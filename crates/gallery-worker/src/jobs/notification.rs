//! Notification fan-out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use gallery_core::result::AppResult;
use gallery_core::types::JobId;
use gallery_entity::job::JobRecord;

use super::decode_payload;
use crate::executor::{JobExecutionError, JobHandler};

/// Delivers a single notification to one recipient.
#[async_trait]
pub trait NotificationSink: Send + Sync + std::fmt::Debug {
    /// Deliver `message` about `event` to `recipient`.
    async fn deliver(&self, recipient: &str, event: &str, message: &str) -> AppResult<()>;
}

/// Sink that writes notifications to the log.
#[derive(Debug, Default)]
pub struct TracingNotificationSink;

#[async_trait]
impl NotificationSink for TracingNotificationSink {
    async fn deliver(&self, recipient: &str, event: &str, message: &str) -> AppResult<()> {
        info!(recipient, event, message, "Notification delivered");
        Ok(())
    }
}

/// Payload of a `notifications` job.
#[derive(Debug, Deserialize)]
struct NotificationPayload {
    event: String,
    recipients: Vec<String>,
    #[serde(default)]
    message: String,
}

/// Fans a notification out to every recipient.
///
/// Deliveries are remembered per job id, so a re-delivered job only reaches
/// recipients that were not notified the first time.
#[derive(Debug)]
pub struct NotificationJobHandler {
    sink: Arc<dyn NotificationSink>,
    delivered: Cache<(JobId, String), ()>,
}

impl NotificationJobHandler {
    /// Create a handler that delivers through `sink`.
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        let delivered = Cache::builder()
            .max_capacity(100_000)
            .time_to_live(Duration::from_secs(24 * 3600))
            .build();
        Self { sink, delivered }
    }
}

#[async_trait]
impl JobHandler for NotificationJobHandler {
    async fn handle(&self, job: &JobRecord) -> Result<Option<Value>, JobExecutionError> {
        let payload: NotificationPayload = decode_payload(job)?;

        let mut sent = 0usize;
        let mut skipped = 0usize;
        for recipient in &payload.recipients {
            let key = (job.id, recipient.clone());
            if self.delivered.contains_key(&key) {
                skipped += 1;
                continue;
            }
            self.sink
                .deliver(recipient, &payload.event, &payload.message)
                .await?;
            self.delivered.insert(key, ()).await;
            sent += 1;
        }

        info!(
            job_id = %job.id,
            event = %payload.event,
            sent,
            skipped,
            "Notification fan-out finished"
        );

        Ok(Some(json!({ "sent": sent, "skipped": skipped })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gallery_core::error::AppError;
    use std::sync::Mutex;

    /// Records deliveries; fails for the recipient named in `broken`.
    #[derive(Debug, Default)]
    struct RecordingSink {
        log: Mutex<Vec<String>>,
        broken: Mutex<Option<String>>,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn deliver(&self, recipient: &str, _event: &str, _message: &str) -> AppResult<()> {
            if self.broken.lock().unwrap().as_deref() == Some(recipient) {
                return Err(AppError::external_service("mailbox full"));
            }
            self.log.lock().unwrap().push(recipient.to_string());
            Ok(())
        }
    }

    fn job() -> JobRecord {
        JobRecord::new(
            "notifications",
            json!({"event": "comment", "recipients": ["ann", "bo", "cy"], "message": "hi"}),
            3,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_redelivery_skips_notified_recipients() {
        let sink = Arc::new(RecordingSink::default());
        *sink.broken.lock().unwrap() = Some("bo".to_string());
        let handler = NotificationJobHandler::new(sink.clone());
        let job = job();

        let err = handler.handle(&job).await.unwrap_err();
        assert!(err.is_retriable());
        assert_eq!(*sink.log.lock().unwrap(), vec!["ann"]);

        *sink.broken.lock().unwrap() = None;
        let result = handler.handle(&job).await.unwrap().unwrap();
        assert_eq!(result, json!({"sent": 2, "skipped": 1}));

        let again = handler.handle(&job).await.unwrap().unwrap();
        assert_eq!(again, json!({"sent": 0, "skipped": 3}));
        assert_eq!(*sink.log.lock().unwrap(), vec!["ann", "bo", "cy"]);
    }

    #[tokio::test]
    async fn test_missing_recipients_is_permanent() {
        let handler = NotificationJobHandler::new(Arc::new(TracingNotificationSink));
        let bad = JobRecord::new("notifications", json!({"event": "x"}), 3, Utc::now());
        let err = handler.handle(&bad).await.unwrap_err();
        assert!(!err.is_retriable());
    }
}
