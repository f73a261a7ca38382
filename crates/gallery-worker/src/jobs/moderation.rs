//! Content-moderation scanning through an external HTTP service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use gallery_core::config::moderation::ModerationConfig;
use gallery_core::error::{AppError, ErrorKind};
use gallery_core::result::AppResult;
use gallery_entity::job::JobRecord;

use super::decode_payload;
use crate::executor::{JobExecutionError, JobHandler};

/// Payload of a `moderation` job.
#[derive(Debug, Deserialize)]
struct ModerationPayload {
    media_id: String,
    url: String,
}

/// Submits media to the moderation service and returns its verdict.
#[derive(Debug, Clone)]
pub struct ModerationJobHandler {
    client: reqwest::Client,
    endpoint: String,
}

impl ModerationJobHandler {
    /// Create a handler from configuration.
    pub fn new(config: &ModerationConfig) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| {
                AppError::with_source(
                    ErrorKind::Configuration,
                    "Failed to build moderation HTTP client",
                    e,
                )
            })?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
        })
    }
}

#[async_trait]
impl JobHandler for ModerationJobHandler {
    async fn handle(&self, job: &JobRecord) -> Result<Option<Value>, JobExecutionError> {
        let payload: ModerationPayload = decode_payload(job)?;

        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "media_id": payload.media_id, "url": payload.url }))
            .send()
            .await
            .map_err(|e| {
                JobExecutionError::Transient(format!("Moderation request failed: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                media_id = %payload.media_id,
                status = status.as_u16(),
                "Moderation service rejected request"
            );
            return Err(classify_failure(status, &body));
        }

        let verdict: Value = response.json().await.map_err(|e| {
            JobExecutionError::Transient(format!("Invalid moderation response: {e}"))
        })?;

        info!(media_id = %payload.media_id, "Moderation scan finished");
        Ok(Some(verdict))
    }
}

/// Rate limits and server errors may clear up; other client errors will not.
fn classify_failure(status: StatusCode, body: &str) -> JobExecutionError {
    let msg = format!("Moderation service returned {status}: {body}");
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        JobExecutionError::Transient(msg)
    } else {
        JobExecutionError::Permanent(msg)
    }
}
