//! Thumbnail generation for uploaded media.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use image::ImageFormat;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use gallery_entity::job::JobRecord;

use super::decode_payload;
use crate::executor::{JobExecutionError, JobHandler};

/// Payload of a `thumbnails` job.
#[derive(Debug, Deserialize)]
struct ThumbnailPayload {
    media_id: String,
    source_path: PathBuf,
    output_dir: PathBuf,
    #[serde(default = "default_sizes")]
    sizes: Vec<u32>,
}

fn default_sizes() -> Vec<u32> {
    vec![256]
}

/// Renders PNG thumbnails, one per requested size.
///
/// Outputs go to `<output_dir>/<media_id>_<size>.png` and are overwritten on
/// re-delivery.
#[derive(Debug, Default)]
pub struct ThumbnailJobHandler;

impl ThumbnailJobHandler {
    /// Create a new thumbnail job handler
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl JobHandler for ThumbnailJobHandler {
    async fn handle(&self, job: &JobRecord) -> Result<Option<Value>, JobExecutionError> {
        let payload: ThumbnailPayload = decode_payload(job)?;
        if payload.sizes.is_empty() || payload.sizes.contains(&0) {
            return Err(JobExecutionError::Permanent(
                "Thumbnail sizes must be non-empty and positive".to_string(),
            ));
        }
        if payload.media_id.is_empty() || payload.media_id.contains(['/', '\\']) {
            return Err(JobExecutionError::Permanent(format!(
                "Invalid media_id: '{}'",
                payload.media_id
            )));
        }

        let source = tokio::fs::read(&payload.source_path).await.map_err(|e| {
            JobExecutionError::Transient(format!(
                "Failed to read '{}': {e}",
                payload.source_path.display()
            ))
        })?;

        let sizes = payload.sizes.clone();
        let rendered = tokio::task::spawn_blocking(move || render(&source, &sizes))
            .await
            .map_err(|e| JobExecutionError::Transient(format!("Render task failed: {e}")))??;

        tokio::fs::create_dir_all(&payload.output_dir)
            .await
            .map_err(|e| io_error(&payload.output_dir, e))?;

        let mut outputs = Vec::with_capacity(rendered.len());
        for (size, bytes) in rendered {
            let path = payload
                .output_dir
                .join(format!("{}_{size}.png", payload.media_id));
            tokio::fs::write(&path, bytes)
                .await
                .map_err(|e| io_error(&path, e))?;
            outputs.push(path.display().to_string());
        }

        info!(
            media_id = %payload.media_id,
            count = outputs.len(),
            "Generated thumbnails"
        );

        Ok(Some(json!({
            "media_id": payload.media_id,
            "thumbnails": outputs,
        })))
    }
}

/// Decode once and encode a PNG per size.
fn render(data: &[u8], sizes: &[u32]) -> Result<Vec<(u32, Vec<u8>)>, JobExecutionError> {
    let img = image::load_from_memory(data)
        .map_err(|e| JobExecutionError::Permanent(format!("Failed to decode image: {e}")))?;

    sizes
        .iter()
        .map(|&size| {
            let thumb = img.thumbnail(size, size);
            let mut buf = Vec::new();
            thumb
                .write_to(&mut std::io::Cursor::new(&mut buf), ImageFormat::Png)
                .map_err(|e| {
                    JobExecutionError::Permanent(format!("Failed to encode thumbnail: {e}"))
                })?;
            Ok((size, buf))
        })
        .collect()
}

fn io_error(path: &Path, e: std::io::Error) -> JobExecutionError {
    JobExecutionError::Transient(format!("I/O error on '{}': {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use image::{GenericImageView, RgbImage};

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("gallery-thumbs-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn job(payload: Value) -> JobRecord {
        JobRecord::new("thumbnails", payload, 3, Utc::now())
    }

    #[tokio::test]
    async fn test_writes_one_png_per_size() {
        let dir = scratch_dir();
        let source = dir.join("source.png");
        RgbImage::from_pixel(80, 40, image::Rgb([200, 10, 10]))
            .save(&source)
            .unwrap();
        let out = dir.join("out");

        let result = ThumbnailJobHandler::new()
            .handle(&job(json!({
                "media_id": "m1",
                "source_path": source,
                "output_dir": out,
                "sizes": [16, 32],
            })))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(result["thumbnails"].as_array().unwrap().len(), 2);
        let small = image::open(out.join("m1_16.png")).unwrap();
        assert_eq!(small.dimensions(), (16, 8));
        let large = image::open(out.join("m1_32.png")).unwrap();
        assert!(large.width() <= 32 && large.height() <= 32);

        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_missing_fields_are_permanent() {
        let err = ThumbnailJobHandler::new()
            .handle(&job(json!({"media_id": "m1"})))
            .await
            .unwrap_err();
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn test_undecodable_image_is_permanent() {
        let dir = scratch_dir();
        let source = dir.join("broken.png");
        std::fs::write(&source, b"not an image").unwrap();

        let err = ThumbnailJobHandler::new()
            .handle(&job(json!({
                "media_id": "m2",
                "source_path": source,
                "output_dir": dir.join("out"),
            })))
            .await
            .unwrap_err();
        assert!(matches!(err, JobExecutionError::Permanent(_)));

        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_unreadable_source_is_transient() {
        let dir = scratch_dir();
        let err = ThumbnailJobHandler::new()
            .handle(&job(json!({
                "media_id": "m3",
                "source_path": dir.join("missing.png"),
                "output_dir": dir.join("out"),
            })))
            .await
            .unwrap_err();
        assert!(matches!(err, JobExecutionError::Transient(_)));

        std::fs::remove_dir_all(dir).ok();
    }
}
