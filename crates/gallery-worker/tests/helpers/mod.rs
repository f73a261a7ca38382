//! Shared test helpers for scheduler integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use gallery_broker::memory::MemoryBroker;
use gallery_broker::{Broker, BrokerConnector};
use gallery_core::config::queue::QueueConfig;
use gallery_core::error::AppError;
use gallery_core::result::AppResult;
use gallery_core::types::JobId;
use gallery_entity::job::{JobRecord, JobState, QueueStats};
use gallery_worker::{JobExecutionError, JobHandler, QueueRegistry, RetryPolicy, Scheduler};

/// Queue settings with short timings.
pub fn test_config() -> QueueConfig {
    QueueConfig {
        poll_interval_ms: 10,
        drain_timeout_seconds: 5,
        ..Default::default()
    }
}

/// Retry policy with millisecond backoff.
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(
        max_attempts,
        Duration::from_millis(5),
        Duration::from_millis(20),
    )
}

/// Build a scheduler over an injected broker.
pub fn scheduler(config: QueueConfig, registry: QueueRegistry, broker: Arc<dyn Broker>) -> Scheduler {
    Scheduler::new(config, registry, BrokerConnector::from_broker(broker))
}

/// Poll until the job reaches `state`, returning the record.
pub async fn wait_for_state(registry: &QueueRegistry, id: JobId, state: JobState) -> JobRecord {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let job = registry.job(id).await.expect("job lookup failed");
        if job.state == state {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {id} stuck in {} waiting for {state}",
            job.state
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Fails transiently until the job's attempt count exceeds `failures`.
#[derive(Debug, Default)]
pub struct FlakyHandler {
    pub failures: u32,
    pub calls: AtomicU32,
}

impl FlakyHandler {
    pub fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl JobHandler for FlakyHandler {
    async fn handle(&self, job: &JobRecord) -> Result<Option<Value>, JobExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if job.attempts <= self.failures {
            Err(JobExecutionError::Transient(format!(
                "attempt {} failed",
                job.attempts
            )))
        } else {
            Ok(Some(json!({ "attempt": job.attempts })))
        }
    }
}

/// Always reports a non-retriable failure.
#[derive(Debug)]
pub struct RejectingHandler;

#[async_trait]
impl JobHandler for RejectingHandler {
    async fn handle(&self, _job: &JobRecord) -> Result<Option<Value>, JobExecutionError> {
        Err(JobExecutionError::Permanent("unsupported format".to_string()))
    }
}

/// Panics on the first attempt, succeeds afterwards.
#[derive(Debug)]
pub struct PanicOnceHandler;

#[async_trait]
impl JobHandler for PanicOnceHandler {
    async fn handle(&self, job: &JobRecord) -> Result<Option<Value>, JobExecutionError> {
        if job.attempts == 1 {
            panic!("first attempt panics");
        }
        Ok(None)
    }
}

/// Records the highest number of simultaneously running invocations.
#[derive(Debug, Default)]
pub struct GaugeHandler {
    pub current: AtomicUsize,
    pub max_seen: AtomicUsize,
    pub delay: Duration,
}

impl GaugeHandler {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Default::default()
        })
    }
}

#[async_trait]
impl JobHandler for GaugeHandler {
    async fn handle(&self, _job: &JobRecord) -> Result<Option<Value>, JobExecutionError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(None)
    }
}

/// Idempotent handler: marks `media_id` as processed in a shared set.
#[derive(Debug, Default)]
pub struct MarkProcessedHandler {
    pub processed: Mutex<HashSet<String>>,
    pub calls: AtomicU32,
}

#[async_trait]
impl JobHandler for MarkProcessedHandler {
    async fn handle(&self, job: &JobRecord) -> Result<Option<Value>, JobExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let media_id = job
            .payload
            .get("media_id")
            .and_then(Value::as_str)
            .ok_or_else(|| JobExecutionError::Permanent("missing media_id".to_string()))?;
        self.processed
            .lock()
            .map_err(|_| JobExecutionError::Transient("poisoned".to_string()))?
            .insert(media_id.to_string());
        Ok(None)
    }
}

/// Broker that is never reachable.
#[derive(Debug, Default)]
pub struct UnreachableBroker {
    pub pings: AtomicU32,
}

fn refused() -> AppError {
    AppError::connection("connection refused")
}

#[async_trait]
impl Broker for UnreachableBroker {
    async fn ping(&self) -> AppResult<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        Err(refused())
    }
    async fn push(&self, _job: &JobRecord) -> AppResult<()> {
        Err(refused())
    }
    async fn claim(
        &self,
        _queue: &str,
        _worker_id: &str,
        _now: DateTime<Utc>,
    ) -> AppResult<Option<JobRecord>> {
        Err(refused())
    }
    async fn complete(&self, _job: &JobRecord) -> AppResult<()> {
        Err(refused())
    }
    async fn retry(&self, _job: &JobRecord) -> AppResult<()> {
        Err(refused())
    }
    async fn fail(&self, _job: &JobRecord) -> AppResult<()> {
        Err(refused())
    }
    async fn get(&self, _id: JobId) -> AppResult<Option<JobRecord>> {
        Err(refused())
    }
    async fn recover_expired(
        &self,
        _queue: &str,
        _cutoff: DateTime<Utc>,
        _now: DateTime<Utc>,
    ) -> AppResult<Vec<JobRecord>> {
        Err(refused())
    }
    async fn failures(&self, _queue: &str, _limit: usize) -> AppResult<Vec<JobRecord>> {
        Err(refused())
    }
    async fn stats(&self, _queue: &str) -> AppResult<QueueStats> {
        Err(refused())
    }
    async fn close(&self) -> AppResult<()> {
        Ok(())
    }
}

/// In-memory broker that counts `close` calls instead of closing, so tests
/// can still inspect it after shutdown.
#[derive(Debug)]
pub struct TrackingBroker {
    pub inner: MemoryBroker,
    pub closes: AtomicU32,
}

impl TrackingBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryBroker::new(Duration::from_secs(600)),
            closes: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl Broker for TrackingBroker {
    async fn ping(&self) -> AppResult<()> {
        self.inner.ping().await
    }
    async fn push(&self, job: &JobRecord) -> AppResult<()> {
        self.inner.push(job).await
    }
    async fn claim(
        &self,
        queue: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Option<JobRecord>> {
        self.inner.claim(queue, worker_id, now).await
    }
    async fn complete(&self, job: &JobRecord) -> AppResult<()> {
        self.inner.complete(job).await
    }
    async fn retry(&self, job: &JobRecord) -> AppResult<()> {
        self.inner.retry(job).await
    }
    async fn fail(&self, job: &JobRecord) -> AppResult<()> {
        self.inner.fail(job).await
    }
    async fn get(&self, id: JobId) -> AppResult<Option<JobRecord>> {
        self.inner.get(id).await
    }
    async fn recover_expired(
        &self,
        queue: &str,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<JobRecord>> {
        self.inner.recover_expired(queue, cutoff, now).await
    }
    async fn failures(&self, queue: &str, limit: usize) -> AppResult<Vec<JobRecord>> {
        self.inner.failures(queue, limit).await
    }
    async fn stats(&self, queue: &str) -> AppResult<QueueStats> {
        self.inner.stats(queue).await
    }
    async fn close(&self) -> AppResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
