//! In-memory broker for development and tests.
//!
//! Queue indexes live behind a single async mutex, so `claim` is atomic by
//! construction. Completed records are kept in a [moka] cache and expire
//! after the configured retention.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use moka::future::Cache;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use gallery_core::error::AppError;
use gallery_core::result::AppResult;
use gallery_core::types::JobId;
use gallery_entity::job::{JobRecord, JobState, QueueStats};

use crate::broker::Broker;

/// Per-queue indexes. Pending entries are ordered by ready time, then by
/// insertion order.
#[derive(Debug, Default)]
struct QueueIndex {
    pending: BTreeMap<(i64, u64), JobId>,
    active: HashMap<JobId, i64>,
    failed: Vec<JobId>,
    dead: Vec<JobId>,
    completed: u64,
    seq: u64,
}

impl QueueIndex {
    fn push_pending(&mut self, id: JobId, run_at: DateTime<Utc>) {
        self.seq += 1;
        self.pending.insert((run_at.timestamp_millis(), self.seq), id);
    }
}

/// In-process broker.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    /// Records that are pending, active, failed, or dead-lettered.
    records: Arc<DashMap<JobId, JobRecord>>,
    /// Completed records, retained for a bounded time.
    completed: Cache<JobId, JobRecord>,
    /// Queue indexes keyed by queue name.
    queues: Arc<Mutex<HashMap<String, QueueIndex>>>,
    /// Set once `close` has been called.
    closed: Arc<AtomicBool>,
}

impl MemoryBroker {
    /// Create an empty broker retaining completed records for `completed_ttl`.
    pub fn new(completed_ttl: Duration) -> Self {
        let completed = Cache::builder()
            .max_capacity(100_000)
            .time_to_live(completed_ttl)
            .build();

        Self {
            records: Arc::new(DashMap::new()),
            completed,
            queues: Arc::new(Mutex::new(HashMap::new())),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn ensure_open(&self) -> AppResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AppError::connection("Memory broker is closed"));
        }
        Ok(())
    }

    /// Release the lease on `job` and file it under its current state.
    async fn settle(&self, job: &JobRecord, expected: &[JobState]) -> AppResult<()> {
        self.ensure_open()?;
        if !expected.contains(&job.state) {
            return Err(AppError::validation(format!(
                "Cannot settle job {} in state {}",
                job.id, job.state
            )));
        }

        let mut queues = self.queues.lock().await;
        let index = queues.entry(job.queue.clone()).or_default();

        if index.active.remove(&job.id).is_none() {
            return Err(AppError::conflict(format!(
                "Lease on job {} is no longer held",
                job.id
            )));
        }

        match job.state {
            JobState::Pending => {
                index.push_pending(job.id, job.run_at);
                self.records.insert(job.id, job.clone());
            }
            JobState::Completed => {
                index.completed += 1;
                self.records.remove(&job.id);
                self.completed.insert(job.id, job.clone()).await;
            }
            JobState::Failed => {
                index.failed.push(job.id);
                self.records.insert(job.id, job.clone());
            }
            JobState::DeadLettered => {
                index.dead.push(job.id);
                self.records.insert(job.id, job.clone());
            }
            // Rejected by the state check above.
            JobState::Active => {}
        }

        debug!(job_id = %job.id, queue = %job.queue, state = %job.state, "Settled job");
        Ok(())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn ping(&self) -> AppResult<()> {
        self.ensure_open()
    }

    async fn push(&self, job: &JobRecord) -> AppResult<()> {
        self.ensure_open()?;
        let mut queues = self.queues.lock().await;
        self.records.insert(job.id, job.clone());
        queues
            .entry(job.queue.clone())
            .or_default()
            .push_pending(job.id, job.run_at);
        Ok(())
    }

    async fn claim(
        &self,
        queue: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Option<JobRecord>> {
        self.ensure_open()?;
        let mut queues = self.queues.lock().await;
        let Some(index) = queues.get_mut(queue) else {
            return Ok(None);
        };

        let Some((&key, &id)) = index.pending.iter().next() else {
            return Ok(None);
        };
        if key.0 > now.timestamp_millis() {
            return Ok(None);
        }

        let Some(mut record) = self.records.get_mut(&id) else {
            warn!(job_id = %id, queue, "Pending id has no record, dropping");
            index.pending.remove(&key);
            return Ok(None);
        };
        record
            .lease(worker_id, now)
            .map_err(|e| AppError::conflict(e.to_string()))?;
        index.pending.remove(&key);
        index.active.insert(id, now.timestamp_millis());

        Ok(Some(record.clone()))
    }

    async fn complete(&self, job: &JobRecord) -> AppResult<()> {
        self.settle(job, &[JobState::Completed]).await
    }

    async fn retry(&self, job: &JobRecord) -> AppResult<()> {
        self.settle(job, &[JobState::Pending]).await
    }

    async fn fail(&self, job: &JobRecord) -> AppResult<()> {
        self.settle(job, &[JobState::Failed, JobState::DeadLettered])
            .await
    }

    async fn get(&self, id: JobId) -> AppResult<Option<JobRecord>> {
        self.ensure_open()?;
        if let Some(record) = self.records.get(&id) {
            return Ok(Some(record.clone()));
        }
        Ok(self.completed.get(&id).await)
    }

    async fn recover_expired(
        &self,
        queue: &str,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<JobRecord>> {
        self.ensure_open()?;
        let mut queues = self.queues.lock().await;
        let Some(index) = queues.get_mut(queue) else {
            return Ok(Vec::new());
        };

        let cutoff_ms = cutoff.timestamp_millis();
        let expired: Vec<JobId> = index
            .active
            .iter()
            .filter(|(_, leased_at)| **leased_at < cutoff_ms)
            .map(|(id, _)| *id)
            .collect();

        let mut recovered = Vec::with_capacity(expired.len());
        for id in expired {
            index.active.remove(&id);
            let Some(mut record) = self.records.get_mut(&id) else {
                continue;
            };
            match record.release_expired(now) {
                Ok(JobState::Pending) => index.push_pending(id, record.run_at),
                Ok(_) => index.dead.push(id),
                Err(e) => {
                    warn!(job_id = %id, queue, error = %e, "Skipping unrecoverable lease");
                    continue;
                }
            }
            recovered.push(record.clone());
        }

        Ok(recovered)
    }

    async fn failures(&self, queue: &str, limit: usize) -> AppResult<Vec<JobRecord>> {
        self.ensure_open()?;
        let queues = self.queues.lock().await;
        let Some(index) = queues.get(queue) else {
            return Ok(Vec::new());
        };

        let mut records: Vec<JobRecord> = index
            .failed
            .iter()
            .chain(index.dead.iter())
            .filter_map(|id| self.records.get(id).map(|r| r.clone()))
            .collect();
        records.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
        records.truncate(limit);
        Ok(records)
    }

    async fn stats(&self, queue: &str) -> AppResult<QueueStats> {
        self.ensure_open()?;
        let queues = self.queues.lock().await;
        let stats = match queues.get(queue) {
            Some(index) => QueueStats {
                queue: queue.to_string(),
                pending: index.pending.len() as u64,
                active: index.active.len() as u64,
                completed: index.completed,
                failed: index.failed.len() as u64,
                dead_lettered: index.dead.len() as u64,
            },
            None => QueueStats {
                queue: queue.to_string(),
                ..QueueStats::default()
            },
        };
        Ok(stats)
    }

    async fn close(&self) -> AppResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn job(queue: &str, max_attempts: u32) -> JobRecord {
        JobRecord::new(queue, json!({"n": 1}), max_attempts, Utc::now())
    }

    #[tokio::test]
    async fn test_push_then_claim() {
        let broker = MemoryBroker::default();
        let j = job("thumbnails", 3);
        broker.push(&j).await.unwrap();

        let leased = broker
            .claim("thumbnails", "w-1", Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leased.id, j.id);
        assert_eq!(leased.state, JobState::Active);
        assert_eq!(leased.attempts, 1);

        assert!(broker
            .claim("thumbnails", "w-2", Utc::now())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_concurrent_claims_are_exclusive() {
        let broker = MemoryBroker::default();
        for _ in 0..20 {
            broker.push(&job("scan", 3)).await.unwrap();
        }

        let mut handles = Vec::new();
        for w in 0..8 {
            let broker = broker.clone();
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                while let Some(j) = broker
                    .claim("scan", &format!("w-{w}"), Utc::now())
                    .await
                    .unwrap()
                {
                    ids.push(j.id);
                }
                ids
            }));
        }

        let mut all = Vec::new();
        for h in handles {
            all.extend(h.await.unwrap());
        }
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(total, 20);
        assert_eq!(all.len(), 20);
    }

    #[tokio::test]
    async fn test_failed_lease_keeps_job_pending() {
        let broker = MemoryBroker::default();
        let mut stale = job("scan", 3);
        stale.lease("elsewhere", Utc::now()).unwrap();
        broker.push(&stale).await.unwrap();

        let err = broker.claim("scan", "w-1", Utc::now()).await.unwrap_err();
        assert_eq!(err.kind, gallery_core::error::ErrorKind::Conflict);

        let stats = broker.stats("scan").await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.active, 0);
        let stored = broker.get(stale.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn test_retry_is_delayed() {
        let broker = MemoryBroker::default();
        broker.push(&job("scan", 3)).await.unwrap();
        let now = Utc::now();
        let mut leased = broker.claim("scan", "w-1", now).await.unwrap().unwrap();

        let run_at = now + ChronoDuration::seconds(30);
        leased.retry(run_at).unwrap();
        broker.retry(&leased).await.unwrap();

        assert!(broker.claim("scan", "w-1", now).await.unwrap().is_none());
        let again = broker.claim("scan", "w-1", run_at).await.unwrap().unwrap();
        assert_eq!(again.attempts, 2);
    }

    #[tokio::test]
    async fn test_settle_without_lease_conflicts() {
        let broker = MemoryBroker::default();
        let mut j = job("scan", 3);
        broker.push(&j).await.unwrap();
        j.lease("w-1", Utc::now()).unwrap();
        j.complete(None, Utc::now()).unwrap();

        let err = broker.complete(&j).await.unwrap_err();
        assert_eq!(err.kind, gallery_core::error::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_complete_retains_record_and_counts() {
        let broker = MemoryBroker::default();
        broker.push(&job("thumbnails", 3)).await.unwrap();
        let mut leased = broker
            .claim("thumbnails", "w-1", Utc::now())
            .await
            .unwrap()
            .unwrap();
        leased.complete(Some(json!({"ok": true})), Utc::now()).unwrap();
        broker.complete(&leased).await.unwrap();

        let stored = broker.get(leased.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
        let stats = broker.stats("thumbnails").await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_failures_lists_failed_and_dead() {
        let broker = MemoryBroker::default();
        broker.push(&job("scan", 1)).await.unwrap();
        broker.push(&job("scan", 3)).await.unwrap();

        let mut first = broker.claim("scan", "w", Utc::now()).await.unwrap().unwrap();
        first.dead_letter("timeout", Utc::now()).unwrap();
        broker.fail(&first).await.unwrap();

        let mut second = broker.claim("scan", "w", Utc::now()).await.unwrap().unwrap();
        second.fail("bad input", Utc::now()).unwrap();
        broker.fail(&second).await.unwrap();

        let failures = broker.failures("scan", 10).await.unwrap();
        assert_eq!(failures.len(), 2);
        let stats = broker.stats("scan").await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_recover_expired_leases() {
        let broker = MemoryBroker::default();
        let leased_at = Utc::now() - ChronoDuration::minutes(30);
        let enqueued_at = leased_at - ChronoDuration::minutes(1);
        broker
            .push(&JobRecord::new("scan", json!({}), 3, enqueued_at))
            .await
            .unwrap();
        broker
            .push(&JobRecord::new("scan", json!({}), 1, enqueued_at))
            .await
            .unwrap();

        broker.claim("scan", "old", leased_at).await.unwrap().unwrap();
        broker.claim("scan", "old", leased_at).await.unwrap().unwrap();

        let now = Utc::now();
        let recovered = broker
            .recover_expired("scan", now - ChronoDuration::minutes(10), now)
            .await
            .unwrap();
        assert_eq!(recovered.len(), 2);

        let stats = broker.stats("scan").await.unwrap();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_recent_leases_are_not_recovered() {
        let broker = MemoryBroker::default();
        broker.push(&job("scan", 3)).await.unwrap();
        broker.claim("scan", "live", Utc::now()).await.unwrap().unwrap();

        let now = Utc::now();
        let recovered = broker
            .recover_expired("scan", now - ChronoDuration::minutes(10), now)
            .await
            .unwrap();
        assert!(recovered.is_empty());
    }

    #[tokio::test]
    async fn test_closed_broker_rejects_operations() {
        let broker = MemoryBroker::default();
        broker.close().await.unwrap();
        broker.close().await.unwrap();
        let err = broker.ping().await.unwrap_err();
        assert!(err.is_connection());
    }
}
