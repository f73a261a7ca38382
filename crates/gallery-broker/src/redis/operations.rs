//! Redis broker implementation.
//!
//! Each queue keeps its job ids in sorted sets (`pending` scored by ready
//! time, `active` scored by lease time, `failed`/`dead` scored by finish
//! time); job records are JSON strings under `job:<id>`. A lease is taken by
//! a Lua script that checks the id is still pending and the record is
//! unchanged, then moves the id to `active` and stores the leased record in
//! the same step. Ending a lease goes through a second script that first
//! removes the id from `active` and does nothing if it was already gone.

use std::sync::LazyLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Script;
use tracing::{debug, warn};

use gallery_core::error::AppError;
use gallery_core::result::AppResult;
use gallery_core::types::JobId;
use gallery_entity::job::{JobRecord, JobState, QueueStats};

use super::client::RedisClient;
use crate::broker::Broker;
use crate::keys;

/// KEYS: pending, active, job. ARGV: id, expected record, leased record, now (ms).
const LEASE_LUA: &str = r#"
if not redis.call('ZSCORE', KEYS[1], ARGV[1]) then
  return 0
end
if redis.call('GET', KEYS[3]) ~= ARGV[2] then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('ZADD', KEYS[2], ARGV[4], ARGV[1])
redis.call('SET', KEYS[3], ARGV[3])
return 1
"#;

/// Claim attempts per call before yielding to the next poll.
const CLAIM_ROUNDS: usize = 16;

/// KEYS: active, job, target. ARGV: id, record json, mode, score, ttl seconds.
const SETTLE_LUA: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
  return 0
end
if ARGV[3] == 'completed' then
  redis.call('SET', KEYS[2], ARGV[2], 'EX', ARGV[5])
  redis.call('INCR', KEYS[3])
else
  redis.call('SET', KEYS[2], ARGV[2])
  redis.call('ZADD', KEYS[3], ARGV[4], ARGV[1])
end
return 1
"#;

static LEASE_SCRIPT: LazyLock<Script> = LazyLock::new(|| Script::new(LEASE_LUA));
static SETTLE_SCRIPT: LazyLock<Script> = LazyLock::new(|| Script::new(SETTLE_LUA));

/// Redis-backed broker.
#[derive(Debug)]
pub struct RedisBroker {
    /// Redis client.
    client: RedisClient,
    /// Retention for completed records.
    completed_ttl: Duration,
    /// Set once `close` has been called.
    closed: AtomicBool,
}

impl RedisBroker {
    /// Create a new Redis broker.
    pub fn new(client: RedisClient, completed_ttl: Duration) -> Self {
        Self {
            client,
            completed_ttl,
            closed: AtomicBool::new(false),
        }
    }

    /// Map a Redis error to an AppError.
    fn map_err(e: redis::RedisError) -> AppError {
        let message = format!("Redis error: {e}");
        let err = if e.is_io_error() || e.is_connection_dropped() {
            AppError::connection(message)
        } else {
            AppError::broker(message)
        };
        AppError {
            source: Some(Box::new(e)),
            ..err
        }
    }

    fn ensure_open(&self) -> AppResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AppError::connection("Redis broker is closed"));
        }
        Ok(())
    }

    fn key(&self, key: &str) -> String {
        self.client.prefixed_key(key)
    }

    async fn load(&self, id: &str) -> AppResult<Option<JobRecord>> {
        self.load_raw(id)
            .await?
            .map(|r| serde_json::from_str(&r).map_err(AppError::from))
            .transpose()
    }

    async fn load_raw(&self, id: &str) -> AppResult<Option<String>> {
        let mut conn = self.client.conn_mut();
        redis::cmd("GET")
            .arg(self.key(&format!("job:{id}")))
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)
    }

    /// Oldest pending id of `queue` that is ready at `now`.
    async fn next_ready(&self, queue: &str, now: DateTime<Utc>) -> AppResult<Option<String>> {
        let mut conn = self.client.conn_mut();
        let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.key(&keys::pending(queue)))
            .arg("-inf")
            .arg(now.timestamp_millis())
            .arg("LIMIT")
            .arg(0)
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)?;
        Ok(ids.into_iter().next())
    }

    async fn load_many(&self, ids: &[String]) -> AppResult<Vec<JobRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let job_keys: Vec<String> = ids.iter().map(|id| self.key(&format!("job:{id}"))).collect();
        let mut conn = self.client.conn_mut();
        let raws: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&job_keys)
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)?;

        raws.into_iter()
            .flatten()
            .map(|raw| serde_json::from_str(&raw).map_err(AppError::from))
            .collect()
    }

    /// Run the settle script for `job` in its current state.
    ///
    /// Returns `false` when the lease was no longer held.
    async fn settle(&self, job: &JobRecord) -> AppResult<bool> {
        let (target, mode, score) = match job.state {
            JobState::Pending => (keys::pending(&job.queue), "pending", job.run_at.timestamp_millis()),
            JobState::Completed => (keys::completed(&job.queue), "completed", 0),
            JobState::Failed => (
                keys::failed(&job.queue),
                "index",
                finished_ms(job),
            ),
            JobState::DeadLettered => (keys::dead(&job.queue), "index", finished_ms(job)),
            JobState::Active => {
                return Err(AppError::validation(format!(
                    "Job {} is still active",
                    job.id
                )));
            }
        };

        let payload = serde_json::to_string(job)?;
        let mut conn = self.client.conn_mut();
        let held: i64 = SETTLE_SCRIPT
            .key(self.key(&keys::active(&job.queue)))
            .key(self.key(&keys::job(job.id)))
            .key(self.key(&target))
            .arg(job.id.to_string())
            .arg(payload)
            .arg(mode)
            .arg(score)
            .arg(self.completed_ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(Self::map_err)?;

        Ok(held == 1)
    }

    async fn settle_expecting(&self, job: &JobRecord, expected: &[JobState]) -> AppResult<()> {
        self.ensure_open()?;
        if !expected.contains(&job.state) {
            return Err(AppError::validation(format!(
                "Cannot settle job {} in state {}",
                job.id, job.state
            )));
        }
        if !self.settle(job).await? {
            return Err(AppError::conflict(format!(
                "Lease on job {} is no longer held",
                job.id
            )));
        }
        debug!(job_id = %job.id, queue = %job.queue, state = %job.state, "Settled job");
        Ok(())
    }
}

fn finished_ms(job: &JobRecord) -> i64 {
    job.finished_at.unwrap_or_else(Utc::now).timestamp_millis()
}

#[async_trait]
impl Broker for RedisBroker {
    async fn ping(&self) -> AppResult<()> {
        self.ensure_open()?;
        let mut conn = self.client.conn_mut();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)?;
        if pong != "PONG" {
            return Err(AppError::broker(format!(
                "Unexpected PING reply: {pong}"
            )));
        }
        Ok(())
    }

    async fn push(&self, job: &JobRecord) -> AppResult<()> {
        self.ensure_open()?;
        let payload = serde_json::to_string(job)?;
        let mut conn = self.client.conn_mut();
        let _: () = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(self.key(&keys::job(job.id)))
            .arg(payload)
            .ignore()
            .cmd("ZADD")
            .arg(self.key(&keys::pending(&job.queue)))
            .arg(job.run_at.timestamp_millis())
            .arg(job.id.to_string())
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)?;
        Ok(())
    }

    async fn claim(
        &self,
        queue: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Option<JobRecord>> {
        self.ensure_open()?;
        let pending_key = self.key(&keys::pending(queue));
        let active_key = self.key(&keys::active(queue));

        for _ in 0..CLAIM_ROUNDS {
            let Some(id) = self.next_ready(queue, now).await? else {
                return Ok(None);
            };

            let mut conn = self.client.conn_mut();
            let Some(raw) = self.load_raw(&id).await? else {
                warn!(job_id = %id, queue, "Pending id has no record, dropping");
                let _: i64 = redis::cmd("ZREM")
                    .arg(&pending_key)
                    .arg(&id)
                    .query_async(&mut conn)
                    .await
                    .map_err(Self::map_err)?;
                continue;
            };

            let mut record: JobRecord = serde_json::from_str(&raw)?;
            record
                .lease(worker_id, now)
                .map_err(|e| AppError::conflict(e.to_string()))?;

            let leased: i64 = LEASE_SCRIPT
                .key(&pending_key)
                .key(&active_key)
                .key(self.key(&keys::job(record.id)))
                .arg(&id)
                .arg(&raw)
                .arg(serde_json::to_string(&record)?)
                .arg(now.timestamp_millis())
                .invoke_async(&mut conn)
                .await
                .map_err(Self::map_err)?;

            if leased == 1 {
                return Ok(Some(record));
            }
            debug!(job_id = %id, queue, "Lost lease race, retrying");
        }

        Ok(None)
    }

    async fn complete(&self, job: &JobRecord) -> AppResult<()> {
        self.settle_expecting(job, &[JobState::Completed]).await
    }

    async fn retry(&self, job: &JobRecord) -> AppResult<()> {
        self.settle_expecting(job, &[JobState::Pending]).await
    }

    async fn fail(&self, job: &JobRecord) -> AppResult<()> {
        self.settle_expecting(job, &[JobState::Failed, JobState::DeadLettered])
            .await
    }

    async fn get(&self, id: JobId) -> AppResult<Option<JobRecord>> {
        self.ensure_open()?;
        self.load(&id.to_string()).await
    }

    async fn recover_expired(
        &self,
        queue: &str,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<JobRecord>> {
        self.ensure_open()?;
        let mut conn = self.client.conn_mut();
        let expired: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.key(&keys::active(queue)))
            .arg("-inf")
            .arg(format!("({}", cutoff.timestamp_millis()))
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)?;

        let mut recovered = Vec::with_capacity(expired.len());
        for id in expired {
            let Some(mut record) = self.load(&id).await? else {
                continue;
            };
            if let Err(e) = record.release_expired(now) {
                warn!(job_id = %id, queue, error = %e, "Skipping unrecoverable lease");
                continue;
            }
            if self.settle(&record).await? {
                recovered.push(record);
            }
        }

        Ok(recovered)
    }

    async fn failures(&self, queue: &str, limit: usize) -> AppResult<Vec<JobRecord>> {
        self.ensure_open()?;
        if limit == 0 {
            return Ok(Vec::new());
        }
        let stop = limit as isize - 1;
        let mut conn = self.client.conn_mut();
        let (mut ids, dead): (Vec<String>, Vec<String>) = redis::pipe()
            .cmd("ZREVRANGE")
            .arg(self.key(&keys::failed(queue)))
            .arg(0)
            .arg(stop)
            .cmd("ZREVRANGE")
            .arg(self.key(&keys::dead(queue)))
            .arg(0)
            .arg(stop)
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)?;
        ids.extend(dead);

        let mut records = self.load_many(&ids).await?;
        records.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
        records.truncate(limit);
        Ok(records)
    }

    async fn stats(&self, queue: &str) -> AppResult<QueueStats> {
        self.ensure_open()?;
        let mut conn = self.client.conn_mut();
        let (pending, active, failed, dead_lettered, completed): (u64, u64, u64, u64, Option<u64>) =
            redis::pipe()
                .cmd("ZCARD")
                .arg(self.key(&keys::pending(queue)))
                .cmd("ZCARD")
                .arg(self.key(&keys::active(queue)))
                .cmd("ZCARD")
                .arg(self.key(&keys::failed(queue)))
                .cmd("ZCARD")
                .arg(self.key(&keys::dead(queue)))
                .cmd("GET")
                .arg(self.key(&keys::completed(queue)))
                .query_async(&mut conn)
                .await
                .map_err(Self::map_err)?;

        Ok(QueueStats {
            queue: queue.to_string(),
            pending,
            active,
            completed: completed.unwrap_or(0),
            failed,
            dead_lettered,
        })
    }

    async fn close(&self) -> AppResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
