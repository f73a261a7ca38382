//! Broker trait for pluggable durable queue backends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use gallery_core::result::AppResult;
use gallery_core::types::JobId;
use gallery_entity::job::{JobRecord, QueueStats};

/// Durable queue storage shared by every worker pool.
///
/// Implementations must be safe for concurrent use. `claim` is the only
/// operation that hands out leases and must never hand the same pending job
/// to two callers. The settle operations (`complete`, `retry`, `fail`) end a
/// lease and return a `Conflict` error when the caller no longer holds it.
#[async_trait]
pub trait Broker: Send + Sync + std::fmt::Debug + 'static {
    /// Check that the backend is reachable.
    async fn ping(&self) -> AppResult<()>;

    /// Persist a new pending job and make it eligible at its `run_at`.
    async fn push(&self, job: &JobRecord) -> AppResult<()>;

    /// Atomically lease the next eligible pending job of `queue`.
    ///
    /// The returned record is already `Active` with its attempt counted.
    async fn claim(
        &self,
        queue: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Option<JobRecord>>;

    /// Store a `Completed` record and release its lease.
    async fn complete(&self, job: &JobRecord) -> AppResult<()>;

    /// Store a record moved back to `Pending` and release its lease.
    async fn retry(&self, job: &JobRecord) -> AppResult<()>;

    /// Store a `Failed` or `DeadLettered` record and release its lease.
    async fn fail(&self, job: &JobRecord) -> AppResult<()>;

    /// Look up a job record by id.
    async fn get(&self, id: JobId) -> AppResult<Option<JobRecord>>;

    /// Release leases of `queue` taken before `cutoff`.
    ///
    /// Returns the recovered records in their new state (`Pending` or
    /// `DeadLettered`).
    async fn recover_expired(
        &self,
        queue: &str,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<JobRecord>>;

    /// Most recent `Failed` and `DeadLettered` records of `queue`, newest first.
    async fn failures(&self, queue: &str, limit: usize) -> AppResult<Vec<JobRecord>>;

    /// Point-in-time counts for `queue`.
    async fn stats(&self, queue: &str) -> AppResult<QueueStats>;

    /// Release backend resources. Further calls fail with a connection error.
    async fn close(&self) -> AppResult<()>;
}
