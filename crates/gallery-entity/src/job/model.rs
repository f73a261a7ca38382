//! Job record model and its state transitions.
//!
//! Transitions are the only way to move a record between states; each one
//! checks the source state and leaves the record untouched when the move is
//! not allowed. Terminal states (`Completed`, `Failed`, `DeadLettered`) have
//! no outgoing transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use gallery_core::types::JobId;

use super::state::JobState;

/// Error returned when a transition is not allowed from the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Invalid job transition: {from} -> {to}")]
pub struct InvalidTransition {
    /// State the record was in.
    pub from: JobState,
    /// State that was requested.
    pub to: JobState,
}

/// Error returned when replaying a job that has not failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Job {id} is {state}; only failed or dead-lettered jobs can be replayed")]
pub struct NotReplayable {
    /// Job id.
    pub id: JobId,
    /// State the job is in.
    pub state: JobState,
}

/// A unit of background work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique job identifier.
    pub id: JobId,
    /// Owning queue name.
    pub queue: String,
    /// Opaque handler input.
    pub payload: serde_json::Value,
    /// Current lifecycle state.
    pub state: JobState,
    /// Execution attempts so far.
    pub attempts: u32,
    /// Attempt ceiling before dead-lettering.
    pub max_attempts: u32,
    /// When the job was enqueued.
    pub enqueued_at: DateTime<Utc>,
    /// Earliest time the job may be leased.
    pub run_at: DateTime<Utc>,
    /// When the current or last lease started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    /// Failure reason, only in `Failed` or `DeadLettered`.
    pub last_error: Option<String>,
    /// Worker slot holding the lease while `Active`.
    pub worker_id: Option<String>,
    /// Value returned by a successful handler.
    pub result: Option<serde_json::Value>,
}

impl JobRecord {
    /// Create a new pending job that is ready immediately.
    pub fn new(
        queue: impl Into<String>,
        payload: serde_json::Value,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            queue: queue.into(),
            payload,
            state: JobState::Pending,
            attempts: 0,
            max_attempts,
            enqueued_at: now,
            run_at: now,
            started_at: None,
            finished_at: None,
            last_error: None,
            worker_id: None,
            result: None,
        }
    }

    /// Whether another execution attempt is allowed.
    pub fn has_attempts_remaining(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Whether a pending job is eligible for leasing at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Pending && self.run_at <= now
    }

    /// `Pending -> Active`: take the lease and count the attempt.
    pub fn lease(
        &mut self,
        worker_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        self.expect_state(JobState::Pending, JobState::Active)?;
        self.state = JobState::Active;
        self.attempts += 1;
        self.started_at = Some(now);
        self.worker_id = Some(worker_id.into());
        Ok(())
    }

    /// `Active -> Completed`.
    pub fn complete(
        &mut self,
        result: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        self.expect_state(JobState::Active, JobState::Completed)?;
        self.state = JobState::Completed;
        self.finished_at = Some(now);
        self.result = result;
        self.worker_id = None;
        Ok(())
    }

    /// `Active -> Pending` after a transient failure, eligible again at `run_at`.
    ///
    /// Refused once the attempt ceiling is reached; use [`Self::dead_letter`].
    pub fn retry(&mut self, run_at: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.expect_state(JobState::Active, JobState::Pending)?;
        if !self.has_attempts_remaining() {
            return Err(InvalidTransition {
                from: self.state,
                to: JobState::Pending,
            });
        }
        self.state = JobState::Pending;
        self.run_at = run_at;
        self.worker_id = None;
        self.last_error = None;
        Ok(())
    }

    /// `Active -> DeadLettered` once transient failures exhausted the attempts.
    pub fn dead_letter(
        &mut self,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        self.expect_state(JobState::Active, JobState::DeadLettered)?;
        self.finish_with_error(JobState::DeadLettered, error.into(), now);
        Ok(())
    }

    /// `Active -> Failed` on a non-retriable failure.
    pub fn fail(
        &mut self,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        self.expect_state(JobState::Active, JobState::Failed)?;
        self.finish_with_error(JobState::Failed, error.into(), now);
        Ok(())
    }

    /// Release an abandoned lease found during recovery.
    ///
    /// The job becomes `Pending` and ready at `now` if attempts remain,
    /// otherwise it is dead-lettered. A record that is still `Pending` never
    /// had its lease recorded and is returned unchanged. Returns the
    /// resulting state.
    pub fn release_expired(&mut self, now: DateTime<Utc>) -> Result<JobState, InvalidTransition> {
        if self.state == JobState::Pending {
            return Ok(JobState::Pending);
        }
        if self.has_attempts_remaining() {
            self.retry(now)?;
        } else {
            self.dead_letter("lease expired", now)?;
        }
        Ok(self.state)
    }

    /// Build a fresh pending job carrying this job's payload.
    ///
    /// Only `Failed` and `DeadLettered` jobs can be replayed. The copy gets a
    /// new id and a zero attempt count; `self` is left untouched.
    pub fn replay_copy(
        &self,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<JobRecord, NotReplayable> {
        if !self.state.is_failure() {
            return Err(NotReplayable {
                id: self.id,
                state: self.state,
            });
        }
        Ok(Self::new(
            self.queue.clone(),
            self.payload.clone(),
            max_attempts,
            now,
        ))
    }

    fn finish_with_error(&mut self, state: JobState, error: String, now: DateTime<Utc>) {
        self.state = state;
        self.finished_at = Some(now);
        self.last_error = Some(error);
        self.worker_id = None;
    }

    fn expect_state(&self, from: JobState, to: JobState) -> Result<(), InvalidTransition> {
        if self.state == from {
            Ok(())
        } else {
            Err(InvalidTransition {
                from: self.state,
                to,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn pending(max_attempts: u32) -> JobRecord {
        JobRecord::new("thumbnails", json!({"media_id": "m1"}), max_attempts, Utc::now())
    }

    #[test]
    fn test_new_job_is_pending_and_ready() {
        let job = pending(3);
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.is_ready(Utc::now()));
        assert!(job.started_at.is_none());
        assert!(job.last_error.is_none());
    }

    #[test]
    fn test_lease_increments_attempts() {
        let mut job = pending(3);
        let now = Utc::now();
        job.lease("w-1", now).unwrap();
        assert_eq!(job.state, JobState::Active);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.started_at, Some(now));
        assert_eq!(job.worker_id.as_deref(), Some("w-1"));
    }

    #[test]
    fn test_lease_twice_is_rejected() {
        let mut job = pending(3);
        job.lease("w-1", Utc::now()).unwrap();
        let err = job.lease("w-2", Utc::now()).unwrap_err();
        assert_eq!(err.from, JobState::Active);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.worker_id.as_deref(), Some("w-1"));
    }

    #[test]
    fn test_retry_delays_until_run_at() {
        let mut job = pending(3);
        let now = Utc::now();
        job.lease("w-1", now).unwrap();
        let later = now + Duration::seconds(2);
        job.retry(later).unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert!(!job.is_ready(now));
        assert!(job.is_ready(later));
        assert!(job.last_error.is_none());
        assert!(job.worker_id.is_none());
    }

    #[test]
    fn test_retry_refused_when_attempts_exhausted() {
        let mut job = pending(1);
        job.lease("w-1", Utc::now()).unwrap();
        assert!(job.retry(Utc::now()).is_err());
        assert_eq!(job.state, JobState::Active);
        job.dead_letter("boom", Utc::now()).unwrap();
        assert_eq!(job.state, JobState::DeadLettered);
        assert_eq!(job.last_error.as_deref(), Some("boom"));
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn test_terminal_states_have_no_exit() {
        let mut job = pending(3);
        job.lease("w-1", Utc::now()).unwrap();
        job.fail("bad payload", Utc::now()).unwrap();

        assert!(job.lease("w-2", Utc::now()).is_err());
        assert!(job.retry(Utc::now()).is_err());
        assert!(job.complete(None, Utc::now()).is_err());
        assert!(job.dead_letter("x", Utc::now()).is_err());
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.last_error.as_deref(), Some("bad payload"));
    }

    #[test]
    fn test_complete_from_pending_is_rejected() {
        let mut job = pending(3);
        let err = job.complete(None, Utc::now()).unwrap_err();
        assert_eq!(
            err,
            InvalidTransition {
                from: JobState::Pending,
                to: JobState::Completed
            }
        );
    }

    #[test]
    fn test_release_expired() {
        let mut job = pending(2);
        job.lease("w-1", Utc::now()).unwrap();
        assert_eq!(job.release_expired(Utc::now()).unwrap(), JobState::Pending);

        job.lease("w-2", Utc::now()).unwrap();
        assert_eq!(
            job.release_expired(Utc::now()).unwrap(),
            JobState::DeadLettered
        );
        assert_eq!(job.last_error.as_deref(), Some("lease expired"));
        assert_eq!(job.attempts, 2);
    }

    #[test]
    fn test_release_expired_on_unleased_record() {
        let mut job = pending(3);
        let before = job.clone();
        assert_eq!(job.release_expired(Utc::now()).unwrap(), JobState::Pending);
        assert_eq!(job, before);

        job.lease("w-1", Utc::now()).unwrap();
        job.complete(None, Utc::now()).unwrap();
        assert!(job.release_expired(Utc::now()).is_err());
    }

    #[test]
    fn test_replay_copy_of_dead_letter() {
        let mut job = pending(1);
        job.lease("w-1", Utc::now()).unwrap();
        job.dead_letter("timeout", Utc::now()).unwrap();

        let copy = job.replay_copy(4, Utc::now()).unwrap();
        assert_ne!(copy.id, job.id);
        assert_eq!(copy.state, JobState::Pending);
        assert_eq!(copy.attempts, 0);
        assert_eq!(copy.max_attempts, 4);
        assert_eq!(copy.payload, job.payload);
        assert_eq!(job.state, JobState::DeadLettered);
    }

    #[test]
    fn test_replay_copy_requires_failure() {
        let job = pending(3);
        let err = job.replay_copy(3, Utc::now()).unwrap_err();
        assert_eq!(err.id, job.id);
        assert_eq!(err.state, JobState::Pending);
    }

    #[test]
    fn test_json_roundtrip_keeps_state() {
        let mut job = pending(3);
        job.lease("w-1", Utc::now()).unwrap();
        let json = serde_json::to_string(&job).unwrap();
        let back: JobRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job);
    }
}
