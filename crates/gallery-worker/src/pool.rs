//! Worker pool: leases jobs for one queue and executes them with bounded
//! concurrency.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use gallery_broker::Broker;
use gallery_entity::job::JobRecord;

use crate::events::{JobEvent, JobEventKind};
use crate::executor::{self, JobExecutionError};
use crate::registry::QueueDefinition;

/// Timing knobs shared by every pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    /// Wait between lease attempts on an idle queue.
    pub poll_interval: Duration,
    /// How long to wait for in-flight jobs after intake stops.
    pub drain_timeout: Duration,
}

/// Executes jobs of a single queue.
#[derive(Debug)]
pub struct WorkerPool {
    worker: Arc<Worker>,
    options: PoolOptions,
    cancel: CancellationToken,
    slots: AtomicU64,
}

/// State shared with every spawned job task.
#[derive(Debug)]
struct Worker {
    definition: QueueDefinition,
    broker: Arc<dyn Broker>,
    events: broadcast::Sender<JobEvent>,
}

impl WorkerPool {
    /// Create a pool for `definition`. Leasing stops once `cancel` fires.
    pub fn new(
        definition: QueueDefinition,
        broker: Arc<dyn Broker>,
        events: broadcast::Sender<JobEvent>,
        options: PoolOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            worker: Arc::new(Worker {
                definition,
                broker,
                events,
            }),
            options,
            cancel,
            slots: AtomicU64::new(0),
        }
    }

    /// Run the pool on a background task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Lease and execute jobs until cancelled, then drain.
    pub async fn run(self) {
        let queue = self.worker.definition.name.clone();
        let concurrency = self.worker.definition.concurrency;
        info!(
            queue = %queue,
            concurrency,
            poll_interval_ms = self.options.poll_interval.as_millis() as u64,
            "Worker pool started"
        );

        let semaphore = Arc::new(Semaphore::new(concurrency));

        loop {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            if self.cancel.is_cancelled() {
                break;
            }

            let worker_id = self.next_worker_id();
            match self
                .worker
                .broker
                .claim(&queue, &worker_id, Utc::now())
                .await
            {
                Ok(Some(job)) => {
                    debug!(
                        job_id = %job.id,
                        queue = %queue,
                        attempt = job.attempts,
                        max_attempts = job.max_attempts,
                        worker_id = %worker_id,
                        "Leased job"
                    );
                    let worker = Arc::clone(&self.worker);
                    tokio::spawn(async move {
                        let _permit = permit;
                        worker.process(job).await;
                    });
                }
                Ok(None) => {
                    drop(permit);
                    trace!(queue = %queue, "No eligible jobs");
                    self.idle_wait().await;
                }
                Err(e) => {
                    drop(permit);
                    error!(queue = %queue, error = %e, "Failed to lease job");
                    tokio::select! {
                        _ = self.cancel.cancelled() => {}
                        _ = tokio::time::sleep(self.options.poll_interval) => {}
                    }
                }
            }
        }

        self.drain(&semaphore).await;
    }

    /// Wait for an enqueue notification, the poll interval, or cancellation.
    async fn idle_wait(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.worker.definition.waker.notified() => {}
            _ = tokio::time::sleep(self.options.poll_interval) => {}
        }
    }

    async fn drain(&self, semaphore: &Semaphore) {
        let queue = &self.worker.definition.name;
        let concurrency = self.worker.definition.concurrency;
        let in_flight = concurrency.saturating_sub(semaphore.available_permits());
        info!(queue = %queue, in_flight, "Worker pool draining");

        let all = u32::try_from(concurrency).unwrap_or(u32::MAX);
        match tokio::time::timeout(self.options.drain_timeout, semaphore.acquire_many(all)).await {
            Ok(_) => info!(queue = %queue, "Worker pool stopped"),
            Err(_) => {
                let remaining = concurrency.saturating_sub(semaphore.available_permits());
                warn!(
                    queue = %queue,
                    remaining,
                    "Drain timed out, leaving jobs active for recovery"
                );
            }
        }
    }

    fn next_worker_id(&self) -> String {
        let n = self.slots.fetch_add(1, Ordering::Relaxed);
        format!("{}@{}#{n}", self.worker.definition.name, std::process::id())
    }
}

impl Worker {
    /// Run the handler and persist the outcome.
    async fn process(&self, mut job: JobRecord) {
        let outcome = executor::execute(self.definition.handler.as_ref(), &job).await;
        let now = Utc::now();

        let (transition, kind) = match outcome {
            Ok(result) => (job.complete(result, now), JobEventKind::Completed),
            Err(e) if e.is_retriable() && job.has_attempts_remaining() => {
                let delay = self.definition.retry.backoff(job.attempts);
                let run_at = now + TimeDelta::from_std(delay).unwrap_or(TimeDelta::zero());
                warn!(
                    job_id = %job.id,
                    queue = %job.queue,
                    attempt = job.attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "Job failed, will retry"
                );
                (job.retry(run_at), JobEventKind::Retrying { run_at })
            }
            Err(e) if e.is_retriable() => {
                error!(
                    job_id = %job.id,
                    queue = %job.queue,
                    attempt = job.attempts,
                    error = %e,
                    "Job exhausted its attempts"
                );
                (job.dead_letter(message(&e), now), JobEventKind::DeadLettered)
            }
            Err(e) => {
                error!(
                    job_id = %job.id,
                    queue = %job.queue,
                    attempt = job.attempts,
                    error = %e,
                    "Job failed permanently"
                );
                (job.fail(message(&e), now), JobEventKind::Failed)
            }
        };

        if let Err(e) = transition {
            error!(job_id = %job.id, error = %e, "Rejected job transition");
            return;
        }

        let persisted = match kind {
            JobEventKind::Completed => self.broker.complete(&job).await,
            JobEventKind::Retrying { .. } => self.broker.retry(&job).await,
            JobEventKind::Failed | JobEventKind::DeadLettered => self.broker.fail(&job).await,
        };
        if let Err(e) = persisted {
            error!(
                job_id = %job.id,
                queue = %job.queue,
                state = %job.state,
                error = %e,
                "Failed to record job outcome"
            );
            return;
        }

        if kind == JobEventKind::Completed {
            info!(job_id = %job.id, queue = %job.queue, attempt = job.attempts, "Job completed");
        }

        // No subscribers is fine.
        let _ = self.events.send(JobEvent {
            job_id: job.id,
            queue: job.queue.clone(),
            kind,
            attempts: job.attempts,
            error: job.last_error.clone(),
        });
    }
}

fn message(err: &JobExecutionError) -> String {
    match err {
        JobExecutionError::Permanent(msg) | JobExecutionError::Transient(msg) => msg.clone(),
        JobExecutionError::Internal(e) => e.to_string(),
    }
}
