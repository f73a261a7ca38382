//! Queue registry: named queues, enqueue, and inspection.
//!
//! Queues are registered during startup through `&mut self`, before the
//! registry is wrapped in an `Arc` and shared. After that the definitions are
//! read without locks. The runtime mode and broker handle are set once by the
//! scheduler when it initializes.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Notify, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use gallery_broker::Broker;
use gallery_core::types::JobId;
use gallery_entity::job::{JobRecord, QueueStats};

use crate::error::QueueError;
use crate::events::JobEvent;
use crate::executor::JobHandler;
use crate::retry::RetryPolicy;

/// Operating mode of the queueing subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    /// Broker connected, pools running.
    Enabled,
    /// Turned off by configuration, or not initialized yet.
    Disabled,
    /// Initialization ran but the broker was unreachable.
    Degraded,
}

impl fmt::Display for QueueMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enabled => write!(f, "enabled"),
            Self::Disabled => write!(f, "disabled"),
            Self::Degraded => write!(f, "degraded"),
        }
    }
}

/// A registered queue.
#[derive(Debug, Clone)]
pub struct QueueDefinition {
    /// Unique queue name.
    pub name: String,
    /// Max simultaneously active jobs.
    pub concurrency: usize,
    /// Retry policy.
    pub retry: RetryPolicy,
    /// Handler invoked for each job.
    pub handler: Arc<dyn JobHandler>,
    /// Wakes the queue's pool after an enqueue.
    pub(crate) waker: Arc<Notify>,
}

#[derive(Debug)]
struct Runtime {
    mode: QueueMode,
    broker: Option<Arc<dyn Broker>>,
}

/// Process-wide table of named queues.
#[derive(Debug)]
pub struct QueueRegistry {
    definitions: BTreeMap<String, QueueDefinition>,
    runtime: OnceLock<Runtime>,
    accepting: AtomicBool,
    intake: CancellationToken,
    events: broadcast::Sender<JobEvent>,
}

impl QueueRegistry {
    /// Create an empty registry whose event channel holds `event_capacity`
    /// undelivered events per subscriber.
    pub fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            definitions: BTreeMap::new(),
            runtime: OnceLock::new(),
            accepting: AtomicBool::new(false),
            intake: CancellationToken::new(),
            events,
        }
    }

    /// Register a queue.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        concurrency: usize,
        retry: RetryPolicy,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), QueueError> {
        let name = name.into();
        if self.definitions.contains_key(&name) {
            return Err(QueueError::DuplicateQueue(name));
        }
        if name.is_empty() {
            return Err(invalid(&name, "name must not be empty"));
        }
        if concurrency == 0 {
            return Err(invalid(&name, "concurrency must be at least 1"));
        }
        if retry.max_attempts == 0 {
            return Err(invalid(&name, "max_attempts must be at least 1"));
        }
        if retry.base_delay > retry.max_delay {
            return Err(invalid(&name, "retry base delay exceeds max delay"));
        }

        info!(
            queue = %name,
            concurrency,
            max_attempts = retry.max_attempts,
            "Registered queue"
        );
        self.definitions.insert(
            name.clone(),
            QueueDefinition {
                name,
                concurrency,
                retry,
                handler,
                waker: Arc::new(Notify::new()),
            },
        );
        Ok(())
    }

    /// Enqueue a job, returning its id once it is persisted in the broker.
    pub async fn enqueue(&self, queue: &str, payload: Value) -> Result<JobId, QueueError> {
        let definition = self
            .definitions
            .get(queue)
            .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))?;

        let record = JobRecord::new(queue, payload, definition.retry.max_attempts, Utc::now());
        self.submit(definition, record).await
    }

    async fn submit(
        &self,
        definition: &QueueDefinition,
        record: JobRecord,
    ) -> Result<JobId, QueueError> {
        if !self.is_accepting() {
            return Err(QueueError::QueueDisabled { mode: self.mode() });
        }
        self.broker()?.push(&record).await?;
        definition.waker.notify_one();

        debug!(job_id = %record.id, queue = %record.queue, "Enqueued job");
        Ok(record.id)
    }

    /// Stop accepting jobs and tell the pools to stop leasing.
    pub fn shutdown(&self) {
        if !self.intake.is_cancelled() {
            info!("Queue registry no longer accepting jobs");
        }
        self.accepting.store(false, Ordering::SeqCst);
        self.intake.cancel();
    }

    /// Current operating mode.
    pub fn mode(&self) -> QueueMode {
        self.runtime
            .get()
            .map(|r| r.mode)
            .unwrap_or(QueueMode::Disabled)
    }

    /// Whether `enqueue` would currently be accepted.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst) && self.mode() == QueueMode::Enabled
    }

    /// Registered queue names, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        self.definitions.keys().cloned().collect()
    }

    /// Look up a queue definition.
    pub fn definition(&self, queue: &str) -> Option<&QueueDefinition> {
        self.definitions.get(queue)
    }

    /// Fetch a job record.
    pub async fn job(&self, id: JobId) -> Result<JobRecord, QueueError> {
        self.broker()?
            .get(id)
            .await?
            .ok_or(QueueError::NotFound(id))
    }

    /// Current counts for a queue.
    pub async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        self.ensure_registered(queue)?;
        Ok(self.broker()?.stats(queue).await?)
    }

    /// Most recent failed and dead-lettered jobs of a queue.
    pub async fn dead_letters(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<JobRecord>, QueueError> {
        self.ensure_registered(queue)?;
        Ok(self.broker()?.failures(queue, limit).await?)
    }

    /// Enqueue a fresh copy of a failed or dead-lettered job.
    ///
    /// The original record stays terminal; the copy gets a new id.
    pub async fn replay(&self, id: JobId) -> Result<JobId, QueueError> {
        let original = self.job(id).await?;
        let definition = self
            .definitions
            .get(&original.queue)
            .ok_or_else(|| QueueError::UnknownQueue(original.queue.clone()))?;
        let copy = original.replay_copy(definition.retry.max_attempts, Utc::now())?;
        let new_id = self.submit(definition, copy).await?;
        info!(job_id = %id, new_job_id = %new_id, queue = %original.queue, "Replayed job");
        Ok(new_id)
    }

    /// Subscribe to job outcome events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Set the runtime mode. Only the first call has any effect.
    pub(crate) fn activate(&self, mode: QueueMode, broker: Option<Arc<dyn Broker>>) -> bool {
        if self.runtime.set(Runtime { mode, broker }).is_err() {
            return false;
        }
        self.accepting.store(
            mode == QueueMode::Enabled && !self.intake.is_cancelled(),
            Ordering::SeqCst,
        );
        true
    }

    pub(crate) fn definitions(&self) -> impl Iterator<Item = &QueueDefinition> {
        self.definitions.values()
    }

    pub(crate) fn intake(&self) -> CancellationToken {
        self.intake.clone()
    }

    pub(crate) fn events(&self) -> broadcast::Sender<JobEvent> {
        self.events.clone()
    }

    fn broker(&self) -> Result<&Arc<dyn Broker>, QueueError> {
        self.runtime
            .get()
            .and_then(|r| r.broker.as_ref())
            .ok_or(QueueError::QueueDisabled { mode: self.mode() })
    }

    fn ensure_registered(&self, queue: &str) -> Result<(), QueueError> {
        if self.definitions.contains_key(queue) {
            Ok(())
        } else {
            Err(QueueError::UnknownQueue(queue.to_string()))
        }
    }
}

impl Default for QueueRegistry {
    fn default() -> Self {
        Self::new(256)
    }
}

fn invalid(name: &str, reason: &str) -> QueueError {
    QueueError::InvalidDefinition {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}
