//! Scheduler lifecycle: ordered startup and time-bounded shutdown.
//!
//! Startup connects the broker, recovers abandoned leases and starts one
//! worker pool per registered queue. A missing broker never fails startup;
//! the registry is put in degraded mode instead and every enqueue is refused.
//!
//! Shutdown stops intake, waits for in-flight jobs up to the drain timeout
//! and closes the broker connection. Concurrent calls share one drain.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OnceCell, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use gallery_broker::{Broker, BrokerConnection, BrokerConnector};
use gallery_core::config::queue::QueueConfig;

use crate::pool::{PoolOptions, WorkerPool};
use crate::registry::{QueueMode, QueueRegistry};

/// Scheduler process state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    /// Constructed, `initialize` not called yet.
    Uninitialized,
    /// `initialize` in progress.
    Starting,
    /// Initialized; pools run if the mode is `Enabled`.
    Running,
    /// `shutdown` in progress.
    Draining,
    /// Shut down.
    Stopped,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Default)]
struct Resources {
    initialized: bool,
    connection: Option<BrokerConnection>,
    pools: Vec<JoinHandle<()>>,
}

/// Owns the queueing subsystem for the lifetime of the host process.
#[derive(Debug)]
pub struct Scheduler {
    config: QueueConfig,
    registry: Arc<QueueRegistry>,
    connector: BrokerConnector,
    state: watch::Sender<SchedulerState>,
    resources: Mutex<Resources>,
    stopped: OnceCell<()>,
}

impl Scheduler {
    /// Create a scheduler around a fully registered queue registry.
    pub fn new(config: QueueConfig, registry: QueueRegistry, connector: BrokerConnector) -> Self {
        let (state, _) = watch::channel(SchedulerState::Uninitialized);
        Self {
            config,
            registry: Arc::new(registry),
            connector,
            state,
            resources: Mutex::new(Resources::default()),
            stopped: OnceCell::new(),
        }
    }

    /// The shared registry handed to request handlers.
    pub fn registry(&self) -> Arc<QueueRegistry> {
        Arc::clone(&self.registry)
    }

    /// Current process state.
    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    /// Watch process state changes.
    pub fn watch_state(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    /// Start the subsystem. Never fails; a second call is ignored.
    pub async fn initialize(&self) {
        let mut resources = self.resources.lock().await;
        if resources.initialized || self.stopped.initialized() {
            warn!(state = %self.state(), "Scheduler already initialized, ignoring");
            return;
        }
        resources.initialized = true;
        self.state.send_replace(SchedulerState::Starting);

        if !self.config.enabled {
            info!("Job queue disabled by configuration");
            self.registry.activate(QueueMode::Disabled, None);
            self.state.send_replace(SchedulerState::Running);
            return;
        }

        let connection = match self.connector.connect().await {
            Ok(connection) => connection,
            Err(e) => {
                warn!(error = %e, "Broker unavailable, job queue running in degraded mode");
                self.registry.activate(QueueMode::Degraded, None);
                self.state.send_replace(SchedulerState::Running);
                return;
            }
        };

        let broker = Arc::clone(connection.broker());
        self.recover_leases(broker.as_ref()).await;
        self.registry
            .activate(QueueMode::Enabled, Some(Arc::clone(&broker)));

        let options = PoolOptions {
            poll_interval: Duration::from_millis(self.config.poll_interval_ms.max(1)),
            drain_timeout: Duration::from_secs(self.config.drain_timeout_seconds),
        };
        for definition in self.registry.definitions() {
            let pool = WorkerPool::new(
                definition.clone(),
                Arc::clone(&broker),
                self.registry.events(),
                options,
                self.registry.intake(),
            );
            resources.pools.push(pool.spawn());
        }
        resources.connection = Some(connection);

        info!(queues = resources.pools.len(), "Job queue initialized");
        self.state.send_replace(SchedulerState::Running);
    }

    /// Stop intake, drain in-flight jobs and close the broker connection.
    ///
    /// Idempotent; concurrent callers wait on the same drain.
    pub async fn shutdown(&self) {
        self.stopped.get_or_init(|| self.drain()).await;
    }

    async fn drain(&self) {
        info!("Job queue shutting down");
        self.state.send_replace(SchedulerState::Draining);
        self.registry.shutdown();

        let mut resources = self.resources.lock().await;
        resources.initialized = true;

        let pools = std::mem::take(&mut resources.pools);
        for result in futures::future::join_all(pools).await {
            if let Err(e) = result {
                error!(error = %e, "Worker pool task failed");
            }
        }

        if let Some(connection) = resources.connection.take() {
            connection.close().await;
        }

        self.state.send_replace(SchedulerState::Stopped);
        info!("Job queue stopped");
    }

    /// Return abandoned leases to their queues.
    async fn recover_leases(&self, broker: &dyn Broker) {
        let now = Utc::now();
        let cutoff = i64::try_from(self.config.lease_timeout_seconds)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .and_then(|timeout| now.checked_sub_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        for queue in self.registry.queue_names() {
            match broker.recover_expired(&queue, cutoff, now).await {
                Ok(recovered) if recovered.is_empty() => {}
                Ok(recovered) => {
                    info!(queue = %queue, count = recovered.len(), "Recovered expired leases");
                }
                Err(e) => {
                    warn!(queue = %queue, error = %e, "Failed to recover expired leases");
                }
            }
        }
    }
}
