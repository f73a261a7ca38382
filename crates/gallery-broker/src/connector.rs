//! Broker connector with bounded connection retry.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{info, warn};

use gallery_core::config::broker::BrokerConfig;
#[cfg(feature = "redis-backend")]
use gallery_core::config::broker::RedisBrokerConfig;
use gallery_core::error::{AppError, ErrorKind};
use gallery_core::result::AppResult;

use crate::broker::Broker;

/// Where the connector obtains its broker.
#[derive(Debug, Clone)]
enum Source {
    #[cfg(feature = "redis-backend")]
    Redis {
        config: RedisBrokerConfig,
        completed_ttl: Duration,
    },
    Provided(Arc<dyn Broker>),
}

/// Opens broker connections for the configured provider.
///
/// Each [`connect`](Self::connect) makes up to `attempts` tries, sleeping
/// `base_delay * 2^(n-1)` (capped at `max_delay`) between them.
#[derive(Debug, Clone)]
pub struct BrokerConnector {
    source: Source,
    attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl BrokerConnector {
    /// Create a connector from configuration.
    pub fn new(config: &BrokerConfig) -> AppResult<Self> {
        let completed_ttl = Duration::from_secs(config.completed_ttl_seconds);
        let source = match config.provider.as_str() {
            #[cfg(feature = "redis-backend")]
            "redis" => Source::Redis {
                config: config.redis.clone(),
                completed_ttl,
            },
            #[cfg(feature = "memory")]
            "memory" => {
                info!("Using in-memory broker");
                Source::Provided(Arc::new(crate::memory::MemoryBroker::new(completed_ttl)))
            }
            other => {
                return Err(AppError::configuration(format!(
                    "Unknown broker provider: '{other}'. Supported: memory, redis"
                )));
            }
        };

        Ok(Self {
            source,
            attempts: config.connect_attempts.max(1),
            base_delay: Duration::from_millis(config.connect_base_delay_ms),
            max_delay: Duration::from_millis(config.connect_max_delay_ms),
        })
    }

    /// Create a connector around an existing broker (for testing).
    pub fn from_broker(broker: Arc<dyn Broker>) -> Self {
        Self {
            source: Source::Provided(broker),
            attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Override the retry policy.
    pub fn with_retry(mut self, attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    /// Delay before attempt `attempt + 1`.
    fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    async fn open(&self) -> AppResult<Arc<dyn Broker>> {
        let broker: Arc<dyn Broker> = match &self.source {
            #[cfg(feature = "redis-backend")]
            Source::Redis {
                config,
                completed_ttl,
            } => {
                let client = crate::redis::RedisClient::connect(config).await?;
                Arc::new(crate::redis::RedisBroker::new(client, *completed_ttl))
            }
            Source::Provided(broker) => Arc::clone(broker),
        };
        broker.ping().await?;
        Ok(broker)
    }

    /// Connect to the broker, retrying with bounded exponential backoff.
    ///
    /// Configuration errors are returned immediately. Any other failure on
    /// the last attempt is reported as [`ErrorKind::Connection`].
    pub async fn connect(&self) -> AppResult<BrokerConnection> {
        let mut attempt = 1;
        loop {
            match self.open().await {
                Ok(broker) => {
                    info!(attempt, "Broker connection established");
                    return Ok(BrokerConnection::new(broker));
                }
                Err(e) if e.kind == ErrorKind::Configuration => return Err(e),
                Err(e) if attempt >= self.attempts => {
                    return Err(AppError::with_source(
                        ErrorKind::Connection,
                        format!("Broker unreachable after {attempt} attempt(s)"),
                        e,
                    ));
                }
                Err(e) => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Broker connection failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// An established broker connection.
///
/// Clones share the same underlying broker; closing any of them closes all.
#[derive(Debug, Clone)]
pub struct BrokerConnection {
    broker: Arc<dyn Broker>,
    closed: Arc<AtomicBool>,
}

impl BrokerConnection {
    fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The connected broker.
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the connection. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.broker.close().await {
            warn!(error = %e, "Error closing broker connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use gallery_core::types::JobId;
    use gallery_entity::job::{JobRecord, QueueStats};

    /// Broker whose first `failures` pings fail.
    #[derive(Debug, Default)]
    struct FlakyBroker {
        failures: u32,
        pings: AtomicU32,
        closes: AtomicU32,
    }

    #[async_trait]
    impl Broker for FlakyBroker {
        async fn ping(&self) -> AppResult<()> {
            let n = self.pings.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(AppError::connection("refused"))
            } else {
                Ok(())
            }
        }
        async fn push(&self, _job: &JobRecord) -> AppResult<()> {
            Ok(())
        }
        async fn claim(
            &self,
            _queue: &str,
            _worker_id: &str,
            _now: DateTime<Utc>,
        ) -> AppResult<Option<JobRecord>> {
            Ok(None)
        }
        async fn complete(&self, _job: &JobRecord) -> AppResult<()> {
            Ok(())
        }
        async fn retry(&self, _job: &JobRecord) -> AppResult<()> {
            Ok(())
        }
        async fn fail(&self, _job: &JobRecord) -> AppResult<()> {
            Ok(())
        }
        async fn get(&self, _id: JobId) -> AppResult<Option<JobRecord>> {
            Ok(None)
        }
        async fn recover_expired(
            &self,
            _queue: &str,
            _cutoff: DateTime<Utc>,
            _now: DateTime<Utc>,
        ) -> AppResult<Vec<JobRecord>> {
            Ok(Vec::new())
        }
        async fn failures(&self, _queue: &str, _limit: usize) -> AppResult<Vec<JobRecord>> {
            Ok(Vec::new())
        }
        async fn stats(&self, queue: &str) -> AppResult<QueueStats> {
            Ok(QueueStats {
                queue: queue.to_string(),
                ..Default::default()
            })
        }
        async fn close(&self) -> AppResult<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn flaky(failures: u32) -> Arc<FlakyBroker> {
        Arc::new(FlakyBroker {
            failures,
            ..Default::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_until_ping_succeeds() {
        let broker = flaky(2);
        let connector = BrokerConnector::from_broker(broker.clone()).with_retry(
            3,
            Duration::from_millis(100),
            Duration::from_secs(1),
        );

        let started = tokio::time::Instant::now();
        let conn = connector.connect().await.unwrap();
        assert!(!conn.is_closed());
        assert_eq!(broker.pings.load(Ordering::SeqCst), 3);
        // 100ms + 200ms of backoff.
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_gives_up_after_attempts() {
        let broker = flaky(u32::MAX);
        let connector = BrokerConnector::from_broker(broker.clone()).with_retry(
            3,
            Duration::from_millis(10),
            Duration::from_millis(20),
        );

        let err = connector.connect().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Connection);
        assert_eq!(broker.pings.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_backoff_is_capped() {
        let connector = BrokerConnector::from_broker(flaky(0)).with_retry(
            10,
            Duration::from_millis(500),
            Duration::from_secs(4),
        );
        assert_eq!(connector.delay_after(1), Duration::from_millis(500));
        assert_eq!(connector.delay_after(2), Duration::from_secs(1));
        assert_eq!(connector.delay_after(4), Duration::from_secs(4));
        assert_eq!(connector.delay_after(9), Duration::from_secs(4));
    }

    #[test]
    fn test_unknown_provider_is_configuration_error() {
        let config = BrokerConfig {
            provider: "kafka".into(),
            ..Default::default()
        };
        let err = BrokerConnector::new(&config).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_memory_provider_connects() {
        let config = BrokerConfig {
            provider: "memory".into(),
            ..Default::default()
        };
        let conn = BrokerConnector::new(&config)
            .unwrap()
            .connect()
            .await
            .unwrap();
        let stats = conn.broker().stats("thumbnails").await.unwrap();
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let broker = flaky(0);
        let conn = BrokerConnector::from_broker(broker.clone())
            .connect()
            .await
            .unwrap();
        conn.close().await;
        conn.clone().close().await;
        assert!(conn.is_closed());
        assert_eq!(broker.closes.load(Ordering::SeqCst), 1);
    }
}
