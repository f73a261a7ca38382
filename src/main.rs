//! Gallery job server.
//!
//! Loads configuration, registers the built-in media queues, starts the
//! scheduler and runs until SIGTERM or SIGINT.

use std::sync::Arc;

use tracing_subscriber::{EnvFilter, fmt};

use gallery_broker::BrokerConnector;
use gallery_core::config::AppConfig;
use gallery_core::error::AppError;
use gallery_worker::jobs::{
    MODERATION_QUEUE, ModerationJobHandler, NOTIFICATIONS_QUEUE, NotificationJobHandler,
    THUMBNAILS_QUEUE, ThumbnailJobHandler, TracingNotificationSink,
};
use gallery_worker::{JobHandler, QueueRegistry, RetryPolicy, Scheduler, ShutdownCoordinator};

#[tokio::main]
async fn main() {
    let env = std::env::var("GALLERY_ENV").unwrap_or_else(|_| "development".to_string());
    let config = match AppConfig::load(&env) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    init_logging(&config);
    tracing::info!(env = %env, "Configuration loaded");

    if let Err(e) = run(config).await {
        tracing::error!(error = %e, "Server error");
        std::process::exit(1);
    }
}

/// Initialize tracing/logging
fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .with_thread_ids(true)
                .init();
        }
        _ => {
            fmt()
                .pretty()
                .with_env_filter(filter)
                .with_target(true)
                .init();
        }
    }
}

/// Wire the scheduler and run until shutdown is requested.
async fn run(config: AppConfig) -> Result<(), AppError> {
    tracing::info!("Starting gallery job server v{}", env!("CARGO_PKG_VERSION"));

    let registry = build_registry(&config)?;
    let connector = BrokerConnector::new(&config.broker)?;
    let scheduler = Scheduler::new(config.queue.clone(), registry, connector);

    let shutdown = ShutdownCoordinator::new();
    shutdown.listen_for_signals();

    scheduler.initialize().await;
    tracing::info!(mode = %scheduler.registry().mode(), "Gallery job server ready");

    shutdown.wait().await;
    scheduler.shutdown().await;

    tracing::info!("Gallery job server stopped");
    Ok(())
}

/// Register the built-in media queues with their configured settings.
fn build_registry(config: &AppConfig) -> Result<QueueRegistry, AppError> {
    let handlers: [(&str, Arc<dyn JobHandler>); 3] = [
        (THUMBNAILS_QUEUE, Arc::new(ThumbnailJobHandler::new())),
        (
            MODERATION_QUEUE,
            Arc::new(ModerationJobHandler::new(&config.moderation)?),
        ),
        (
            NOTIFICATIONS_QUEUE,
            Arc::new(NotificationJobHandler::new(Arc::new(TracingNotificationSink))),
        ),
    ];

    let mut registry = QueueRegistry::new(config.queue.event_capacity);
    for (name, handler) in handlers {
        let settings = config.queue.settings_for(name);
        registry
            .register(
                name,
                settings.concurrency,
                RetryPolicy::from_settings(&settings),
                handler,
            )
            .map_err(|e| AppError::configuration(e.to_string()))?;
    }
    Ok(registry)
}
