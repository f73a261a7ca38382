//! Queue inspection and manual enqueue commands.
//!
//! These talk to the broker directly; a running server picks up enqueued
//! jobs on its next poll.

use chrono::Utc;

use gallery_broker::Broker;
use gallery_core::config::AppConfig;
use gallery_core::error::AppError;
use gallery_core::types::JobId;
use gallery_entity::job::JobRecord;
use gallery_worker::jobs::BUILTIN_QUEUES;

use super::Commands;
use crate::output::{self, JobRow, OutputFormat, StatsRow};

/// Execute queue commands
pub async fn execute(
    command: &Commands,
    config: &AppConfig,
    format: OutputFormat,
) -> Result<(), AppError> {
    let connection = super::connect(config).await?;
    let broker = connection.broker().as_ref();

    let result = run(command, broker, config, format).await;
    connection.close().await;
    result
}

async fn run(
    command: &Commands,
    broker: &dyn Broker,
    config: &AppConfig,
    format: OutputFormat,
) -> Result<(), AppError> {
    match command {
        Commands::Stats { queue } => {
            let names = match queue {
                Some(q) => vec![q.clone()],
                None => known_queues(config),
            };
            let mut rows = Vec::with_capacity(names.len());
            for name in &names {
                rows.push(StatsRow::from(broker.stats(name).await?));
            }
            output::print_list(&rows, format);
        }
        Commands::DeadLetters { queue, limit } => {
            let jobs = broker.failures(queue, *limit).await?;
            let rows: Vec<JobRow> = jobs.iter().map(JobRow::from).collect();
            output::print_list(&rows, format);
        }
        Commands::Replay { job_id } => {
            let original = load(broker, job_id).await?;
            let settings = config.queue.settings_for(&original.queue);
            let copy = original
                .replay_copy(settings.max_attempts, Utc::now())
                .map_err(|e| AppError::conflict(e.to_string()))?;
            broker.push(&copy).await?;
            output::print_success(&format!(
                "Job {} replayed as {} on '{}'",
                original.id, copy.id, copy.queue
            ));
        }
        Commands::Enqueue { queue, payload } => {
            let payload = serde_json::from_str(payload)
                .map_err(|e| AppError::validation(format!("Invalid JSON payload: {e}")))?;
            let job = new_job(config, queue, payload)?;
            broker.push(&job).await?;
            output::print_success(&format!("Job enqueued on '{queue}' (id: {})", job.id));
        }
        Commands::Job { job_id } => {
            let job = load(broker, job_id).await?;
            output::print_item(&job, format);
        }
        Commands::Config(_) => {}
    }
    Ok(())
}

/// Built-in queues plus any queue named in configuration.
fn known_queues(config: &AppConfig) -> Vec<String> {
    let mut names: Vec<String> = BUILTIN_QUEUES.iter().map(|q| q.to_string()).collect();
    for name in config.queue.queues.keys() {
        if !names.contains(name) {
            names.push(name.clone());
        }
    }
    names.sort();
    names
}

fn new_job(config: &AppConfig, queue: &str, payload: serde_json::Value) -> Result<JobRecord, AppError> {
    if !known_queues(config).iter().any(|q| q == queue) {
        return Err(AppError::validation(format!("Unknown queue: '{queue}'")));
    }
    let settings = config.queue.settings_for(queue);
    Ok(JobRecord::new(queue, payload, settings.max_attempts, Utc::now()))
}

async fn load(broker: &dyn Broker, job_id: &str) -> Result<JobRecord, AppError> {
    let id: JobId = job_id
        .parse()
        .map_err(|_| AppError::validation(format!("Invalid job id: '{job_id}'")))?;
    broker
        .get(id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("Job {id} not found")))
}
