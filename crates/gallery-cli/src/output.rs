//! Table and JSON output formatting for CLI commands.

use serde::Serialize;
use tabled::{Table, Tabled};

use gallery_entity::job::{JobRecord, QueueStats};

/// Output format selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    #[default]
    Table,
    /// JSON output
    Json,
}

/// One row of `stats` output.
#[derive(Debug, Serialize, Tabled)]
pub struct StatsRow {
    /// Queue name
    pub queue: String,
    /// Waiting jobs
    pub pending: u64,
    /// Leased jobs
    pub active: u64,
    /// Completed jobs
    pub completed: u64,
    /// Permanently failed jobs
    pub failed: u64,
    /// Dead-lettered jobs
    #[tabled(rename = "dead")]
    pub dead_lettered: u64,
}

impl From<QueueStats> for StatsRow {
    fn from(s: QueueStats) -> Self {
        Self {
            queue: s.queue,
            pending: s.pending,
            active: s.active,
            completed: s.completed,
            failed: s.failed,
            dead_lettered: s.dead_lettered,
        }
    }
}

/// One row of a job listing.
#[derive(Debug, Serialize, Tabled)]
pub struct JobRow {
    /// Job id
    pub id: String,
    /// Owning queue
    pub queue: String,
    /// Lifecycle state
    pub state: String,
    /// Attempts made / allowed
    pub attempts: String,
    /// Finish time
    pub finished_at: String,
    /// Failure reason
    pub last_error: String,
}

impl From<&JobRecord> for JobRow {
    fn from(job: &JobRecord) -> Self {
        Self {
            id: job.id.to_string(),
            queue: job.queue.clone(),
            state: job.state.to_string(),
            attempts: format!("{}/{}", job.attempts, job.max_attempts),
            finished_at: job
                .finished_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string()),
            last_error: job.last_error.clone().unwrap_or_else(|| "-".to_string()),
        }
    }
}

/// Print a list of items in the selected format
pub fn print_list<T: Serialize + Tabled>(items: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if items.is_empty() {
                println!("No results found.");
            } else {
                println!("{}", Table::new(items));
            }
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(items).unwrap_or_else(|_| "[]".to_string());
            println!("{json}");
        }
    }
}

/// Print a single item in the selected format
pub fn print_item<T: Serialize + std::fmt::Debug>(item: &T, format: OutputFormat) {
    match format {
        OutputFormat::Table => println!("{item:#?}"),
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(item).unwrap_or_else(|_| "{}".to_string());
            println!("{json}");
        }
    }
}

/// Print a success message
pub fn print_success(msg: &str) {
    println!("✓ {msg}");
}

/// Print a key-value pair
pub fn print_kv(key: &str, value: &str) {
    println!("  {:<24} {}", format!("{key}:"), value);
}
