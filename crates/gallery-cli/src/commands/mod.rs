//! CLI command definitions and dispatch.

pub mod config;
pub mod queue;

use clap::{Parser, Subcommand};

use gallery_broker::{BrokerConnection, BrokerConnector};
use gallery_core::config::AppConfig;
use gallery_core::error::AppError;

use crate::output::OutputFormat;

/// Gallery job queue administration
#[derive(Debug, Parser)]
#[command(name = "gallery-cli", version, about, long_about = None)]
pub struct Cli {
    /// Directory holding `default.toml` and environment overlays
    #[arg(long, default_value = "config")]
    pub config_dir: String,

    /// Environment overlay to load
    #[arg(short, long, env = "GALLERY_ENV", default_value = "development")]
    pub env: String,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    pub format: OutputFormat,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Show queue counts
    Stats {
        /// Queue name; all known queues when omitted
        queue: Option<String>,
    },
    /// List the most recent failed and dead-lettered jobs
    DeadLetters {
        /// Queue name
        queue: String,
        /// Maximum number of jobs to list
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Re-enqueue a failed or dead-lettered job as a new job
    Replay {
        /// Id of the failed job
        job_id: String,
    },
    /// Enqueue a job manually
    Enqueue {
        /// Queue name
        queue: String,
        /// JSON payload
        #[arg(short, long, default_value = "{}")]
        payload: String,
    },
    /// Show a single job record
    Job {
        /// Job id
        job_id: String,
    },
    /// Configuration management
    Config(config::ConfigArgs),
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(&self) -> Result<(), AppError> {
        let config = AppConfig::load_from(&self.config_dir, &self.env)?;
        match &self.command {
            Commands::Config(args) => config::execute(args, &config, self.format),
            command => queue::execute(command, &config, self.format).await,
        }
    }
}

/// Helper: connect to the configured broker
pub async fn connect(config: &AppConfig) -> Result<BrokerConnection, AppError> {
    BrokerConnector::new(&config.broker)?.connect().await
}
