//! Configuration CLI commands.

use clap::{Args, Subcommand};

use gallery_core::config::AppConfig;
use gallery_core::error::AppError;

use crate::output::{self, OutputFormat};

/// Arguments for config commands
#[derive(Debug, Args)]
pub struct ConfigArgs {
    /// Config subcommand
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Config subcommands
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show the effective configuration
    Show,
    /// Show the resolved settings of a queue
    Queue {
        /// Queue name
        name: String,
    },
}

/// Execute config commands
pub fn execute(args: &ConfigArgs, config: &AppConfig, format: OutputFormat) -> Result<(), AppError> {
    match &args.command {
        ConfigCommand::Show => {
            let mut shown = config.clone();
            shown.broker.redis.url = mask_password(&shown.broker.redis.url);
            output::print_item(&shown, format);
        }
        ConfigCommand::Queue { name } => {
            let settings = config.queue.settings_for(name);
            println!("Queue '{name}':");
            output::print_kv("Concurrency", &settings.concurrency.to_string());
            output::print_kv("Max attempts", &settings.max_attempts.to_string());
            output::print_kv("Retry base delay (ms)", &settings.retry_base_delay_ms.to_string());
            output::print_kv("Retry max delay (ms)", &settings.retry_max_delay_ms.to_string());
        }
    }
    Ok(())
}

/// Mask password in broker URL for display
fn mask_password(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            let scheme_end = url.find("://").map(|i| i + 3).unwrap_or(0);
            if colon_pos > scheme_end {
                return format!("{}:****{}", &url[..colon_pos], &url[at_pos..]);
            }
        }
    }
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_password() {
        assert_eq!(
            mask_password("redis://:hunter2@cache:6379"),
            "redis://:****@cache:6379"
        );
        assert_eq!(mask_password("redis://cache:6379"), "redis://cache:6379");
    }
}
