use std::{path::PathBuf, str::FromStr};

use clap::{Parser, Subcommand};
use mqbridge_broker::{BackendKind, QueueConfig};
use mqbridge_config::load_config;
use mqbridge_models::errors::QueueError;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// JSON queue configuration file.
    #[arg(long, default_value = "mqbridge.json")]
    pub config: PathBuf,

    /// Logical topic; repeat to consume from several queues.
    #[arg(long = "topic", required = true)]
    pub topics: Vec<String>,

    #[arg(long)]
    pub backend: Option<String>,

    #[arg(long)]
    pub prefix: Option<String>,

    #[arg(long, default_value = "info")]
    pub log_level: String,

    #[arg(long)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Enqueue one payload (JSON, or a plain string) on the first topic.
    Produce {
        payload: String,
        #[arg(long)]
        user_id: Option<String>,
    },
    /// Consume from every topic until Ctrl+C or the pass limit.
    Consume {
        #[arg(long)]
        ack: bool,
        #[arg(long)]
        iterations: Option<usize>,
        #[arg(long, default_value_t = 1000)]
        poll_interval_ms: u64,
    },
}

pub fn resolve_config(args: &CliArgs) -> Result<QueueConfig, QueueError> {
    let mut config = load_config(&args.config)?;
    if let Some(backend) = &args.backend {
        config.backend_kind = BackendKind::from_str(backend)?;
    }
    if let Some(prefix) = &args.prefix {
        config.prefix = Some(prefix.clone());
    }
    Ok(config)
}
