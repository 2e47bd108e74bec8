pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use crate::orchestrator::events::CommandType;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to the per-user config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume lifecycle events until interrupted
    Run,

    /// Create a crawl job and publish its START event
    Start {
        /// Domain or URL to crawl
        #[arg(required = true)]
        domain: String,

        /// Maximum link depth from the seed page
        #[arg(short, long, default_value_t = 1)]
        depth: u32,

        /// Backend kind
        #[arg(short, long, default_value = "fast-fetch")]
        kind: String,

        /// Backend specific settings as a JSON object
        #[arg(short, long)]
        extra: Option<String>,

        /// Job id (generated when omitted)
        #[arg(long)]
        job_id: Option<String>,
    },

    /// Request a running job to stop
    Stop {
        #[arg(required = true)]
        job_id: String,
    },

    /// Pause a running job
    Pause {
        #[arg(required = true)]
        job_id: String,
    },

    /// Resume a paused job
    Resume {
        #[arg(required = true)]
        job_id: String,
    },

    /// Show one job, or all jobs
    Status {
        job_id: Option<String>,
    },

    /// List registered backend kinds and their settings
    Kinds,

    /// Show the configuration
    Config {
        /// Write the defaults to the configuration file
        #[arg(long)]
        init: bool,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Run => {
            info!("Starting event consumer");
            commands::run(config_path).await
        }
        Commands::Start { domain, depth, kind, extra, job_id } => {
            info!("Submitting {} crawl of {}", kind, domain);
            commands::start(config_path, domain, depth, kind, extra, job_id).await
        }
        Commands::Stop { job_id } => commands::submit(config_path, CommandType::Stop, job_id).await,
        Commands::Pause { job_id } => commands::submit(config_path, CommandType::Pause, job_id).await,
        Commands::Resume { job_id } => commands::submit(config_path, CommandType::Resume, job_id).await,
        Commands::Status { job_id } => commands::status(config_path, job_id).await,
        Commands::Kinds => commands::kinds(config_path).await,
        Commands::Config { init } => commands::show_config(config_path, init).await,
    }
}
