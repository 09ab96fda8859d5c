use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

mod cmd;

#[derive(Parser)]
#[command(name = "phase-ledger")]
#[command(version, about = "Persistent phase lifecycle state for orchestrated runs")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// SQLite database to use instead of .phase-ledger/ledger.db
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Run whose phases are addressed
    #[arg(long, default_value = "default", global = true)]
    pub run: String,

    /// Log output format (logs go to stderr)
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the .phase-ledger directory, config and database
    Init,
    /// Register phases as QUEUED (existing phases are left unchanged)
    Register {
        #[arg(required = true)]
        phases: Vec<String>,
    },
    /// Show all phases of the run
    Status,
    /// Show one phase record
    Show {
        phase: String,
        /// Print the record as JSON
        #[arg(long)]
        json: bool,
    },
    /// Move a phase to a new status
    Mark {
        phase: String,
        /// Target status: queued, executing, gate, ci_running, complete, failed, skipped
        status: String,
        /// Failure reason (recorded when marking failed)
        #[arg(long)]
        reason: Option<String>,
    },
    /// Change retry/epoch/escalation counters
    Update {
        phase: String,
        #[arg(long)]
        increment_retry: bool,
        #[arg(long)]
        increment_epoch: bool,
        #[arg(long)]
        increment_escalation: bool,
        #[arg(long, allow_hyphen_values = true)]
        set_retry: Option<i64>,
        #[arg(long, allow_hyphen_values = true)]
        set_epoch: Option<i64>,
        #[arg(long, allow_hyphen_values = true)]
        set_escalation: Option<i64>,
        #[arg(long)]
        failure_reason: Option<String>,
        /// Fail with a lock conflict unless the stored version matches
        #[arg(long)]
        expect_version: Option<u64>,
    },
    /// Reset a failed phase to QUEUED for another attempt
    Reset { phase: String },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default ledger.toml file
    Init,
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("phase_ledger={}", level)));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir)?,
        Commands::Register { phases } => cmd::cmd_register(&cli, &project_dir, phases).await?,
        Commands::Status => cmd::cmd_status(&cli, &project_dir).await?,
        Commands::Show { phase, json } => cmd::cmd_show(&cli, &project_dir, phase, *json).await?,
        Commands::Mark {
            phase,
            status,
            reason,
        } => cmd::cmd_mark(&cli, &project_dir, phase, status, reason.as_deref()).await?,
        Commands::Update {
            phase,
            increment_retry,
            increment_epoch,
            increment_escalation,
            set_retry,
            set_epoch,
            set_escalation,
            failure_reason,
            expect_version,
        } => {
            let request = phase_ledger::manager::StateUpdateRequest {
                increment_retry: *increment_retry,
                increment_epoch: *increment_epoch,
                increment_escalation: *increment_escalation,
                set_retry: *set_retry,
                set_epoch: *set_epoch,
                set_escalation: *set_escalation,
                failure_reason: failure_reason.clone(),
                timestamp: None,
                expected_version: *expect_version,
            };
            cmd::cmd_update(&cli, &project_dir, phase, request).await?
        }
        Commands::Reset { phase } => cmd::cmd_reset(&cli, &project_dir, phase).await?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
