use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use repo_runner::gates::Tier;
use repo_runner::orchestrator::IndexerKind;
use repo_runner::phase::Phase;

mod cmd;

#[derive(Parser)]
#[command(name = "repo-runner")]
#[command(
    version,
    about = "Drive a repository through detection, setup and service start"
)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Directory holding checkpoints, logs, users.json and runner.toml
    #[arg(long, global = true, env = "REPO_RUNNER_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Emit log lines as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run (or resume) the pipeline for a repository
    Run {
        /// Path to the repository
        repo: PathBuf,

        /// Target environment
        #[arg(long = "env", default_value = "detect")]
        environment: String,

        /// Tier for anonymous runs; registered users run at their account tier
        #[arg(long, env = "REPO_RUNNER_TIER")]
        tier: Option<Tier>,

        #[arg(long, env = "REPO_RUNNER_USER")]
        user: Option<String>,

        /// Password for --user; when given, the run is refused unless it matches
        #[arg(long, env = "REPO_RUNNER_PASSWORD", hide_env_values = true, requires = "user")]
        password: Option<String>,

        /// Model hint passed to agents
        #[arg(long)]
        model: Option<String>,

        /// Phase to skip (repeatable)
        #[arg(long = "skip")]
        skip: Vec<Phase>,

        /// Context indexer: simple, vector, advanced-vector
        #[arg(long, default_value = "simple")]
        indexer: IndexerKind,

        /// Request GPU access
        #[arg(long)]
        gpu: bool,

        /// Feature flag passed to agents (repeatable)
        #[arg(long = "feature")]
        features: Vec<String>,

        /// Report what would run without invoking any agent
        #[arg(long)]
        dry_run: bool,

        /// Re-run phases that already succeeded
        #[arg(long)]
        force: bool,

        /// Explicit run id (default: derived from repo path and user)
        #[arg(long)]
        run_id: Option<String>,

        /// Print the final report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show a run's state, or a summary of all runs
    Status {
        run_id: Option<String>,

        #[arg(long)]
        json: bool,
    },
    /// List checkpointed runs
    List,
    /// Stop a run in progress
    Stop {
        run_id: String,

        /// Seconds to wait for the run to acknowledge
        #[arg(long, default_value = "5")]
        wait: u64,
    },
    /// Delete a run's checkpoint so the next run starts over
    Reset {
        run_id: String,

        /// Reset even if the checkpoint says the run is still running
        #[arg(long)]
        force: bool,
    },
    /// Manage user accounts
    Users {
        #[command(subcommand)]
        command: UsersCommands,
    },
    /// View or initialize runner.toml
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum UsersCommands {
    /// Create an account
    Add {
        id: String,

        #[arg(long, env = "REPO_RUNNER_PASSWORD")]
        password: String,

        #[arg(long, default_value = "free")]
        tier: Tier,
    },
    /// List accounts
    List,
    /// Refuse further runs for an account
    Block { id: String },
    /// Lift a block
    Unblock { id: String },
    /// Change an account's tier
    SetTier { id: String, tier: Tier },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Validate runner.toml and show any warnings
    Validate,
    /// Write a default runner.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Run { .. } => {
            let code = cmd::cmd_run(&cli).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Status { run_id, json } => cmd::cmd_status(&cli, run_id.as_deref(), *json)?,
        Commands::List => cmd::cmd_list(&cli)?,
        Commands::Stop { run_id, wait } => cmd::cmd_stop(&cli, run_id, *wait).await?,
        Commands::Reset { run_id, force } => cmd::cmd_reset(&cli, run_id, *force)?,
        Commands::Users { command } => cmd::cmd_users(&cli, command.clone())?,
        Commands::Config { command } => cmd::cmd_config(&cli, command.clone())?,
    }

    Ok(())
}
