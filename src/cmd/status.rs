//! Run inspection and control: `status`, `list`, `stop`, `reset`.

use anyhow::{Context, Result};
use std::time::{Duration, Instant};

use repo_runner::checkpoint::CheckpointStore;
use repo_runner::orchestrator::RunState;

use super::super::Cli;
use super::run::styled_phase_status;

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(200);

fn open_store(cli: &Cli) -> Result<CheckpointStore> {
    let config = super::load_config(cli)?;
    Ok(CheckpointStore::new(&config.checkpoint_dir))
}

fn load_run(store: &CheckpointStore, run_id: &str) -> Result<RunState> {
    store
        .try_load(run_id)
        .with_context(|| format!("Failed to read checkpoint for run '{}'", run_id))?
        .with_context(|| format!("No run '{}' found", run_id))
}

pub fn cmd_list(cli: &Cli) -> Result<()> {
    super::init_console_logging(cli)?;
    let store = open_store(cli)?;
    let ids = store.list().context("Failed to list checkpoints")?;

    if ids.is_empty() {
        println!("No runs found.");
        return Ok(());
    }

    println!(
        "{:<18} {:<10} {:<12} {:<10} {:<20} Repository",
        "Run", "Status", "User", "Tier", "Updated"
    );
    for id in ids {
        match store.load(&id) {
            Some(state) => println!(
                "{:<18} {:<10} {:<12} {:<10} {:<20} {}",
                state.run_id,
                state.overall_status.to_string(),
                state.user,
                state.tier.to_string(),
                state.updated_at.format("%Y-%m-%d %H:%M:%S"),
                state.repo_path.display()
            ),
            None => println!("{:<18} {}", id, console::style("unreadable").red()),
        }
    }
    Ok(())
}

pub fn cmd_status(cli: &Cli, run_id: Option<&str>, json: bool) -> Result<()> {
    let Some(run_id) = run_id else {
        return cmd_list(cli);
    };
    super::init_console_logging(cli)?;
    let store = open_store(cli)?;
    let state = load_run(&store, run_id)?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&state).context("Failed to serialize run state")?
        );
        return Ok(());
    }

    println!();
    println!("{} {}", console::style("Run").bold(), state.run_id);
    println!("Status:     {}", state.overall_status);
    println!("Repository: {}", state.repo_path.display());
    println!("User:       {} ({})", state.user, state.tier);
    println!("Started:    {}", state.start_time.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("Updated:    {}", state.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(phase) = state.current_phase {
        println!("Current:    {}", phase);
    }
    println!();

    for phase in &state.phases {
        let Some(result) = state.result(*phase) else {
            continue;
        };
        let detail = result
            .error
            .as_ref()
            .map(|e| e.message.as_str())
            .or(result.reason.as_deref())
            .unwrap_or("");
        println!(
            "  {:<24} {} {}",
            phase.as_str(),
            styled_phase_status(result.status),
            detail
        );
    }

    if !state.ports.is_empty() {
        println!();
        println!("Ports:");
        for allocation in &state.ports {
            match allocation.port {
                Some(port) => println!("  {:<16} {}", allocation.service, port),
                None => println!("  {:<16} {}", allocation.service, console::style("exhausted").red()),
            }
        }
    }
    if let Some(error) = &state.run_error {
        println!();
        println!("{} {}", console::style("Error:").red().bold(), error);
    }
    println!();
    Ok(())
}

/// Drop a stop marker for the run, then wait for it to settle. If nothing
/// acknowledges the marker the run is presumed dead and marked aborted.
pub async fn cmd_stop(cli: &Cli, run_id: &str, wait_secs: u64) -> Result<()> {
    super::init_console_logging(cli)?;
    let store = open_store(cli)?;
    let state = load_run(&store, run_id)?;

    if state.overall_status.is_terminal() {
        println!("Run {} is not running ({}).", run_id, state.overall_status);
        return Ok(());
    }

    store
        .request_stop(run_id)
        .context("Failed to write stop marker")?;
    println!("{}", console::style("Stop requested.").yellow());

    let deadline = Instant::now() + Duration::from_secs(wait_secs);
    while Instant::now() < deadline {
        tokio::time::sleep(STOP_POLL_INTERVAL).await;
        if store
            .load(run_id)
            .is_some_and(|s| s.overall_status.is_terminal())
        {
            println!("Run {} stopped.", run_id);
            return Ok(());
        }
    }

    store.clear_stop(run_id).context("Failed to clear stop marker")?;
    if store
        .mark_aborted(run_id, "stopped by user")
        .context("Failed to update checkpoint")?
    {
        println!(
            "No live process answered; run {} marked aborted.",
            run_id
        );
    } else {
        println!("Run {} stopped.", run_id);
    }
    Ok(())
}

pub fn cmd_reset(cli: &Cli, run_id: &str, force: bool) -> Result<()> {
    super::init_console_logging(cli)?;
    let store = open_store(cli)?;

    if !force
        && let Some(state) = store.load(run_id)
        && !state.overall_status.is_terminal()
    {
        anyhow::bail!(
            "Run {} is still running. Stop it first or pass --force.",
            run_id
        );
    }

    if store.remove(run_id).context("Failed to remove checkpoint")? {
        store.clear_stop(run_id).context("Failed to clear stop marker")?;
        println!("Reset run {}.", run_id);
    } else {
        println!("No checkpoint for run {}.", run_id);
    }
    Ok(())
}
