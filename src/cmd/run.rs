//! Pipeline execution: `repo-runner run <repo>`.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

use repo_runner::agents::AgentRegistry;
use repo_runner::checkpoint::CheckpointStore;
use repo_runner::gates::UserRegistry;
use repo_runner::orchestrator::{FinalReport, RunOptions, RunStatus, StopHandle, WorkflowEngine};
use repo_runner::phase::PhaseStatus;

use super::super::{Cli, Commands};

/// Run the pipeline and return the process exit code.
pub async fn cmd_run(cli: &Cli) -> Result<i32> {
    let Commands::Run {
        repo,
        environment,
        tier,
        user,
        password,
        model,
        skip,
        indexer,
        gpu,
        features,
        dry_run,
        force,
        run_id,
        json,
    } = &cli.command
    else {
        anyhow::bail!("cmd_run called for a different command");
    };

    let config = super::load_config(cli)?;
    config.ensure_directories()?;
    let _guard = repo_runner::logging::init(cli.verbose, cli.log_json, Some(&config.log_dir))?;
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }

    let options = RunOptions {
        run_id: run_id.clone(),
        environment: environment.clone(),
        user: user.clone(),
        tier: *tier,
        model: model.clone(),
        skip: skip.iter().copied().collect(),
        indexer: *indexer,
        gpu: *gpu,
        features: parse_features(features)?,
        dry_run: *dry_run,
        force: *force,
    };

    let registry = AgentRegistry::from_commands(config.toml.agent_commands());
    let users = Arc::new(UserRegistry::open(&config.users_file));
    if let (Some(id), Some(password)) = (user.as_deref(), password.as_deref())
        && let Err(e) = users.authenticate(id, password)
    {
        tracing::warn!(user = id, error = %e, "login failed");
        println!("{} {}", console::style("Denied:").red().bold(), e);
        return Ok(1);
    }
    let engine = WorkflowEngine::new(
        CheckpointStore::new(&config.checkpoint_dir),
        registry,
        config.toml.clone(),
    )
    .with_users(users);

    let stop = StopHandle::new();
    let on_interrupt = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping run");
            on_interrupt.stop();
        }
    });

    let report = engine
        .run_with_stop(repo, options, stop)
        .await
        .with_context(|| format!("Run failed for {}", repo.display()))?;

    if *json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize report")?
        );
    } else {
        print_report(&report);
    }
    Ok(report.exit_code())
}

/// `name` enables a flag; `name=false` disables it.
fn parse_features(raw: &[String]) -> Result<BTreeMap<String, bool>> {
    raw.iter()
        .map(|entry| match entry.split_once('=') {
            None => Ok((entry.clone(), true)),
            Some((name, value)) => {
                let enabled = value
                    .parse::<bool>()
                    .with_context(|| format!("Invalid value in --feature {}", entry))?;
                Ok((name.to_string(), enabled))
            }
        })
        .collect()
}

fn styled_status(status: RunStatus) -> console::StyledObject<String> {
    let text = status.to_string();
    match status {
        RunStatus::Completed => console::style(text).green().bold(),
        RunStatus::Degraded => console::style(text).yellow().bold(),
        RunStatus::Aborted => console::style(text).red().bold(),
        RunStatus::Running => console::style(text).cyan(),
    }
}

pub(super) fn styled_phase_status(status: PhaseStatus) -> console::StyledObject<String> {
    let text = format!("{:<10}", status.to_string());
    match status {
        PhaseStatus::Succeeded => console::style(text).green(),
        PhaseStatus::Failed => console::style(text).red(),
        PhaseStatus::Skipped => console::style(text).dim(),
        PhaseStatus::Running => console::style(text).cyan(),
        PhaseStatus::Pending => console::style(text),
    }
}

fn print_report(report: &FinalReport) {
    println!();
    println!(
        "{} {}  {}",
        console::style("Run").bold(),
        report.run_id,
        styled_status(report.status)
    );
    println!("Repository: {}", report.repo_path.display());
    println!("User:       {} ({})", report.user, report.tier);
    println!();

    if !report.phases.is_empty() {
        println!("{:<24} {:<10} {:<8} Detail", "Phase", "Status", "Retries");
        println!("{:<24} {:<10} {:<8} ------", "-----", "------", "-------");
        for phase in &report.phases {
            let detail = phase
                .error
                .as_deref()
                .or(phase.reason.as_deref())
                .unwrap_or("");
            println!(
                "{:<24} {} {:<8} {}",
                phase.phase.as_str(),
                styled_phase_status(phase.status),
                phase.retry_count,
                detail
            );
        }
        println!();
        println!(
            "{} succeeded, {} failed, {} skipped",
            report.succeeded, report.failed, report.skipped
        );
    }

    if !report.endpoints.is_empty() {
        println!();
        println!("{}", console::style("Endpoints").bold());
        for endpoint in &report.endpoints {
            println!("  {:<16} {}", endpoint.service, endpoint.url);
        }
    }

    if !report.remediations.is_empty() {
        println!();
        println!("{}", console::style("Auto-fix attempts").bold());
        for fix in &report.remediations {
            println!("  {:<24} {}", fix.target.as_str(), fix.status);
        }
    }

    if !report.errors.is_empty() {
        println!();
        println!("{}", console::style("Errors").red().bold());
        for error in &report.errors {
            match error.phase {
                Some(phase) => println!("  {}: {}", phase, error.message),
                None => println!("  {}", error.message),
            }
        }
    }

    println!();
    println!("Elapsed: {:.2}s", report.elapsed.as_secs_f64());
    if let Some(path) = &report.checkpoint_path {
        println!("Checkpoint: {}", path.display());
    }
}
