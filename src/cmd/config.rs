//! Configuration view and validation commands: `repo-runner config`.

use anyhow::{Context, Result};

use repo_runner::phase::Phase;
use repo_runner::runner_config::RunnerToml;

use super::super::{Cli, ConfigCommands};

pub fn cmd_config(cli: &Cli, command: Option<ConfigCommands>) -> Result<()> {
    super::init_console_logging(cli)?;
    let config = super::load_config(cli)?;

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("repo-runner configuration");
            println!("=========================");
            println!();
            println!("State dir:   {}", config.state_dir().display());
            println!("Checkpoints: {}", config.checkpoint_dir.display());
            println!("Logs:        {}", config.log_dir.display());
            println!("Users:       {}", config.users_file.display());
            if config.config_file.exists() {
                println!("Config file: {}", config.config_file.display());
            } else {
                println!(
                    "Config file: {} (not found, using defaults)",
                    config.config_file.display()
                );
            }
            println!();

            let rendered =
                toml::to_string_pretty(&config.toml).context("Failed to render configuration")?;
            println!("{}", rendered.trim_end());
            println!();

            println!("Effective phase settings:");
            for phase in Phase::PIPELINE {
                let spec = config.toml.phase_spec(phase);
                println!(
                    "  {:<24} {:<10} timeout {}s",
                    phase.as_str(),
                    if spec.mandatory { "mandatory" } else { "optional" },
                    spec.timeout.as_secs()
                );
            }
            println!();
        }
        Some(ConfigCommands::Validate) => {
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("{}", console::style("Configuration is valid.").green());
            } else {
                println!("{}", console::style("Configuration warnings:").yellow().bold());
                for warning in &warnings {
                    println!("  - {}", warning);
                }
            }
        }
        Some(ConfigCommands::Init) => {
            if config.config_file.exists() {
                anyhow::bail!(
                    "{} already exists. Remove it first to reinitialize.",
                    config.config_file.display()
                );
            }
            RunnerToml::default().save(&config.config_file)?;
            println!("Created {}", config.config_file.display());
        }
    }
    Ok(())
}
