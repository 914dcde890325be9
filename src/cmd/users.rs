//! Account management: `repo-runner users`.

use anyhow::{Context, Result};

use repo_runner::gates::UserRegistry;

use super::super::{Cli, UsersCommands};

pub fn cmd_users(cli: &Cli, command: UsersCommands) -> Result<()> {
    super::init_console_logging(cli)?;
    let config = super::load_config(cli)?;
    let registry = UserRegistry::open(&config.users_file);

    match command {
        UsersCommands::Add { id, password, tier } => {
            registry
                .create(&id, &password, tier)
                .with_context(|| format!("Failed to add user '{}'", id))?;
            println!("Added user {} ({}).", id, tier);
        }
        UsersCommands::List => {
            let users = registry.list();
            if users.is_empty() {
                println!("No users registered.");
                return Ok(());
            }
            println!(
                "{:<16} {:<10} {:<9} {:<8} Last login",
                "User", "Tier", "Requests", "Blocked"
            );
            for user in users {
                let last_login = user
                    .last_login
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "never".to_string());
                let blocked = if user.blocked {
                    console::style("yes".to_string()).red()
                } else {
                    console::style("no".to_string())
                };
                println!(
                    "{:<16} {:<10} {:<9} {:<8} {}",
                    user.id,
                    user.tier.to_string(),
                    user.requests_this_hour,
                    blocked,
                    last_login
                );
            }
        }
        UsersCommands::Block { id } => {
            registry
                .set_blocked(&id, true)
                .with_context(|| format!("Failed to block user '{}'", id))?;
            println!("Blocked {}.", id);
        }
        UsersCommands::Unblock { id } => {
            registry
                .set_blocked(&id, false)
                .with_context(|| format!("Failed to unblock user '{}'", id))?;
            println!("Unblocked {}.", id);
        }
        UsersCommands::SetTier { id, tier } => {
            registry
                .set_tier(&id, tier)
                .with_context(|| format!("Failed to change tier for '{}'", id))?;
            println!("{} is now {}.", id, tier);
        }
    }
    Ok(())
}
