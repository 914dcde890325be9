//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module   | Commands handled                    |
//! |----------|-------------------------------------|
//! | `run`    | `Run`                               |
//! | `status` | `Status`, `List`, `Stop`, `Reset`   |
//! | `users`  | `Users`                             |
//! | `config` | `Config`                            |

pub mod config;
pub mod run;
pub mod status;
pub mod users;

pub use config::cmd_config;
pub use run::cmd_run;
pub use status::{cmd_list, cmd_reset, cmd_status, cmd_stop};
pub use users::cmd_users;

use anyhow::Result;
use repo_runner::config::Config;

use super::Cli;

/// Resolve configuration from the global flags.
pub fn load_config(cli: &Cli) -> Result<Config> {
    Config::new(cli.state_dir.clone(), cli.verbose)
}

/// Console-only logging for the short-lived commands.
pub fn init_console_logging(cli: &Cli) -> Result<()> {
    // Guard is None without a log dir.
    let _ = repo_runner::logging::init(cli.verbose, cli.log_json, None)?;
    Ok(())
}
