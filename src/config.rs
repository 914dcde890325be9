use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::runner_config::{CONFIG_FILE, RunnerToml};

/// Directory name used under the platform data dir.
const APP_DIR: &str = "repo-runner";

/// Runtime configuration.
///
/// Resolves the state directory (CLI flag → `REPO_RUNNER_STATE_DIR` →
/// platform data dir) and loads `runner.toml` from it.
#[derive(Debug, Clone)]
pub struct Config {
    pub state_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub log_dir: PathBuf,
    pub users_file: PathBuf,
    pub config_file: PathBuf,
    pub verbose: bool,
    /// Parsed runner.toml
    pub toml: RunnerToml,
}

impl Config {
    /// Build the configuration. `state_dir` is the CLI value, which clap has
    /// already filled from the environment when the flag is absent.
    pub fn new(state_dir: Option<PathBuf>, verbose: bool) -> Result<Self> {
        let state_dir = match state_dir {
            Some(dir) => dir,
            None => default_state_dir(),
        };
        let toml = RunnerToml::load_or_default(&state_dir)?;
        Ok(Self::from_parts(state_dir, toml, verbose))
    }

    pub fn from_parts(state_dir: PathBuf, toml: RunnerToml, verbose: bool) -> Self {
        Self {
            checkpoint_dir: state_dir.join("runs"),
            log_dir: state_dir.join("logs"),
            users_file: state_dir.join("users.json"),
            config_file: state_dir.join(CONFIG_FILE),
            state_dir,
            verbose,
            toml,
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.checkpoint_dir)
            .context("Failed to create checkpoint directory")?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        Ok(())
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }
}

/// `<data_local_dir>/repo-runner`, or `./.repo-runner` when the platform
/// has no data dir.
pub fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from(".repo-runner"))
}
