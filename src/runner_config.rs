//! `runner.toml`: the engine's file configuration.
//!
//! Lives at `<state_dir>/runner.toml`. Every section is optional.
//!
//! # Configuration File Format
//!
//! ```toml
//! [engine]
//! auto_fix = true
//! phase_timeout_secs = 600
//!
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 500
//! max_delay_ms = 30000
//! multiplier = 2.0
//!
//! [ports]
//! host = "127.0.0.1"
//! range_start = 8000
//! range_size = 100
//! reclaim = false
//! grace_period_ms = 2000
//!
//! [ports.services]
//! backend = 8000
//! frontend = 3000
//!
//! [phases.database-setup]
//! mandatory = false
//! timeout_secs = 300
//! command = "./scripts/migrate.sh"
//!
//! [tiers.free]
//! rate_limit_per_hour = 20
//! capabilities = ["simple-search", "vector-search"]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use crate::gates::{Capability, Tier, TierProfile};
use crate::phase::{Phase, PhaseSpec};
use crate::ports::PortsConfig;
use crate::retry::RetryConfig;

pub const CONFIG_FILE: &str = "runner.toml";

/// Engine-wide switches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSection {
    /// Invoke the auto-fix agent once on the first failure of a phase
    #[serde(default = "default_auto_fix")]
    pub auto_fix: bool,
    /// Timeout applied to every phase without its own override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_timeout_secs: Option<u64>,
}

fn default_auto_fix() -> bool {
    true
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            auto_fix: default_auto_fix(),
            phase_timeout_secs: None,
        }
    }
}

/// `[phases.<name>]` override.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mandatory: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Shell command implementing the phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

/// `[tiers.<name>]` override. Unset fields keep the built-in value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_per_hour: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_repos: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_runs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<BTreeSet<Capability>>,
}

/// The complete runner.toml structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunnerToml {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub ports: PortsConfig,
    /// Keyed by phase name
    #[serde(default)]
    pub phases: BTreeMap<String, PhaseOverride>,
    /// Keyed by tier name
    #[serde(default)]
    pub tiers: BTreeMap<String, TierOverride>,
}

impl RunnerToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse runner.toml")
    }

    /// Load `<state_dir>/runner.toml`, or defaults if it does not exist.
    pub fn load_or_default(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize runner.toml")?;
        crate::checkpoint::write_atomic(path, content.as_bytes())
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    fn phase_override(&self, phase: Phase) -> Option<&PhaseOverride> {
        self.phases.get(phase.as_str()).or_else(|| {
            self.phases
                .iter()
                .find(|(name, _)| name.parse::<Phase>().ok() == Some(phase))
                .map(|(_, o)| o)
        })
    }

    /// Effective settings for `phase`: built-in defaults, then `[engine]`,
    /// then `[phases.<name>]`.
    pub fn phase_spec(&self, phase: Phase) -> PhaseSpec {
        let mut spec = PhaseSpec::defaults(phase);
        if let Some(secs) = self.engine.phase_timeout_secs {
            spec.timeout = Duration::from_secs(secs);
        }
        if let Some(o) = self.phase_override(phase) {
            if let Some(mandatory) = o.mandatory {
                spec.mandatory = mandatory;
            }
            if let Some(secs) = o.timeout_secs {
                spec.timeout = Duration::from_secs(secs);
            }
        }
        spec
    }

    /// Configured agent commands, in pipeline order.
    pub fn agent_commands(&self) -> Vec<(Phase, &str)> {
        Phase::PIPELINE
            .iter()
            .filter_map(|p| {
                self.phase_override(*p)
                    .and_then(|o| o.command.as_deref())
                    .map(|c| (*p, c))
            })
            .collect()
    }

    /// Tier profiles with overrides applied.
    pub fn tier_profiles(&self) -> Vec<TierProfile> {
        self.tiers
            .iter()
            .filter_map(|(name, o)| {
                let tier = name.parse::<Tier>().ok()?;
                let mut profile = TierProfile::default_for(tier);
                if let Some(v) = o.rate_limit_per_hour {
                    profile.rate_limit_per_hour = v;
                }
                if let Some(v) = o.max_repos {
                    profile.max_repos = v;
                }
                if let Some(v) = o.max_concurrent_runs {
                    profile.max_concurrent_runs = v;
                }
                if let Some(ref caps) = o.capabilities {
                    profile.capabilities = caps.clone();
                }
                Some(profile)
            })
            .collect()
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        for name in self.phases.keys() {
            if name.parse::<Phase>().is_err() {
                warnings.push(format!("Unknown phase '{}' in [phases]", name));
            }
        }
        for (name, o) in &self.tiers {
            if name.parse::<Tier>().is_err() {
                warnings.push(format!("Unknown tier '{}' in [tiers]", name));
            }
            if o.max_concurrent_runs == Some(0) {
                warnings.push(format!(
                    "Tier '{}' has max_concurrent_runs = 0; no runs will be admitted",
                    name
                ));
            }
        }
        if self.retry.max_attempts == 0 {
            warnings.push("retry.max_attempts is 0; treating as a single attempt".to_string());
        }
        if self.retry.multiplier < 1.0 {
            warnings.push(format!(
                "retry.multiplier {} is below 1.0; delays will shrink",
                self.retry.multiplier
            ));
        }
        if self.ports.range_size == 0
            || self.ports.range_start as u32 + self.ports.range_size as u32 > u16::MAX as u32 + 1
        {
            warnings.push(format!(
                "Invalid port range: start {} size {}",
                self.ports.range_start, self.ports.range_size
            ));
        }
        for (service, port) in &self.ports.services {
            if *port == 0 {
                warnings.push(format!("Service '{}' has preferred port 0", service));
            }
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = RunnerToml::parse("").unwrap();
        assert!(config.engine.auto_fix);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.ports.range_start, 8000);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_phase_overrides() {
        let config = RunnerToml::parse(
            r#"
[engine]
phase_timeout_secs = 42

[phases.database-setup]
mandatory = true
command = "./migrate.sh"

[phases.health_check]
timeout_secs = 5
"#,
        )
        .unwrap();

        let db = config.phase_spec(Phase::DatabaseSetup);
        assert!(db.mandatory);
        assert_eq!(db.timeout, Duration::from_secs(42));

        let health = config.phase_spec(Phase::HealthCheck);
        assert_eq!(health.timeout, Duration::from_secs(5));
        assert!(!health.mandatory);

        assert!(config.phase_spec(Phase::EnvironmentDetect).mandatory);
        assert_eq!(
            config.agent_commands(),
            vec![(Phase::DatabaseSetup, "./migrate.sh")]
        );
    }

    #[test]
    fn test_tier_overrides() {
        let config = RunnerToml::parse(
            r#"
[tiers.free]
rate_limit_per_hour = 20
capabilities = ["simple-search", "vector-search"]
"#,
        )
        .unwrap();
        let profiles = config.tier_profiles();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].tier, Tier::Free);
        assert_eq!(profiles[0].rate_limit_per_hour, 20);
        assert_eq!(profiles[0].max_concurrent_runs, 1);
        assert!(profiles[0].capabilities.contains(&Capability::VectorSearch));
    }

    #[test]
    fn test_validate_warns_on_unknown_names() {
        let config = RunnerToml::parse(
            r#"
[phases.deploy]
command = "true"

[tiers.gold]
rate_limit_per_hour = 1
"#,
        )
        .unwrap();
        let warnings = config.validate();
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("deploy"));
        assert!(warnings[1].contains("gold"));
    }

    #[test]
    fn test_validate_port_range() {
        let config = RunnerToml::parse(
            r#"
[ports]
range_start = 65530
range_size = 10
"#,
        )
        .unwrap();
        assert!(config.validate()[0].contains("Invalid port range"));
    }

    #[test]
    fn test_invalid_toml_is_error() {
        let err = RunnerToml::parse("[engine\nauto_fix = ").unwrap_err();
        assert!(err.to_string().contains("runner.toml"));
    }

    #[test]
    fn test_save_and_load_or_default() {
        let dir = tempdir().unwrap();
        assert_eq!(
            RunnerToml::load_or_default(dir.path()).unwrap(),
            RunnerToml::default()
        );

        let mut config = RunnerToml::default();
        config.engine.auto_fix = false;
        config.ports.services.insert("backend".into(), 8000);
        config.save(&dir.path().join(CONFIG_FILE)).unwrap();

        let loaded = RunnerToml::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded, config);
    }
}
