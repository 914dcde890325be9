//! Phase definitions for the repo-runner pipeline.
//!
//! This module provides:
//! - `Phase`, the fixed, ordered set of pipeline stages
//! - `PhaseStatus` and `PhaseResult`, the per-phase record kept in a run
//! - `PhaseSpec`, the resolved per-phase settings (mandatory flag, timeout)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::{ErrorKind, PhaseError};
use crate::gates::Capability;
use crate::orchestrator::state::{IndexerKind, RunOptions};

/// One named stage of the pipeline. Declaration order is execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    EnvironmentDetect,
    RequirementsAnalysis,
    DependencySetup,
    DatabaseSetup,
    ContextIndexing,
    ServiceStart,
    HealthCheck,
    AutoFixOnDemand,
}

impl Phase {
    /// The full pipeline in execution order.
    pub const PIPELINE: [Phase; 8] = [
        Phase::EnvironmentDetect,
        Phase::RequirementsAnalysis,
        Phase::DependencySetup,
        Phase::DatabaseSetup,
        Phase::ContextIndexing,
        Phase::ServiceStart,
        Phase::HealthCheck,
        Phase::AutoFixOnDemand,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::EnvironmentDetect => "environment-detect",
            Phase::RequirementsAnalysis => "requirements-analysis",
            Phase::DependencySetup => "dependency-setup",
            Phase::DatabaseSetup => "database-setup",
            Phase::ContextIndexing => "context-indexing",
            Phase::ServiceStart => "service-start",
            Phase::HealthCheck => "health-check",
            Phase::AutoFixOnDemand => "auto-fix-on-demand",
        }
    }

    /// Position of the phase in the pipeline.
    pub fn index(&self) -> usize {
        Self::PIPELINE
            .iter()
            .position(|p| p == self)
            .unwrap_or(Self::PIPELINE.len())
    }

    /// Whether a failure of this phase aborts the run when no override is configured.
    pub fn default_mandatory(&self) -> bool {
        matches!(self, Phase::EnvironmentDetect | Phase::DependencySetup)
    }

    /// Timeout for one invocation of the phase agent when no override is configured.
    pub fn default_timeout(&self) -> Duration {
        let secs = match self {
            Phase::EnvironmentDetect => 60,
            Phase::RequirementsAnalysis => 300,
            Phase::DependencySetup => 900,
            Phase::DatabaseSetup => 300,
            Phase::ContextIndexing => 600,
            Phase::ServiceStart => 180,
            Phase::HealthCheck => 120,
            Phase::AutoFixOnDemand => 300,
        };
        Duration::from_secs(secs)
    }

    /// Capability the caller's tier must hold for this phase to run.
    pub fn required_capability(&self, options: &RunOptions) -> Option<Capability> {
        match self {
            Phase::ContextIndexing => Some(match options.indexer {
                IndexerKind::Simple => Capability::SimpleSearch,
                IndexerKind::Vector => Capability::VectorSearch,
                IndexerKind::AdvancedVector => Capability::AdvancedVectorSearch,
            }),
            Phase::RequirementsAnalysis if options.gpu => Some(Capability::GpuAccess),
            _ => None,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('_', "-");
        Self::PIPELINE
            .iter()
            .copied()
            .find(|p| p.as_str() == normalized)
            .ok_or_else(|| {
                let valid: Vec<&str> = Self::PIPELINE.iter().map(|p| p.as_str()).collect();
                anyhow::anyhow!(
                    "Invalid phase '{}'. Valid values: {}",
                    s,
                    valid.join(", ")
                )
            })
    }
}

/// Lifecycle status of a phase within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl PhaseStatus {
    /// Whether a resumed run must not execute the phase again.
    pub fn is_settled(&self) -> bool {
        matches!(self, PhaseStatus::Succeeded | PhaseStatus::Skipped)
    }
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::Running => "running",
            PhaseStatus::Succeeded => "succeeded",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Persisted form of a phase error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&PhaseError> for PhaseFailure {
    fn from(err: &PhaseError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Record of one phase within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: Phase,
    #[serde(default)]
    pub status: PhaseStatus,
    /// Opaque payload returned by the agent
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PhaseFailure>,
    /// Why the phase was skipped, if it was
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Skipped by the engine (request, tier, nothing to fix) rather than by
    /// its agent; such skips are decided again on resume
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub policy_skip: bool,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl PhaseResult {
    pub fn pending(phase: Phase) -> Self {
        Self {
            phase,
            status: PhaseStatus::Pending,
            output: serde_json::Value::Null,
            error: None,
            reason: None,
            policy_skip: false,
            retry_count: 0,
            started_at: None,
            ended_at: None,
        }
    }

    /// Wall-clock duration between start and end, if both are known.
    pub fn duration(&self) -> Option<Duration> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => (end - start).to_std().ok(),
            _ => None,
        }
    }
}

/// Resolved settings for one phase after configuration overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseSpec {
    pub phase: Phase,
    pub mandatory: bool,
    pub timeout: Duration,
}

impl PhaseSpec {
    pub fn defaults(phase: Phase) -> Self {
        Self {
            phase,
            mandatory: phase.default_mandatory(),
            timeout: phase.default_timeout(),
        }
    }
}
