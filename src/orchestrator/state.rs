use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::errors::{EngineError, PhaseError};
use crate::gates::{Caller, Tier};
use crate::phase::{Phase, PhaseFailure, PhaseResult, PhaseStatus};
use crate::ports::PortAllocation;

/// Current checkpoint schema version. Bump on incompatible changes.
pub const SCHEMA_VERSION: u32 = 1;

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Running,
    Completed,
    /// Finished, but some phase was skipped by denial or failed non-fatally
    Degraded,
    /// A mandatory phase failed or the run was stopped
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Degraded => "degraded",
            RunStatus::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Which context indexer the caller asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IndexerKind {
    #[default]
    Simple,
    Vector,
    AdvancedVector,
}

impl std::str::FromStr for IndexerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "simple" => Ok(IndexerKind::Simple),
            "vector" | "faiss" => Ok(IndexerKind::Vector),
            "advanced-vector" | "chroma" => Ok(IndexerKind::AdvancedVector),
            _ => anyhow::bail!(
                "Invalid indexer '{}'. Valid values: simple, vector, advanced-vector",
                s
            ),
        }
    }
}

/// Caller-supplied options for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Explicit run id; derived from repo path and user when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Target environment (detect, local, docker, ...)
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Tier for anonymous callers; registered users always use their account tier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub skip: BTreeSet<Phase>,
    #[serde(default)]
    pub indexer: IndexerKind,
    #[serde(default)]
    pub gpu: bool,
    #[serde(default)]
    pub features: BTreeMap<String, bool>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub force: bool,
}

fn default_environment() -> String {
    "detect".to_string()
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            run_id: None,
            environment: default_environment(),
            user: None,
            tier: None,
            model: None,
            skip: BTreeSet::new(),
            indexer: IndexerKind::default(),
            gpu: false,
            features: BTreeMap::new(),
            dry_run: false,
            force: false,
        }
    }
}

/// Outcome of one inline auto-fix attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationRecord {
    /// Phase whose failure triggered the fix
    pub target: Phase,
    pub status: PhaseStatus,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PhaseFailure>,
    pub at: DateTime<Utc>,
}

/// Complete state of one run. This is what gets checkpointed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    #[serde(default)]
    pub schema_version: u32,
    pub run_id: String,
    pub repo_path: PathBuf,
    pub phases: Vec<Phase>,
    pub phase_results: BTreeMap<Phase, PhaseResult>,
    #[serde(default)]
    pub current_phase: Option<Phase>,
    pub user: String,
    pub tier: Tier,
    #[serde(default)]
    pub options: RunOptions,
    pub overall_status: RunStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    /// Process driving the run, used to tell live runs from crashed ones
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Set when a phase was skipped by denial or failed without aborting
    #[serde(default)]
    pub degraded: bool,
    /// Phases that already received their one inline auto-fix attempt
    #[serde(default)]
    pub auto_fixed: BTreeSet<Phase>,
    #[serde(default)]
    pub remediations: Vec<RemediationRecord>,
    #[serde(default)]
    pub ports: Vec<PortAllocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_error: Option<String>,
}

impl RunState {
    pub fn new(run_id: &str, repo_path: PathBuf, caller: &Caller, options: RunOptions) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION,
            run_id: run_id.to_string(),
            repo_path,
            phases: Phase::PIPELINE.to_vec(),
            phase_results: Phase::PIPELINE
                .iter()
                .map(|p| (*p, PhaseResult::pending(*p)))
                .collect(),
            current_phase: None,
            user: caller.id.clone(),
            tier: caller.tier,
            options,
            overall_status: RunStatus::Running,
            start_time: now,
            updated_at: now,
            pid: Some(std::process::id()),
            degraded: false,
            auto_fixed: BTreeSet::new(),
            remediations: Vec::new(),
            ports: Vec::new(),
            run_error: None,
        }
    }

    pub fn result(&self, phase: Phase) -> Option<&PhaseResult> {
        self.phase_results.get(&phase)
    }

    fn result_mut(&mut self, phase: Phase) -> &mut PhaseResult {
        self.phase_results
            .entry(phase)
            .or_insert_with(|| PhaseResult::pending(phase))
    }

    pub fn status_of(&self, phase: Phase) -> PhaseStatus {
        self.result(phase).map(|r| r.status).unwrap_or_default()
    }

    /// The phase currently marked running, if any.
    pub fn running_phase(&self) -> Option<Phase> {
        self.phase_results
            .values()
            .find(|r| r.status == PhaseStatus::Running)
            .map(|r| r.phase)
    }

    pub fn count_with_status(&self, status: PhaseStatus) -> usize {
        self.phase_results
            .values()
            .filter(|r| r.status == status)
            .count()
    }

    /// Mark a phase running. Fails if a different phase is already running.
    pub fn begin_phase(&mut self, phase: Phase) -> Result<(), EngineError> {
        if let Some(running) = self.running_phase()
            && running != phase
        {
            return Err(EngineError::PhaseAlreadyRunning {
                running: running.to_string(),
                requested: phase.to_string(),
            });
        }
        let now = Utc::now();
        let result = self.result_mut(phase);
        result.status = PhaseStatus::Running;
        result.started_at = Some(now);
        result.ended_at = None;
        result.error = None;
        result.reason = None;
        self.current_phase = Some(phase);
        self.updated_at = now;
        Ok(())
    }

    pub fn succeed_phase(&mut self, phase: Phase, output: serde_json::Value) {
        let now = Utc::now();
        let result = self.result_mut(phase);
        result.status = PhaseStatus::Succeeded;
        result.output = output;
        result.error = None;
        result.ended_at = Some(now);
        self.current_phase = None;
        self.updated_at = now;
    }

    pub fn fail_phase(&mut self, phase: Phase, err: &PhaseError) {
        let now = Utc::now();
        let result = self.result_mut(phase);
        result.status = PhaseStatus::Failed;
        result.error = Some(PhaseFailure::from(err));
        result.ended_at = Some(now);
        self.current_phase = None;
        self.updated_at = now;
    }

    fn mark_skipped(&mut self, phase: Phase, reason: String, policy: bool) -> &mut PhaseResult {
        let now = Utc::now();
        self.current_phase = None;
        self.updated_at = now;
        let result = self.result_mut(phase);
        result.status = PhaseStatus::Skipped;
        result.reason = Some(reason);
        result.policy_skip = policy;
        result.ended_at = Some(now);
        if result.started_at.is_none() {
            result.started_at = Some(now);
        }
        result
    }

    /// Skip a phase by engine decision. `degrading` skips (tier denial) mark
    /// the run degraded.
    pub fn skip_phase(&mut self, phase: Phase, reason: impl Into<String>, degrading: bool) {
        self.mark_skipped(phase, reason.into(), true);
        if degrading {
            self.degraded = true;
        }
    }

    /// Record that the phase's agent found nothing to do.
    pub fn agent_skipped(&mut self, phase: Phase, reason: impl Into<String>, output: serde_json::Value) {
        self.mark_skipped(phase, reason.into(), false).output = output;
    }

    pub fn note_retry(&mut self, phase: Phase) {
        self.result_mut(phase).retry_count += 1;
        self.updated_at = Utc::now();
    }

    pub fn has_failures(&self) -> bool {
        self.count_with_status(PhaseStatus::Failed) > 0
    }

    /// Outputs of every succeeded phase, for agent contexts.
    pub fn prior_outputs(&self) -> BTreeMap<Phase, serde_json::Value> {
        self.phase_results
            .values()
            .filter(|r| r.status == PhaseStatus::Succeeded)
            .map(|r| (r.phase, r.output.clone()))
            .collect()
    }

    /// Prepare a loaded checkpoint for another pass.
    ///
    /// With `force` every phase starts over. Otherwise succeeded phases and
    /// agent-reported skips are kept. Everything else (including a phase
    /// interrupted while running) goes back to pending with a fresh retry
    /// budget, and engine skips are decided again.
    pub fn prepare_resume(&mut self, force: bool) {
        for result in self.phase_results.values_mut() {
            let keep = !force
                && match result.status {
                    PhaseStatus::Succeeded => true,
                    PhaseStatus::Skipped => !result.policy_skip,
                    _ => false,
                };
            if !keep {
                *result = PhaseResult::pending(result.phase);
            }
        }
        if force {
            self.auto_fixed.clear();
            self.remediations.clear();
            self.ports.clear();
            self.start_time = Utc::now();
        }
        self.degraded = false;
        self.current_phase = None;
        self.overall_status = RunStatus::Running;
        self.run_error = None;
        self.updated_at = Utc::now();
    }

    /// Mark the run aborted with a run-level error.
    pub fn abort(&mut self, error: impl Into<String>) {
        self.overall_status = RunStatus::Aborted;
        self.run_error = Some(error.into());
        self.current_phase = None;
        self.updated_at = Utc::now();
    }

    /// Settle the overall status once the pipeline has been walked.
    pub fn finish(&mut self) -> RunStatus {
        if self.overall_status != RunStatus::Aborted {
            self.overall_status = if self.degraded || self.has_failures() {
                RunStatus::Degraded
            } else {
                RunStatus::Completed
            };
        }
        self.current_phase = None;
        self.updated_at = Utc::now();
        self.overall_status
    }
}
