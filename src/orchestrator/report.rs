//! Final report returned by a run.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::state::{RemediationRecord, RunState, RunStatus};
use crate::errors::ErrorKind;
use crate::gates::Caller;
use crate::phase::{Phase, PhaseStatus};

/// One line per phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub phase: Phase,
    pub status: PhaseStatus,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A failure worth showing to the caller. `phase` is absent for run-level errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub service: String,
    pub port: u16,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalReport {
    pub run_id: String,
    pub repo_path: PathBuf,
    pub user: String,
    pub tier: String,
    pub status: RunStatus,
    pub phases: Vec<PhaseSummary>,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: Vec<ErrorSummary>,
    pub endpoints: Vec<ServiceEndpoint>,
    pub remediations: Vec<RemediationRecord>,
    #[serde(with = "duration_serde")]
    pub elapsed: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_path: Option<PathBuf>,
}

impl FinalReport {
    /// Build the report for a run that got as far as having state.
    pub fn from_state(state: &RunState, elapsed: Duration, checkpoint_path: Option<PathBuf>) -> Self {
        let phases: Vec<PhaseSummary> = state
            .phases
            .iter()
            .filter_map(|p| state.result(*p))
            .map(|r| PhaseSummary {
                phase: r.phase,
                status: r.status,
                retry_count: r.retry_count,
                duration_ms: r.duration().map(|d| d.as_millis() as u64),
                reason: r.reason.clone(),
                error: r.error.as_ref().map(|e| e.message.clone()),
            })
            .collect();

        let mut errors: Vec<ErrorSummary> = state
            .phases
            .iter()
            .filter_map(|p| state.result(*p))
            .filter(|r| r.status == PhaseStatus::Failed)
            .filter_map(|r| {
                r.error.as_ref().map(|e| ErrorSummary {
                    phase: Some(r.phase),
                    kind: Some(e.kind),
                    message: e.message.clone(),
                })
            })
            .collect();
        if let Some(ref message) = state.run_error {
            errors.push(ErrorSummary {
                phase: None,
                kind: None,
                message: message.clone(),
            });
        }

        let count = |s: PhaseStatus| phases.iter().filter(|p| p.status == s).count();

        Self {
            run_id: state.run_id.clone(),
            repo_path: state.repo_path.clone(),
            user: state.user.clone(),
            tier: state.tier.to_string(),
            status: state.overall_status,
            succeeded: count(PhaseStatus::Succeeded),
            failed: count(PhaseStatus::Failed),
            skipped: count(PhaseStatus::Skipped),
            phases,
            errors,
            endpoints: endpoints(state),
            remediations: state.remediations.clone(),
            elapsed,
            checkpoint_path,
        }
    }

    /// Report for a run refused before any state was created.
    pub fn denied(run_id: &str, repo_path: PathBuf, caller: &Caller, message: String) -> Self {
        Self {
            run_id: run_id.to_string(),
            repo_path,
            user: caller.id.clone(),
            tier: caller.tier.to_string(),
            status: RunStatus::Aborted,
            phases: Vec::new(),
            succeeded: 0,
            failed: 0,
            skipped: 0,
            errors: vec![ErrorSummary {
                phase: None,
                kind: None,
                message,
            }],
            endpoints: Vec::new(),
            remediations: Vec::new(),
            elapsed: Duration::ZERO,
            checkpoint_path: None,
        }
    }

    /// Phases named in the error summary.
    pub fn failing_phases(&self) -> Vec<Phase> {
        self.errors.iter().filter_map(|e| e.phase).collect()
    }

    /// Process exit code: 0 completed, 2 degraded, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Completed => 0,
            RunStatus::Degraded => 2,
            RunStatus::Aborted | RunStatus::Running => 1,
        }
    }
}

/// Endpoints for ports assigned during service-start. A service-start
/// payload may supply its own URLs under `urls.<service>`.
fn endpoints(state: &RunState) -> Vec<ServiceEndpoint> {
    let urls = state
        .result(Phase::ServiceStart)
        .filter(|r| r.status == PhaseStatus::Succeeded)
        .and_then(|r| r.output.get("urls"))
        .and_then(|u| u.as_object());

    state
        .ports
        .iter()
        .filter_map(|a| {
            let port = a.port?;
            let url = urls
                .and_then(|u| u.get(&a.service))
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| format!("http://localhost:{}", port));
            Some(ServiceEndpoint {
                service: a.service.clone(),
                port,
                url,
            })
        })
        .collect()
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
