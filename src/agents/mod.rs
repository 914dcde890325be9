//! Phase agents and their invocation.
//!
//! An agent performs the actual work of a phase. The engine only knows the
//! `PhaseAgent` trait; concrete workers are registered per phase in an
//! `AgentRegistry`. `AgentInvoker` bounds every call with a timeout and a
//! cancellation token.

pub mod command;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::errors::{ErrorKind, PhaseError};
use crate::phase::{Phase, PhaseFailure};
use crate::retry::classify_message;

pub use command::CommandAgent;

/// Everything an agent is told about the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentContext {
    pub run_id: String,
    pub phase: Phase,
    pub repo_path: PathBuf,
    /// Payloads of phases that already succeeded
    #[serde(default)]
    pub prior_results: BTreeMap<Phase, serde_json::Value>,
    /// Run options and feature flags relevant to the agent
    #[serde(default)]
    pub config: serde_json::Value,
    /// Service name to assigned port (service-start and later)
    #[serde(default)]
    pub ports: BTreeMap<String, u16>,
    /// Set when the auto-fix agent is asked to remediate a failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failing_phase: Option<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<PhaseFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Succeeded,
    Skipped,
    Failed,
}

/// What an agent reports back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub status: OutcomeStatus,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AgentOutcome {
    pub fn succeeded(payload: serde_json::Value) -> Self {
        Self {
            status: OutcomeStatus::Succeeded,
            payload,
            error: None,
            error_kind: None,
            reason: None,
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Skipped,
            payload: serde_json::Value::Null,
            error: None,
            error_kind: None,
            reason: Some(reason.into()),
        }
    }

    pub fn failed(error: impl Into<String>, kind: Option<ErrorKind>) -> Self {
        Self {
            status: OutcomeStatus::Failed,
            payload: serde_json::Value::Null,
            error: Some(error.into()),
            error_kind: kind,
            reason: None,
        }
    }

    /// Turn a reported failure into a `PhaseError`. An unlabelled failure is
    /// classified from its message.
    pub fn into_result(self) -> Result<AgentOutcome, PhaseError> {
        match self.status {
            OutcomeStatus::Succeeded | OutcomeStatus::Skipped => Ok(self),
            OutcomeStatus::Failed => {
                let message = self
                    .error
                    .unwrap_or_else(|| "agent reported failure".to_string());
                let kind = self
                    .error_kind
                    .unwrap_or_else(|| classify_message(&message));
                Err(PhaseError::of_kind(kind, message))
            }
        }
    }
}

/// A worker for one pipeline phase.
#[async_trait]
pub trait PhaseAgent: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Do the phase's work. Implementations should return promptly once
    /// `cancel` fires.
    async fn invoke(
        &self,
        ctx: &AgentContext,
        cancel: CancellationToken,
    ) -> Result<AgentOutcome, PhaseError>;
}

/// Stand-in for phases nobody registered a worker for.
#[derive(Debug, Default)]
pub struct UnconfiguredAgent;

#[async_trait]
impl PhaseAgent for UnconfiguredAgent {
    fn name(&self) -> &str {
        "unconfigured"
    }

    async fn invoke(
        &self,
        _ctx: &AgentContext,
        _cancel: CancellationToken,
    ) -> Result<AgentOutcome, PhaseError> {
        Ok(AgentOutcome::skipped("no agent configured"))
    }
}

/// Explicit phase to agent map.
#[derive(Clone)]
pub struct AgentRegistry {
    agents: HashMap<Phase, Arc<dyn PhaseAgent>>,
    fallback: Arc<dyn PhaseAgent>,
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<(Phase, &str)> =
            self.agents.iter().map(|(p, a)| (*p, a.name())).collect();
        names.sort();
        f.debug_struct("AgentRegistry").field("agents", &names).finish()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: HashMap::new(),
            fallback: Arc::new(UnconfiguredAgent),
        }
    }

    pub fn register(&mut self, phase: Phase, agent: Arc<dyn PhaseAgent>) -> &mut Self {
        self.agents.insert(phase, agent);
        self
    }

    /// Registry of command agents, one per configured phase command.
    pub fn from_commands<'a>(commands: impl IntoIterator<Item = (Phase, &'a str)>) -> Self {
        let mut registry = Self::new();
        for (phase, command) in commands {
            registry.register(phase, Arc::new(CommandAgent::new(command)));
        }
        registry
    }

    pub fn is_registered(&self, phase: Phase) -> bool {
        self.agents.contains_key(&phase)
    }

    /// The agent for `phase`, or `UnconfiguredAgent` if none was registered.
    pub fn get(&self, phase: Phase) -> Arc<dyn PhaseAgent> {
        self.agents
            .get(&phase)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }
}

/// Invokes registered agents with a timeout and cancellation.
#[derive(Debug, Clone)]
pub struct AgentInvoker {
    registry: Arc<AgentRegistry>,
}

impl AgentInvoker {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Run the agent for `phase`. A reported failure, a timeout and a
    /// cancellation all come back as `Err`.
    pub async fn invoke(
        &self,
        phase: Phase,
        ctx: &AgentContext,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<AgentOutcome, PhaseError> {
        let agent = self.registry.get(phase);
        let child = cancel.child_token();
        tracing::debug!(%phase, agent = agent.name(), timeout_secs = timeout.as_secs(), "invoking agent");

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PhaseError::Cancelled),
            res = tokio::time::timeout(timeout, agent.invoke(ctx, child.clone())) => match res {
                Ok(outcome) => outcome.and_then(AgentOutcome::into_result),
                Err(_) => Err(PhaseError::TimedOut { secs: timeout.as_secs() }),
            },
        };
        // Lets agents that spawned background work observe the end of the call.
        child.cancel();
        result
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{ScriptedAgent, context};
    use super::*;

    fn invoker_with(phase: Phase, agent: Arc<dyn PhaseAgent>) -> AgentInvoker {
        let mut registry = AgentRegistry::new();
        registry.register(phase, agent);
        AgentInvoker::new(Arc::new(registry))
    }

    #[tokio::test]
    async fn test_unregistered_phase_is_skipped() {
        let invoker = AgentInvoker::new(Arc::new(AgentRegistry::new()));
        let outcome = invoker
            .invoke(
                Phase::DatabaseSetup,
                &context(Phase::DatabaseSetup),
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Skipped);
        assert_eq!(outcome.reason.as_deref(), Some("no agent configured"));
    }

    #[tokio::test]
    async fn test_failed_outcome_becomes_error() {
        let agent = ScriptedAgent::new(vec![Ok(AgentOutcome::failed(
            "listen EADDRINUSE: address already in use",
            None,
        ))]);
        let invoker = invoker_with(Phase::ServiceStart, agent);
        let err = invoker
            .invoke(
                Phase::ServiceStart,
                &context(Phase::ServiceStart),
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[tokio::test]
    async fn test_explicit_error_kind_wins() {
        let outcome = AgentOutcome::failed("timed out talking to registry", Some(ErrorKind::Permanent));
        assert_eq!(outcome.into_result().unwrap_err().kind(), ErrorKind::Permanent);
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let agent = ScriptedAgent::slow(Duration::from_secs(10));
        let invoker = invoker_with(Phase::HealthCheck, agent);
        let err = invoker
            .invoke(
                Phase::HealthCheck,
                &context(Phase::HealthCheck),
                Duration::from_millis(20),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PhaseError::TimedOut { .. }));
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[tokio::test]
    async fn test_cancellation_stops_invocation() {
        let agent = ScriptedAgent::slow(Duration::from_secs(10));
        let invoker = invoker_with(Phase::DependencySetup, agent);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = invoker
            .invoke(
                Phase::DependencySetup,
                &context(Phase::DependencySetup),
                Duration::from_secs(30),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_outcome_deserializes_with_defaults() {
        let outcome: AgentOutcome =
            serde_json::from_str(r#"{"status":"skipped","reason":"no database detected"}"#).unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Skipped);
        assert_eq!(outcome.payload, serde_json::Value::Null);
    }

    #[test]
    fn test_registry_debug_lists_agents() {
        let registry = AgentRegistry::from_commands([(Phase::HealthCheck, "true")]);
        assert!(registry.is_registered(Phase::HealthCheck));
        assert!(!registry.is_registered(Phase::DatabaseSetup));
        assert!(format!("{:?}", registry).contains("HealthCheck"));
    }
}
