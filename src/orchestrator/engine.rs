//! The workflow engine: drives the phase pipeline for one run.
//!
//! A run goes through these steps:
//! 1. Resolve the caller, derive the run id, and pass the tier gate
//! 2. Load the checkpoint (resume) or create fresh state
//! 3. Walk the pipeline, invoking each unsettled phase under the retry policy
//! 4. Checkpoint after every transition and return a `FinalReport`

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::report::FinalReport;
use super::state::{RemediationRecord, RunOptions, RunState, RunStatus};
use crate::agents::{AgentContext, AgentInvoker, AgentRegistry, OutcomeStatus};
use crate::checkpoint::{CheckpointStore, validate_run_id};
use crate::errors::{EngineError, GateError, PhaseError};
use crate::gates::{Caller, RunSlot, TierGate, UserRegistry};
use crate::phase::{Phase, PhaseFailure, PhaseSpec, PhaseStatus};
use crate::ports::{PortAllocation, PortAllocator, PortProbe, SystemPortProbe};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::runner_config::RunnerToml;

/// Identity used when the caller gives none.
pub const ANONYMOUS_USER: &str = "anonymous";

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Cancels a run from outside the engine.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    token: CancellationToken,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// What the pipeline loop does after a phase.
enum PhaseFlow {
    Continue,
    Abort,
}

/// What a caller already holds, as seen in the checkpoint directory.
#[derive(Debug, Default)]
struct CallerUsage {
    repos: BTreeSet<PathBuf>,
    /// Runs still driven by another live process
    running_elsewhere: u32,
}

/// Stable run id for a repository and user: first 16 hex chars of
/// sha256(canonical path, user).
pub fn derive_run_id(repo_path: &Path, user: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(repo_path.to_string_lossy().as_bytes());
    hasher.update([0u8]);
    hasher.update(user.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

pub struct WorkflowEngine {
    store: CheckpointStore,
    gate: Arc<TierGate>,
    users: Option<Arc<UserRegistry>>,
    invoker: AgentInvoker,
    retry: RetryPolicy,
    config: RunnerToml,
    probe: Arc<dyn PortProbe>,
    active: DashMap<String, StopHandle>,
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("store", &self.store)
            .field("invoker", &self.invoker)
            .field("active", &self.active.len())
            .finish()
    }
}

impl WorkflowEngine {
    pub fn new(store: CheckpointStore, registry: AgentRegistry, config: RunnerToml) -> Self {
        let gate = Arc::new(TierGate::with_profiles(config.tier_profiles()));
        let probe: Arc<dyn PortProbe> = Arc::new(SystemPortProbe::new(config.ports.host.clone()));
        Self {
            store,
            gate,
            users: None,
            invoker: AgentInvoker::new(Arc::new(registry)),
            retry: RetryPolicy::new(config.retry.clone()),
            config,
            probe,
            active: DashMap::new(),
        }
    }

    /// Share a gate between engines (counters are per gate).
    pub fn with_gate(mut self, gate: Arc<TierGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_users(mut self, users: Arc<UserRegistry>) -> Self {
        self.users = Some(users);
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn PortProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn gate(&self) -> &TierGate {
        &self.gate
    }

    /// Cancel an in-flight run. Returns false if no such run is active.
    pub fn stop(&self, run_id: &str) -> bool {
        match self.active.get(run_id) {
            Some(handle) => {
                tracing::info!(%run_id, "stop requested");
                handle.stop();
                true
            }
            None => false,
        }
    }

    /// Run ids currently executing in this engine.
    pub fn active_runs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub async fn run(&self, repo_path: &Path, options: RunOptions) -> Result<FinalReport, EngineError> {
        self.run_with_stop(repo_path, options, StopHandle::new()).await
    }

    /// Run the pipeline for `repo_path`. Expected failures (denials, phase
    /// errors, cancellation) end up in the report; `Err` is reserved for
    /// faults such as an unwritable checkpoint directory.
    pub async fn run_with_stop(
        &self,
        repo_path: &Path,
        options: RunOptions,
        stop: StopHandle,
    ) -> Result<FinalReport, EngineError> {
        let started = Instant::now();
        let repo_path = repo_path
            .canonicalize()
            .ok()
            .filter(|p| p.is_dir())
            .ok_or_else(|| EngineError::RepoNotFound {
                path: repo_path.to_path_buf(),
            })?;

        let caller = self.resolve_caller(&options);
        let run_id = match options.run_id {
            Some(ref id) => id.clone(),
            None => derive_run_id(&repo_path, &caller.id),
        };
        validate_run_id(&run_id)?;

        if let Some(message) = self.check_blocked(&caller) {
            return Ok(FinalReport::denied(&run_id, repo_path, &caller, message));
        }

        // Claim the run id for this process.
        match self.active.entry(run_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                let message = format!("run {} is already in progress", run_id);
                tracing::warn!(%run_id, "{}", message);
                return Ok(FinalReport::denied(&run_id, repo_path, &caller, message));
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(stop.clone());
            }
        }

        let watcher = (!options.dry_run).then(|| self.watch_stop_marker(&run_id, &stop));
        let result = self
            .admit_and_drive(&run_id, repo_path, &caller, options, &stop, started)
            .await;
        if let Some(watcher) = watcher {
            watcher.abort();
        }
        self.active.remove(&run_id);
        result
    }

    /// Cancel `stop` when another process drops a stop marker for `run_id`.
    fn watch_stop_marker(&self, run_id: &str, stop: &StopHandle) -> tokio::task::JoinHandle<()> {
        // A marker left behind by an earlier process must not stop this run.
        if let Err(e) = self.store.clear_stop(run_id) {
            tracing::warn!(%run_id, error = %e, "failed to clear stale stop marker");
        }
        let store = self.store.clone();
        let run_id = run_id.to_string();
        let token = stop.token().clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(STOP_POLL_INTERVAL) => {}
                }
                if store.stop_requested(&run_id) {
                    tracing::info!(%run_id, "stop marker found");
                    if let Err(e) = store.clear_stop(&run_id) {
                        tracing::warn!(%run_id, error = %e, "failed to clear stop marker");
                    }
                    token.cancel();
                    return;
                }
            }
        })
    }

    async fn admit_and_drive(
        &self,
        run_id: &str,
        repo_path: PathBuf,
        caller: &Caller,
        options: RunOptions,
        stop: &StopHandle,
        started: Instant,
    ) -> Result<FinalReport, EngineError> {
        // Dry runs preview the pipeline without consuming allowance.
        let _slot = if options.dry_run {
            None
        } else {
            let usage = self.usage(run_id, caller)?;
            match self.admit(&repo_path, caller, &usage) {
                Ok(slot) => Some(slot),
                Err(e) => {
                    tracing::warn!(%run_id, user = %caller.id, error = %e, "run denied");
                    return Ok(FinalReport::denied(run_id, repo_path, caller, e.to_string()));
                }
            }
        };

        let state = self.load_or_create(run_id, repo_path, caller, options);
        self.drive(state, stop.token(), started).await
    }

    /// Registered users always run at their account tier; anonymous callers
    /// may pick one.
    fn resolve_caller(&self, options: &RunOptions) -> Caller {
        let id = options
            .user
            .clone()
            .unwrap_or_else(|| ANONYMOUS_USER.to_string());
        let account = self.users.as_ref().and_then(|u| u.get(&id));
        let tier = match account {
            Some(account) => account.tier,
            None => options.tier.unwrap_or_default(),
        };
        Caller::new(id, tier)
    }

    fn check_blocked(&self, caller: &Caller) -> Option<String> {
        let account = self.users.as_ref()?.get(&caller.id)?;
        account.blocked.then(|| {
            tracing::warn!(user = %caller.id, "blocked user refused");
            GateError::UserBlocked {
                user: caller.id.clone(),
            }
            .to_string()
        })
    }

    /// Repositories and live runs the caller has across every process
    /// sharing this checkpoint directory.
    fn usage(&self, run_id: &str, caller: &Caller) -> Result<CallerUsage, EngineError> {
        let own_pid = std::process::id();
        let mut usage = CallerUsage::default();
        for run in self.store.load_all()? {
            if run.user != caller.id {
                continue;
            }
            let live_elsewhere = run.overall_status == RunStatus::Running
                && run.run_id != run_id
                && run
                    .pid
                    .is_some_and(|pid| pid != own_pid && self.probe.is_alive(pid));
            if live_elsewhere {
                usage.running_elsewhere += 1;
            }
            usage.repos.insert(run.repo_path);
        }
        Ok(usage)
    }

    /// Apply the tier's repository, concurrency and hourly limits, in that
    /// order. A registered account's hourly count lives in the user registry;
    /// anyone else is counted by the in-process gate.
    fn admit(&self, repo_path: &Path, caller: &Caller, usage: &CallerUsage) -> Result<RunSlot, GateError> {
        let profile = self.gate.profile(caller.tier);
        if !usage.repos.contains(repo_path) && usage.repos.len() as u32 >= profile.max_repos {
            return Err(GateError::RepoLimit {
                user: caller.id.clone(),
                limit: profile.max_repos,
            });
        }

        let slot = self.gate.begin_run_alongside(caller, usage.running_elsewhere)?;

        let counted = match &self.users {
            Some(users) => users.try_acquire(&caller.id, profile.rate_limit_per_hour)?,
            None => None,
        };
        let count = match counted {
            Some(count) => count,
            None => self.gate.try_acquire(caller)?,
        };
        tracing::debug!(user = %caller.id, count, limit = profile.rate_limit_per_hour, "run admitted");
        Ok(slot)
    }

    fn load_or_create(
        &self,
        run_id: &str,
        repo_path: PathBuf,
        caller: &Caller,
        options: RunOptions,
    ) -> RunState {
        if !options.dry_run
            && let Some(mut state) = self.store.load(run_id)
        {
            if state.repo_path == repo_path {
                tracing::info!(%run_id, force = options.force, "resuming run from checkpoint");
                state.prepare_resume(options.force);
                state.pid = Some(std::process::id());
                state.tier = caller.tier;
                state.user = caller.id.clone();
                state.options = options;
                return state;
            }
            tracing::warn!(
                run_id,
                stored = %state.repo_path.display(),
                "checkpoint belongs to another repository; starting over"
            );
        }
        RunState::new(run_id, repo_path, caller, options)
    }

    fn save(&self, state: &RunState) -> Result<Option<PathBuf>, EngineError> {
        if state.options.dry_run {
            return Ok(None);
        }
        Ok(Some(self.store.save(&state.run_id, state)?))
    }

    async fn drive(
        &self,
        mut state: RunState,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<FinalReport, EngineError> {
        let run_id = state.run_id.clone();
        tracing::info!(
            run_id,
            repo = %state.repo_path.display(),
            user = %state.user,
            tier = %state.tier,
            dry_run = state.options.dry_run,
            "run started"
        );
        self.save(&state)?;

        let mut allocator = PortAllocator::from_config(&self.config.ports, Arc::clone(&self.probe));

        for phase in state.phases.clone() {
            if state.status_of(phase).is_settled() {
                tracing::debug!(%run_id, %phase, "phase already settled");
                continue;
            }
            if cancel.is_cancelled() {
                state.abort("run cancelled");
                break;
            }

            let spec = self.config.phase_spec(phase);

            if state.options.skip.contains(&phase) {
                state.skip_phase(phase, "skipped by request", false);
                self.save(&state)?;
                continue;
            }

            if let Some(capability) = phase.required_capability(&state.options)
                && !self.gate.allows(state.tier, capability)
            {
                let reason = GateError::CapabilityDenied {
                    tier: state.tier.to_string(),
                    capability: capability.to_string(),
                }
                .to_string();
                tracing::warn!(%run_id, %phase, "{}", reason);
                state.skip_phase(phase, reason.clone(), true);
                if spec.mandatory {
                    state.abort(format!("mandatory phase {} denied: {}", phase, reason));
                    self.save(&state)?;
                    break;
                }
                self.save(&state)?;
                continue;
            }

            if state.options.dry_run {
                state.skip_phase(phase, "dry run", false);
                continue;
            }

            if phase == Phase::AutoFixOnDemand && !state.has_failures() {
                state.skip_phase(phase, "no failures to remediate", false);
                self.save(&state)?;
                continue;
            }

            match self
                .run_phase(&mut state, &spec, &mut allocator, cancel)
                .await?
            {
                PhaseFlow::Continue => {}
                PhaseFlow::Abort => break,
            }
        }

        let status = state.finish();
        let checkpoint_path = self.save(&state)?;
        tracing::info!(%run_id, %status, elapsed_ms = started.elapsed().as_millis() as u64, "run finished");
        Ok(FinalReport::from_state(&state, started.elapsed(), checkpoint_path))
    }

    /// Run one phase to a settled outcome, retrying per policy.
    async fn run_phase(
        &self,
        state: &mut RunState,
        spec: &PhaseSpec,
        allocator: &mut PortAllocator,
        cancel: &CancellationToken,
    ) -> Result<PhaseFlow, EngineError> {
        let phase = spec.phase;
        let run_id = state.run_id.clone();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            state.begin_phase(phase)?;
            self.save(state)?;
            tracing::info!(%run_id, %phase, attempt, "phase started");

            let result = match self.prepare_ports(state, phase, allocator).await {
                Ok(()) => {
                    let ctx = self.context_for(state, phase);
                    self.invoker.invoke(phase, &ctx, spec.timeout, cancel).await
                }
                Err(e) => Err(e),
            };

            let err = match result {
                Ok(outcome) => {
                    if outcome.status == OutcomeStatus::Skipped {
                        let reason = outcome
                            .reason
                            .unwrap_or_else(|| "skipped by agent".to_string());
                        tracing::info!(%run_id, %phase, %reason, "phase skipped");
                        state.agent_skipped(phase, reason, outcome.payload);
                    } else {
                        tracing::info!(%run_id, %phase, attempt, "phase succeeded");
                        state.succeed_phase(phase, outcome.payload);
                    }
                    self.save(state)?;
                    return Ok(PhaseFlow::Continue);
                }
                Err(err) => err,
            };

            tracing::warn!(%run_id, %phase, attempt, kind = %err.kind(), error = %err, "phase failed");
            state.fail_phase(phase, &err);
            self.save(state)?;

            if err.is_cancelled() {
                state.abort("run cancelled");
                self.save(state)?;
                return Ok(PhaseFlow::Abort);
            }

            if self.should_auto_fix(state, phase) && self.auto_fix(state, phase, &err, cancel).await? {
                // A remediated phase gets one attempt outside its retry budget.
                attempt -= 1;
                state.note_retry(phase);
                self.save(state)?;
                tracing::info!(%run_id, %phase, "retrying phase after auto-fix");
                continue;
            }

            match self.retry.decide(spec, attempt, err.kind()) {
                RetryDecision::Retry(delay) => {
                    state.note_retry(phase);
                    self.save(state)?;
                    tracing::info!(%run_id, %phase, delay_ms = delay.as_millis() as u64, "retrying phase");
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            state.abort("run cancelled");
                            self.save(state)?;
                            return Ok(PhaseFlow::Abort);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::Skip => {
                    tracing::warn!(%run_id, %phase, "optional phase failed; continuing");
                    return Ok(PhaseFlow::Continue);
                }
                RetryDecision::Abort => {
                    state.abort(format!("mandatory phase {} failed: {}", phase, err));
                    self.save(state)?;
                    return Ok(PhaseFlow::Abort);
                }
            }
        }
    }

    fn should_auto_fix(&self, state: &RunState, phase: Phase) -> bool {
        self.config.engine.auto_fix
            && phase != Phase::AutoFixOnDemand
            && !state.auto_fixed.contains(&phase)
            && self.invoker.registry().is_registered(Phase::AutoFixOnDemand)
    }

    /// Ask the auto-fix agent to remediate `phase`. Recorded once per phase
    /// per run. Returns whether the agent reports a fix.
    async fn auto_fix(
        &self,
        state: &mut RunState,
        phase: Phase,
        err: &PhaseError,
        cancel: &CancellationToken,
    ) -> Result<bool, EngineError> {
        state.auto_fixed.insert(phase);
        let mut ctx = self.context_for(state, Phase::AutoFixOnDemand);
        ctx.failing_phase = Some(phase);
        ctx.failure = Some(PhaseFailure::from(err));
        let timeout = self.config.phase_spec(Phase::AutoFixOnDemand).timeout;

        tracing::info!(run_id = %state.run_id, %phase, "invoking auto-fix");
        let record = match self
            .invoker
            .invoke(Phase::AutoFixOnDemand, &ctx, timeout, cancel)
            .await
        {
            Ok(outcome) => RemediationRecord {
                target: phase,
                status: match outcome.status {
                    OutcomeStatus::Skipped => PhaseStatus::Skipped,
                    _ => PhaseStatus::Succeeded,
                },
                output: outcome.payload,
                error: None,
                at: chrono::Utc::now(),
            },
            Err(e) => {
                tracing::warn!(run_id = %state.run_id, %phase, error = %e, "auto-fix failed");
                RemediationRecord {
                    target: phase,
                    status: PhaseStatus::Failed,
                    output: serde_json::Value::Null,
                    error: Some(PhaseFailure::from(&e)),
                    at: chrono::Utc::now(),
                }
            }
        };
        let fixed = record.status == PhaseStatus::Succeeded;
        state.remediations.push(record);
        self.save(state)?;
        Ok(fixed)
    }

    /// Assign ports before service-start. Requested services come from
    /// `[ports.services]` and the environment-detect payload's `services`.
    async fn prepare_ports(
        &self,
        state: &mut RunState,
        phase: Phase,
        allocator: &mut PortAllocator,
    ) -> Result<(), PhaseError> {
        if phase != Phase::ServiceStart {
            return Ok(());
        }

        // Request order decides contention: environment-detect order first,
        // then services only named in `[ports.services]`.
        let mut wanted: Vec<(String, Option<u16>)> = Vec::new();
        if let Some(services) = state
            .result(Phase::EnvironmentDetect)
            .and_then(|r| r.output.get("services"))
            .and_then(|s| s.as_array())
        {
            for service in services {
                let Some(name) = service.get("name").and_then(|n| n.as_str()) else {
                    continue;
                };
                if wanted.iter().any(|(n, _)| n == name) {
                    continue;
                }
                let port = service
                    .get("preferred_port")
                    .or_else(|| service.get("port"))
                    .and_then(|p| p.as_u64())
                    .and_then(|p| u16::try_from(p).ok());
                wanted.push((name.to_string(), port));
            }
        }
        for (name, port) in &self.config.ports.services {
            match wanted.iter_mut().find(|(n, _)| n == name) {
                Some(entry) => entry.1 = Some(*port),
                None => wanted.push((name.clone(), Some(*port))),
            }
        }

        let ports = &self.config.ports;
        let mut allocations: Vec<PortAllocation> = Vec::with_capacity(wanted.len());
        let mut failure = None;
        for (service, preferred) in &wanted {
            if let Err(e) = allocator
                .allocate(service, *preferred, ports.range_start, ports.range_size)
                .await
            {
                failure.get_or_insert(e);
            }
            allocations.push(
                allocator
                    .allocation(service)
                    .unwrap_or_else(|| PortAllocation::exhausted(service, *preferred)),
            );
        }
        state.ports = allocations;

        match failure {
            // Another process may free a port before the retry.
            Some(e) => Err(PhaseError::transient(e.to_string())),
            None => Ok(()),
        }
    }

    fn context_for(&self, state: &RunState, phase: Phase) -> AgentContext {
        let options = &state.options;
        let mut config = serde_json::json!({
            "environment": options.environment,
            "model": options.model,
            "indexer": options.indexer,
            "gpu": options.gpu,
            "features": options.features,
            "user": state.user,
            "tier": state.tier,
        });
        if phase == Phase::AutoFixOnDemand {
            let failures: Vec<serde_json::Value> = state
                .phase_results
                .values()
                .filter(|r| r.status == PhaseStatus::Failed)
                .map(|r| serde_json::json!({ "phase": r.phase, "error": r.error }))
                .collect();
            config["failures"] = serde_json::Value::Array(failures);
        }

        AgentContext {
            run_id: state.run_id.clone(),
            phase,
            repo_path: state.repo_path.clone(),
            prior_results: state.prior_outputs(),
            config,
            ports: state
                .ports
                .iter()
                .filter_map(|a| a.port.map(|p| (a.service.clone(), p)))
                .collect(),
            failing_phase: None,
            failure: None,
        }
    }
}
