//! Agent that runs an external command.
//!
//! The command runs under `sh -c` in the repository directory:
//! - the `AgentContext` is written as JSON to stdin
//! - stdout is parsed as an `AgentOutcome` if possible
//! - otherwise the exit code decides: 0 succeeded, 3 skipped, anything else failed
//!
//! The command runs in its own process group. On cancellation the group gets
//! SIGTERM and a short grace period; if the invocation is dropped (timeout,
//! or cancellation after the grace period) the group is killed. A command
//! that finishes normally may leave background processes running, which is
//! how service-start agents keep services up.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{AgentContext, AgentOutcome, PhaseAgent};
use crate::errors::PhaseError;
use crate::retry::classify_message;

/// Exit code an agent uses to report that there was nothing to do.
pub const EXIT_SKIPPED: i32 = 3;

const TERM_GRACE: Duration = Duration::from_millis(500);

/// Kills a command's process group when dropped.
struct ProcessGroup {
    pgid: Option<i32>,
}

impl ProcessGroup {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid.and_then(|p| i32::try_from(p).ok()),
        }
    }

    /// Leave the group alone from now on.
    fn release(&mut self) {
        self.pgid = None;
    }

    #[cfg(unix)]
    fn signal(&self, sig: libc::c_int) {
        if let Some(pgid) = self.pgid {
            // SAFETY: kill(2) has no memory-safety preconditions. A negative
            // pid addresses the whole group; ESRCH once it is gone is fine.
            unsafe {
                libc::kill(-pgid, sig);
            }
        }
    }

    async fn terminate(&mut self) {
        #[cfg(unix)]
        {
            self.signal(libc::SIGTERM);
            tokio::time::sleep(TERM_GRACE).await;
            self.signal(libc::SIGKILL);
        }
        self.release();
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        #[cfg(unix)]
        self.signal(libc::SIGKILL);
    }
}

#[derive(Debug, Clone)]
pub struct CommandAgent {
    command: String,
}

impl CommandAgent {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

#[async_trait]
impl PhaseAgent for CommandAgent {
    fn name(&self) -> &str {
        &self.command
    }

    async fn invoke(
        &self,
        ctx: &AgentContext,
        cancel: CancellationToken,
    ) -> Result<AgentOutcome, PhaseError> {
        let context_json = serde_json::to_string(ctx)
            .map_err(|e| PhaseError::permanent(format!("Failed to serialize agent context: {}", e)))?;

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&self.command)
            .current_dir(&ctx.repo_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("REPO_RUNNER_RUN_ID", &ctx.run_id)
            .env("REPO_RUNNER_PHASE", ctx.phase.as_str())
            .env("REPO_RUNNER_REPO", &ctx.repo_path)
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| PhaseError::from_io(&format!("Failed to spawn '{}'", self.command), &e))?;
        let mut group = ProcessGroup::new(child.id());

        if let Some(mut stdin) = child.stdin.take() {
            // A command that ignores stdin may close it early; that is not an error.
            if let Err(e) = stdin.write_all(context_json.as_bytes()).await
                && e.kind() != std::io::ErrorKind::BrokenPipe
            {
                return Err(PhaseError::from_io("Failed to write agent stdin", &e));
            }
        }

        let output = tokio::select! {
            _ = cancel.cancelled() => {
                group.terminate().await;
                return Err(PhaseError::Cancelled);
            }
            output = child.wait_with_output() => {
                group.release();
                output.map_err(|e| PhaseError::from_io("Failed to wait for agent", &e))?
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        tracing::debug!(phase = %ctx.phase, exit_code, "agent command finished");
        Ok(parse_outcome(
            exit_code,
            &String::from_utf8_lossy(&output.stdout),
            &String::from_utf8_lossy(&output.stderr),
        ))
    }
}

fn parse_outcome(exit_code: i32, stdout: &str, stderr: &str) -> AgentOutcome {
    let stdout = stdout.trim();
    let stderr = stderr.trim();

    if !stdout.is_empty()
        && let Ok(outcome) = serde_json::from_str::<AgentOutcome>(stdout)
    {
        return outcome;
    }

    match exit_code {
        0 => {
            let payload = if stdout.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::from_str(stdout)
                    .unwrap_or_else(|_| serde_json::json!({ "stdout": stdout }))
            };
            AgentOutcome::succeeded(payload)
        }
        EXIT_SKIPPED => {
            let reason = if !stderr.is_empty() {
                stderr
            } else if !stdout.is_empty() {
                stdout
            } else {
                "agent requested skip"
            };
            AgentOutcome::skipped(reason)
        }
        _ => {
            let message = if !stderr.is_empty() {
                format!("exit {}: {}", exit_code, stderr)
            } else if !stdout.is_empty() {
                format!("exit {}: {}", exit_code, stdout)
            } else {
                format!("agent failed with exit code {}", exit_code)
            };
            let kind = classify_message(&message);
            AgentOutcome::failed(message, Some(kind))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::OutcomeStatus;
    use crate::agents::testing::context;
    use crate::errors::ErrorKind;
    use crate::phase::Phase;
    use std::time::Duration;
    use tempfile::tempdir;

    fn ctx_in(dir: &std::path::Path, phase: Phase) -> AgentContext {
        let mut ctx = context(phase);
        ctx.repo_path = dir.to_path_buf();
        ctx
    }

    #[test]
    fn test_parse_json_outcome() {
        let outcome = parse_outcome(
            0,
            r#"{"status":"skipped","reason":"no database detected"}"#,
            "",
        );
        assert_eq!(outcome.status, OutcomeStatus::Skipped);
        assert_eq!(outcome.reason.as_deref(), Some("no database detected"));
    }

    #[test]
    fn test_parse_plain_json_payload() {
        let outcome = parse_outcome(0, r#"{"language":"python"}"#, "");
        assert_eq!(outcome.status, OutcomeStatus::Succeeded);
        assert_eq!(outcome.payload["language"], "python");
    }

    #[test]
    fn test_parse_text_stdout() {
        let outcome = parse_outcome(0, "installed 12 packages", "");
        assert_eq!(outcome.payload["stdout"], "installed 12 packages");
    }

    #[test]
    fn test_exit_three_is_skip() {
        let outcome = parse_outcome(3, "", "nothing to index");
        assert_eq!(outcome.status, OutcomeStatus::Skipped);
        assert_eq!(outcome.reason.as_deref(), Some("nothing to index"));
    }

    #[test]
    fn test_nonzero_exit_is_classified() {
        let outcome = parse_outcome(1, "", "Error: address already in use");
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert_eq!(outcome.error_kind, Some(ErrorKind::Transient));

        let outcome = parse_outcome(2, "", "package.json missing");
        assert_eq!(outcome.error_kind, Some(ErrorKind::Permanent));
        assert!(outcome.error.unwrap().contains("exit 2"));
    }

    #[tokio::test]
    async fn test_command_receives_context_on_stdin() {
        let dir = tempdir().unwrap();
        let agent = CommandAgent::new("cat");
        let outcome = agent
            .invoke(&ctx_in(dir.path(), Phase::EnvironmentDetect), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Succeeded);
        assert_eq!(outcome.payload["phase"], "environment-detect");
        assert_eq!(outcome.payload["run_id"], "test-run");
    }

    #[tokio::test]
    async fn test_command_runs_in_repo_and_sees_env() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let agent = CommandAgent::new(
            r#"test -f marker.txt && printf '{"status":"succeeded","payload":{"phase":"%s"}}' "$REPO_RUNNER_PHASE""#,
        );
        let outcome = agent
            .invoke(&ctx_in(dir.path(), Phase::HealthCheck), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.payload["phase"], "health-check");
    }

    #[tokio::test]
    async fn test_failing_command_reports_stderr() {
        let dir = tempdir().unwrap();
        let agent = CommandAgent::new("echo 'migration failed' >&2; exit 1");
        let outcome = agent
            .invoke(&ctx_in(dir.path(), Phase::DatabaseSetup), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert!(outcome.error.unwrap().contains("migration failed"));
    }

    #[tokio::test]
    async fn test_cancel_kills_command() {
        let dir = tempdir().unwrap();
        let agent = CommandAgent::new("sleep 30");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let started = std::time::Instant::now();
        let err = agent
            .invoke(&ctx_in(dir.path(), Phase::ServiceStart), cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    /// Running and not a zombie, per /proc.
    #[cfg(target_os = "linux")]
    fn process_running(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.trim_start().chars().next())
                .is_some_and(|state| state != 'Z'),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    async fn wait_for_pid_file(path: &std::path::Path) -> u32 {
        for _ in 0..500 {
            if let Ok(content) = std::fs::read_to_string(path)
                && let Ok(pid) = content.trim().parse()
            {
                return pid;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("command never wrote {}", path.display());
    }

    #[cfg(target_os = "linux")]
    async fn gone_within(pid: u32, limit: Duration) -> bool {
        let deadline = std::time::Instant::now() + limit;
        while std::time::Instant::now() < deadline {
            if !process_running(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        !process_running(pid)
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_cancel_terminates_background_children() {
        let dir = tempdir().unwrap();
        let agent = CommandAgent::new("sleep 300 & echo $! > child.pid; wait");
        let ctx = ctx_in(dir.path(), Phase::ServiceStart);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let pid_file = dir.path().join("child.pid");

        let (result, child) = tokio::join!(agent.invoke(&ctx, cancel), async {
            let pid = wait_for_pid_file(&pid_file).await;
            trigger.cancel();
            pid
        });

        assert!(result.unwrap_err().is_cancelled());
        assert!(gone_within(child, Duration::from_secs(5)).await);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timeout_kills_background_children() {
        let dir = tempdir().unwrap();
        let agent = CommandAgent::new("sleep 300 & echo $! > child.pid; wait");
        let ctx = ctx_in(dir.path(), Phase::DependencySetup);
        let pid_file = dir.path().join("child.pid");

        let timed_out =
            tokio::time::timeout(Duration::from_millis(300), agent.invoke(&ctx, CancellationToken::new()))
                .await;
        assert!(timed_out.is_err());

        let child = wait_for_pid_file(&pid_file).await;
        assert!(gone_within(child, Duration::from_secs(5)).await);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_finished_command_leaves_background_service_running() {
        let dir = tempdir().unwrap();
        let agent = CommandAgent::new("sleep 300 >/dev/null 2>&1 & echo $! > child.pid");
        let outcome = agent
            .invoke(&ctx_in(dir.path(), Phase::ServiceStart), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Succeeded);

        let child = wait_for_pid_file(&dir.path().join("child.pid")).await;
        assert!(process_running(child));
        // SAFETY: test cleanup of the process we just started.
        unsafe {
            libc::kill(child as i32, libc::SIGKILL);
        }
    }

    #[tokio::test]
    async fn test_missing_repo_dir_is_spawn_error() {
        let dir = tempdir().unwrap();
        let agent = CommandAgent::new("true");
        let err = agent
            .invoke(
                &ctx_in(&dir.path().join("absent"), Phase::DependencySetup),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permanent);
    }
}
