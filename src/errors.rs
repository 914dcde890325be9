//! Typed error hierarchy for the repo-runner engine.
//!
//! One enum per subsystem:
//! - `PhaseError`: failures raised while a phase agent runs
//! - `GateError`: tier, user and rate-limit denials
//! - `PortError`: port allocation failures
//! - `CheckpointError`: checkpoint persistence failures
//! - `EngineError`: run-level faults that are not phase-local

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Retry classification for a phase failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network failure, resource busy, port conflict, timeout.
    Transient,
    /// Missing mandatory input, invalid configuration, authentication failure.
    Permanent,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::Permanent => write!(f, "permanent"),
        }
    }
}

/// Errors from a single phase invocation.
#[derive(Debug, Clone, Error)]
pub enum PhaseError {
    #[error("{message}")]
    Transient { message: String },

    #[error("{message}")]
    Permanent { message: String },

    #[error("agent timed out after {secs}s")]
    TimedOut { secs: u64 },

    #[error("cancelled by stop request")]
    Cancelled,
}

impl PhaseError {
    pub fn transient(message: impl Into<String>) -> Self {
        PhaseError::Transient {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        PhaseError::Permanent {
            message: message.into(),
        }
    }

    /// Build an error of the given kind.
    pub fn of_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        match kind {
            ErrorKind::Transient => Self::transient(message),
            ErrorKind::Permanent => Self::permanent(message),
        }
    }

    /// Classify an I/O error raised while talking to a worker.
    pub fn from_io(context: &str, err: &std::io::Error) -> Self {
        let kind = crate::retry::classify_io(err);
        Self::of_kind(kind, format!("{}: {}", context, err))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PhaseError::Transient { .. } | PhaseError::TimedOut { .. } => ErrorKind::Transient,
            PhaseError::Permanent { .. } | PhaseError::Cancelled => ErrorKind::Permanent,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PhaseError::Cancelled)
    }
}

/// Errors from the tier gate and user registry.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("rate limit exceeded for {user}: {count}/{limit} requests this hour")]
    RateLimitExceeded {
        user: String,
        count: u32,
        limit: u32,
    },

    #[error("concurrent run limit reached for {user} ({limit} active)")]
    ConcurrencyLimit { user: String, limit: u32 },

    #[error("repository limit reached for {user} ({limit} repositories)")]
    RepoLimit { user: String, limit: u32 },

    #[error("user {user} is blocked")]
    UserBlocked { user: String },

    #[error("unknown user {user}")]
    UnknownUser { user: String },

    #[error("user {user} already exists")]
    UserExists { user: String },

    #[error("invalid credentials for {user}")]
    InvalidCredentials { user: String },

    #[error("tier {tier} lacks {capability}")]
    CapabilityDenied { tier: String, capability: String },

    #[error("Failed to persist user registry at {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the port allocator.
#[derive(Debug, Error)]
pub enum PortError {
    #[error("no free port for {service} in {start}..{end}")]
    PortExhausted { service: String, start: u16, end: u32 },

    #[error("invalid port range starting at {start} with size {size}")]
    InvalidRange { start: u16, size: u16 },
}

/// Errors from checkpoint persistence.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("invalid run id '{0}'")]
    InvalidRunId(String),

    #[error("checkpoint {run_id} is corrupt: {message}")]
    Corrupt { run_id: String, message: String },

    #[error("checkpoint I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize checkpoint {run_id}: {source}")]
    Serialize {
        run_id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Run-level faults. Expected error classes never surface here; they end up
/// in the final report instead.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("repository path {path} does not exist")]
    RepoNotFound { path: PathBuf },

    #[error("phase {running} is still running; cannot start {requested}")]
    PhaseAlreadyRunning { running: String, requested: String },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_error_kinds() {
        assert_eq!(PhaseError::transient("x").kind(), ErrorKind::Transient);
        assert_eq!(PhaseError::permanent("x").kind(), ErrorKind::Permanent);
        assert_eq!(PhaseError::TimedOut { secs: 5 }.kind(), ErrorKind::Transient);
        assert_eq!(PhaseError::Cancelled.kind(), ErrorKind::Permanent);
    }

    #[test]
    fn phase_error_from_io_addr_in_use_is_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "address already in use");
        let err = PhaseError::from_io("bind", &io);
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.to_string().contains("bind"));
    }

    #[test]
    fn phase_error_from_io_not_found_is_permanent() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        assert_eq!(PhaseError::from_io("spawn", &io).kind(), ErrorKind::Permanent);
    }

    #[test]
    fn rate_limit_error_carries_counts() {
        let err = GateError::RateLimitExceeded {
            user: "alice".into(),
            count: 10,
            limit: 10,
        };
        match &err {
            GateError::RateLimitExceeded { count, limit, .. } => {
                assert_eq!(*count, 10);
                assert_eq!(*limit, 10);
            }
            _ => panic!("Expected RateLimitExceeded"),
        }
        assert!(err.to_string().contains("alice"));
    }

    #[test]
    fn port_exhausted_names_service() {
        let err = PortError::PortExhausted {
            service: "api".into(),
            start: 8000,
            end: 8010,
        };
        assert!(err.to_string().contains("api"));
        assert!(err.to_string().contains("8000"));
    }

    #[test]
    fn engine_error_converts_from_checkpoint_error() {
        let inner = CheckpointError::InvalidRunId("../etc".into());
        let err: EngineError = inner.into();
        assert!(matches!(
            err,
            EngineError::Checkpoint(CheckpointError::InvalidRunId(_))
        ));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&PhaseError::Cancelled);
        assert_std_error(&GateError::UserBlocked { user: "x".into() });
        assert_std_error(&PortError::InvalidRange { start: 0, size: 0 });
        assert_std_error(&CheckpointError::InvalidRunId("x".into()));
    }
}
