//! Failure classification and the retry decision for phase failures.
//!
//! Transient failures are retried with exponential backoff until the attempt
//! budget is spent. Permanent failures are never retried. When no more
//! attempts are allowed, mandatory phases abort the run and optional phases
//! are skipped.

use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;

use crate::errors::ErrorKind;
use crate::phase::PhaseSpec;

/// Backoff settings, read from the `[retry]` section of `runner.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per phase, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

/// What the engine does after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait, then invoke the phase again from scratch
    Retry(Duration),
    /// Record the failure and continue with the next phase
    Skip,
    /// Stop the run
    Abort,
}

#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Backoff before the retry that follows attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_ms = self.config.base_delay_ms as f64 * self.config.multiplier.powi(exponent);
        let capped = delay_ms.min(self.config.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Decide what to do after `attempt_count` failed attempts of `spec.phase`.
    pub fn decide(&self, spec: &PhaseSpec, attempt_count: u32, kind: ErrorKind) -> RetryDecision {
        let give_up = if spec.mandatory {
            RetryDecision::Abort
        } else {
            RetryDecision::Skip
        };
        match kind {
            ErrorKind::Permanent => give_up,
            ErrorKind::Transient if attempt_count >= self.config.max_attempts => give_up,
            ErrorKind::Transient => RetryDecision::Retry(self.delay_for_attempt(attempt_count)),
        }
    }
}

/// Classify an I/O error by kind.
pub fn classify_io(err: &io::Error) -> ErrorKind {
    use io::ErrorKind as K;
    match err.kind() {
        K::AddrInUse
        | K::AddrNotAvailable
        | K::ConnectionRefused
        | K::ConnectionReset
        | K::ConnectionAborted
        | K::NotConnected
        | K::BrokenPipe
        | K::TimedOut
        | K::Interrupted
        | K::WouldBlock
        | K::ResourceBusy
        | K::NetworkUnreachable
        | K::HostUnreachable
        | K::NetworkDown => ErrorKind::Transient,
        _ => classify_message(&err.to_string()),
    }
}

const TRANSIENT_MARKERS: &[&str] = &[
    "address already in use",
    "port already in use",
    "port is already allocated",
    "timed out",
    "timeout",
    "connection refused",
    "connection reset",
    "resource busy",
    "resource temporarily unavailable",
    "temporarily unavailable",
    "try again",
    "network is unreachable",
    "too many requests",
    "service unavailable",
    "could not resolve host",
    "lock file",
];

/// Classify a free-text error reported by an external agent.
pub fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        ErrorKind::Transient
    } else {
        ErrorKind::Permanent
    }
}
