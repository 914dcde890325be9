//! Port allocation for the service-start phase.
//!
//! One `PortAllocator` lives for the duration of a run. It hands out ports
//! that are distinct within the run and free on the host, optionally
//! reclaiming a requested port from a stale process first.

pub mod probe;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::PortError;

pub use probe::{PortProbe, Signal, SystemPortProbe};

const ALIVE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// `[ports]` section of `runner.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortsConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_range_start")]
    pub range_start: u16,
    #[serde(default = "default_range_size")]
    pub range_size: u16,
    /// Terminate processes squatting on a requested port
    #[serde(default)]
    pub reclaim: bool,
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// Preferred port per service name
    #[serde(default)]
    pub services: BTreeMap<String, u16>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_range_start() -> u16 {
    8000
}

fn default_range_size() -> u16 {
    100
}

fn default_grace_period_ms() -> u64 {
    2000
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            range_start: default_range_start(),
            range_size: default_range_size(),
            reclaim: false,
            grace_period_ms: default_grace_period_ms(),
            services: BTreeMap::new(),
        }
    }
}

/// Outcome of probing a port for a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PortState {
    Free,
    InUse,
    Reclaimed,
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAllocation {
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_port: Option<u16>,
    /// Absent only when the range was exhausted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub state: PortState,
    /// Pid that was terminated to free the port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reclaimed_pid: Option<u32>,
}

impl PortAllocation {
    pub fn exhausted(service: &str, preferred_port: Option<u16>) -> Self {
        Self {
            service: service.to_string(),
            preferred_port,
            port: None,
            state: PortState::Exhausted,
            reclaimed_pid: None,
        }
    }
}

/// Per-run port allocator.
pub struct PortAllocator {
    probe: Arc<dyn PortProbe>,
    reclaim: bool,
    grace_period: Duration,
    own_pid: u32,
    assigned: BTreeMap<String, PortAllocation>,
}

impl std::fmt::Debug for PortAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortAllocator")
            .field("reclaim", &self.reclaim)
            .field("grace_period", &self.grace_period)
            .field("assigned", &self.assigned)
            .finish()
    }
}

impl PortAllocator {
    pub fn new(probe: Arc<dyn PortProbe>, reclaim: bool, grace_period: Duration) -> Self {
        Self {
            probe,
            reclaim,
            grace_period,
            own_pid: std::process::id(),
            assigned: BTreeMap::new(),
        }
    }

    pub fn from_config(config: &PortsConfig, probe: Arc<dyn PortProbe>) -> Self {
        Self::new(
            probe,
            config.reclaim,
            Duration::from_millis(config.grace_period_ms),
        )
    }

    fn is_assigned(&self, port: u16) -> bool {
        self.assigned.values().any(|a| a.port == Some(port))
    }

    /// Assign a port to `service`.
    ///
    /// Candidates are tried starting at `preferred` (wrapping within
    /// `range_start..range_start + range_size`). A preferred port outside the
    /// range is tried first on its own. Only the preferred port is ever
    /// reclaimed from another process.
    pub async fn allocate(
        &mut self,
        service: &str,
        preferred: Option<u16>,
        range_start: u16,
        range_size: u16,
    ) -> Result<u16, PortError> {
        let end = range_start as u32 + range_size as u32;
        if range_size == 0 || end > u16::MAX as u32 + 1 {
            return Err(PortError::InvalidRange {
                start: range_start,
                size: range_size,
            });
        }

        if let Some(existing) = self.assigned.get(service).and_then(|a| a.port) {
            return Ok(existing);
        }

        let in_range = |p: u16| (p as u32) >= range_start as u32 && (p as u32) < end;
        let offset = preferred
            .filter(|p| in_range(*p))
            .map(|p| p - range_start)
            .unwrap_or(0);

        let mut candidates: Vec<u16> = Vec::with_capacity(range_size as usize + 1);
        if let Some(p) = preferred.filter(|p| !in_range(*p)) {
            candidates.push(p);
        }
        candidates.extend(
            (0..range_size as u32)
                .map(|i| (range_start as u32 + (offset as u32 + i) % range_size as u32) as u16),
        );

        for port in candidates {
            if self.is_assigned(port) {
                continue;
            }
            let (state, reclaimed_pid) = if self.probe.is_free(port) {
                (PortState::Free, None)
            } else if self.reclaim && Some(port) == preferred {
                match self.reclaim_port(port).await {
                    Some(pid) => (PortState::Reclaimed, Some(pid)),
                    None => continue,
                }
            } else {
                tracing::debug!(service, port, "port in use");
                continue;
            };

            tracing::info!(service, port, state = ?state, "port assigned");
            self.assigned.insert(
                service.to_string(),
                PortAllocation {
                    service: service.to_string(),
                    preferred_port: preferred,
                    port: Some(port),
                    state,
                    reclaimed_pid,
                },
            );
            return Ok(port);
        }

        tracing::warn!(service, range_start, range_size, "no free port in range");
        Err(PortError::PortExhausted {
            service: service.to_string(),
            start: range_start,
            end,
        })
    }

    /// Terminate the owner of `port`: SIGTERM, wait out the grace period,
    /// SIGKILL if still alive. Returns the pid if the port ends up free.
    async fn reclaim_port(&self, port: u16) -> Option<u32> {
        let pid = self.probe.owner(port)?;
        if pid == self.own_pid {
            tracing::debug!(port, pid, "port held by this process; not reclaiming");
            return None;
        }

        tracing::warn!(port, pid, "reclaiming port from stale process");
        if let Err(e) = self.probe.signal(pid, Signal::Term) {
            tracing::warn!(port, pid, error = %e, "SIGTERM failed");
            return None;
        }

        let deadline = tokio::time::Instant::now() + self.grace_period;
        while self.probe.is_alive(pid) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(ALIVE_POLL_INTERVAL.min(self.grace_period)).await;
        }
        if self.probe.is_alive(pid) {
            if let Err(e) = self.probe.signal(pid, Signal::Kill) {
                tracing::warn!(port, pid, error = %e, "SIGKILL failed");
                return None;
            }
            tokio::time::sleep(ALIVE_POLL_INTERVAL.min(self.grace_period)).await;
        }

        self.probe.is_free(port).then_some(pid)
    }

    /// Release the port held by `service`.
    pub fn release(&mut self, service: &str) -> Option<u16> {
        self.assigned.remove(service).and_then(|a| a.port)
    }

    pub fn release_all(&mut self) {
        if !self.assigned.is_empty() {
            tracing::debug!(count = self.assigned.len(), "releasing ports");
        }
        self.assigned.clear();
    }

    pub fn port_for(&self, service: &str) -> Option<u16> {
        self.assigned.get(service).and_then(|a| a.port)
    }

    pub fn allocation(&self, service: &str) -> Option<PortAllocation> {
        self.assigned.get(service).cloned()
    }

    pub fn allocations(&self) -> Vec<PortAllocation> {
        self.assigned.values().cloned().collect()
    }
}

impl Drop for PortAllocator {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::probe::fake::FakeProbe;
    use super::*;

    fn allocator(probe: FakeProbe, reclaim: bool) -> (PortAllocator, Arc<FakeProbe>) {
        let probe = Arc::new(probe);
        let alloc = PortAllocator::new(probe.clone(), reclaim, Duration::from_millis(50));
        (alloc, probe)
    }

    #[tokio::test]
    async fn test_two_services_requesting_same_port() {
        let (mut alloc, _) = allocator(FakeProbe::default(), false);
        let api = alloc.allocate("api", Some(8000), 8000, 100).await.unwrap();
        let web = alloc.allocate("web", Some(8000), 8000, 100).await.unwrap();
        assert_eq!(api, 8000);
        assert_eq!(web, 8001);
    }

    #[tokio::test]
    async fn test_busy_port_is_skipped() {
        let (mut alloc, _) = allocator(FakeProbe::with_busy(&[(8000, 999)]), false);
        let port = alloc.allocate("api", Some(8000), 8000, 10).await.unwrap();
        assert_eq!(port, 8001);
    }

    #[tokio::test]
    async fn test_scan_wraps_within_range() {
        let busy = [(8008, 1), (8009, 1)];
        let (mut alloc, _) = allocator(FakeProbe::with_busy(&busy), false);
        let port = alloc.allocate("api", Some(8008), 8000, 10).await.unwrap();
        assert_eq!(port, 8000);
    }

    #[tokio::test]
    async fn test_exhausted_range() {
        let busy: Vec<(u16, u32)> = (9000..9003).map(|p| (p, 7)).collect();
        let (mut alloc, _) = allocator(FakeProbe::with_busy(&busy), false);
        let err = alloc.allocate("api", None, 9000, 3).await.unwrap_err();
        assert!(matches!(err, PortError::PortExhausted { end: 9003, .. }));
    }

    #[tokio::test]
    async fn test_assigned_ports_are_distinct() {
        let (mut alloc, _) = allocator(FakeProbe::default(), false);
        let mut seen = std::collections::HashSet::new();
        for i in 0..5 {
            let port = alloc
                .allocate(&format!("svc{i}"), Some(7000), 7000, 5)
                .await
                .unwrap();
            assert!(seen.insert(port));
        }
        assert!(alloc.allocate("svc5", Some(7000), 7000, 5).await.is_err());
    }

    #[tokio::test]
    async fn test_same_service_keeps_its_port() {
        let (mut alloc, _) = allocator(FakeProbe::default(), false);
        let first = alloc.allocate("api", Some(8000), 8000, 10).await.unwrap();
        let again = alloc.allocate("api", Some(8000), 8000, 10).await.unwrap();
        assert_eq!(first, again);
    }

    #[tokio::test]
    async fn test_release_makes_port_available() {
        let (mut alloc, _) = allocator(FakeProbe::default(), false);
        alloc.allocate("api", Some(8000), 8000, 10).await.unwrap();
        assert_eq!(alloc.release("api"), Some(8000));
        let port = alloc.allocate("web", Some(8000), 8000, 10).await.unwrap();
        assert_eq!(port, 8000);
        alloc.release_all();
        assert!(alloc.allocations().is_empty());
    }

    #[tokio::test]
    async fn test_reclaim_terminates_stale_owner() {
        let (mut alloc, probe) = allocator(FakeProbe::with_busy(&[(8000, 4242)]), true);
        let port = alloc.allocate("api", Some(8000), 8000, 10).await.unwrap();
        assert_eq!(port, 8000);
        let allocation = &alloc.allocations()[0];
        assert_eq!(allocation.state, PortState::Reclaimed);
        assert_eq!(allocation.reclaimed_pid, Some(4242));
        assert_eq!(*probe.signals.lock().unwrap(), vec![(4242, Signal::Term)]);
    }

    #[tokio::test]
    async fn test_reclaim_escalates_to_sigkill() {
        let probe = FakeProbe::with_busy(&[(8000, 5151)]);
        probe.stubborn.lock().unwrap().insert(5151);
        let (mut alloc, probe) = allocator(probe, true);
        let port = alloc.allocate("api", Some(8000), 8000, 10).await.unwrap();
        assert_eq!(port, 8000);
        assert_eq!(
            *probe.signals.lock().unwrap(),
            vec![(5151, Signal::Term), (5151, Signal::Kill)]
        );
    }

    #[tokio::test]
    async fn test_never_reclaims_from_own_process() {
        let own = std::process::id();
        let (mut alloc, probe) = allocator(FakeProbe::with_busy(&[(8000, own)]), true);
        let port = alloc.allocate("api", Some(8000), 8000, 10).await.unwrap();
        assert_eq!(port, 8001);
        assert!(probe.signals.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_range() {
        let (mut alloc, _) = allocator(FakeProbe::default(), false);
        assert!(matches!(
            alloc.allocate("api", None, 65535, 2).await,
            Err(PortError::InvalidRange { .. })
        ));
        assert!(matches!(
            alloc.allocate("api", None, 8000, 0).await,
            Err(PortError::InvalidRange { .. })
        ));
    }

    #[tokio::test]
    async fn test_preferred_port_outside_range_tried_first() {
        let (mut alloc, _) = allocator(FakeProbe::default(), false);
        let port = alloc.allocate("db", Some(5432), 8000, 10).await.unwrap();
        assert_eq!(port, 5432);
    }
}
