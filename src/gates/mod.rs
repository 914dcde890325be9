//! Tier gating: capability lookup, hourly rate limits and concurrent-run slots.
//!
//! Every caller is identified by a `Caller` (identity + tier). The gate keeps
//! per-identity counters in `DashMap`s so parallel runs for the same user
//! update them under the shard lock and never lose increments. These
//! counters cover one process; registered accounts carry their hourly count
//! in the user registry, and runs held by other processes are passed in by
//! the engine.
//!
//! Rate limiting uses fixed wall-clock hour buckets: a request made at
//! 10:59:59 and one made at 11:00:00 land in different buckets, and the
//! count resets at every hour boundary.

pub mod users;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::errors::GateError;

pub use users::{UserAccount, UserRegistry};

/// Subscription tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Free,
    Advanced,
    Premium,
    Tester,
    Admin,
    Developer,
}

impl Tier {
    pub const ALL: [Tier; 6] = [
        Tier::Free,
        Tier::Advanced,
        Tier::Premium,
        Tier::Tester,
        Tier::Admin,
        Tier::Developer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Advanced => "advanced",
            Tier::Premium => "premium",
            Tier::Tester => "tester",
            Tier::Admin => "admin",
            Tier::Developer => "developer",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "advanced" => Ok(Tier::Advanced),
            "premium" => Ok(Tier::Premium),
            "tester" => Ok(Tier::Tester),
            "admin" => Ok(Tier::Admin),
            "developer" => Ok(Tier::Developer),
            _ => anyhow::bail!(
                "Invalid tier '{}'. Valid values: free, advanced, premium, tester, admin, developer",
                s
            ),
        }
    }
}

/// A gated capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    SimpleSearch,
    VectorSearch,
    AdvancedVectorSearch,
    GpuAccess,
    UserManagement,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Capability::SimpleSearch => "simple-search",
            Capability::VectorSearch => "vector-search",
            Capability::AdvancedVectorSearch => "advanced-vector-search",
            Capability::GpuAccess => "gpu-access",
            Capability::UserManagement => "user-management",
        };
        f.write_str(s)
    }
}

/// Limits and capabilities granted to a tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierProfile {
    pub tier: Tier,
    pub rate_limit_per_hour: u32,
    pub max_repos: u32,
    pub max_concurrent_runs: u32,
    pub capabilities: BTreeSet<Capability>,
}

impl TierProfile {
    /// Built-in profile for a tier.
    pub fn default_for(tier: Tier) -> Self {
        use Capability::*;
        let (rate, repos, concurrent, caps): (u32, u32, u32, &[Capability]) = match tier {
            Tier::Free => (10, 3, 1, &[SimpleSearch]),
            Tier::Advanced => (50, 10, 3, &[SimpleSearch, VectorSearch, GpuAccess]),
            Tier::Premium => (
                200,
                100,
                10,
                &[SimpleSearch, VectorSearch, AdvancedVectorSearch, GpuAccess],
            ),
            Tier::Tester => (100, 50, 5, &[SimpleSearch, VectorSearch, GpuAccess]),
            Tier::Admin => (
                1000,
                1000,
                50,
                &[
                    SimpleSearch,
                    VectorSearch,
                    AdvancedVectorSearch,
                    GpuAccess,
                    UserManagement,
                ],
            ),
            Tier::Developer => (
                10000,
                10000,
                100,
                &[
                    SimpleSearch,
                    VectorSearch,
                    AdvancedVectorSearch,
                    GpuAccess,
                    UserManagement,
                ],
            ),
        };
        Self {
            tier,
            rate_limit_per_hour: rate,
            max_repos: repos,
            max_concurrent_runs: concurrent,
            capabilities: caps.iter().copied().collect(),
        }
    }
}

/// Identity and tier of whoever started a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub id: String,
    pub tier: Tier,
}

impl Caller {
    pub fn new(id: impl Into<String>, tier: Tier) -> Self {
        Self {
            id: id.into(),
            tier,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    bucket: i64,
    count: u32,
}

/// Wall-clock hour bucket used as the rate-limit window key.
pub fn hour_bucket(now: DateTime<Utc>) -> i64 {
    now.timestamp().div_euclid(3600)
}

/// Capability and throughput gate shared by all runs in the process.
#[derive(Debug)]
pub struct TierGate {
    profiles: HashMap<Tier, TierProfile>,
    windows: DashMap<String, RateWindow>,
    active_runs: Arc<DashMap<String, u32>>,
}

impl Default for TierGate {
    fn default() -> Self {
        Self::new()
    }
}

impl TierGate {
    /// Gate with the built-in tier profiles.
    pub fn new() -> Self {
        Self::with_profiles(Vec::new())
    }

    /// Gate with the built-in profiles, replaced by any given overrides.
    pub fn with_profiles(overrides: Vec<TierProfile>) -> Self {
        let mut profiles: HashMap<Tier, TierProfile> = Tier::ALL
            .iter()
            .map(|t| (*t, TierProfile::default_for(*t)))
            .collect();
        for profile in overrides {
            profiles.insert(profile.tier, profile);
        }
        Self {
            profiles,
            windows: DashMap::new(),
            active_runs: Arc::new(DashMap::new()),
        }
    }

    pub fn profile(&self, tier: Tier) -> TierProfile {
        self.profiles
            .get(&tier)
            .cloned()
            .unwrap_or_else(|| TierProfile::default_for(tier))
    }

    /// Static capability lookup.
    pub fn allows(&self, tier: Tier, capability: Capability) -> bool {
        self.profiles
            .get(&tier)
            .is_some_and(|p| p.capabilities.contains(&capability))
    }

    pub fn check_rate_limit(&self, caller: &Caller) -> Result<(), GateError> {
        self.check_rate_limit_at(caller, Utc::now())
    }

    /// Fails with `RateLimitExceeded` once the caller has used up the
    /// current hour's allowance.
    pub fn check_rate_limit_at(&self, caller: &Caller, now: DateTime<Utc>) -> Result<(), GateError> {
        let limit = self.profile(caller.tier).rate_limit_per_hour;
        let count = self.requests_in_window(&caller.id, now);
        if count >= limit {
            return Err(GateError::RateLimitExceeded {
                user: caller.id.clone(),
                count,
                limit,
            });
        }
        Ok(())
    }

    pub fn record_request(&self, caller: &Caller) -> u32 {
        self.record_request_at(caller, Utc::now())
    }

    /// Increment the caller's counter for the hour containing `now`.
    /// Returns the count after the increment.
    pub fn record_request_at(&self, caller: &Caller, now: DateTime<Utc>) -> u32 {
        let bucket = hour_bucket(now);
        let mut window = self
            .windows
            .entry(caller.id.clone())
            .or_insert(RateWindow { bucket, count: 0 });
        if window.bucket != bucket {
            window.bucket = bucket;
            window.count = 0;
        }
        window.count += 1;
        window.count
    }

    pub fn try_acquire(&self, caller: &Caller) -> Result<u32, GateError> {
        self.try_acquire_at(caller, Utc::now())
    }

    /// Check and record in one step, under the entry lock.
    pub fn try_acquire_at(&self, caller: &Caller, now: DateTime<Utc>) -> Result<u32, GateError> {
        let limit = self.profile(caller.tier).rate_limit_per_hour;
        let bucket = hour_bucket(now);
        let mut window = self
            .windows
            .entry(caller.id.clone())
            .or_insert(RateWindow { bucket, count: 0 });
        if window.bucket != bucket {
            window.bucket = bucket;
            window.count = 0;
        }
        if window.count >= limit {
            return Err(GateError::RateLimitExceeded {
                user: caller.id.clone(),
                count: window.count,
                limit,
            });
        }
        window.count += 1;
        Ok(window.count)
    }

    /// Requests recorded for `user` in the hour containing `now`.
    pub fn requests_in_window(&self, user: &str, now: DateTime<Utc>) -> u32 {
        let bucket = hour_bucket(now);
        self.windows
            .get(user)
            .filter(|w| w.bucket == bucket)
            .map(|w| w.count)
            .unwrap_or(0)
    }

    /// Take a concurrent-run slot for the caller. The slot is returned when
    /// the guard is dropped.
    pub fn begin_run(&self, caller: &Caller) -> Result<RunSlot, GateError> {
        self.begin_run_alongside(caller, 0)
    }

    /// Like `begin_run`, with `elsewhere` runs for the caller already active
    /// in other processes counting toward the limit.
    pub fn begin_run_alongside(&self, caller: &Caller, elsewhere: u32) -> Result<RunSlot, GateError> {
        let limit = self.profile(caller.tier).max_concurrent_runs;
        let mut active = self.active_runs.entry(caller.id.clone()).or_insert(0);
        if *active + elsewhere >= limit {
            return Err(GateError::ConcurrencyLimit {
                user: caller.id.clone(),
                limit,
            });
        }
        *active += 1;
        Ok(RunSlot {
            user: caller.id.clone(),
            active_runs: Arc::clone(&self.active_runs),
        })
    }

    pub fn active_runs(&self, user: &str) -> u32 {
        self.active_runs.get(user).map(|c| *c).unwrap_or(0)
    }
}

/// Guard for a concurrent-run slot.
#[derive(Debug)]
pub struct RunSlot {
    user: String,
    active_runs: Arc<DashMap<String, u32>>,
}

impl Drop for RunSlot {
    fn drop(&mut self) {
        if let Some(mut count) = self.active_runs.get_mut(&self.user) {
            *count = count.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, h, m, s).unwrap()
    }

    #[test]
    fn test_free_tier_only_has_simple_search() {
        let gate = TierGate::new();
        assert!(gate.allows(Tier::Free, Capability::SimpleSearch));
        assert!(!gate.allows(Tier::Free, Capability::VectorSearch));
        assert!(!gate.allows(Tier::Free, Capability::GpuAccess));
    }

    #[test]
    fn test_user_management_reserved_for_admin_and_developer() {
        let gate = TierGate::new();
        for tier in Tier::ALL {
            let expected = matches!(tier, Tier::Admin | Tier::Developer);
            assert_eq!(gate.allows(tier, Capability::UserManagement), expected, "{tier}");
        }
    }

    #[test]
    fn test_free_tier_rate_limit_resets_on_hour_boundary() {
        let gate = TierGate::new();
        let caller = Caller::new("alice", Tier::Free);

        for _ in 0..10 {
            gate.check_rate_limit_at(&caller, at(10, 15, 0)).unwrap();
            gate.record_request_at(&caller, at(10, 15, 0));
        }
        let err = gate.check_rate_limit_at(&caller, at(10, 59, 59)).unwrap_err();
        assert!(matches!(
            err,
            GateError::RateLimitExceeded {
                count: 10,
                limit: 10,
                ..
            }
        ));

        gate.check_rate_limit_at(&caller, at(11, 0, 0)).unwrap();
        assert_eq!(gate.record_request_at(&caller, at(11, 0, 0)), 1);
    }

    #[test]
    fn test_try_acquire_denies_without_incrementing() {
        let gate = TierGate::new();
        let caller = Caller::new("bob", Tier::Free);
        for i in 1..=10 {
            assert_eq!(gate.try_acquire_at(&caller, at(9, 0, 0)).unwrap(), i);
        }
        assert!(gate.try_acquire_at(&caller, at(9, 30, 0)).is_err());
        assert_eq!(gate.requests_in_window("bob", at(9, 30, 0)), 10);
    }

    #[test]
    fn test_users_have_independent_windows() {
        let gate = TierGate::new();
        let a = Caller::new("a", Tier::Free);
        let b = Caller::new("b", Tier::Free);
        for _ in 0..10 {
            gate.record_request_at(&a, at(8, 0, 0));
        }
        assert!(gate.check_rate_limit_at(&a, at(8, 1, 0)).is_err());
        assert!(gate.check_rate_limit_at(&b, at(8, 1, 0)).is_ok());
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let gate = Arc::new(TierGate::new());
        let caller = Caller::new("carol", Tier::Developer);
        let now = at(12, 0, 0);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let caller = caller.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        gate.record_request_at(&caller, now);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(gate.requests_in_window("carol", now), 2000);
    }

    #[test]
    fn test_run_slot_released_on_drop() {
        let gate = TierGate::new();
        let caller = Caller::new("dave", Tier::Free);
        let slot = gate.begin_run(&caller).unwrap();
        assert_eq!(gate.active_runs("dave"), 1);
        assert!(matches!(
            gate.begin_run(&caller),
            Err(GateError::ConcurrencyLimit { limit: 1, .. })
        ));
        drop(slot);
        assert_eq!(gate.active_runs("dave"), 0);
        assert!(gate.begin_run(&caller).is_ok());
    }

    #[test]
    fn test_runs_in_other_processes_count_toward_limit() {
        let gate = TierGate::new();
        let caller = Caller::new("fay", Tier::Advanced);
        let _one = gate.begin_run_alongside(&caller, 1).unwrap();
        assert!(matches!(
            gate.begin_run_alongside(&caller, 2),
            Err(GateError::ConcurrencyLimit { limit: 3, .. })
        ));
        assert_eq!(gate.active_runs("fay"), 1);
    }

    #[test]
    fn test_profile_overrides_replace_defaults() {
        let mut free = TierProfile::default_for(Tier::Free);
        free.rate_limit_per_hour = 2;
        free.capabilities.insert(Capability::VectorSearch);
        let gate = TierGate::with_profiles(vec![free]);

        assert!(gate.allows(Tier::Free, Capability::VectorSearch));
        let caller = Caller::new("erin", Tier::Free);
        gate.try_acquire_at(&caller, at(1, 0, 0)).unwrap();
        gate.try_acquire_at(&caller, at(1, 0, 0)).unwrap();
        assert!(gate.try_acquire_at(&caller, at(1, 0, 0)).is_err());
    }

    #[test]
    fn test_tier_parse() {
        assert_eq!("Premium".parse::<Tier>().unwrap(), Tier::Premium);
        assert!("gold".parse::<Tier>().is_err());
    }
}
