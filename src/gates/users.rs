//! File-backed user accounts.
//!
//! Accounts live in `<state_dir>/users.json`. Credentials are stored as a
//! salted SHA-256 digest; the file is rewritten atomically on every change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{Tier, hour_bucket};
use crate::checkpoint::write_atomic;
use crate::errors::GateError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: String,
    pub password_hash: String,
    pub salt: String,
    pub tier: Tier,
    /// Runs started in the hour of `last_request_at`
    #[serde(default)]
    pub requests_this_hour: u32,
    #[serde(default)]
    pub blocked: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_login: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_request_at: Option<DateTime<Utc>>,
}

impl UserAccount {
    /// Runs counted in the hour containing `now`.
    pub fn requests_at(&self, now: DateTime<Utc>) -> u32 {
        match self.last_request_at {
            Some(at) if hour_bucket(at) == hour_bucket(now) => self.requests_this_hour,
            _ => 0,
        }
    }
}

/// Accounts on disk. `None` if the file exists but cannot be used.
fn read_accounts(path: &Path) -> Option<BTreeMap<String, UserAccount>> {
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(users) => Some(users),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable user registry");
                None
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Some(BTreeMap::new()),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read user registry");
            None
        }
    }
}

fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Registry of accounts persisted as JSON.
#[derive(Debug)]
pub struct UserRegistry {
    path: PathBuf,
    users: Mutex<BTreeMap<String, UserAccount>>,
}

impl UserRegistry {
    /// Open the registry at `path`. A missing file yields an empty registry;
    /// an unreadable one is logged and treated as empty.
    pub fn open(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            users: Mutex::new(read_accounts(path).unwrap_or_default()),
        }
    }

    fn with_users<T>(
        &self,
        persist: bool,
        f: impl FnOnce(&mut BTreeMap<String, UserAccount>) -> Result<T, GateError>,
    ) -> Result<T, GateError> {
        let mut users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        // Another process may have rewritten the file since we opened it.
        if persist && let Some(on_disk) = read_accounts(&self.path) {
            *users = on_disk;
        }
        let value = f(&mut users)?;
        if persist {
            serde_json::to_vec_pretty(&*users)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
                .and_then(|bytes| write_atomic(&self.path, &bytes))
                .map_err(|source| GateError::Persist {
                    path: self.path.clone(),
                    source,
                })?;
        }
        Ok(value)
    }

    pub fn create(&self, id: &str, password: &str, tier: Tier) -> Result<UserAccount, GateError> {
        self.with_users(true, |users| {
            if users.contains_key(id) {
                return Err(GateError::UserExists { user: id.to_string() });
            }
            let salt = uuid::Uuid::new_v4().simple().to_string();
            let account = UserAccount {
                id: id.to_string(),
                password_hash: hash_password(&salt, password),
                salt,
                tier,
                requests_this_hour: 0,
                blocked: false,
                created_at: Utc::now(),
                last_login: None,
                last_request_at: None,
            };
            users.insert(id.to_string(), account.clone());
            tracing::info!(user = id, tier = %tier, "created user");
            Ok(account)
        })
    }

    /// Verify credentials and stamp the login time.
    pub fn authenticate(&self, id: &str, password: &str) -> Result<UserAccount, GateError> {
        self.with_users(true, |users| {
            let account = users.get_mut(id).ok_or_else(|| GateError::UnknownUser {
                user: id.to_string(),
            })?;
            if account.blocked {
                return Err(GateError::UserBlocked { user: id.to_string() });
            }
            if hash_password(&account.salt, password) != account.password_hash {
                return Err(GateError::InvalidCredentials { user: id.to_string() });
            }
            account.last_login = Some(Utc::now());
            Ok(account.clone())
        })
    }

    pub fn get(&self, id: &str) -> Option<UserAccount> {
        self.users
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn list(&self) -> Vec<UserAccount> {
        self.users
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn set_blocked(&self, id: &str, blocked: bool) -> Result<(), GateError> {
        self.with_users(true, |users| {
            let account = users.get_mut(id).ok_or_else(|| GateError::UnknownUser {
                user: id.to_string(),
            })?;
            account.blocked = blocked;
            Ok(())
        })
    }

    pub fn set_tier(&self, id: &str, tier: Tier) -> Result<(), GateError> {
        self.with_users(true, |users| {
            let account = users.get_mut(id).ok_or_else(|| GateError::UnknownUser {
                user: id.to_string(),
            })?;
            account.tier = tier;
            Ok(())
        })
    }

    pub fn try_acquire(&self, id: &str, limit: u32) -> Result<Option<u32>, GateError> {
        self.try_acquire_at(id, limit, Utc::now())
    }

    /// Count a run against the account's hourly allowance, persisting the
    /// new count. Uses the same wall-clock hour buckets as `TierGate`.
    /// Returns `None` when `id` has no account.
    pub fn try_acquire_at(
        &self,
        id: &str,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<u32>, GateError> {
        self.with_users(true, |users| {
            let Some(account) = users.get_mut(id) else {
                return Ok(None);
            };
            let count = account.requests_at(now);
            if count >= limit {
                return Err(GateError::RateLimitExceeded {
                    user: id.to_string(),
                    count,
                    limit,
                });
            }
            account.requests_this_hour = count + 1;
            account.last_request_at = Some(now);
            Ok(Some(count + 1))
        })
    }
}
