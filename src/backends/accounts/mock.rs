use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{
    chage_never_expire_command, groupadd_command, useradd_command, userdel_command, usermod_command,
    AccountStore, ShadowRecord, StoreError, UserChanges, UserRecord, NO_LIMIT,
};
use crate::core::envelope::redact_command_args;

/// Default maximum password age given to freshly created mock accounts,
/// mirroring `PASS_MAX_DAYS` of a stock login.defs.
pub const DEFAULT_MAX_AGE: i64 = 99999;

/// Operations that can be made to fail on purpose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    CreateUser,
    ModifyUser,
    DeleteUser,
    CreateGroup,
    ClearExpiration,
}

#[derive(Debug, Default)]
struct MockState {
    users: BTreeMap<String, UserRecord>,
    shadows: BTreeMap<String, ShadowRecord>,
    groups: BTreeMap<u32, String>,
    failing_ops: HashSet<MockOp>,
    failing_lookups: BTreeSet<String>,
    failing_group_lookups: BTreeSet<u32>,
    // shadow lookups still allowed per user before they start failing
    shadow_lookup_budget: BTreeMap<String, usize>,
    calls: Vec<String>,
}

/// In-memory account store for tests and `backend=mock` runs.
///
/// Clones share state, so a test can hand one clone to the reconciler and
/// inspect the other afterwards.
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, MockState>> {
        self.state.lock().map_err(|_| anyhow!("mock backend state poisoned"))
    }

    // builders are only ever called on a fresh, unshared backend
    fn seed(self, f: impl FnOnce(&mut MockState)) -> Self {
        if let Ok(mut state) = self.state.lock() {
            f(&mut state);
        }
        self
    }

    pub fn with_user(self, username: &str, uid: u32, gid: u32, home: Option<&str>) -> Self {
        let record = UserRecord {
            username: username.to_string(),
            uid,
            gid,
            home: home.map(str::to_string),
        };
        self.seed(|s| {
            s.users.insert(username.to_string(), record);
        })
    }

    pub fn with_shadow(self, username: &str, password_hash: &str, expire: i64, inactive: i64, max_age: i64) -> Self {
        let record = ShadowRecord {
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            expire,
            inactive,
            max_age,
        };
        self.seed(|s| {
            s.shadows.insert(username.to_string(), record);
        })
    }

    pub fn with_group(self, gid: u32, name: &str) -> Self {
        self.seed(|s| {
            s.groups.insert(gid, name.to_string());
        })
    }

    pub fn failing_on(self, op: MockOp) -> Self {
        self.seed(|s| {
            s.failing_ops.insert(op);
        })
    }

    /// Make every lookup of `username` fail as if the store were unreachable.
    pub fn failing_lookup(self, username: &str) -> Self {
        self.seed(|s| {
            s.failing_lookups.insert(username.to_string());
        })
    }

    /// Make `group_exists(gid)` fail as if the group database were unreachable.
    pub fn failing_group_lookup(self, gid: u32) -> Self {
        self.seed(|s| {
            s.failing_group_lookups.insert(gid);
        })
    }

    /// Let the first `allowed` shadow lookups of `username` succeed and fail
    /// every later one.
    pub fn failing_shadow_lookup_after(self, username: &str, allowed: usize) -> Self {
        self.seed(|s| {
            s.shadow_lookup_budget.insert(username.to_string(), allowed);
        })
    }

    /// Redacted command lines of every mutation attempted so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state().map(|s| s.calls.clone()).unwrap_or_default()
    }

    pub fn user(&self, username: &str) -> Option<UserRecord> {
        self.state().ok().and_then(|s| s.users.get(username).cloned())
    }

    pub fn shadow(&self, username: &str) -> Option<ShadowRecord> {
        self.state().ok().and_then(|s| s.shadows.get(username).cloned())
    }

    pub fn group(&self, gid: u32) -> Option<String> {
        self.state().ok().and_then(|s| s.groups.get(&gid).cloned())
    }

    fn begin(&self, op: MockOp, argv: Vec<String>) -> Result<MutexGuard<'_, MockState>> {
        let mut state = self.state()?;
        let shown = redact_command_args(&argv).join(" ");
        state.calls.push(shown.clone());
        if state.failing_ops.contains(&op) {
            return Err(StoreError::Command {
                command: shown,
                code: Some(1),
                stderr: "simulated failure".to_string(),
            }
            .into());
        }
        Ok(state)
    }

    fn check_lookup(&self, state: &MockState, what: &'static str, username: &str) -> Result<()> {
        if state.failing_lookups.contains(username) {
            return Err(StoreError::Lookup {
                what,
                key: username.to_string(),
                cause: "simulated lookup failure".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

impl AccountStore for MockBackend {
    fn id(&self) -> &str {
        "mock"
    }

    fn lookup_user(&self, username: &str) -> Result<Option<UserRecord>> {
        let state = self.state()?;
        self.check_lookup(&state, "user", username)?;
        Ok(state.users.get(username).cloned())
    }

    fn lookup_shadow(&self, username: &str) -> Result<Option<ShadowRecord>> {
        let mut state = self.state()?;
        self.check_lookup(&state, "shadow", username)?;
        if let Some(left) = state.shadow_lookup_budget.get_mut(username) {
            if *left == 0 {
                return Err(StoreError::Lookup {
                    what: "shadow",
                    key: username.to_string(),
                    cause: "simulated lookup failure".to_string(),
                }
                .into());
            }
            *left -= 1;
        }
        Ok(state.shadows.get(username).cloned())
    }

    fn group_exists(&self, gid: u32) -> Result<bool> {
        let state = self.state()?;
        if state.failing_group_lookups.contains(&gid) {
            return Err(StoreError::Lookup {
                what: "group",
                key: gid.to_string(),
                cause: "simulated lookup failure".to_string(),
            }
            .into());
        }
        Ok(state.groups.contains_key(&gid))
    }

    fn create_user(&mut self, username: &str, changes: &UserChanges) -> Result<()> {
        let mut state = self.begin(MockOp::CreateUser, useradd_command(username, changes))?;
        if state.users.contains_key(username) {
            return Err(StoreError::Rejected(format!("user '{}' already exists", username)).into());
        }
        let uid = changes
            .uid
            .ok_or_else(|| StoreError::Rejected("mock backend requires an explicit uid".to_string()))?;
        let gid = changes.gid.unwrap_or(uid);
        if !state.groups.contains_key(&gid) {
            return Err(StoreError::Rejected(format!("group {} does not exist", gid)).into());
        }

        state.users.insert(
            username.to_string(),
            UserRecord {
                username: username.to_string(),
                uid,
                gid,
                home: Some(changes.home_dir.clone().unwrap_or_else(|| format!("/home/{}", username))),
            },
        );
        state.shadows.insert(
            username.to_string(),
            ShadowRecord {
                username: username.to_string(),
                password_hash: changes.password_hash.clone().unwrap_or_else(|| "!".to_string()),
                expire: NO_LIMIT,
                inactive: NO_LIMIT,
                max_age: DEFAULT_MAX_AGE,
            },
        );
        Ok(())
    }

    fn modify_user(&mut self, username: &str, changes: &UserChanges) -> Result<()> {
        let mut state = self.begin(MockOp::ModifyUser, usermod_command(username, changes))?;
        if let Some(gid) = changes.gid {
            if !state.groups.contains_key(&gid) {
                return Err(StoreError::Rejected(format!("group {} does not exist", gid)).into());
            }
        }

        let user = state
            .users
            .get_mut(username)
            .ok_or_else(|| StoreError::Rejected(format!("user '{}' does not exist", username)))?;
        if let Some(uid) = changes.uid {
            user.uid = uid;
        }
        if let Some(gid) = changes.gid {
            user.gid = gid;
        }
        if let Some(home) = &changes.home_dir {
            user.home = Some(home.clone());
        }

        if let Some(hash) = &changes.password_hash {
            let shadow = state.shadows.entry(username.to_string()).or_insert_with(|| ShadowRecord {
                username: username.to_string(),
                password_hash: String::new(),
                expire: NO_LIMIT,
                inactive: NO_LIMIT,
                max_age: DEFAULT_MAX_AGE,
            });
            shadow.password_hash = hash.clone();
        }
        Ok(())
    }

    fn delete_user(&mut self, username: &str, remove_home: bool) -> Result<()> {
        let mut state = self.begin(MockOp::DeleteUser, userdel_command(username, remove_home))?;
        let user = state.users.remove(username);
        let shadow = state.shadows.remove(username);
        if user.is_none() && shadow.is_none() {
            return Err(StoreError::Rejected(format!("user '{}' does not exist", username)).into());
        }
        // userdel drops the user private group along with the account
        if let Some(user) = user {
            if state.groups.get(&user.gid).map(String::as_str) == Some(username) {
                state.groups.remove(&user.gid);
            }
        }
        Ok(())
    }

    fn create_group(&mut self, gid: u32, name: &str) -> Result<()> {
        let mut state = self.begin(MockOp::CreateGroup, groupadd_command(gid, name))?;
        if state.groups.contains_key(&gid) {
            return Err(StoreError::Rejected(format!("gid {} is already in use", gid)).into());
        }
        if state.groups.values().any(|existing| existing == name) {
            return Err(StoreError::Rejected(format!("group '{}' already exists", name)).into());
        }
        state.groups.insert(gid, name.to_string());
        Ok(())
    }

    fn clear_expiration(&mut self, username: &str) -> Result<()> {
        let mut state = self.begin(MockOp::ClearExpiration, chage_never_expire_command(username))?;
        let shadow = state
            .shadows
            .get_mut(username)
            .ok_or_else(|| StoreError::Rejected(format!("user '{}' has no shadow entry", username)))?;
        shadow.expire = NO_LIMIT;
        shadow.inactive = NO_LIMIT;
        shadow.max_age = NO_LIMIT;
        Ok(())
    }
}
