//! Account store backends.
//!
//! The reconciler only ever talks to an [`AccountStore`]: three read-only
//! probes and five mutations. "Not found" is never an error here; lookups
//! return `Ok(None)` / `Ok(false)` and reserve `Err` for a store that could
//! not be queried at all.

use anyhow::{anyhow, Result};
use serde::Serialize;
use thiserror::Error;

pub mod mock;
pub mod system;

pub use mock::{MockBackend, MockOp};
pub use system::SystemBackend;

/// Value of a shadow aging field meaning "no limit / disabled".
pub const NO_LIMIT: i64 = -1;

pub const DEFAULT_SHADOW_PATH: &str = "/etc/shadow";

/// Errors raised by a store, distinct from a record simply being absent
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("lookup of {what} '{key}' failed: {cause}")]
    Lookup {
        what: &'static str,
        key: String,
        cause: String,
    },

    #[error("failed to run `{command}`: {cause}")]
    Spawn { command: String, cause: String },

    #[error("`{command}` exited with status {code:?}: {stderr}")]
    Command {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{0}")]
    Rejected(String),
}

/// Entry of the host user database
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserRecord {
    pub username: String,
    pub uid: u32,
    pub gid: u32,
    pub home: Option<String>,
}

/// Entry of the host shadow database
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShadowRecord {
    pub username: String,
    #[serde(skip)]
    pub password_hash: String,
    pub expire: i64,
    pub inactive: i64,
    pub max_age: i64,
}

impl ShadowRecord {
    pub fn is_non_expiring(&self) -> bool {
        self.expire == NO_LIMIT && self.inactive == NO_LIMIT && self.max_age == NO_LIMIT
    }
}

/// Fields to pass explicitly to a create or modify call. `None` leaves the
/// field to the system default (create) or untouched (modify).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserChanges {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub password_hash: Option<String>,
    pub home_dir: Option<String>,
}

impl UserChanges {
    pub fn is_empty(&self) -> bool {
        self.uid.is_none() && self.gid.is_none() && self.password_hash.is_none() && self.home_dir.is_none()
    }

    /// Names of the fields being set, in command-line order.
    pub fn fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.uid.is_some() {
            fields.push("uid");
        }
        if self.gid.is_some() {
            fields.push("gid");
        }
        if self.password_hash.is_some() {
            fields.push("password");
        }
        if self.home_dir.is_some() {
            fields.push("home");
        }
        fields
    }

    // uid, gid, password, home: fixed so rendered invocations are diffable
    fn push_args(&self, args: &mut Vec<String>) {
        if let Some(uid) = self.uid {
            args.push("-u".to_string());
            args.push(uid.to_string());
        }
        if let Some(gid) = self.gid {
            args.push("-g".to_string());
            args.push(gid.to_string());
        }
        if let Some(hash) = &self.password_hash {
            args.push("-p".to_string());
            args.push(hash.clone());
        }
        if let Some(home) = &self.home_dir {
            args.push("-d".to_string());
            args.push(home.clone());
        }
    }
}

pub fn useradd_command(username: &str, changes: &UserChanges) -> Vec<String> {
    let mut args = vec!["useradd".to_string()];
    changes.push_args(&mut args);
    if changes.home_dir.is_some() {
        args.push("-m".to_string());
    }
    args.push(username.to_string());
    args
}

pub fn usermod_command(username: &str, changes: &UserChanges) -> Vec<String> {
    let mut args = vec!["usermod".to_string()];
    changes.push_args(&mut args);
    args.push(username.to_string());
    args
}

pub fn userdel_command(username: &str, remove_home: bool) -> Vec<String> {
    let mut args = vec!["userdel".to_string()];
    if remove_home {
        args.push("-r".to_string());
    }
    args.push(username.to_string());
    args
}

pub fn groupadd_command(gid: u32, name: &str) -> Vec<String> {
    vec!["groupadd".to_string(), "-g".to_string(), gid.to_string(), name.to_string()]
}

pub fn chage_never_expire_command(username: &str) -> Vec<String> {
    ["chage", "-E", "-1", "-I", "-1", "-M", "-1", username]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Read and write access to the host account databases
pub trait AccountStore {
    /// Backend ID as accepted by [`get_backend`]
    fn id(&self) -> &str;

    fn lookup_user(&self, username: &str) -> Result<Option<UserRecord>>;

    fn lookup_shadow(&self, username: &str) -> Result<Option<ShadowRecord>>;

    fn group_exists(&self, gid: u32) -> Result<bool>;

    fn create_user(&mut self, username: &str, changes: &UserChanges) -> Result<()>;

    fn modify_user(&mut self, username: &str, changes: &UserChanges) -> Result<()>;

    fn delete_user(&mut self, username: &str, remove_home: bool) -> Result<()>;

    fn create_group(&mut self, gid: u32, name: &str) -> Result<()>;

    /// Disable expiry, inactivity and maximum password age for the account.
    fn clear_expiration(&mut self, username: &str) -> Result<()>;
}

/// Settings shared by backend constructors
#[derive(Debug, Clone)]
pub struct BackendOptions {
    pub shadow_path: String,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            shadow_path: DEFAULT_SHADOW_PATH.to_string(),
        }
    }
}

/// Get backend instance by ID
pub fn get_backend(backend_id: &str, options: &BackendOptions) -> Result<Box<dyn AccountStore>> {
    match backend_id.to_lowercase().as_str() {
        "system" => Ok(Box::new(SystemBackend::new(&options.shadow_path))),
        "mock" => Ok(Box::new(MockBackend::new())),
        _ => Err(anyhow!("Unsupported backend: {}", backend_id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn changes(uid: Option<u32>, gid: Option<u32>, hash: Option<&str>, home: Option<&str>) -> UserChanges {
        UserChanges {
            uid,
            gid,
            password_hash: hash.map(str::to_string),
            home_dir: home.map(str::to_string),
        }
    }

    #[test]
    fn test_useradd_argument_order() {
        let c = changes(Some(1500), Some(1500), Some("abc123hash"), Some("/home/jdoe"));
        assert_eq!(
            useradd_command("jdoe", &c).join(" "),
            "useradd -u 1500 -g 1500 -p abc123hash -d /home/jdoe -m jdoe"
        );

        let c = changes(Some(1500), Some(1500), Some("abc123hash"), None);
        assert_eq!(useradd_command("jdoe", &c).join(" "), "useradd -u 1500 -g 1500 -p abc123hash jdoe");
    }

    #[test]
    fn test_usermod_only_changed_fields() {
        let c = changes(None, Some(20), None, Some("/srv/bob"));
        assert_eq!(usermod_command("bob", &c).join(" "), "usermod -g 20 -d /srv/bob bob");
        assert_eq!(c.fields(), vec!["gid", "home"]);
        assert!(!c.is_empty());
        assert!(UserChanges::default().is_empty());
    }

    #[test]
    fn test_other_commands() {
        assert_eq!(userdel_command("bob", true).join(" "), "userdel -r bob");
        assert_eq!(groupadd_command(1500, "jdoe").join(" "), "groupadd -g 1500 jdoe");
        assert_eq!(chage_never_expire_command("jdoe").join(" "), "chage -E -1 -I -1 -M -1 jdoe");
    }

    #[test]
    fn test_non_expiring() {
        let mut shadow = ShadowRecord {
            username: "jdoe".to_string(),
            password_hash: "x".to_string(),
            expire: NO_LIMIT,
            inactive: NO_LIMIT,
            max_age: 99999,
        };
        assert!(!shadow.is_non_expiring());
        shadow.max_age = NO_LIMIT;
        assert!(shadow.is_non_expiring());
    }

    #[test]
    fn test_get_backend() {
        let options = BackendOptions::default();
        assert_eq!(get_backend("system", &options).unwrap().id(), "system");
        assert_eq!(get_backend("MOCK", &options).unwrap().id(), "mock");
        assert!(get_backend("ldap", &options).is_err());
    }
}
