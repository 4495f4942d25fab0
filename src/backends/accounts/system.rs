use anyhow::Result;
use nix::unistd::{Gid, Group, User};
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Command;

use super::{
    chage_never_expire_command, groupadd_command, useradd_command, userdel_command, usermod_command,
    AccountStore, ShadowRecord, StoreError, UserChanges, UserRecord, NO_LIMIT,
};
use crate::core::envelope::redact_command_args;

/// Host account store: NSS lookups through `nix`, the shadow file read
/// directly, and mutations through the shadow-utils binaries.
#[derive(Debug)]
pub struct SystemBackend {
    shadow_path: PathBuf,
}

impl SystemBackend {
    pub fn new(shadow_path: &str) -> Self {
        Self {
            shadow_path: PathBuf::from(shadow_path),
        }
    }

    fn run(&self, argv: Vec<String>) -> Result<()> {
        let shown = redact_command_args(&argv).join(" ");
        log::info!("executing: {}", shown);

        let Some((program, args)) = argv.split_first() else {
            return Err(StoreError::Rejected("empty command line".to_string()).into());
        };
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| StoreError::Spawn {
                command: shown.clone(),
                cause: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StoreError::Command {
                command: shown,
                code: output.status.code(),
                stderr: stderr.lines().next().unwrap_or("").trim().to_string(),
            }
            .into());
        }

        Ok(())
    }
}

fn parse_aging_field(value: &str, field: &str, line_user: &str) -> Result<i64> {
    if value.is_empty() {
        return Ok(NO_LIMIT);
    }
    value.parse::<i64>().map_err(|_| {
        StoreError::Lookup {
            what: "shadow",
            key: line_user.to_string(),
            cause: format!("field '{}' is not numeric: '{}'", field, value),
        }
        .into()
    })
}

/// Parse one `/etc/shadow` line:
/// `name:hash:lastchg:min:max:warn:inactive:expire:reserved`.
/// Empty aging fields mean "no limit".
pub fn parse_shadow_line(line: &str) -> Result<ShadowRecord> {
    let fields: Vec<&str> = line.split(':').collect();
    let name = fields.first().copied().unwrap_or("");
    if fields.len() < 8 {
        return Err(StoreError::Lookup {
            what: "shadow",
            key: name.to_string(),
            cause: format!("expected at least 8 fields, found {}", fields.len()),
        }
        .into());
    }

    Ok(ShadowRecord {
        username: name.to_string(),
        password_hash: fields[1].to_string(),
        max_age: parse_aging_field(fields[4], "max", name)?,
        inactive: parse_aging_field(fields[6], "inactive", name)?,
        expire: parse_aging_field(fields[7], "expire", name)?,
    })
}

impl AccountStore for SystemBackend {
    fn id(&self) -> &str {
        "system"
    }

    fn lookup_user(&self, username: &str) -> Result<Option<UserRecord>> {
        let user = User::from_name(username).map_err(|errno| StoreError::Lookup {
            what: "user",
            key: username.to_string(),
            cause: errno.to_string(),
        })?;

        Ok(user.map(|u| UserRecord {
            username: u.name,
            uid: u.uid.as_raw(),
            gid: u.gid.as_raw(),
            home: Some(u.dir.to_string_lossy().to_string()).filter(|h| !h.is_empty()),
        }))
    }

    fn lookup_shadow(&self, username: &str) -> Result<Option<ShadowRecord>> {
        let content = match fs::read_to_string(&self.shadow_path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::debug!("{} does not exist; treating '{}' as having no shadow entry", self.shadow_path.display(), username);
                return Ok(None);
            }
            Err(e) => {
                return Err(StoreError::Lookup {
                    what: "shadow",
                    key: username.to_string(),
                    cause: format!("{}: {}", self.shadow_path.display(), e),
                }
                .into())
            }
        };

        let prefix = format!("{}:", username);
        for line in content.lines() {
            if line.starts_with(&prefix) {
                return parse_shadow_line(line).map(Some);
            }
        }
        Ok(None)
    }

    fn group_exists(&self, gid: u32) -> Result<bool> {
        let group = Group::from_gid(Gid::from_raw(gid)).map_err(|errno| StoreError::Lookup {
            what: "group",
            key: gid.to_string(),
            cause: errno.to_string(),
        })?;
        Ok(group.is_some())
    }

    fn create_user(&mut self, username: &str, changes: &UserChanges) -> Result<()> {
        self.run(useradd_command(username, changes))
    }

    fn modify_user(&mut self, username: &str, changes: &UserChanges) -> Result<()> {
        self.run(usermod_command(username, changes))
    }

    fn delete_user(&mut self, username: &str, remove_home: bool) -> Result<()> {
        self.run(userdel_command(username, remove_home))
    }

    fn create_group(&mut self, gid: u32, name: &str) -> Result<()> {
        self.run(groupadd_command(gid, name))
    }

    fn clear_expiration(&mut self, username: &str) -> Result<()> {
        self.run(chage_never_expire_command(username))
    }
}
