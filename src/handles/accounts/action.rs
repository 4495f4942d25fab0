use anyhow::Result;
use serde::Serialize;

use crate::backends::accounts::{
    chage_never_expire_command, groupadd_command, useradd_command, userdel_command, usermod_command,
    AccountStore, UserChanges,
};
use crate::core::envelope::redact_command_args;

/// A corrective operation decided by the reconciler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    DeleteUser { username: String, remove_home: bool },
    CreateGroup { gid: u32, name: String },
    CreateUser { username: String, changes: UserChanges },
    ModifyUser { username: String, changes: UserChanges },
    ClearExpiration { username: String },
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DeleteUser { .. } => "delete_user",
            Self::CreateGroup { .. } => "create_group",
            Self::CreateUser { .. } => "create_user",
            Self::ModifyUser { .. } => "modify_user",
            Self::ClearExpiration { .. } => "clear_expiration",
        }
    }

    /// Human name of the operation, used in failure messages
    pub fn operation(&self) -> &'static str {
        match self {
            Self::DeleteUser { .. } => "delete user",
            Self::CreateGroup { .. } => "create group",
            Self::CreateUser { .. } => "create user",
            Self::ModifyUser { .. } => "modify user",
            Self::ClearExpiration { .. } => "clear password expiration",
        }
    }

    /// Account the action is about; for groups, the group name.
    pub fn subject(&self) -> &str {
        match self {
            Self::DeleteUser { username, .. }
            | Self::CreateUser { username, .. }
            | Self::ModifyUser { username, .. }
            | Self::ClearExpiration { username } => username,
            Self::CreateGroup { name, .. } => name,
        }
    }

    /// Equivalent shadow-utils invocation, unredacted.
    pub fn command(&self) -> Vec<String> {
        match self {
            Self::DeleteUser { username, remove_home } => userdel_command(username, *remove_home),
            Self::CreateGroup { gid, name } => groupadd_command(*gid, name),
            Self::CreateUser { username, changes } => useradd_command(username, changes),
            Self::ModifyUser { username, changes } => usermod_command(username, changes),
            Self::ClearExpiration { username } => chage_never_expire_command(username),
        }
    }

    pub fn fields(&self) -> Vec<&'static str> {
        match self {
            Self::CreateUser { changes, .. } | Self::ModifyUser { changes, .. } => changes.fields(),
            _ => Vec::new(),
        }
    }

    /// Issue exactly one store mutation for this action.
    pub fn execute(&self, store: &mut dyn AccountStore) -> Result<()> {
        match self {
            Self::DeleteUser { username, remove_home } => store.delete_user(username, *remove_home),
            Self::CreateGroup { gid, name } => store.create_group(*gid, name),
            Self::CreateUser { username, changes } => store.create_user(username, changes),
            Self::ModifyUser { username, changes } => store.modify_user(username, changes),
            Self::ClearExpiration { username } => store.clear_expiration(username),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Planned,
    Applied,
    Failed,
}

/// An action together with what happened to it
#[derive(Debug, Clone)]
pub struct ActionRecord {
    pub action: Action,
    pub status: ActionStatus,
    pub error: Option<String>,
}

impl ActionRecord {
    pub fn succeeded(&self) -> bool {
        self.status != ActionStatus::Failed
    }
}

impl Serialize for ActionRecord {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;

        let mut st = serializer.serialize_struct("ActionRecord", 6)?;
        st.serialize_field("kind", self.action.kind())?;
        st.serialize_field("subject", self.action.subject())?;
        st.serialize_field("fields", &self.action.fields())?;
        st.serialize_field("command", &redact_command_args(&self.action.command()))?;
        st.serialize_field("status", &self.status)?;
        st.serialize_field("error", &self.error)?;
        st.end()
    }
}

/// Runs actions against a store, or only records them in dry-run mode.
/// Never retries.
#[derive(Debug, Clone, Copy)]
pub struct Executor {
    pub dry_run: bool,
}

impl Executor {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }

    pub fn run(&self, action: Action, store: &mut dyn AccountStore) -> ActionRecord {
        let shown = redact_command_args(&action.command()).join(" ");
        if self.dry_run {
            log::info!("would execute: {}", shown);
            return ActionRecord {
                action,
                status: ActionStatus::Planned,
                error: None,
            };
        }

        match action.execute(store) {
            Ok(()) => {
                log::info!("applied: {}", shown);
                ActionRecord {
                    action,
                    status: ActionStatus::Applied,
                    error: None,
                }
            }
            Err(e) => ActionRecord {
                action,
                status: ActionStatus::Failed,
                error: Some(format!("{:#}", e)),
            },
        }
    }
}
