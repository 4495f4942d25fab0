use std::collections::BTreeSet;
use std::env;

use super::error::AccountError;

/// Environment variable overriding the protected-account list (comma-separated).
pub const PROTECTED_USERS_ENV: &str = "ACCTSYNC_PROTECTED_USERS";

pub const DEFAULT_PROTECTED_USERS: &[&str] = &["root", "bin", "daemon", "nobody", "puppet"];

/// Characters recognised as line-mode prefixes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeChars {
    pub expire_never: char,
    pub update_if_changed: char,
    pub delete: char,
}

impl Default for ModeChars {
    fn default() -> Self {
        Self {
            expire_never: '!',
            update_if_changed: '+',
            delete: '-',
        }
    }
}

impl ModeChars {
    /// Parse a three-character string in the order expire-never,
    /// update-if-changed, delete (the default is `!+-`).
    pub fn parse(s: &str) -> Result<Self, AccountError> {
        let invalid = || AccountError::InvalidOption {
            key: "mode_chars".to_string(),
            value: s.to_string(),
        };

        let chars: Vec<char> = s.chars().collect();
        if chars.len() != 3 || chars.iter().any(|c| c.is_alphanumeric() || c.is_whitespace() || *c == ',') {
            return Err(invalid());
        }
        if chars[0] == chars[1] || chars[1] == chars[2] || chars[0] == chars[2] {
            return Err(invalid());
        }

        Ok(Self {
            expire_never: chars[0],
            update_if_changed: chars[1],
            delete: chars[2],
        })
    }
}

/// Policy handed to the parser and reconciler at construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerConfig {
    pub protected_users: BTreeSet<String>,
    pub mode_chars: ModeChars,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            protected_users: DEFAULT_PROTECTED_USERS.iter().map(|s| s.to_string()).collect(),
            mode_chars: ModeChars::default(),
        }
    }
}

impl ReconcilerConfig {
    /// Defaults, overridden by `ACCTSYNC_PROTECTED_USERS` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(list) = env::var(PROTECTED_USERS_ENV) {
            config.protected_users = parse_user_list(&list);
            log::debug!("protected users from {}: {:?}", PROTECTED_USERS_ENV, config.protected_users);
        }
        config
    }

    pub fn is_protected(&self, username: &str) -> bool {
        self.protected_users.contains(username)
    }
}

pub fn parse_user_list(list: &str) -> BTreeSet<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
