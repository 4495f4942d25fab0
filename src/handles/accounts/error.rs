use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

/// Account reconciliation error types
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AccountError {
    #[error("line {line}: {reason}")]
    MalformedEntry { line: usize, reason: String },

    #[error("found previous entry for '{username}' on line {first_line}, skipping line {line}")]
    DuplicateUsername {
        username: String,
        line: usize,
        first_line: usize,
    },

    #[error("{username}: {reason}")]
    PolicyViolation { username: String, reason: String },

    #[error("{username}: failed to query account store: {cause}")]
    ProbeError { username: String, cause: String },

    #[error("{username}: {operation} failed: {cause}")]
    MutationFailure {
        username: String,
        operation: String,
        cause: String,
    },

    #[error("could not parse desired-state list: {0}")]
    BatchParseFailure(String),

    #[error("invalid backend: {0}")]
    InvalidBackend(String),

    #[error("invalid value '{value}' for option '{key}'")]
    InvalidOption { key: String, value: String },

    #[error("could not read desired-state list {path}: {cause}")]
    InputRead { path: String, cause: String },
}

impl AccountError {
    pub fn code(&self) -> String {
        match self {
            Self::MalformedEntry { .. } => "accounts.malformed_entry".to_string(),
            Self::DuplicateUsername { .. } => "accounts.duplicate_username".to_string(),
            Self::PolicyViolation { .. } => "accounts.policy_violation".to_string(),
            Self::ProbeError { .. } => "accounts.probe_error".to_string(),
            Self::MutationFailure { .. } => "accounts.mutation_failure".to_string(),
            Self::BatchParseFailure(_) => "accounts.batch_parse_failure".to_string(),
            Self::InvalidBackend(_) => "accounts.invalid_backend".to_string(),
            Self::InvalidOption { .. } => "accounts.invalid_option".to_string(),
            Self::InputRead { .. } => "accounts.input_read".to_string(),
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "ok": false,
            "error": {
                "code": self.code(),
                "message": self.to_string(),
                "details": self.details()
            }
        })
    }

    pub fn details(&self) -> Value {
        match self {
            Self::MalformedEntry { line, .. } => json!({"line": line}),
            Self::DuplicateUsername {
                username,
                line,
                first_line,
            } => json!({"username": username, "line": line, "first_line": first_line}),
            Self::PolicyViolation { username, .. } => json!({"username": username}),
            Self::ProbeError { username, .. } => json!({"username": username}),
            Self::MutationFailure {
                username, operation, ..
            } => json!({"username": username, "operation": operation}),
            Self::InvalidBackend(backend) => json!({"backend": backend}),
            Self::InvalidOption { key, value } => json!({"key": key, "value": value}),
            Self::InputRead { path, .. } => json!({"path": path}),
            Self::BatchParseFailure(_) => json!({}),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

/// One operator-visible anomaly. Creating one also emits the matching log line.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: String,
    pub message: String,
    pub details: Value,
    #[serde(skip)]
    pub error: AccountError,
}

impl Diagnostic {
    pub fn warning(error: AccountError) -> Self {
        log::warn!("{}", error);
        Self::new(Severity::Warning, error)
    }

    pub fn error(error: AccountError) -> Self {
        log::error!("{}", error);
        Self::new(Severity::Error, error)
    }

    /// Wrap an error that was already logged where it was detected.
    pub fn new(severity: Severity, error: AccountError) -> Self {
        Self {
            severity,
            code: error.code(),
            message: error.to_string(),
            details: error.details(),
            error,
        }
    }
}
