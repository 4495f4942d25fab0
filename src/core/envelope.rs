use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Instant;

pub const REDACTED: &str = "***REDACTED***";

/// JSON envelope shared by every verb of the accounts handle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEnvelope {
    pub ok: bool,
    pub handle: String,
    pub verb: String,
    pub target: String,
    pub ts: String,
    pub duration_ms: u64,
    pub dry_run: bool,
    pub backend: BackendInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub events: Vec<EnvelopeEvent>,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<EnvelopeError>,
}

/// Which account store served the run, and whether mutations were only simulated
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendInfo {
    pub id: String,
    pub simulated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeEvent {
    pub ts: String,
    pub level: String,
    pub msg: String,
    pub phase: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl RunEnvelope {
    pub fn new(handle: &str, verb: &str, target: &str, backend: BackendInfo, dry_run: bool) -> Self {
        Self {
            ok: true,
            handle: handle.to_string(),
            verb: verb.to_string(),
            target: target.to_string(),
            ts: Utc::now().to_rfc3339(),
            duration_ms: 0,
            dry_run,
            backend,
            result: None,
            events: Vec::new(),
            warnings: Vec::new(),
            error: None,
        }
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn fail(&mut self, error: EnvelopeError) {
        self.ok = false;
        self.error = Some(error);
    }

    pub fn add_event(&mut self, level: &str, msg: &str, phase: &str) {
        self.events.push(EnvelopeEvent {
            ts: Utc::now().to_rfc3339(),
            level: level.to_string(),
            msg: msg.to_string(),
            phase: phase.to_string(),
        });
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn to_json(&self, pretty: bool) -> Result<String> {
        if pretty {
            serde_json::to_string_pretty(self).map_err(|e| anyhow!("JSON serialization error: {}", e))
        } else {
            serde_json::to_string(self).map_err(|e| anyhow!("JSON serialization error: {}", e))
        }
    }
}

impl BackendInfo {
    pub fn new(id: &str, simulated: bool) -> Self {
        Self {
            id: id.to_string(),
            simulated,
        }
    }
}

impl EnvelopeError {
    pub fn with_details(code: &str, message: &str, details: serde_json::Value) -> Self {
        Self {
            code: code.to_string(),
            message: message.to_string(),
            details: Some(details),
        }
    }
}

/// Replace credential arguments of a rendered command line.
///
/// Both `-p <hash>` and `--password=<hash>` forms are handled. Shadow hashes
/// never reach logs or JSON output in clear.
pub fn redact_command_args(command: &[String]) -> Vec<String> {
    let sensitive_flags = ["-p", "--password"];
    let mut redacted = Vec::with_capacity(command.len());
    let mut redact_next = false;

    for arg in command {
        if redact_next {
            redacted.push(REDACTED.to_string());
            redact_next = false;
        } else if let Some((flag, _)) = arg.split_once('=').filter(|(f, _)| sensitive_flags.contains(f)) {
            redacted.push(format!("{}={}", flag, REDACTED));
        } else if sensitive_flags.contains(&arg.as_str()) {
            redacted.push(arg.clone());
            redact_next = true;
        } else {
            redacted.push(arg.clone());
        }
    }

    redacted
}

/// Wall-clock timer for `duration_ms`
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_envelope_failure_flips_ok() {
        let mut envelope = RunEnvelope::new("accounts", "apply", "accounts:///x", BackendInfo::new("mock", false), false);
        assert!(envelope.ok);

        envelope.fail(EnvelopeError::with_details(
            "accounts.reconcile_failed",
            "1 account operation(s) failed",
            json!({ "failures": 1 }),
        ));
        assert!(!envelope.ok);
        let error = envelope.error.as_ref().unwrap();
        assert_eq!(error.code, "accounts.reconcile_failed");
        assert_eq!(error.details.as_ref().unwrap()["failures"], 1);
    }

    #[test]
    fn test_redact_password_hash() {
        let redacted = redact_command_args(&argv(&["useradd", "-u", "1500", "-p", "$6$salt$hash", "jdoe"]));
        assert_eq!(redacted, argv(&["useradd", "-u", "1500", "-p", REDACTED, "jdoe"]));

        let redacted = redact_command_args(&argv(&["tool", "--password=abc", "-pq"]));
        assert_eq!(redacted, argv(&["tool", &format!("--password={}", REDACTED), "-pq"]));
    }

    #[test]
    fn test_json_serialization() {
        let envelope = RunEnvelope::new("accounts", "plan", "accounts:///etc/acct.list", BackendInfo::new("system", true), true)
            .with_result(json!({"actions": []}));

        let compact = envelope.to_json(false).unwrap();
        assert!(compact.contains("\"ok\":true"));
        assert!(compact.contains("\"handle\":\"accounts\""));
        assert!(!compact.contains("\"error\""));

        let pretty = envelope.to_json(true).unwrap();
        assert!(pretty.len() > compact.len());
    }
}
