//! `accounts://` handle: reconcile local user accounts against a
//! desired-state list.
//!
//! Verbs:
//! - `parse`: parse, dedup and order the list, report what was understood
//! - `plan`: full reconciliation in dry-run, nothing is mutated
//! - `apply`: reconcile and execute (honours `dry_run=true`)

pub mod action;
pub mod config;
pub mod entry;
pub mod error;
pub mod order;
pub mod reconcile;

use anyhow::Result;
use percent_encoding::percent_decode_str;
use serde::Serialize;
use serde_json::json;
use std::fmt::Write as _;
use std::io::Read;
use url::Url;

use crate::backends::accounts::{get_backend, AccountStore, BackendOptions, DEFAULT_SHADOW_PATH};
use crate::core::envelope::{BackendInfo, EnvelopeError, RunEnvelope, Timer};
use crate::core::{Args, Handle, IoStreams, Status};

use action::{ActionRecord, ActionStatus};
use config::{parse_user_list, ModeChars, ReconcilerConfig};
use entry::{parse_input, AccountSpec};
use error::{AccountError, Diagnostic, Severity};
use order::dedup_and_order;
use reconcile::Reconciler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Text,
}

/// Options accepted by every verb
#[derive(Debug, Clone)]
pub struct AccountsOptions {
    pub backend: String,
    pub dry_run: bool,
    pub format: OutputFormat,
    pub config: ReconcilerConfig,
    pub shadow_path: String,
}

impl Default for AccountsOptions {
    fn default() -> Self {
        Self {
            backend: "system".to_string(),
            dry_run: false,
            format: OutputFormat::Json,
            config: ReconcilerConfig::default(),
            shadow_path: DEFAULT_SHADOW_PATH.to_string(),
        }
    }
}

impl AccountsOptions {
    /// Build options from stage args on top of `base` (usually the
    /// environment-derived config).
    pub fn from_args(args: &Args, base: ReconcilerConfig) -> Result<Self, AccountError> {
        let mut options = AccountsOptions {
            config: base,
            ..Default::default()
        };

        if let Some(backend) = args.get("backend") {
            options.backend = match backend.as_str() {
                "system" | "mock" => backend.clone(),
                _ => return Err(AccountError::InvalidBackend(backend.clone())),
            };
        }

        if let Some(dry_run) = args.get("dry_run") {
            options.dry_run = parse_bool("dry_run", dry_run)?;
        }

        if let Some(format) = args.get("format") {
            options.format = match format.as_str() {
                "json" => OutputFormat::Json,
                "text" => OutputFormat::Text,
                _ => {
                    return Err(AccountError::InvalidOption {
                        key: "format".to_string(),
                        value: format.clone(),
                    })
                }
            };
        }

        if let Some(list) = args.get("protected") {
            options.config.protected_users = parse_user_list(list);
        }
        if let Some(chars) = args.get("mode_chars") {
            options.config.mode_chars = ModeChars::parse(chars)?;
        }
        if let Some(path) = args.get("shadow_path") {
            options.shadow_path = path.clone();
        }

        Ok(options)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, AccountError> {
    match value {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(AccountError::InvalidOption {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

#[derive(Debug, Default, Serialize)]
pub struct RunSummary {
    pub accounts: usize,
    pub malformed: usize,
    pub duplicates: usize,
    pub planned: usize,
    pub applied: usize,
    pub failed: usize,
    pub warnings: usize,
    pub errors: usize,
}

/// Result of one verb; becomes `result` in the envelope
#[derive(Debug, Default, Serialize)]
pub struct RunReport {
    pub specs: Vec<AccountSpec>,
    pub actions: Vec<ActionRecord>,
    pub diagnostics: Vec<Diagnostic>,
    pub summary: RunSummary,
}

impl RunReport {
    /// Probe or mutation failures; policy warnings do not count.
    pub fn failures(&self) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| {
                matches!(
                    d.error,
                    AccountError::ProbeError { .. } | AccountError::MutationFailure { .. }
                )
            })
            .count()
    }

    fn summarize(&mut self, malformed: usize, duplicates: usize) {
        let count = |status| self.actions.iter().filter(|a| a.status == status).count();
        let severity = |s| self.diagnostics.iter().filter(|d| d.severity == s).count();
        self.summary = RunSummary {
            accounts: self.specs.len(),
            malformed,
            duplicates,
            planned: count(ActionStatus::Planned),
            applied: count(ActionStatus::Applied),
            failed: count(ActionStatus::Failed),
            warnings: severity(Severity::Warning),
            errors: severity(Severity::Error),
        };
    }
}

/// Where the desired-state list comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    Stdin,
    File(String),
}

impl InputSource {
    fn describe(&self) -> &str {
        match self {
            InputSource::Stdin => "-",
            InputSource::File(path) => path,
        }
    }
}

pub struct AccountsHandle {
    source: InputSource,
}

impl AccountsHandle {
    pub fn from_url(url: &Url) -> Result<AccountsHandle> {
        // accounts://./list.txt keeps "." as host; glue it back on
        let raw = format!("{}{}", url.host_str().unwrap_or(""), url.path());
        let path = percent_decode_str(&raw).decode_utf8_lossy().to_string();
        let source = match path.as_str() {
            "" | "/" | "-" | "/-" => InputSource::Stdin,
            _ => InputSource::File(path),
        };
        Ok(AccountsHandle { source })
    }

    pub fn source(&self) -> &InputSource {
        &self.source
    }

    fn read_input(&self, stdin: &mut dyn Read) -> Result<Vec<u8>, AccountError> {
        let mut buf = Vec::new();
        match &self.source {
            InputSource::Stdin => stdin
                .read_to_end(&mut buf)
                .map(|_| buf)
                .map_err(|e| AccountError::InputRead {
                    path: "-".to_string(),
                    cause: e.to_string(),
                }),
            InputSource::File(path) => std::fs::read(path).map_err(|e| AccountError::InputRead {
                path: path.clone(),
                cause: e.to_string(),
            }),
        }
    }

    /// Parse, order and (for `plan`/`apply`) reconcile one batch against `store`.
    pub fn run(
        &self,
        verb: &str,
        options: &AccountsOptions,
        input: &[u8],
        store: Option<&mut dyn AccountStore>,
    ) -> Result<RunReport, AccountError> {
        let parsed = parse_input(input, &options.config.mode_chars)?;
        let mut report = RunReport::default();

        let malformed = parsed.issues.len();
        for issue in parsed.issues {
            report.diagnostics.push(Diagnostic::warning(issue.into()));
        }

        let ordered = dedup_and_order(parsed.specs);
        let duplicates = ordered.duplicates.len();
        report
            .diagnostics
            .extend(ordered.duplicates.into_iter().map(|e| Diagnostic::new(Severity::Warning, e)));
        report.specs = ordered.specs;

        if let Some(store) = store {
            let dry_run = verb == "plan" || options.dry_run;
            let reconciler = Reconciler::new(options.config.clone(), dry_run);
            let outcome = reconciler.reconcile(&report.specs, store);
            report.actions = outcome.actions;
            report.diagnostics.extend(outcome.diagnostics);
        }

        report.summarize(malformed, duplicates);
        Ok(report)
    }

    fn execute(&self, verb: &str, args: &Args, io: &mut IoStreams) -> Result<Status> {
        let timer = Timer::new();
        let options = AccountsOptions::from_args(args, ReconcilerConfig::from_env())?;
        let dry_run = verb == "plan" || options.dry_run;
        let input = self.read_input(io.stdin)?;

        let report = if verb == "parse" {
            self.run(verb, &options, &input, None)?
        } else {
            let backend_options = BackendOptions {
                shadow_path: options.shadow_path.clone(),
            };
            let mut backend = get_backend(&options.backend, &backend_options)?;
            let store: &mut dyn AccountStore = &mut *backend;
            self.run(verb, &options, &input, Some(store))?
        };
        let failures = report.failures();

        let simulated = dry_run || verb == "parse" || options.backend == "mock";
        let mut envelope = RunEnvelope::new(
            "accounts",
            verb,
            self.source.describe(),
            BackendInfo::new(&options.backend, simulated),
            dry_run,
        );
        envelope.add_event(
            "info",
            &format!("{} account(s) after dedup", report.summary.accounts),
            "parse",
        );
        if verb != "parse" {
            envelope.add_event("info", &format!("{} action(s)", report.actions.len()), "reconcile");
        }
        for diag in report.diagnostics.iter().filter(|d| d.severity == Severity::Warning) {
            envelope.add_warning(diag.message.clone());
        }
        if failures > 0 {
            envelope.fail(EnvelopeError::with_details(
                "accounts.reconcile_failed",
                &format!("{} account operation(s) failed", failures),
                json!({ "failures": failures }),
            ));
        }
        envelope.duration_ms = timer.elapsed_ms();

        match options.format {
            OutputFormat::Json => {
                let envelope = envelope.with_result(serde_json::to_value(&report)?);
                writeln!(io.stdout, "{}", envelope.to_json(false)?)?;
            }
            OutputFormat::Text => {
                write!(io.stdout, "{}", format_text(&envelope, &report))?;
            }
        }

        if failures > 0 {
            return Ok(Status::err(2, format!("{} account operation(s) failed", failures)));
        }
        Ok(Status::success())
    }
}

// serde name of a unit enum variant
fn label<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

fn format_text(envelope: &RunEnvelope, report: &RunReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "accounts {} {} (backend={}, dry_run={})",
        envelope.verb, envelope.target, envelope.backend.id, envelope.dry_run
    );

    if envelope.verb == "parse" {
        for spec in &report.specs {
            let _ = writeln!(
                out,
                "  {:<12} {:<16} uid={:<6} gid={:<6} home={}",
                label(&spec.mode),
                spec.username,
                spec.uid,
                spec.gid,
                spec.home_dir.as_deref().unwrap_or("-")
            );
        }
    }

    for record in &report.actions {
        let command = crate::core::envelope::redact_command_args(&record.action.command()).join(" ");
        let _ = writeln!(out, "  {:<8} {:<17} {}", label(&record.status), record.action.kind(), command);
        if let Some(err) = &record.error {
            let _ = writeln!(out, "           error: {}", err);
        }
    }

    for diag in &report.diagnostics {
        let level = match diag.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        let _ = writeln!(out, "  {:<8} {}", level, diag.message);
    }

    let s = &report.summary;
    let _ = writeln!(
        out,
        "summary: {} account(s), {} planned, {} applied, {} failed, {} warning(s), {} error(s)",
        s.accounts, s.planned, s.applied, s.failed, s.warnings, s.errors
    );
    out
}

impl Handle for AccountsHandle {
    fn verbs(&self) -> &'static [&'static str] {
        &["parse", "plan", "apply"]
    }

    fn call(&self, verb: &str, args: &Args, io: &mut IoStreams) -> Result<Status> {
        match self.execute(verb, args, io) {
            Ok(status) => Ok(status),
            Err(e) => {
                if let Some(account_err) = e.downcast_ref::<AccountError>() {
                    writeln!(io.stderr, "{}", serde_json::to_string_pretty(&account_err.to_json())?)?;
                    Ok(Status::err(1, account_err.to_string()))
                } else {
                    Err(e)
                }
            }
        }
    }
}

pub fn register(reg: &mut crate::core::Registry) {
    reg.register_scheme("accounts", |u| Ok(Box::new(AccountsHandle::from_url(u)?)));
}
