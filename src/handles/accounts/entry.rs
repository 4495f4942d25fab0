//! Desired-state entry parsing.
//!
//! One record per line:
//!
//! ```text
//! <!|+|-><username>,<uid>,<gid>[,<homedir>],<passwordHash>
//! ```
//!
//! Blank lines and `#` comments are skipped. A bad line is reported and
//! dropped; only input that cannot be read as text at all fails the batch.

use serde::Serialize;

use super::config::ModeChars;
use super::error::AccountError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// `!`: also disable password expiration
    ExpireNever,
    /// `+`: reconciled exactly like `Plain`
    UpdateIfChanged,
    /// `-`: remove the account
    Delete,
    /// no prefix
    Plain,
}

/// Desired state of one account
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountSpec {
    /// 1-based line number in the input
    pub line: usize,
    pub mode: Mode,
    pub username: String,
    pub uid: u32,
    pub gid: u32,
    pub home_dir: Option<String>,
    #[serde(skip)]
    pub password_hash: String,
}

/// Line-local validation failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIssue {
    pub line: usize,
    pub reason: String,
}

impl ParseIssue {
    fn new(line: usize, reason: impl Into<String>) -> Self {
        Self {
            line,
            reason: reason.into(),
        }
    }
}

impl From<ParseIssue> for AccountError {
    fn from(issue: ParseIssue) -> Self {
        AccountError::MalformedEntry {
            line: issue.line,
            reason: issue.reason,
        }
    }
}

#[derive(Debug, Default)]
pub struct ParsedEntries {
    pub specs: Vec<AccountSpec>,
    pub issues: Vec<ParseIssue>,
}

fn parse_id(value: &str, what: &str, line: usize) -> Result<u32, ParseIssue> {
    value
        .parse::<u32>()
        .map_err(|_| ParseIssue::new(line, format!("{} '{}' is not a valid numeric id", what, value)))
}

/// Parse one line. `None` for blank and comment lines.
pub fn parse_line(line: usize, raw: &str, modes: &ModeChars) -> Option<Result<AccountSpec, ParseIssue>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    Some(parse_fields(line, trimmed, modes))
}

fn parse_fields(line: usize, text: &str, modes: &ModeChars) -> Result<AccountSpec, ParseIssue> {
    let fields: Vec<&str> = text.split(',').map(str::trim).collect();
    if fields.len() < 4 {
        return Err(ParseIssue::new(line, "missing required entries"));
    }
    if fields.len() > 5 {
        return Err(ParseIssue::new(line, format!("expected at most 5 fields, found {}", fields.len())));
    }

    let (mode, username) = split_mode(fields[0], modes);
    if username.is_empty() {
        return Err(ParseIssue::new(line, "empty username"));
    }
    if username.contains(':') || username.chars().any(char::is_whitespace) {
        return Err(ParseIssue::new(line, format!("invalid username '{}'", username)));
    }

    let uid = parse_id(fields[1], "uid", line)?;
    let gid = parse_id(fields[2], "gid", line)?;

    // Four fields means the home column was left out entirely: the fourth
    // value is the password. An empty fourth field before a password is
    // read the same way.
    let home_field = fields[3];
    let password_field = fields.get(4).copied().unwrap_or("");
    let (home_dir, password_hash) = if password_field.is_empty() {
        (None, home_field)
    } else if home_field.is_empty() {
        (None, password_field)
    } else {
        (Some(home_field.to_string()), password_field)
    };

    if password_hash.is_empty() {
        return Err(ParseIssue::new(line, "missing password hash"));
    }

    Ok(AccountSpec {
        line,
        mode,
        username: username.to_string(),
        uid,
        gid,
        home_dir,
        password_hash: password_hash.to_string(),
    })
}

fn split_mode<'a>(field: &'a str, modes: &ModeChars) -> (Mode, &'a str) {
    let mut chars = field.chars();
    let mode = match chars.next() {
        Some(c) if c == modes.expire_never => Mode::ExpireNever,
        Some(c) if c == modes.update_if_changed => Mode::UpdateIfChanged,
        Some(c) if c == modes.delete => Mode::Delete,
        _ => return (Mode::Plain, field),
    };
    (mode, chars.as_str())
}

/// Parse an already-materialised list of lines. Line-local problems end up
/// in `issues`; this never fails as a whole.
pub fn parse_entries<S: AsRef<str>>(lines: &[S], modes: &ModeChars) -> ParsedEntries {
    let mut parsed = ParsedEntries::default();
    for (idx, raw) in lines.iter().enumerate() {
        match parse_line(idx + 1, raw.as_ref(), modes) {
            None => {}
            Some(Ok(spec)) => parsed.specs.push(spec),
            Some(Err(issue)) => parsed.issues.push(issue),
        }
    }
    parsed
}

/// Decode raw input and parse it. Input that is not UTF-8 aborts the whole
/// batch; nothing from it is reconciled.
pub fn parse_input(input: &[u8], modes: &ModeChars) -> Result<ParsedEntries, AccountError> {
    let text = match std::str::from_utf8(input) {
        Ok(text) => text,
        Err(e) => {
            let lossy = String::from_utf8_lossy(input);
            let lines: Vec<String> = lossy.lines().map(redact_entry).collect();
            log::error!("could not parse desired-state list ({}); input was: {:?}", e, lines);
            return Err(AccountError::BatchParseFailure(e.to_string()));
        }
    };
    let lines: Vec<&str> = text.lines().collect();
    Ok(parse_entries(&lines, modes))
}

// Everything after the last comma is a credential
fn redact_entry(line: &str) -> String {
    match line.rsplit_once(',') {
        Some((head, _)) => format!("{},***", head),
        None => line.to_string(),
    }
}
