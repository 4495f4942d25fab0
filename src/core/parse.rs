use anyhow::{anyhow, Result};
use regex::Regex;
use std::collections::HashMap;

use super::registry::Args;

#[derive(Debug)]
pub struct ParsedStage {
    pub target: String,
    pub verb: String,
    pub args: Args,
}

/// Parse a stage of the form `scheme://target.verb(key=value, key="a,b")`.
///
/// The argument list is optional. The verb is whatever follows the last dot
/// of the target part, so file names with extensions still work:
/// `accounts:///etc/acct.list.plan` targets `/etc/acct.list` with verb `plan`.
pub fn parse_stage(s: &str) -> Result<ParsedStage> {
    let s = s.trim();
    let (main_part, args_str) = split_args(s);

    let last_dot = main_part
        .rfind('.')
        .ok_or_else(|| anyhow!("Cannot parse stage (missing verb): {}", s))?;
    let target = &main_part[..last_dot];
    let verb = &main_part[last_dot + 1..];

    let verb_regex = Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_-]*$")?;
    if !verb_regex.is_match(verb) {
        return Err(anyhow!("Cannot parse stage (invalid verb '{}'): {}", verb, s));
    }

    let url_regex = Regex::new(r"^[a-zA-Z][a-zA-Z0-9+.-]*://")?;
    if !url_regex.is_match(target) {
        return Err(anyhow!("Cannot parse stage (target is not a URL): {}", s));
    }

    let mut args: Args = HashMap::new();
    if let Some(args_content) = args_str {
        for kv in parse_arguments(args_content) {
            if let Some((k, v)) = kv.split_once('=') {
                args.insert(k.trim().to_string(), v.trim().trim_matches('"').to_string());
            }
        }
    }

    Ok(ParsedStage {
        target: target.to_string(),
        verb: verb.to_string(),
        args,
    })
}

fn split_args(s: &str) -> (&str, Option<&str>) {
    if let (Some(open), Some(close)) = (s.rfind('('), s.rfind(')')) {
        if close > open {
            return (s[..open].trim(), Some(s[open + 1..close].trim()));
        }
    }
    (s, None)
}

/// Split an argument list on commas, keeping quoted values (`protected="root,bin"`) intact.
fn parse_arguments(args_str: &str) -> Vec<String> {
    let mut result = Vec::new();
    let mut current_arg = String::new();
    let mut in_quotes = false;

    for ch in args_str.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current_arg.push(ch);
            }
            ',' if !in_quotes => {
                if !current_arg.trim().is_empty() {
                    result.push(current_arg.trim().to_string());
                }
                current_arg.clear();
            }
            _ => current_arg.push(ch),
        }
    }

    if !current_arg.trim().is_empty() {
        result.push(current_arg.trim().to_string());
    }

    result
}
