use anyhow::{bail, Result};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;

use super::status::Status;

// Paths in stage targets may carry shell-style escapes (`\ ` for a space);
// url::Url would reject or mangle them, so percent-encode first.
fn encode_target_escapes(target: &str) -> String {
    let mut result = String::with_capacity(target.len() + 8);
    let mut chars = target.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\\' {
            result.push(c);
            continue;
        }
        match chars.peek() {
            Some(' ') => {
                chars.next();
                result.push_str("%20");
            }
            Some('\\') => {
                chars.next();
                result.push_str("%5C");
            }
            _ => result.push(c),
        }
    }

    result
}

pub type Args = HashMap<String, String>;

pub struct IoStreams<'a> {
    pub stdin: &'a mut dyn Read,
    pub stdout: &'a mut dyn Write,
    pub stderr: &'a mut dyn Write,
}

pub trait Handle: Send + Sync {
    fn verbs(&self) -> &'static [&'static str];
    fn call(&self, verb: &str, args: &Args, io: &mut IoStreams) -> Result<Status>;
}

type HandleCtor = Arc<dyn Fn(&url::Url) -> Result<Box<dyn Handle>> + Send + Sync>;

#[derive(Default)]
pub struct Registry {
    schemes: HashMap<String, HandleCtor>,
}

impl Registry {
    pub fn list_schemes(&self) -> Vec<String> {
        let mut v: Vec<String> = self.schemes.keys().cloned().collect();
        v.sort();
        v
    }

    pub fn register_scheme<F>(&mut self, scheme: &str, ctor: F)
    where
        F: Fn(&url::Url) -> Result<Box<dyn Handle>> + 'static + Send + Sync,
    {
        self.schemes.insert(scheme.to_string(), Arc::new(ctor));
    }

    pub fn resolve(&self, target: &str) -> Result<Box<dyn Handle>> {
        let encoded = encode_target_escapes(target);
        let u = url::Url::parse(&encoded)?;
        let scheme = u.scheme();
        match self.schemes.get(scheme) {
            Some(ctor) => ctor(&u),
            None => bail!("Unknown scheme: {}", scheme),
        }
    }
}
