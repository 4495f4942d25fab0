pub mod envelope;
pub mod parse;
pub mod registry;
pub mod status;

pub use envelope::{BackendInfo, EnvelopeError, EnvelopeEvent, RunEnvelope};
pub use registry::{Args, Handle, IoStreams, Registry};
pub use status::Status;

use anyhow::Result;
use std::io::{Read, Write};

pub fn dispatch_stage(
    reg: &mut Registry,
    stage_str: &str,
    cli_args: &[String],
    stdin: &mut dyn Read,
    stdout: &mut dyn Write,
    stderr: &mut dyn Write,
) -> Result<Status> {
    let mut parsed = parse::parse_stage(stage_str)?;

    // CLI key=value pairs override those given inside the stage parentheses
    for arg in cli_args {
        if let Some((key, value)) = arg.split_once('=') {
            parsed.args.insert(key.trim().to_string(), value.trim().to_string());
        }
    }

    log::debug!("dispatching verb='{}' target='{}'", parsed.verb, parsed.target);

    let mut io = IoStreams { stdin, stdout, stderr };
    let h = reg.resolve(&parsed.target)?;
    if !h.verbs().contains(&parsed.verb.as_str()) {
        anyhow::bail!(
            "Unknown verb '{}' for {} (expected one of: {})",
            parsed.verb,
            parsed.target,
            h.verbs().join(", ")
        );
    }
    h.call(&parsed.verb, &parsed.args, &mut io)
}
