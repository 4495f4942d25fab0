use std::io::Write;

use acctsync::core::{dispatch_stage, Registry};
use acctsync::handles;
use anyhow::{anyhow, Result};
use clap::Parser;

/// Reconcile local user accounts against a desired-state list
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// List registered URL schemes and exit
    #[arg(long)]
    list_schemas: bool,

    /// Pretty-print JSON outputs when possible
    #[arg(long)]
    json_pretty: bool,

    /// Increase log verbosity (-v info, -vv debug); RUST_LOG takes precedence
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// A single command stage like: accounts:///etc/acct.list.plan or accounts://-.apply(backend=mock)
    #[arg(value_name = "STAGE")]
    stage: Option<String>,

    /// Additional arguments passed to the command as key=value pairs
    #[arg(value_name = "ARGS")]
    args: Vec<String>,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .target(env_logger::Target::Stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut reg = Registry::default();
    handles::register_all(&mut reg);

    if cli.list_schemas {
        for s in reg.list_schemes() {
            println!("{}", s);
        }
        return Ok(());
    }

    let stage = cli
        .stage
        .ok_or_else(|| anyhow!("No stage provided. Try --list-schemas"))?;

    // Capture output so we can optionally pretty-print JSON
    let mut buf: Vec<u8> = Vec::new();
    let status = dispatch_stage(
        &mut reg,
        &stage,
        &cli.args,
        &mut std::io::stdin(),
        &mut buf,
        &mut std::io::stderr(),
    )?;

    let pretty = if cli.json_pretty {
        serde_json::from_slice::<serde_json::Value>(&buf)
            .ok()
            .and_then(|val| serde_json::to_string_pretty(&val).ok())
    } else {
        None
    };
    match pretty {
        Some(text) => println!("{}", text),
        // not JSON, or no pretty-printing requested
        None => std::io::stdout().write_all(&buf)?,
    }

    if !status.ok {
        log::debug!("stage failed: {}", status.reason.as_deref().unwrap_or("unknown"));
        std::process::exit(status.exit_code());
    }
    Ok(())
}
