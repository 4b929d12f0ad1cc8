#![warn(unused_extern_crates)]
#![allow(special_module_name)]
use std::path::Path;

use crate::lib::AnyhowResult;
use anyhow::Context;
use clap::{crate_version, ArgAction, Args, Parser};
use tracing_subscriber::EnvFilter;

mod commands;
mod lib;

/// Installs the private key and certificate chain of a PKCS#12 bundle as PEM files.
#[derive(Parser)]
#[clap(name("certfetch"), version = crate_version!())]
pub struct CliOpts {
    #[clap(flatten, next_help_heading = "COMMON")]
    global_opts: GlobalOpts,
    #[clap(subcommand)]
    command: commands::Command,
}

#[derive(Args)]
struct GlobalOpts {
    /// Log progress to STDERR. Repeat for more detail; RUST_LOG overrides it.
    #[clap(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Print the installation report as JSON on STDOUT.
    #[clap(long, global = true)]
    json: bool,
}

fn main() -> AnyhowResult {
    let opts = CliOpts::parse();
    init_logging(opts.global_opts.verbose);
    commands::dispatch(opts.command, opts.global_opts.json)?;
    Ok(())
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("certfetch={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn read_file(path: impl AsRef<Path>, name: &str) -> AnyhowResult<String> {
    let path = path.as_ref();
    if path == Path::new("-") {
        // read from STDIN
        let mut buffer = String::new();
        use std::io::Read;
        std::io::stdin()
            .read_to_string(&mut buffer)
            .map(|_| buffer)
            .context(format!("Couldn't read {} from STDIN", name))
    } else {
        std::fs::read_to_string(path).with_context(|| format!("Couldn't read {} file", name))
    }
}
