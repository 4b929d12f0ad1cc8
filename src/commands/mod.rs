//! This module implements the command-line API.

use crate::lib::{
    AnyhowResult, ArtifactRole, ChainNaming, ChainOrder, ContainerDisposition, InstallConfig,
    InstallReport, InstallTarget, OpenSslDecoder, PipelineFailure,
};
use anyhow::Context;
use clap::{Args, Parser};
use std::io::{self, Write};
use std::path::PathBuf;
use tokio::runtime::Runtime;

mod fetch;
mod install;
mod split;

#[derive(Parser)]
pub enum Command {
    Fetch(fetch::FetchOpts),
    Install(install::InstallOpts),
    Split(split::SplitOpts),
}

pub fn dispatch(cmd: Command, json: bool) -> AnyhowResult {
    let runtime = Runtime::new().expect("Unable to create a runtime");
    let report = match cmd {
        Command::Fetch(opts) => runtime.block_on(async { fetch::exec(opts).await })?,
        Command::Install(opts) => runtime.block_on(async { install::exec(opts).await })?,
        Command::Split(opts) => split::exec(opts)?,
    };
    if json {
        print(&report)
    } else {
        describe(&report);
        Ok(())
    }
}

/// Where and how the PEM files are written.
#[derive(Args, Debug)]
pub struct OutputOpts {
    /// Directory to install into. Created owner-only if it does not exist.
    /// [default: ./ssl]
    #[clap(long, env = "INSTALL_PATH")]
    install_path: Option<PathBuf>,

    /// Prefix for the installed file names. [default: az-secret]
    #[clap(long, env = "INSTALL_NAME")]
    install_name: Option<String>,

    /// Also write <prefix>.bundle.pem: the chain followed by the private key.
    #[clap(long)]
    bundle: bool,

    /// Order of the certificates in the chain and bundle files.
    #[clap(long, value_enum, default_value_t = ChainOrder::AsExtracted)]
    chain_order: ChainOrder,

    /// File name of the chain: <prefix>.fullchain.pem or <prefix>.cert.crt.
    #[clap(long, value_enum, default_value_t = ChainNaming::Fullchain)]
    chain_name: ChainNaming,
}

impl OutputOpts {
    fn config(&self) -> InstallConfig {
        // INSTALL_PATH may carry surrounding whitespace
        let install_path = self.install_path.as_deref().map(|p| match p.to_str() {
            Some(s) => PathBuf::from(s.trim()),
            None => p.to_path_buf(),
        });
        let mut config = InstallConfig::new(InstallTarget::new(
            install_path.as_deref(),
            self.install_name.as_deref(),
        ));
        config.bundle = self.bundle;
        config.chain_order = self.chain_order;
        config.chain_naming = self.chain_name;
        config
    }
}

/// How the PKCS#12 container is unwrapped.
#[derive(Args, Debug)]
pub struct DecodeOpts {
    /// The openssl binary used to unwrap the container.
    #[clap(long, env = "CERTFETCH_OPENSSL", default_value = "openssl")]
    openssl: PathBuf,

    /// Pass -legacy to openssl. OpenSSL 3 needs this for containers
    /// encrypted with RC2 or 3DES.
    #[clap(long)]
    legacy: bool,

    /// Read the container passphrase from this environment variable.
    /// Without it the container is expected to have no export password.
    #[clap(long, conflicts_with = "ask_passphrase")]
    passphrase_env: Option<String>,

    /// Prompt for the container passphrase.
    #[clap(long)]
    ask_passphrase: bool,

    /// What to do with the container file once the PEM files are written.
    #[clap(long, value_enum, default_value_t = ContainerDisposition::Delete)]
    container: ContainerDisposition,
}

impl DecodeOpts {
    fn decoder(&self) -> OpenSslDecoder {
        OpenSslDecoder::new(&self.openssl).with_legacy(self.legacy)
    }

    fn passphrase(&self) -> AnyhowResult<String> {
        if let Some(var) = &self.passphrase_env {
            std::env::var(var).with_context(|| format!("Environment variable {var} is not set"))
        } else if self.ask_passphrase {
            rpassword::prompt_password("PKCS#12 passphrase: ")
                .context("Couldn't read the passphrase")
        } else {
            Ok(String::new())
        }
    }
}

fn install_config(output: &OutputOpts, decode: &DecodeOpts) -> AnyhowResult<InstallConfig> {
    let mut config = output.config();
    config.container = decode.container;
    config.passphrase = decode.passphrase()?;
    Ok(config)
}

fn failed(failure: PipelineFailure) -> anyhow::Error {
    tracing::error!(stage = %failure.stage, kind = ?failure.kind(), "installation aborted");
    failure.into()
}

fn describe(report: &InstallReport) {
    if let Some(dir) = &report.created_dir {
        eprintln!("Directory [{}] created!", dir.display());
    }
    for artifact in &report.artifacts {
        let what = match artifact.role {
            ArtifactRole::PrivateKey => "private key",
            ArtifactRole::Chain => "certificate chain",
            ArtifactRole::Bundle => "bundle",
        };
        eprintln!(
            "Wrote {what} ({} block{}) to {} with mode {:04o}",
            artifact.blocks,
            if artifact.blocks == 1 { "" } else { "s" },
            artifact.path.display(),
            artifact.mode
        );
    }
    if let Some(container) = &report.container {
        match container.disposition {
            ContainerDisposition::Delete => {
                eprintln!("Removed container {}", container.path.display())
            }
            ContainerDisposition::Restrict => eprintln!(
                "Kept container {} with mode {:04o}",
                container.path.display(),
                container.mode
            ),
        }
    }
}

// Using println! for printing to STDOUT and piping it to other tools leads to
// the problem that when the other tool closes its stream, the println! macro
// panics on the error and the whole binary crashes. This function provides a
// graceful handling of the error.
fn print<T>(arg: &T) -> AnyhowResult
where
    T: ?Sized + serde::ser::Serialize,
{
    let mut json = serde_json::to_string_pretty(&arg)?;
    json.push('\n');
    if let Err(e) = io::stdout().write_all(json.as_bytes()) {
        if e.kind() != std::io::ErrorKind::BrokenPipe {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
    Ok(())
}
