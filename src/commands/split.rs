use crate::commands::{failed, OutputOpts};
use crate::lib::{AnyhowResult, InstallReport, Pipeline};
use crate::read_file;
use clap::Parser;
use std::path::PathBuf;

/// Splits already decoded PEM text, such as the output of
/// `openssl pkcs12 -nodes`, into private key and certificate chain files.
#[derive(Parser, Debug)]
pub struct SplitOpts {
    /// Path to the PEM text (use "-" for STDIN).
    input: PathBuf,

    #[clap(flatten)]
    output: OutputOpts,
}

pub fn exec(opts: SplitOpts) -> AnyhowResult<InstallReport> {
    let text = read_file(&opts.input, "PEM")?;
    let config = opts.output.config();
    Pipeline::new(&config).split(&text).map_err(failed)
}
