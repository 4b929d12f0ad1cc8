use crate::commands::{failed, install_config, DecodeOpts, OutputOpts};
use crate::lib::{
    secret_store::{FileEncoding, FileSecretStore},
    AnyhowResult, InstallReport, Pipeline,
};
use clap::Parser;
use std::path::PathBuf;

/// Installs the private key and certificate chain of a local PKCS#12 file.
#[derive(Parser, Debug)]
pub struct InstallOpts {
    /// Path to the .pfx/.p12 file.
    input: PathBuf,

    /// The file holds base64 text, as exported from a secret store, instead
    /// of the binary container.
    #[clap(long)]
    base64: bool,

    #[clap(flatten)]
    output: OutputOpts,

    #[clap(flatten)]
    decode: DecodeOpts,
}

pub async fn exec(opts: InstallOpts) -> AnyhowResult<InstallReport> {
    let encoding = if opts.base64 {
        FileEncoding::Base64
    } else {
        FileEncoding::Binary
    };
    let store = FileSecretStore::new(&opts.input, encoding);
    let config = install_config(&opts.output, &opts.decode)?;
    let decoder = opts.decode.decoder();

    let identifier = opts.input.display().to_string();
    Pipeline::new(&config)
        .run(&store, &identifier, &decoder)
        .await
        .map_err(failed)
}
