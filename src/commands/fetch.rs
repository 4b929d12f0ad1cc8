use crate::commands::{failed, install_config, DecodeOpts, OutputOpts};
use crate::lib::{
    secret_store::{AzureKeyVaultStore, EnvSecretStore, TokenSource},
    AnyhowResult, InstallReport, Pipeline, SecretStore,
};
use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use indicatif::ProgressBar;
use std::time::Duration;

/// Fetches a PKCS#12 bundle from a secret store and installs its private key
/// and certificate chain as PEM files.
#[derive(Parser, Debug)]
pub struct FetchOpts {
    /// Name of the secret holding the base64-encoded PKCS#12 bundle.
    #[clap(long, env = "SECRET_NAME")]
    secret_name: String,

    /// Where the secret is stored.
    #[clap(long, value_enum, default_value_t = StoreKind::AzureKeyVault)]
    store: StoreKind,

    /// Name of the Azure Key Vault (https://<name>.vault.azure.net).
    /// Sign-in uses AZURE_ACCESS_TOKEN if set, then a service principal from
    /// AZURE_TENANT_ID, AZURE_CLIENT_ID and AZURE_CLIENT_SECRET, then the
    /// managed identity of the host.
    #[clap(long, env = "KEYVAULT_NAME")]
    keyvault_name: Option<String>,

    /// Full URL of the Key Vault, for vaults outside the public cloud.
    #[clap(long, env = "KEYVAULT_URL", conflicts_with = "keyvault_name")]
    keyvault_url: Option<String>,

    #[clap(flatten)]
    output: OutputOpts,

    #[clap(flatten)]
    decode: DecodeOpts,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StoreKind {
    AzureKeyVault,
    /// CERTFETCH_SECRET_<NAME> environment variables. For development only.
    Env,
}

pub async fn exec(opts: FetchOpts) -> AnyhowResult<InstallReport> {
    let store: Box<dyn SecretStore> = match opts.store {
        StoreKind::AzureKeyVault => {
            let token = TokenSource::from_env();
            let store = match (&opts.keyvault_url, &opts.keyvault_name) {
                (Some(url), _) => AzureKeyVaultStore::with_vault_url(url, token),
                (None, Some(name)) => AzureKeyVaultStore::new(name, token),
                (None, None) => bail!(
                    "--keyvault-name (or KEYVAULT_NAME) is required for the Azure Key Vault store"
                ),
            };
            Box::new(store.context("Failed to set up the Key Vault client")?)
        }
        StoreKind::Env => Box::new(EnvSecretStore),
    };
    let config = install_config(&opts.output, &opts.decode)?;
    let decoder = opts.decode.decoder();

    let spinner = ProgressBar::new_spinner();
    spinner.set_message(format!(
        "Fetching {} from {}...",
        opts.secret_name,
        store.describe()
    ));
    spinner.enable_steady_tick(Duration::from_millis(100));
    let result = Pipeline::new(&config)
        .run(store.as_ref(), opts.secret_name.trim(), &decoder)
        .await;
    spinner.finish_and_clear();
    result.map_err(failed)
}
