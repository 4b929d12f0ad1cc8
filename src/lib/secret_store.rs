//! Sources for the base64-encoded PKCS#12 bundle.
//!
//! The pipeline only sees the [`SecretStore`] trait. Three backends ship:
//!
//! - [`AzureKeyVaultStore`]: reads a Key Vault secret over the REST API, signed
//!   in with a static token, a service principal or a managed identity
//! - [`EnvSecretStore`]: reads `CERTFETCH_SECRET_<NAME>` (development only)
//! - [`FileSecretStore`]: reads a local `.pfx` or base64 file
//!
//! Implementations must never log secret values.

use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Environment variable prefix read by [`EnvSecretStore`].
pub const ENV_SECRET_PREFIX: &str = "CERTFETCH_SECRET_";
/// Bearer token for Key Vault, used instead of the managed identity endpoint.
pub const ACCESS_TOKEN_VAR: &str = "AZURE_ACCESS_TOKEN";

const KEY_VAULT_API_VERSION: &str = "7.4";
const KEY_VAULT_RESOURCE: &str = "https://vault.azure.net";
const KEY_VAULT_SCOPE: &str = "https://vault.azure.net/.default";
const IMDS_TOKEN_URL: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

pub type Result<T> = std::result::Result<T, SecretStoreError>;

/// Errors from a secret store backend.
#[derive(Error, Debug)]
pub enum SecretStoreError {
    #[error("secret not found: {identifier}")]
    NotFound { identifier: String },

    #[error("invalid secret name '{identifier}': {reason}")]
    InvalidIdentifier { identifier: String, reason: String },

    #[error("authentication failed: {message}")]
    Authentication { message: String },

    #[error("could not reach secret store: {0}")]
    Connection(#[from] reqwest::Error),

    #[error("secret store returned an error: {message}")]
    Backend { message: String },

    #[error("secret is not valid base64")]
    InvalidEncoding(#[from] base64::DecodeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A place the encoded bundle can be fetched from.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Short human-readable description, e.g. `Azure Key Vault 'prod-kv'`.
    fn describe(&self) -> String;

    /// Returns the base64 text of the secret named `identifier`.
    async fn fetch_secret(&self, identifier: &str) -> Result<String>;

    /// The local file the secret is read from, if there is one.
    fn local_path(&self) -> Option<&Path> {
        None
    }
}

/// Reads secrets from `CERTFETCH_SECRET_<NAME>` environment variables.
#[derive(Debug, Clone, Default)]
pub struct EnvSecretStore;

impl EnvSecretStore {
    /// `site-cert` → `CERTFETCH_SECRET_SITE_CERT`
    pub fn env_var(identifier: &str) -> String {
        format!(
            "{}{}",
            ENV_SECRET_PREFIX,
            identifier.to_uppercase().replace(['-', '.'], "_")
        )
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    fn describe(&self) -> String {
        "environment".to_owned()
    }

    async fn fetch_secret(&self, identifier: &str) -> Result<String> {
        let var = Self::env_var(identifier);
        env::var(&var).map_err(|_| SecretStoreError::NotFound {
            identifier: format!("{identifier} (looked for {var})"),
        })
    }
}

/// How a [`FileSecretStore`] file is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEncoding {
    /// The raw DER container, as exported to a `.pfx`.
    Binary,
    /// Base64 text, as stored in a secret store.
    Base64,
}

/// Reads the bundle from a local file. The identifier is ignored.
#[derive(Debug, Clone)]
pub struct FileSecretStore {
    path: PathBuf,
    encoding: FileEncoding,
}

impl FileSecretStore {
    pub fn new(path: impl Into<PathBuf>, encoding: FileEncoding) -> Self {
        Self {
            path: path.into(),
            encoding,
        }
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }

    async fn fetch_secret(&self, _identifier: &str) -> Result<String> {
        match self.encoding {
            FileEncoding::Binary => Ok(base64::encode(tokio::fs::read(&self.path).await?)),
            FileEncoding::Base64 => Ok(tokio::fs::read_to_string(&self.path).await?),
        }
    }

    fn local_path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

/// Where [`AzureKeyVaultStore`] gets its bearer token.
#[derive(Clone)]
pub enum TokenSource {
    /// A token obtained out of band.
    Static(String),
    /// A service principal signing in with a client secret.
    ClientSecret {
        authority: String,
        tenant_id: String,
        client_id: String,
        client_secret: String,
    },
    /// The instance metadata service of an Azure VM or container.
    ManagedIdentity {
        endpoint: String,
        client_id: Option<String>,
    },
}

impl TokenSource {
    /// Picks the first of these that is configured:
    ///
    /// 1. `AZURE_ACCESS_TOKEN`
    /// 2. `AZURE_TENANT_ID`, `AZURE_CLIENT_ID` and `AZURE_CLIENT_SECRET`,
    ///    against `AZURE_AUTHORITY_HOST` if set
    /// 3. the managed identity, user-assigned if `AZURE_CLIENT_ID` is set
    pub fn from_env() -> Self {
        if let Some(token) = non_empty_var(ACCESS_TOKEN_VAR) {
            return TokenSource::Static(token);
        }
        match (
            non_empty_var("AZURE_TENANT_ID"),
            non_empty_var("AZURE_CLIENT_ID"),
            non_empty_var("AZURE_CLIENT_SECRET"),
        ) {
            (Some(tenant_id), Some(client_id), Some(client_secret)) => TokenSource::ClientSecret {
                authority: non_empty_var("AZURE_AUTHORITY_HOST")
                    .unwrap_or_else(|| DEFAULT_AUTHORITY_HOST.to_owned()),
                tenant_id,
                client_id,
                client_secret,
            },
            (_, client_id, _) => TokenSource::ManagedIdentity {
                endpoint: IMDS_TOKEN_URL.to_owned(),
                client_id,
            },
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

impl std::fmt::Debug for TokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenSource::Static(_) => f.write_str("Static(<redacted>)"),
            TokenSource::ClientSecret {
                authority,
                tenant_id,
                client_id,
                ..
            } => f
                .debug_struct("ClientSecret")
                .field("authority", authority)
                .field("tenant_id", tenant_id)
                .field("client_id", client_id)
                .field("client_secret", &"<redacted>")
                .finish(),
            TokenSource::ManagedIdentity {
                endpoint,
                client_id,
            } => f
                .debug_struct("ManagedIdentity")
                .field("endpoint", endpoint)
                .field("client_id", client_id)
                .finish(),
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct SecretBundle {
    value: Option<String>,
}

#[derive(Deserialize)]
struct KeyVaultErrorBody {
    error: KeyVaultError,
}

#[derive(Deserialize)]
struct KeyVaultError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// Reads secrets from an Azure Key Vault.
#[derive(Debug, Clone)]
pub struct AzureKeyVaultStore {
    label: String,
    vault_url: String,
    token: TokenSource,
    client: Client,
}

impl AzureKeyVaultStore {
    /// The vault at `https://<vault_name>.vault.azure.net`.
    pub fn new(vault_name: &str, token: TokenSource) -> Result<Self> {
        let vault_name = vault_name.trim();
        validate_name(vault_name)?;
        let mut store =
            Self::with_vault_url(&format!("https://{vault_name}.vault.azure.net"), token)?;
        store.label = vault_name.to_owned();
        Ok(store)
    }

    /// A vault at an explicit URL, e.g. in a sovereign cloud.
    pub fn with_vault_url(vault_url: &str, token: TokenSource) -> Result<Self> {
        let vault_url = vault_url.trim().trim_end_matches('/');
        reqwest::Url::parse(vault_url).map_err(|e| SecretStoreError::InvalidIdentifier {
            identifier: vault_url.to_owned(),
            reason: e.to_string(),
        })?;
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            label: vault_url.to_owned(),
            vault_url: vault_url.to_owned(),
            token,
            client,
        })
    }

    fn secret_url(&self, identifier: &str) -> String {
        format!(
            "{}/secrets/{}?api-version={}",
            self.vault_url, identifier, KEY_VAULT_API_VERSION
        )
    }

    async fn access_token(&self) -> Result<String> {
        let request = match &self.token {
            TokenSource::Static(token) => return Ok(token.clone()),
            TokenSource::ClientSecret {
                authority,
                tenant_id,
                client_id,
                client_secret,
            } => {
                debug!(%tenant_id, %client_id, "requesting service principal token");
                let url = format!(
                    "{}/{}/oauth2/v2.0/token",
                    authority.trim_end_matches('/'),
                    tenant_id
                );
                self.client.post(url).form(&[
                    ("grant_type", "client_credentials"),
                    ("client_id", client_id.as_str()),
                    ("client_secret", client_secret.as_str()),
                    ("scope", KEY_VAULT_SCOPE),
                ])
            }
            TokenSource::ManagedIdentity {
                endpoint,
                client_id,
            } => {
                debug!("requesting managed identity token");
                let mut query = vec![
                    ("api-version", "2018-02-01"),
                    ("resource", KEY_VAULT_RESOURCE),
                ];
                if let Some(client_id) = client_id {
                    query.push(("client_id", client_id.as_str()));
                }
                self.client
                    .get(endpoint)
                    .header("Metadata", "true")
                    .query(&query)
            }
        };

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SecretStoreError::Authentication {
                message: format!("token endpoint returned {status}: {}", body.trim()),
            });
        }
        Ok(response.json::<TokenResponse>().await?.access_token)
    }
}

#[async_trait]
impl SecretStore for AzureKeyVaultStore {
    fn describe(&self) -> String {
        format!("Azure Key Vault '{}'", self.label)
    }

    async fn fetch_secret(&self, identifier: &str) -> Result<String> {
        validate_name(identifier)?;
        let token = self.access_token().await?;
        let url = self.secret_url(identifier);
        debug!(%url, "fetching secret");

        let response = self.client.get(&url).bearer_auth(token).send().await?;
        let status = response.status();
        if status.is_success() {
            let bundle: SecretBundle = response.json().await?;
            return bundle.value.ok_or_else(|| SecretStoreError::NotFound {
                identifier: identifier.to_owned(),
            });
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_failure(identifier, status, &body))
    }
}

fn classify_failure(identifier: &str, status: StatusCode, body: &str) -> SecretStoreError {
    let detail = serde_json::from_str::<KeyVaultErrorBody>(body)
        .map(|b| format!("{}: {}", b.error.code, b.error.message))
        .unwrap_or_else(|_| body.trim().to_owned());
    match status {
        StatusCode::NOT_FOUND => SecretStoreError::NotFound {
            identifier: identifier.to_owned(),
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SecretStoreError::Authentication {
            message: format!("{status}: {detail}"),
        },
        _ => SecretStoreError::Backend {
            message: format!("{status}: {detail}"),
        },
    }
}

// Key Vault and vault names: 1-127 alphanumerics and dashes
fn validate_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        Some("must not be empty")
    } else if name.len() > 127 {
        Some("must be at most 127 characters")
    } else if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        Some("may only contain letters, digits and dashes")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(SecretStoreError::InvalidIdentifier {
            identifier: name.to_owned(),
            reason: reason.to_owned(),
        }),
        None => Ok(()),
    }
}
