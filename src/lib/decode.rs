//! Unwrapping PKCS#12 containers into PEM text.
//!
//! The container format itself is never parsed here. Decoding is delegated to
//! an external tool behind the [`Pkcs12Decoder`] trait; the shipped
//! implementation runs `openssl pkcs12`.

use std::{
    fmt,
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tracing::debug;

use super::error::InstallError;

/// Name of the environment variable the passphrase is handed over in, so it
/// never shows up in the child's argument list.
pub const PASSPHRASE_VAR: &str = "CERTFETCH_PKCS12_PASSPHRASE";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecodeMode {
    /// Only the private key(s), unencrypted.
    KeysOnly,
    /// Only the certificates.
    CertsOnly,
}

impl fmt::Display for DecodeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeMode::KeysOnly => f.write_str("keys only"),
            DecodeMode::CertsOnly => f.write_str("certificates only"),
        }
    }
}

/// Something that can turn a PKCS#12 container file into PEM text.
///
/// Implementations only read the container, so two decodes of the same file
/// may run at once.
#[async_trait]
pub trait Pkcs12Decoder: Send + Sync {
    async fn decode(
        &self,
        container: &Path,
        passphrase: &str,
        mode: DecodeMode,
    ) -> Result<String, InstallError>;
}

/// Decodes with the `openssl` command line tool.
#[derive(Clone, Debug)]
pub struct OpenSslDecoder {
    program: PathBuf,
    legacy: bool,
}

impl Default for OpenSslDecoder {
    fn default() -> Self {
        Self::new("openssl")
    }
}

impl OpenSslDecoder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            legacy: false,
        }
    }

    /// Passes `-legacy`, which OpenSSL 3 needs for containers using RC2/3DES.
    pub fn with_legacy(mut self, legacy: bool) -> Self {
        self.legacy = legacy;
        self
    }

    fn command(&self, container: &Path, passphrase: &str, mode: DecodeMode) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("pkcs12").arg("-in").arg(container);
        match mode {
            DecodeMode::KeysOnly => cmd.args(["-nocerts", "-nodes"]),
            DecodeMode::CertsOnly => cmd.arg("-nokeys"),
        };
        if self.legacy {
            cmd.arg("-legacy");
        }
        cmd.arg("-passin")
            .arg(format!("env:{PASSPHRASE_VAR}"))
            .env(PASSPHRASE_VAR, passphrase)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Pkcs12Decoder for OpenSslDecoder {
    async fn decode(
        &self,
        container: &Path,
        passphrase: &str,
        mode: DecodeMode,
    ) -> Result<String, InstallError> {
        debug!(program = %self.program.display(), %mode, "running pkcs12 decode");
        let output = self
            .command(container, passphrase, mode)
            .output()
            .await
            .map_err(|e| InstallError::Decode {
                mode,
                reason: format!("could not run {}: {e}", self.program.display()),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(InstallError::Decode {
                mode,
                reason: format!("{} exited with {}: {}", self.program.display(), output.status, stderr.trim()),
            });
        }
        String::from_utf8(output.stdout).map_err(|_| InstallError::Decode {
            mode,
            reason: "output is not valid UTF-8".to_owned(),
        })
    }
}
