//! Resolved installation settings.
//!
//! The command layer builds an [`InstallConfig`] once from flags and
//! environment; every pipeline stage borrows it and nothing mutates it.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use clap::ValueEnum;
use serde::Serialize;
use tracing::{info, warn};

use super::{assemble::ChainOrder, error::InstallError};

pub const DEFAULT_INSTALL_DIR: &str = "ssl";
pub const DEFAULT_PREFIX: &str = "az-secret";

/// File extension used for the certificate chain artifact.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChainNaming {
    /// `<prefix>.fullchain.pem`
    #[default]
    Fullchain,
    /// `<prefix>.cert.crt`
    Crt,
}

/// What happens to the PKCS#12 container file once the artifacts are written.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContainerDisposition {
    /// Remove the container.
    #[default]
    Delete,
    /// Keep the container, readable by owner and group only.
    Restrict,
}

/// The output directory and the prefix shared by every artifact name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstallTarget {
    dir: PathBuf,
    prefix: String,
}

impl InstallTarget {
    /// Blank values fall back to `./ssl` and `az-secret`.
    pub fn new(dir: Option<&Path>, prefix: Option<&str>) -> Self {
        let dir = dir
            .filter(|d| !d.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_INSTALL_DIR));
        let prefix = prefix
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_PREFIX)
            .to_owned();
        Self { dir, prefix }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn private_key_path(&self) -> PathBuf {
        self.file(".privkey.pem")
    }

    pub fn chain_path(&self, naming: ChainNaming) -> PathBuf {
        match naming {
            ChainNaming::Fullchain => self.file(".fullchain.pem"),
            ChainNaming::Crt => self.file(".cert.crt"),
        }
    }

    pub fn bundle_path(&self) -> PathBuf {
        self.file(".bundle.pem")
    }

    pub fn container_path(&self) -> PathBuf {
        self.file(".pfx")
    }

    fn file(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}{}", self.prefix, suffix))
    }

    /// Makes sure the output directory exists.
    ///
    /// Missing directories are created owner-only. If creation fails part way,
    /// whatever was created by this call is removed again. Returns the
    /// outermost directory this call created, if any.
    pub fn ensure_dir(&self) -> Result<Option<PathBuf>, InstallError> {
        if self.dir.is_dir() {
            return Ok(None);
        }
        let first_missing = self
            .dir
            .ancestors()
            .take_while(|a| !a.as_os_str().is_empty() && !a.exists())
            .last()
            .map(Path::to_path_buf);

        if let Err(source) = create_private_dir_all(&self.dir) {
            if let Some(first_missing) = first_missing {
                let _ = fs::remove_dir_all(first_missing);
            }
            return Err(InstallError::write(&self.dir, source));
        }
        info!(dir = %self.dir.display(), "created install directory");
        Ok(first_missing)
    }

    /// Undoes [`ensure_dir`](Self::ensure_dir): removes the output directory
    /// and its parents up to and including `created`. Only empty directories
    /// are removed.
    pub fn remove_created_dirs(&self, created: &Path) {
        for dir in self.dir.ancestors() {
            if let Err(e) = fs::remove_dir(dir) {
                warn!(dir = %dir.display(), error = %e, "could not remove install directory");
                return;
            }
            if dir == created {
                return;
            }
        }
    }
}

#[cfg(unix)]
fn create_private_dir_all(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new()
        .recursive(true)
        .mode(super::PRIVATE_DIR_MODE)
        .create(dir)
}

#[cfg(not(unix))]
fn create_private_dir_all(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)
}

/// Everything a pipeline run needs to know, resolved once at startup.
#[derive(Clone)]
pub struct InstallConfig {
    pub target: InstallTarget,
    pub chain_order: ChainOrder,
    pub chain_naming: ChainNaming,
    /// Also write `<prefix>.bundle.pem` with the chain followed by the key.
    pub bundle: bool,
    pub container: ContainerDisposition,
    /// Passphrase for the PKCS#12 container; empty for unprotected exports.
    pub passphrase: String,
}

impl InstallConfig {
    pub fn new(target: InstallTarget) -> Self {
        Self {
            target,
            chain_order: ChainOrder::default(),
            chain_naming: ChainNaming::default(),
            bundle: false,
            container: ContainerDisposition::default(),
            passphrase: String::new(),
        }
    }
}

impl fmt::Debug for InstallConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallConfig")
            .field("target", &self.target)
            .field("chain_order", &self.chain_order)
            .field("chain_naming", &self.chain_naming)
            .field("bundle", &self.bundle)
            .field("container", &self.container)
            .field("passphrase", &"<redacted>")
            .finish()
    }
}
