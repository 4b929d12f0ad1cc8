//! Turns extracted PEM blocks into the files to install.
//!
//! No I/O happens here; the result is a list of [`Artifact`]s for the writer.

use std::path::PathBuf;

use clap::ValueEnum;
use itertools::Itertools;
use serde::Serialize;

use super::{
    config::InstallConfig,
    error::InstallError,
    pem_blocks::{BlockKind, PemBlock},
    OWNER_ONLY_MODE, WORLD_READABLE_MODE,
};

/// Whether an artifact carries key material.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactClass {
    /// Contains a private key; owner access only.
    Secret,
    /// Certificates only; readable by everyone.
    Public,
}

impl ArtifactClass {
    pub fn mode(self) -> u32 {
        match self {
            ArtifactClass::Secret => OWNER_ONLY_MODE,
            ArtifactClass::Public => WORLD_READABLE_MODE,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactRole {
    PrivateKey,
    Chain,
    Bundle,
}

/// Order of the certificates in the chain and bundle artifacts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChainOrder {
    /// Keep the order the decoder emitted.
    #[default]
    AsExtracted,
    /// Reverse the decoder's order.
    Reversed,
}

/// A file to be written, with the content and class that decide its mode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Artifact {
    pub role: ArtifactRole,
    pub class: ArtifactClass,
    pub path: PathBuf,
    pub content: String,
    /// Number of PEM blocks in `content`.
    pub blocks: usize,
}

/// Builds the artifact set for one installation.
///
/// Both the key and the certificate sequences must be non-empty; an
/// installation missing either is refused with [`InstallError::ExtractionEmpty`]
/// before any artifact is produced.
pub fn assemble(
    keys: &[PemBlock],
    certs: &[PemBlock],
    config: &InstallConfig,
) -> Result<Vec<Artifact>, InstallError> {
    if keys.is_empty() {
        return Err(InstallError::ExtractionEmpty {
            kind: BlockKind::PrivateKey,
        });
    }
    if certs.is_empty() {
        return Err(InstallError::ExtractionEmpty {
            kind: BlockKind::Certificate,
        });
    }

    debug_assert!(keys.iter().all(|b| b.kind() == BlockKind::PrivateKey));
    debug_assert!(certs.iter().all(|b| b.kind() == BlockKind::Certificate));

    let chain: Vec<&PemBlock> = match config.chain_order {
        ChainOrder::AsExtracted => certs.iter().collect(),
        ChainOrder::Reversed => certs.iter().rev().collect(),
    };
    let target = &config.target;

    let mut artifacts = vec![
        Artifact {
            role: ArtifactRole::PrivateKey,
            class: ArtifactClass::Secret,
            path: target.private_key_path(),
            content: join_blocks(keys.iter()),
            blocks: keys.len(),
        },
        Artifact {
            role: ArtifactRole::Chain,
            class: ArtifactClass::Public,
            path: target.chain_path(config.chain_naming),
            content: join_blocks(chain.iter().copied()),
            blocks: chain.len(),
        },
    ];
    if config.bundle {
        artifacts.push(Artifact {
            role: ArtifactRole::Bundle,
            class: ArtifactClass::Secret,
            path: target.bundle_path(),
            content: join_blocks(chain.iter().copied().chain(keys)),
            blocks: chain.len() + keys.len(),
        });
    }
    Ok(artifacts)
}

// blocks joined by newlines, with one trailing newline
fn join_blocks<'a>(blocks: impl Iterator<Item = &'a PemBlock>) -> String {
    let mut content = blocks.map(PemBlock::text).join("\n");
    content.push('\n');
    content
}
