//! The installation pipeline.
//!
//! A run moves strictly forward through the [`Stage`]s. The first failure
//! ends it with a [`PipelineFailure`] naming the stage it happened in;
//! nothing after that stage runs. The PKCS#12 container written during
//! decoding is removed on every failure path.

use std::{
    fmt, fs,
    io::Write,
    path::{Path, PathBuf},
};

use scopeguard::ScopeGuard;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::{
    assemble::{assemble, Artifact},
    config::{ContainerDisposition, InstallConfig},
    decode::{DecodeMode, Pkcs12Decoder},
    error::{InstallError, PipelineFailure},
    pem_blocks::{extract_blocks, BlockKind},
    secret_store::{SecretStore, SecretStoreError},
    serialize_mode,
    writer::{persist_with_mode, private_temp_file, write_artifacts, WrittenArtifact},
    GROUP_READABLE_MODE, OWNER_ONLY_MODE,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    FetchingSecret,
    DecodingContainer,
    ExtractingBlocks,
    AssemblingArtifacts,
    WritingArtifacts,
    CleaningUp,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::FetchingSecret => "fetching secret",
            Stage::DecodingContainer => "decoding container",
            Stage::ExtractingBlocks => "extracting blocks",
            Stage::AssemblingArtifacts => "assembling artifacts",
            Stage::WritingArtifacts => "writing artifacts",
            Stage::CleaningUp => "cleaning up",
            Stage::Done => "done",
        })
    }
}

/// The raw bytes of a PKCS#12 container.
pub struct EncodedBundle(Vec<u8>);

impl EncodedBundle {
    /// Decodes the secret store's base64 text. Embedded whitespace is ignored.
    pub fn from_base64(text: &str) -> Result<Self, SecretStoreError> {
        let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        Ok(Self(base64::decode(compact)?))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for EncodedBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncodedBundle({} bytes)", self.0.len())
    }
}

/// What became of the container file after a successful run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ContainerOutcome {
    pub path: PathBuf,
    pub disposition: ContainerDisposition,
    #[serde(serialize_with = "serialize_mode")]
    pub mode: u32,
}

/// The result of a successful run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InstallReport {
    pub artifacts: Vec<WrittenArtifact>,
    pub container: Option<ContainerOutcome>,
    /// The install directory, if this run had to create it.
    pub created_dir: Option<PathBuf>,
}

/// One pass from an encoded bundle (or decoded PEM text) to installed files.
pub struct Pipeline<'a> {
    config: &'a InstallConfig,
    stage: Stage,
    created_dir: Option<PathBuf>,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a InstallConfig) -> Self {
        Self {
            config,
            stage: Stage::FetchingSecret,
            created_dir: None,
        }
    }

    fn enter(&mut self, stage: Stage) {
        info!(from = %self.stage, to = %stage, "pipeline transition");
        self.stage = stage;
    }

    fn fail(&self, error: InstallError) -> PipelineFailure {
        debug!(stage = %self.stage, error = %error, "pipeline failed");
        PipelineFailure {
            stage: self.stage,
            error,
        }
    }

    /// Fetches `identifier` from `store` and installs it.
    pub async fn run(
        mut self,
        store: &dyn SecretStore,
        identifier: &str,
        decoder: &dyn Pkcs12Decoder,
    ) -> Result<InstallReport, PipelineFailure> {
        self.enter(Stage::FetchingSecret);
        if self.config.container == ContainerDisposition::Restrict {
            let kept = self.config.target.container_path();
            if store.local_path().is_some_and(|input| same_file(input, &kept)) {
                return Err(self.fail(InstallError::ContainerIsInput { path: kept }));
            }
        }
        info!(source = %store.describe(), identifier, "fetching bundle");
        let bundle = store
            .fetch_secret(identifier)
            .await
            .and_then(|text| EncodedBundle::from_base64(&text))
            .map_err(|source| {
                self.fail(InstallError::Fetch {
                    identifier: identifier.to_owned(),
                    source,
                })
            })?;
        self.install(bundle, decoder).await
    }

    /// Installs an already fetched bundle.
    pub async fn install(
        mut self,
        bundle: EncodedBundle,
        decoder: &dyn Pkcs12Decoder,
    ) -> Result<InstallReport, PipelineFailure> {
        self.enter(Stage::DecodingContainer);
        let config = self.config;
        // directories made only to hold the container go away if no artifact is written
        let created = scopeguard::guard(self.ensure_dir()?, move |created| {
            if let Some(created) = created {
                config.target.remove_created_dirs(&created);
            }
        });

        // removed on drop unless kept at clean-up
        let container = self.write_container(&bundle)?;
        drop(bundle);

        let passphrase = self.config.passphrase.as_str();
        let (keys, certs) = tokio::join!(
            decoder.decode(container.path(), passphrase, DecodeMode::KeysOnly),
            decoder.decode(container.path(), passphrase, DecodeMode::CertsOnly),
        );
        let keys = keys.map_err(|e| self.fail(e))?;
        let certs = certs.map_err(|e| self.fail(e))?;

        let artifacts = self.assemble_artifacts(&keys, &certs)?;
        ScopeGuard::into_inner(created);
        let written = self.write(&artifacts)?;

        self.enter(Stage::CleaningUp);
        let container = self.clean_up(container)?;

        self.enter(Stage::Done);
        Ok(InstallReport {
            artifacts: written,
            container: Some(container),
            created_dir: self.created_dir,
        })
    }

    /// Installs from PEM text that was decoded elsewhere. The same text is
    /// searched for both keys and certificates.
    pub fn split(mut self, text: &str) -> Result<InstallReport, PipelineFailure> {
        let artifacts = self.assemble_artifacts(text, text)?;
        let written = self.write(&artifacts)?;
        self.enter(Stage::Done);
        Ok(InstallReport {
            artifacts: written,
            container: None,
            created_dir: self.created_dir,
        })
    }

    fn ensure_dir(&mut self) -> Result<Option<PathBuf>, PipelineFailure> {
        let created = self.config.target.ensure_dir().map_err(|e| self.fail(e))?;
        if created.is_some() {
            self.created_dir = Some(self.config.target.dir().to_path_buf());
        }
        Ok(created)
    }

    fn write_container(&self, bundle: &EncodedBundle) -> Result<NamedTempFile, PipelineFailure> {
        let dir = self.config.target.dir();
        let mut file = private_temp_file(dir, ".pfx")
            .map_err(|source| self.fail(InstallError::write(dir, source)))?;
        file.write_all(bundle.as_bytes())
            .and_then(|()| file.as_file().sync_all())
            .map_err(|source| self.fail(InstallError::write(dir, source)))?;
        debug!(path = %file.path().display(), "wrote container");
        Ok(file)
    }

    fn assemble_artifacts(
        &mut self,
        keys_text: &str,
        certs_text: &str,
    ) -> Result<Vec<Artifact>, PipelineFailure> {
        self.enter(Stage::ExtractingBlocks);
        let keys = extract_blocks(keys_text, BlockKind::PrivateKey);
        let certs = extract_blocks(certs_text, BlockKind::Certificate);
        info!(
            keys = keys.len(),
            certificates = certs.len(),
            "extracted PEM blocks"
        );

        self.enter(Stage::AssemblingArtifacts);
        assemble(&keys, &certs, self.config).map_err(|e| self.fail(e))
    }

    fn write(&mut self, artifacts: &[Artifact]) -> Result<Vec<WrittenArtifact>, PipelineFailure> {
        self.enter(Stage::WritingArtifacts);
        self.ensure_dir()?;
        let written = write_artifacts(artifacts).map_err(|e| self.fail(e))?;
        for artifact in &written {
            info!(path = %artifact.path.display(), class = ?artifact.class, "installed artifact");
        }
        Ok(written)
    }

    fn clean_up(&self, container: NamedTempFile) -> Result<ContainerOutcome, PipelineFailure> {
        let disposition = self.config.container;
        match disposition {
            ContainerDisposition::Delete => {
                let path = container.path().to_path_buf();
                container.close().map_err(|source| {
                    self.fail(InstallError::Cleanup {
                        path: path.clone(),
                        source,
                    })
                })?;
                info!(path = %path.display(), "removed container");
                Ok(ContainerOutcome {
                    path,
                    disposition,
                    mode: OWNER_ONLY_MODE,
                })
            }
            ContainerDisposition::Restrict => {
                let path = self.config.target.container_path();
                persist_with_mode(container, &path, GROUP_READABLE_MODE)
                    .map_err(|e| self.fail(e))?;
                info!(path = %path.display(), "kept container");
                Ok(ContainerOutcome {
                    path,
                    disposition,
                    mode: GROUP_READABLE_MODE,
                })
            }
        }
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    matches!(
        (fs::canonicalize(a), fs::canonicalize(b)),
        (Ok(a), Ok(b)) if a == b
    )
}
