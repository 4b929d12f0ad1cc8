//! Error types for the installation pipeline.

use std::{io, path::PathBuf};

use itertools::Itertools;
use serde::Serialize;
use thiserror::Error;

use super::{
    decode::DecodeMode, format_mode, pem_blocks::BlockKind, pipeline::Stage,
    secret_store::SecretStoreError,
};

/// The broad category of a failure, as reported to the user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    FetchFailure,
    DecodeFailure,
    ExtractionEmpty,
    WriteFailure,
    PermissionFailure,
}

/// Errors that can occur while turning a PKCS#12 bundle into installed PEM files.
#[derive(Error, Debug)]
pub enum InstallError {
    /// The secret store could not produce the bundle, or it was not valid base64.
    #[error("could not fetch secret '{identifier}'")]
    Fetch {
        identifier: String,
        #[source]
        source: SecretStoreError,
    },

    /// The external decoder failed or could not be started.
    #[error("PKCS#12 decode ({mode}) failed: {reason}")]
    Decode { mode: DecodeMode, reason: String },

    /// Decoding succeeded but produced no blocks of a required kind.
    #[error("no {kind} blocks found in the decoded bundle")]
    ExtractionEmpty { kind: BlockKind },

    /// A file or directory could not be created or written.
    #[error("failed to write {}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The content was written but the required mode could not be applied.
    #[error("wrote {} but could not set mode {}", path.display(), format_mode(*mode))]
    Permission {
        path: PathBuf,
        mode: u32,
        #[source]
        source: io::Error,
    },

    /// The transient container could not be removed after processing.
    #[error("failed to remove {}", path.display())]
    Cleanup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Keeping the container would overwrite the file the bundle was read from.
    #[error("refusing to keep the container at {}: it is the input file", path.display())]
    ContainerIsInput { path: PathBuf },

    /// More than one artifact failed to install.
    #[error("{} artifacts failed: {}", .0.len(), describe_all(.0))]
    Artifacts(Vec<InstallError>),
}

impl InstallError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            InstallError::Fetch { .. } => ErrorKind::FetchFailure,
            InstallError::Decode { .. } => ErrorKind::DecodeFailure,
            InstallError::ExtractionEmpty { .. } => ErrorKind::ExtractionEmpty,
            InstallError::Write { .. }
            | InstallError::Cleanup { .. }
            | InstallError::ContainerIsInput { .. } => ErrorKind::WriteFailure,
            InstallError::Permission { .. } => ErrorKind::PermissionFailure,
            // under-protected content outranks a plain write error
            InstallError::Artifacts(errors) => {
                if errors
                    .iter()
                    .any(|e| e.kind() == ErrorKind::PermissionFailure)
                {
                    ErrorKind::PermissionFailure
                } else {
                    ErrorKind::WriteFailure
                }
            }
        }
    }

    pub(crate) fn write(path: impl Into<PathBuf>, source: io::Error) -> Self {
        InstallError::Write {
            path: path.into(),
            source,
        }
    }
}

fn describe_all(errors: &[InstallError]) -> String {
    errors
        .iter()
        .map(|e| match std::error::Error::source(e) {
            Some(source) => format!("{e}: {source}"),
            None => e.to_string(),
        })
        .join("; ")
}

/// A pipeline run that ended in the `Failed` state.
#[derive(Error, Debug)]
#[error("{stage} failed")]
pub struct PipelineFailure {
    /// The stage that was active when the failure happened.
    pub stage: Stage,
    #[source]
    pub error: InstallError,
}

impl PipelineFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_error(path: &str) -> InstallError {
        InstallError::write(path, io::Error::new(io::ErrorKind::Other, "disk full"))
    }

    #[test]
    fn aggregate_kind_prefers_permission_failures() {
        let errors = InstallError::Artifacts(vec![
            write_error("/tmp/a.pem"),
            InstallError::Permission {
                path: "/tmp/b.pem".into(),
                mode: 0o600,
                source: io::Error::new(io::ErrorKind::PermissionDenied, "nope"),
            },
        ]);
        assert_eq!(errors.kind(), ErrorKind::PermissionFailure);

        let errors = InstallError::Artifacts(vec![write_error("/tmp/a.pem"), write_error("/b")]);
        assert_eq!(errors.kind(), ErrorKind::WriteFailure);
    }

    #[test]
    fn aggregate_message_names_every_path() {
        let errors = InstallError::Artifacts(vec![write_error("/tmp/a.pem"), write_error("/b")]);
        let message = errors.to_string();
        assert!(message.starts_with("2 artifacts failed"));
        assert!(message.contains("/tmp/a.pem: disk full"));
        assert!(message.contains("/b: disk full"));
    }

    #[test]
    fn permission_message_shows_octal_mode() {
        let error = InstallError::Permission {
            path: "/srv/ssl/site.privkey.pem".into(),
            mode: 0o600,
            source: io::Error::new(io::ErrorKind::PermissionDenied, "nope"),
        };
        assert_eq!(
            error.to_string(),
            "wrote /srv/ssl/site.privkey.pem but could not set mode 0600"
        );
    }
}
