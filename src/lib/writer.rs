//! Writes files so that their final mode is in place before anyone can open
//! them under their real name.
//!
//! Content goes to an owner-only temporary file in the destination
//! directory. Once written and synced, the final mode is set on the open
//! handle and the file is renamed over the destination. A reader of the
//! destination path sees either the previous file or the complete new one.

use std::{
    fs::File,
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::{
    assemble::{Artifact, ArtifactClass, ArtifactRole},
    error::InstallError,
    serialize_mode,
};

/// What was installed for one artifact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WrittenArtifact {
    pub role: ArtifactRole,
    pub class: ArtifactClass,
    pub path: PathBuf,
    #[serde(serialize_with = "serialize_mode")]
    pub mode: u32,
    pub blocks: usize,
}

/// Creates an empty temporary file in `dir` that only the owner can open.
///
/// The file is removed when the handle is dropped unless it is persisted.
pub fn private_temp_file(dir: &Path, suffix: &str) -> io::Result<NamedTempFile> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(".certfetch-").suffix(suffix);
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(std::fs::Permissions::from_mode(super::OWNER_ONLY_MODE));
    }
    builder.tempfile_in(dir)
}

/// Writes `contents` to `path` and leaves it with exactly `mode`.
///
/// Any existing file at `path` is replaced. If the mode cannot be applied
/// the content never reaches `path` and [`InstallError::Permission`] is
/// returned.
pub fn write_with_mode(path: &Path, contents: &[u8], mode: u32) -> Result<(), InstallError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut file =
        private_temp_file(dir, ".tmp").map_err(|source| InstallError::write(path, source))?;
    file.write_all(contents)
        .and_then(|()| file.as_file().sync_all())
        .map_err(|source| InstallError::write(path, source))?;
    persist_with_mode(file, path, mode)
}

/// Sets `mode` on a written temporary file and renames it to `path`.
pub fn persist_with_mode(file: NamedTempFile, path: &Path, mode: u32) -> Result<(), InstallError> {
    persist_with(file, path, mode, set_mode)
}

fn persist_with(
    file: NamedTempFile,
    path: &Path,
    mode: u32,
    set_mode: impl FnOnce(&File, u32) -> io::Result<()>,
) -> Result<(), InstallError> {
    // on error the handle is dropped here, which removes the temporary file
    set_mode(file.as_file(), mode).map_err(|source| InstallError::Permission {
        path: path.to_path_buf(),
        mode,
        source,
    })?;
    file.persist(path)
        .map_err(|e| InstallError::write(path, e.error))?;
    debug!(path = %path.display(), mode = %super::format_mode(mode), "wrote file");
    Ok(())
}

#[cfg(unix)]
fn set_mode(file: &File, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_file: &File, mode: u32) -> io::Result<()> {
    warn!(
        mode = %super::format_mode(mode),
        "file modes are not supported on this platform"
    );
    Ok(())
}

/// Writes one artifact with the mode its class requires.
pub fn write_artifact(artifact: &Artifact) -> Result<WrittenArtifact, InstallError> {
    let mode = artifact.class.mode();
    write_with_mode(&artifact.path, artifact.content.as_bytes(), mode)?;
    Ok(WrittenArtifact {
        role: artifact.role,
        class: artifact.class,
        path: artifact.path.clone(),
        mode,
        blocks: artifact.blocks,
    })
}

/// Writes every artifact, continuing past failures.
///
/// Succeeds only if all of them were written. A single failure is returned
/// as-is; several are collected into [`InstallError::Artifacts`].
pub fn write_artifacts(artifacts: &[Artifact]) -> Result<Vec<WrittenArtifact>, InstallError> {
    let mut written = Vec::with_capacity(artifacts.len());
    let mut errors = vec![];
    for artifact in artifacts {
        match write_artifact(artifact) {
            Ok(done) => written.push(done),
            Err(e) => {
                warn!(path = %artifact.path.display(), error = %e, "artifact not installed");
                errors.push(e);
            }
        }
    }
    match errors.len() {
        0 => Ok(written),
        1 => Err(errors.remove(0)),
        _ => Err(InstallError::Artifacts(errors)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lib::{error::ErrorKind, OWNER_ONLY_MODE, WORLD_READABLE_MODE};
    use pretty_assertions::assert_eq;
    use std::fs;

    fn artifact(path: PathBuf, class: ArtifactClass, content: &str) -> Artifact {
        Artifact {
            role: ArtifactRole::Chain,
            class,
            path,
            content: content.to_owned(),
            blocks: 1,
        }
    }

    #[cfg(unix)]
    fn mode_of(path: &Path) -> u32 {
        use std::os::unix::fs::PermissionsExt;
        fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[test]
    fn round_trip_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let content = "-----BEGIN CERTIFICATE-----\r\nXYZ\r\n-----END CERTIFICATE-----\n";
        let artifact = artifact(dir.path().join("c.pem"), ArtifactClass::Public, content);

        let written = write_artifact(&artifact).unwrap();
        assert_eq!(written.path, artifact.path);
        assert_eq!(fs::read_to_string(&artifact.path).unwrap(), content);
    }

    #[test]
    fn overwrites_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k.pem");
        fs::write(&path, "old contents that are longer than the new ones").unwrap();

        write_with_mode(&path, b"new", OWNER_ONLY_MODE).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "new");
    }

    #[test]
    fn leaves_no_temporary_files() {
        let dir = tempfile::tempdir().unwrap();
        write_with_mode(&dir.path().join("a.pem"), b"a", OWNER_ONLY_MODE).unwrap();
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("a.pem")]);
    }

    #[cfg(unix)]
    #[test]
    fn modes_follow_class() {
        let dir = tempfile::tempdir().unwrap();
        let secret = artifact(dir.path().join("s.pem"), ArtifactClass::Secret, "s\n");
        let public = artifact(dir.path().join("p.pem"), ArtifactClass::Public, "p\n");

        let written = write_artifacts(&[secret.clone(), public.clone()]).unwrap();
        assert_eq!(written[0].mode, 0o600);
        assert_eq!(written[1].mode, 0o644);
        assert_eq!(mode_of(&secret.path), 0o600);
        assert_eq!(mode_of(&public.path), 0o644);
    }

    #[cfg(unix)]
    #[test]
    fn replacing_a_world_readable_file_tightens_it() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k.pem");
        fs::write(&path, "old").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o666)).unwrap();

        write_with_mode(&path, b"key", OWNER_ONLY_MODE).unwrap();
        assert_eq!(mode_of(&path), 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn persisted_temp_file_gets_final_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.pfx");
        let mut file = private_temp_file(dir.path(), ".pfx").unwrap();
        assert_eq!(mode_of(file.path()), 0o600);
        file.write_all(b"pfx").unwrap();

        persist_with_mode(file, &path, WORLD_READABLE_MODE).unwrap();
        assert_eq!(mode_of(&path), 0o644);
        assert_eq!(fs::read(&path).unwrap(), b"pfx");
    }

    #[test]
    fn failing_to_set_mode_leaves_destination_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k.pem");
        fs::write(&path, "old").unwrap();
        let mut file = private_temp_file(dir.path(), ".tmp").unwrap();
        file.write_all(b"new secret").unwrap();

        let error = persist_with(file, &path, OWNER_ONLY_MODE, |_, _| {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only filesystem"))
        })
        .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::PermissionFailure);
        assert_eq!(error.to_string(), format!("wrote {} but could not set mode 0600", path.display()));
        assert_eq!(fs::read_to_string(&path).unwrap(), "old");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn one_failure_does_not_stop_the_others() {
        let dir = tempfile::tempdir().unwrap();
        let good = artifact(dir.path().join("good.pem"), ArtifactClass::Public, "g\n");
        let bad = artifact(
            dir.path().join("missing/bad.pem"),
            ArtifactClass::Secret,
            "b\n",
        );

        let error = write_artifacts(&[bad, good.clone()]).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::WriteFailure);
        assert!(error.to_string().contains("bad.pem"));
        assert_eq!(fs::read_to_string(&good.path).unwrap(), "g\n");
    }

    #[test]
    fn several_failures_are_collected() {
        let dir = tempfile::tempdir().unwrap();
        let first = artifact(dir.path().join("no/a.pem"), ArtifactClass::Secret, "a\n");
        let second = artifact(dir.path().join("no/b.pem"), ArtifactClass::Public, "b\n");

        match write_artifacts(&[first, second]).unwrap_err() {
            InstallError::Artifacts(errors) => assert_eq!(errors.len(), 2),
            other => panic!("expected aggregated errors, got {other:?}"),
        }
    }
}
