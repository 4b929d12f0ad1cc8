//! All the common functionality.

pub mod assemble;
pub mod config;
pub mod decode;
pub mod error;
pub mod pem_blocks;
pub mod pipeline;
pub mod secret_store;
pub mod writer;

pub use assemble::{ArtifactRole, ChainOrder};
pub use config::{ChainNaming, ContainerDisposition, InstallConfig, InstallTarget};
pub use decode::OpenSslDecoder;
pub use error::PipelineFailure;
pub use pipeline::{InstallReport, Pipeline};
pub use secret_store::SecretStore;

/// The type to represent results of the command layer.
pub type AnyhowResult<T = ()> = anyhow::Result<T>;

/// Owner read/write, nothing for group or other.
pub const OWNER_ONLY_MODE: u32 = 0o600;
/// Owner read/write, read for everyone else.
pub const WORLD_READABLE_MODE: u32 = 0o644;
/// Owner read/write, group read. Used for a kept PKCS#12 container.
pub const GROUP_READABLE_MODE: u32 = 0o640;
/// Mode for install directories created by this tool.
pub const PRIVATE_DIR_MODE: u32 = 0o700;

pub(crate) fn format_mode(mode: u32) -> String {
    format!("{mode:04o}")
}

pub(crate) fn serialize_mode<S: serde::Serializer>(mode: &u32, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format_mode(*mode))
}
