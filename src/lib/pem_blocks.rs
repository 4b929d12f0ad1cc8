//! Splits decoded PKCS#12 output into PEM blocks by their armor markers.
//!
//! This is text scanning only. Nothing here looks inside a block, so an
//! unparseable key or certificate is carried through untouched.

use std::fmt;

use serde::Serialize;
use tracing::warn;

/// The block types the extractor recognizes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    PrivateKey,
    Certificate,
}

impl BlockKind {
    /// The label used inside the `-----BEGIN <label>-----` marker.
    pub fn label(self) -> &'static str {
        match self {
            BlockKind::PrivateKey => "PRIVATE KEY",
            BlockKind::Certificate => "CERTIFICATE",
        }
    }

    fn begin_marker(self) -> String {
        format!("-----BEGIN {}-----", self.label())
    }

    fn end_marker(self) -> String {
        format!("-----END {}-----", self.label())
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockKind::PrivateKey => f.write_str("private key"),
            BlockKind::Certificate => f.write_str("certificate"),
        }
    }
}

/// One armored object, markers included.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PemBlock {
    kind: BlockKind,
    text: String,
}

impl PemBlock {
    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    /// The literal block text, from the first dash of the BEGIN marker to the
    /// last dash of the END marker.
    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Returns every `kind` block in `text`, in the order they appear.
///
/// Each block runs from a BEGIN marker to the nearest following END marker of
/// the same type. Anything between blocks is skipped. If a BEGIN marker is
/// never closed, a second BEGIN shows up before the END, or an END appears
/// outside a block, the input is treated as malformed and no blocks of that
/// kind are returned at all.
pub fn extract_blocks(text: &str, kind: BlockKind) -> Vec<PemBlock> {
    let begin = kind.begin_marker();
    let end = kind.end_marker();

    let mut blocks = vec![];
    let mut rest = text;
    while let Some(start) = rest.find(&begin) {
        if rest[..start].contains(&end) {
            warn!(%kind, "END marker without BEGIN; ignoring all {} blocks", kind);
            return vec![];
        }
        let after_begin = start + begin.len();
        let Some(close) = rest[after_begin..].find(&end) else {
            warn!(%kind, "unterminated PEM block; ignoring all {} blocks", kind);
            return vec![];
        };
        if rest[after_begin..after_begin + close].contains(&begin) {
            warn!(%kind, "nested BEGIN marker; ignoring all {} blocks", kind);
            return vec![];
        }
        let stop = after_begin + close + end.len();
        blocks.push(PemBlock {
            kind,
            text: rest[start..stop].to_owned(),
        });
        rest = &rest[stop..];
    }
    if rest.contains(&end) {
        warn!(%kind, "END marker without BEGIN; ignoring all {} blocks", kind);
        return vec![];
    }
    blocks
}
