//! Fuzzy anchors
//!
//! Annotations point at lines that move as a file is edited. An [`Anchor`]
//! records the text around the annotated line when it was placed; the matcher
//! finds that text again in the current document with a rolling hash, so
//! whitespace changes and edits elsewhere in the file don't lose the position.
//!
//! Relocation is read-only: it yields a display line and never rewrites the
//! stored anchor. Re-anchoring is an explicit operation on the owner.

mod codec;
pub mod matcher;

pub use codec::{Anchor, DEFAULT_ANCHOR_LINES, MAX_HALF_CHARS};

use thiserror::Error;

/// Errors from anchor handling
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnchorError {
    /// The anchored text could not be found again
    #[error("Anchor not found: {0}")]
    NotFound(String),

    /// The stored anchor could not be parsed
    #[error("Malformed anchor: {0}")]
    Malformed(String),
}
