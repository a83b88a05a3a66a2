//! Anchor capture and wire encoding
//!
//! An anchor is the text surrounding an annotated line at the moment it was
//! placed, plus enough bookkeeping to map a match of that text back to the
//! annotated line. Stored as a small JSON object: `{"line", "text", "num"}`.

use serde::{Deserialize, Serialize};

use super::matcher::WINDOW;
use super::AnchorError;

/// Lines captured on each side of the anchored line by default
pub const DEFAULT_ANCHOR_LINES: usize = 5;

/// Upper bound (in characters) for each half of the captured text
pub const MAX_HALF_CHARS: usize = 500;

/// Relocatable reference to one line of a document
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Anchor {
    /// Line number at capture time (0-based)
    pub line: usize,
    /// Snippet spanning the lines around `line`
    pub text: String,
    /// Number of line breaks in the part of `text` preceding `line`
    #[serde(rename = "num")]
    pub lines_before: usize,
}

impl Anchor {
    /// Capture an anchor for `line` with `budget` lines of context each side
    ///
    /// The line is clamped to the document. The context before the line keeps
    /// at most its last [`MAX_HALF_CHARS`] characters and the context from the
    /// line onward keeps at most its first [`MAX_HALF_CHARS`].
    pub fn capture(document: &str, line: usize, budget: usize) -> Self {
        let starts = line_starts(document);
        let line = line.min(starts.len() - 1);

        let before_start = starts[line.saturating_sub(budget)];
        let line_start = starts[line];
        let after_end = starts
            .get(line + budget)
            .copied()
            .unwrap_or(document.len());

        let before = tail_chars(&document[before_start..line_start], MAX_HALF_CHARS);
        let after = head_chars(&document[line_start..after_end], MAX_HALF_CHARS);
        let lines_before = before.matches('\n').count();

        Self {
            line,
            text: format!("{}{}", before, after),
            lines_before,
        }
    }

    /// Find the line this anchor now points at in `document`
    ///
    /// Fails with [`AnchorError::NotFound`] when the document is empty or
    /// shorter than the snippet, when the snippet is too short to hash, or
    /// when no position is similar enough.
    pub fn locate(&self, document: &str) -> Result<usize, AnchorError> {
        let text_len = self.text.chars().count();
        if document.is_empty() {
            return Err(AnchorError::NotFound("document is empty".into()));
        }
        if document.chars().count() < text_len {
            return Err(AnchorError::NotFound(
                "document is shorter than the anchor text".into(),
            ));
        }
        if text_len <= WINDOW {
            return Err(AnchorError::NotFound(
                "anchor text is shorter than the hash window".into(),
            ));
        }

        let first = super::matcher::find_snippet(&self.text, document)
            .ok_or_else(|| AnchorError::NotFound("no similar region".into()))?;

        let last_line = document.matches('\n').count();
        Ok((first + self.lines_before).min(last_line))
    }

    /// Display line for this anchor, falling back to the captured line
    pub fn relocate(&self, document: &str) -> usize {
        match self.locate(document) {
            Ok(line) => line,
            Err(e) => {
                tracing::debug!("Anchor not relocated ({}), keeping line {}", e, self.line);
                self.line
            }
        }
    }

    /// Serialize to the stored JSON form
    pub fn encode(&self) -> String {
        serde_json::json!({
            "line": self.line,
            "text": self.text,
            "num": self.lines_before,
        })
        .to_string()
    }

    /// Parse the stored JSON form
    pub fn decode(raw: &str) -> Result<Self, AnchorError> {
        serde_json::from_str(raw).map_err(|e| AnchorError::Malformed(e.to_string()))
    }
}

/// Byte offset of the start of every line
fn line_starts(document: &str) -> Vec<usize> {
    let mut starts = vec![0];
    starts.extend(document.match_indices('\n').map(|(i, _)| i + 1));
    starts
}

/// Last `max` characters of `s`
fn tail_chars(s: &str, max: usize) -> &str {
    let count = s.chars().count();
    if count <= max {
        return s;
    }
    match s.char_indices().nth(count - max) {
        Some((i, _)) => &s[i..],
        None => s,
    }
}

/// First `max` characters of `s`
fn head_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}
