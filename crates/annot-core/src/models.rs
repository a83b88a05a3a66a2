//! Data models for annot
//!
//! Threads of comments anchored to lines, static-analysis findings and the
//! projects that group them. Timestamps are seconds since the Unix epoch as
//! `f64`, the unit every peer compares in.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::anchor::Anchor;

/// Current wall-clock time in epoch seconds
pub fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// A discussion anchored to one line of one file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Thread {
    /// Unique identifier
    pub id: Uuid,
    /// Where the thread was placed
    pub anchor: Anchor,
    /// Absolute path locally, workspace-relative on the wire
    pub file_path: String,
    /// Tombstone marker
    pub deleted: bool,
}

impl Thread {
    /// Create a new live thread
    pub fn new(anchor: Anchor, file_path: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            anchor,
            file_path: file_path.into(),
            deleted: false,
        }
    }
}

/// One message in a thread
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Comment {
    /// Unique identifier
    pub id: Uuid,
    /// Owning thread
    pub thread_id: Uuid,
    /// Comment text
    pub body: String,
    /// Display name of the author
    pub author: String,
    /// Last modification time; decides conflicts
    pub last_modified: f64,
    /// Creation time
    pub created: f64,
    /// Tombstone marker
    pub deleted: bool,
}

impl Comment {
    /// Create a new comment stamped with the current time
    pub fn new(thread_id: Uuid, body: impl Into<String>, author: impl Into<String>) -> Self {
        let now = now_secs();
        Self {
            id: Uuid::new_v4(),
            thread_id,
            body: body.into(),
            author: author.into(),
            last_modified: now,
            created: now,
            deleted: false,
        }
    }
}

/// Triage state of a finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Flag {
    #[default]
    Unflagged = 0,
    FalsePositive = 1,
    Hot = 2,
    Resolved = 3,
}

impl Flag {
    /// Message prefixes older clients used to carry the flag
    const LEGACY_ICONS: [(&'static str, Flag); 4] = [
        ("🆕", Flag::Unflagged),
        ("❌", Flag::FalsePositive),
        ("🔥", Flag::Hot),
        ("✅", Flag::Resolved),
    ];

    /// Split a legacy icon prefix off a message
    ///
    /// Returns the flag the icon stood for (if any) and the message without it.
    pub fn from_legacy_message(message: &str) -> (Option<Flag>, String) {
        let trimmed = message.trim_start();
        for (icon, flag) in Self::LEGACY_ICONS {
            if let Some(rest) = trimmed.strip_prefix(icon) {
                return (Some(flag), rest.trim_start().to_string());
            }
        }
        (None, message.to_string())
    }

    /// Short label for display
    pub fn label(&self) -> &'static str {
        match self {
            Flag::Unflagged => "unflagged",
            Flag::FalsePositive => "false-positive",
            Flag::Hot => "hot",
            Flag::Resolved => "resolved",
        }
    }
}

impl TryFrom<u8> for Flag {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Flag::Unflagged),
            1 => Ok(Flag::FalsePositive),
            2 => Ok(Flag::Hot),
            3 => Ok(Flag::Resolved),
            other => Err(format!("unknown flag value {}", other)),
        }
    }
}

impl From<Flag> for u8 {
    fn from(flag: Flag) -> Self {
        flag as u8
    }
}

impl std::str::FromStr for Flag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unflagged" | "none" => Ok(Flag::Unflagged),
            "false-positive" | "false" | "fp" => Ok(Flag::FalsePositive),
            "hot" => Ok(Flag::Hot),
            "resolved" | "done" => Ok(Flag::Resolved),
            other => Err(format!(
                "unknown flag '{}' (expected unflagged, false-positive, hot or resolved)",
                other
            )),
        }
    }
}

/// Analyzer output attached to a finding
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DiagnosticPayload {
    pub message: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub references: Vec<String>,
    /// Rule identifier reported by the analyzer
    #[serde(default)]
    pub rule: Option<String>,
    #[serde(default)]
    pub start_column: usize,
    #[serde(default)]
    pub end_line: usize,
    #[serde(default)]
    pub end_column: usize,
}

/// A static-analysis result anchored to a line
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Finding {
    /// Unique identifier
    pub id: Uuid,
    /// What the analyzer reported
    pub diagnostic: DiagnosticPayload,
    /// Where the finding was reported
    pub anchor: Anchor,
    /// Workspace-relative path
    pub file_path: String,
    /// Triage state
    pub flag: Flag,
    /// When the flag last changed
    pub flag_timestamp: f64,
    /// When the analysis run produced this finding
    pub created: f64,
}

impl Finding {
    /// Create an unflagged finding
    ///
    /// A legacy icon prefix on the message is moved into the flag.
    pub fn new(
        mut diagnostic: DiagnosticPayload,
        anchor: Anchor,
        file_path: impl Into<String>,
        created: f64,
    ) -> Self {
        let (legacy, message) = Flag::from_legacy_message(&diagnostic.message);
        diagnostic.message = message;
        Self {
            id: Uuid::new_v4(),
            diagnostic,
            anchor,
            file_path: file_path.into(),
            flag: legacy.unwrap_or_default(),
            flag_timestamp: created,
            created,
        }
    }

    /// Change the flag, stamping the time of the change
    pub fn set_flag(&mut self, flag: Flag, at: f64) {
        self.flag = flag;
        self.flag_timestamp = at;
    }
}

/// A project grouping annotations of one code base
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub uuid: Uuid,
    pub name: String,
    /// Secret key; only ever stored locally
    #[serde(default, skip_serializing)]
    pub keys: Option<String>,
    /// Proof of key possession, safe to share
    pub jwt: Option<String>,
    pub deleted: bool,
}

impl Project {
    /// Create a new live project
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            keys: None,
            jwt: None,
            deleted: false,
        }
    }

    /// Whether project content is sealed with a key
    pub fn is_encrypted(&self) -> bool {
        self.jwt.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anchor() -> Anchor {
        Anchor {
            line: 4,
            text: "some anchored text".into(),
            lines_before: 2,
        }
    }

    #[test]
    fn test_comment_new() {
        let thread = Thread::new(anchor(), "/work/src/main.rs");
        let comment = Comment::new(thread.id, "looks wrong", "ada");

        assert_eq!(comment.thread_id, thread.id);
        assert_eq!(comment.created, comment.last_modified);
        assert!(!comment.deleted);
        assert!(comment.created > 1_600_000_000.0);
    }

    #[test]
    fn test_flag_serializes_as_number() {
        assert_eq!(serde_json::to_string(&Flag::Hot).unwrap(), "2");
        let flag: Flag = serde_json::from_str("3").unwrap();
        assert_eq!(flag, Flag::Resolved);
        assert!(serde_json::from_str::<Flag>("9").is_err());
    }

    #[test]
    fn test_flag_from_str() {
        assert_eq!("hot".parse::<Flag>().unwrap(), Flag::Hot);
        assert_eq!("FP".parse::<Flag>().unwrap(), Flag::FalsePositive);
        assert!("sideways".parse::<Flag>().is_err());
    }

    #[test]
    fn test_legacy_icon_migration() {
        let (flag, message) = Flag::from_legacy_message("🔥 SQL injection");
        assert_eq!(flag, Some(Flag::Hot));
        assert_eq!(message, "SQL injection");

        let (flag, message) = Flag::from_legacy_message("plain message");
        assert_eq!(flag, None);
        assert_eq!(message, "plain message");
    }

    #[test]
    fn test_finding_new_strips_legacy_icon() {
        let diagnostic = DiagnosticPayload {
            message: "✅ hardcoded secret".into(),
            ..Default::default()
        };
        let finding = Finding::new(diagnostic, anchor(), "src/lib.rs", 100.0);

        assert_eq!(finding.flag, Flag::Resolved);
        assert_eq!(finding.diagnostic.message, "hardcoded secret");
        assert_eq!(finding.flag_timestamp, 100.0);
    }

    #[test]
    fn test_set_flag_stamps_time() {
        let mut finding = Finding::new(DiagnosticPayload::default(), anchor(), "a.tf", 10.0);
        finding.set_flag(Flag::FalsePositive, 42.5);
        assert_eq!(finding.flag, Flag::FalsePositive);
        assert_eq!(finding.flag_timestamp, 42.5);
    }

    #[test]
    fn test_project_keys_not_serialized() {
        let mut project = Project::new("infra");
        project.keys = Some("secret".into());
        let json = serde_json::to_string(&project).unwrap();
        assert!(!json.contains("secret"));
    }
}
