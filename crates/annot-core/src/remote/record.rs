//! Typed remote records
//!
//! Remote collections hold loosely shaped documents. Everything crossing the
//! store boundary is converted to or from a [`RemoteRecord`] here, so the sync
//! engines never look at raw fields. Content fields are sealed with the
//! project's [`FieldCipher`] on the way out and opened on the way in.

use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::backend::Document;
use super::error::RemoteError;
use crate::anchor::Anchor;
use crate::cipher::FieldCipher;
use crate::models::{DiagnosticPayload, Finding, Flag};

pub(crate) const TYPE_THREAD: &str = "thread";
pub(crate) const TYPE_COMMENT: &str = "comment";

/// A thread as stored remotely
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreadRecord {
    pub id: Uuid,
    /// Workspace-relative path
    pub file_path: String,
    pub anchor: Anchor,
    pub timestamp: f64,
}

/// A comment as stored remotely
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommentRecord {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub body: String,
    pub author: String,
    pub timestamp: f64,
}

/// What a tombstone deletes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TombstoneTarget {
    Thread,
    Comment,
}

/// A deletion marker
///
/// For thread tombstones `thread_id` equals `id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Tombstone {
    pub target: TombstoneTarget,
    pub id: Uuid,
    pub thread_id: Uuid,
}

impl Tombstone {
    pub fn thread(id: Uuid) -> Self {
        Self {
            target: TombstoneTarget::Thread,
            id,
            thread_id: id,
        }
    }

    pub fn comment(id: Uuid, thread_id: Uuid) -> Self {
        Self {
            target: TombstoneTarget::Comment,
            id,
            thread_id,
        }
    }
}

/// Anything the sync engines exchange with the remote store
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteRecord {
    Thread(ThreadRecord),
    Comment(CommentRecord),
    Finding(Finding),
    Tombstone(Tombstone),
}

impl RemoteRecord {
    /// Wire document for this record
    pub fn to_document(&self, cipher: &dyn FieldCipher) -> Result<Document, RemoteError> {
        let value = match self {
            RemoteRecord::Thread(t) => json!({
                "type": TYPE_THREAD,
                "tid": t.id.to_string(),
                "filePath": cipher.seal(&t.file_path)?,
                "anchor": cipher.seal(&t.anchor.encode())?,
                "timestampModified": t.timestamp,
                "deleted": false,
            }),
            RemoteRecord::Comment(c) => json!({
                "type": TYPE_COMMENT,
                "cid": c.id.to_string(),
                "tid": c.thread_id.to_string(),
                "comment": cipher.seal(&c.body)?,
                "userCreated": cipher.seal(&c.author)?,
                "timestampModified": c.timestamp,
                "deleted": false,
            }),
            RemoteRecord::Tombstone(t) => match t.target {
                TombstoneTarget::Thread => json!({
                    "type": TYPE_THREAD,
                    "tid": t.id.to_string(),
                    "deleted": true,
                }),
                TombstoneTarget::Comment => json!({
                    "type": TYPE_COMMENT,
                    "cid": t.id.to_string(),
                    "tid": t.thread_id.to_string(),
                    "deleted": true,
                }),
            },
            RemoteRecord::Finding(f) => {
                let diagnostic =
                    serde_json::to_string(&f.diagnostic).map_err(RemoteError::protocol)?;
                json!({
                    "id": f.id.to_string(),
                    "diagnostic": cipher.seal(&diagnostic)?,
                    "flag": u8::from(f.flag),
                    "flag_timestamp": f.flag_timestamp,
                    "anchor": cipher.seal(&f.anchor.encode())?,
                    "file_path": cipher.seal(&f.file_path)?,
                    "timestamp": f.created,
                })
            }
        };

        match value {
            Value::Object(map) => Ok(map),
            _ => Err(RemoteError::Protocol("record did not encode to a document".into())),
        }
    }

    /// Decode a document of a project's comments collection
    pub fn from_comment_document(
        doc: &Document,
        cipher: &dyn FieldCipher,
    ) -> Result<Self, RemoteError> {
        let kind = str_field(doc, "type")?;
        let deleted = doc.get("deleted").and_then(Value::as_bool).unwrap_or(false);

        match (kind, deleted) {
            (TYPE_THREAD, true) => Ok(RemoteRecord::Tombstone(Tombstone::thread(uuid_field(
                doc, "tid",
            )?))),
            (TYPE_COMMENT, true) => Ok(RemoteRecord::Tombstone(Tombstone::comment(
                uuid_field(doc, "cid")?,
                uuid_field(doc, "tid")?,
            ))),
            (TYPE_THREAD, false) => {
                let anchor = Anchor::decode(&cipher.open(str_field(doc, "anchor")?)?)
                    .map_err(RemoteError::protocol)?;
                Ok(RemoteRecord::Thread(ThreadRecord {
                    id: uuid_field(doc, "tid")?,
                    file_path: cipher.open(str_field(doc, "filePath")?)?,
                    anchor,
                    timestamp: f64_field(doc, "timestampModified")?,
                }))
            }
            (TYPE_COMMENT, false) => Ok(RemoteRecord::Comment(CommentRecord {
                id: uuid_field(doc, "cid")?,
                thread_id: uuid_field(doc, "tid")?,
                body: cipher.open(str_field(doc, "comment")?)?,
                author: cipher.open(str_field(doc, "userCreated")?)?,
                timestamp: f64_field(doc, "timestampModified")?,
            })),
            (other, _) => Err(RemoteError::Protocol(format!(
                "unknown document type '{}'",
                other
            ))),
        }
    }

    /// Decode a document of a project's diagnostics collection
    ///
    /// Payloads from older clients carry the flag as an icon prefix on the
    /// message; that prefix wins over the numeric field.
    pub fn from_finding_document(
        doc: &Document,
        cipher: &dyn FieldCipher,
    ) -> Result<Self, RemoteError> {
        let mut diagnostic: DiagnosticPayload =
            serde_json::from_str(&cipher.open(str_field(doc, "diagnostic")?)?)
                .map_err(RemoteError::protocol)?;
        let anchor = Anchor::decode(&cipher.open(str_field(doc, "anchor")?)?)
            .map_err(RemoteError::protocol)?;

        let numeric = doc
            .get("flag")
            .and_then(Value::as_u64)
            .map(|v| Flag::try_from(v as u8).map_err(RemoteError::Protocol))
            .transpose()?
            .unwrap_or_default();
        let (legacy, message) = Flag::from_legacy_message(&diagnostic.message);
        diagnostic.message = message;

        Ok(RemoteRecord::Finding(Finding {
            id: uuid_field(doc, "id")?,
            diagnostic,
            anchor,
            file_path: cipher.open(str_field(doc, "file_path")?)?,
            flag: legacy.unwrap_or(numeric),
            flag_timestamp: doc
                .get("flag_timestamp")
                .and_then(Value::as_f64)
                .unwrap_or_default(),
            created: f64_field(doc, "timestamp")?,
        }))
    }
}

fn str_field<'a>(doc: &'a Document, name: &str) -> Result<&'a str, RemoteError> {
    doc.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| RemoteError::Protocol(format!("missing string field '{}'", name)))
}

fn f64_field(doc: &Document, name: &str) -> Result<f64, RemoteError> {
    doc.get(name)
        .and_then(Value::as_f64)
        .ok_or_else(|| RemoteError::Protocol(format!("missing numeric field '{}'", name)))
}

fn uuid_field(doc: &Document, name: &str) -> Result<Uuid, RemoteError> {
    let raw = str_field(doc, name)?;
    Uuid::parse_str(raw)
        .map_err(|e| RemoteError::Protocol(format!("bad uuid in '{}': {}", name, e)))
}
