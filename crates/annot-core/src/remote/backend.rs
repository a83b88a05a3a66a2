//! Document backend abstraction
//!
//! The remote store talks to a schemaless document database: named
//! collections of JSON-like documents, each carrying a backend-assigned `_id`,
//! plus a feed of change events. [`MemoryBackend`](super::MemoryBackend) keeps
//! everything in process; [`WsBackend`](super::WsBackend) forwards to a server.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use super::credentials::Credentials;
use super::error::RemoteError;

/// A stored document
pub type Document = serde_json::Map<String, Value>;

/// Field holding the backend-assigned document id
pub const ID_FIELD: &str = "_id";

/// Backend-assigned id of a document, if present
pub fn document_id(doc: &Document) -> Option<&str> {
    doc.get(ID_FIELD).and_then(Value::as_str)
}

/// Query predicate over documents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Filter {
    /// Every document
    All,
    /// Field equals value
    Eq { field: String, value: Value },
    /// Numeric field strictly greater than value
    Gt { field: String, value: f64 },
    /// Every sub-filter matches
    And { filters: Vec<Filter> },
    /// Any sub-filter matches
    Or { filters: Vec<Filter> },
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Filter::Eq {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn gt(field: &str, value: f64) -> Self {
        Filter::Gt {
            field: field.to_string(),
            value,
        }
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::And { filters }
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Or { filters }
    }

    /// Whether `doc` satisfies this filter
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq { field, value } => doc.get(field) == Some(value),
            Filter::Gt { field, value } => doc
                .get(field)
                .and_then(Value::as_f64)
                .map_or(false, |v| v > *value),
            Filter::And { filters } => filters.iter().all(|f| f.matches(doc)),
            Filter::Or { filters } => filters.iter().any(|f| f.matches(doc)),
        }
    }
}

/// A change in one collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub collection: String,
    pub change: Change,
}

/// What happened to a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Change {
    Insert { document: Document },
    Delete { id: String },
    Update { id: String, fields: Vec<String> },
}

/// Schemaless document database with a change feed
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    /// Check that `credentials` may read and write
    async fn authenticate(&self, credentials: &Credentials) -> Result<(), RemoteError>;

    /// Expire documents of `collection` once the epoch-seconds value in `field` passes
    async fn ensure_expiry_index(&self, collection: &str, field: &str) -> Result<(), RemoteError>;

    /// Documents matching `filter`
    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, RemoteError>;

    /// Store a document, returning its assigned id
    async fn insert(&self, collection: &str, document: Document) -> Result<String, RemoteError>;

    /// Delete documents by id, returning how many existed
    async fn delete_ids(&self, collection: &str, ids: &[String]) -> Result<usize, RemoteError>;

    /// Replace the document whose `key` field equals the new document's, or insert it
    async fn upsert_by(
        &self,
        collection: &str,
        key: &str,
        document: Document,
    ) -> Result<(), RemoteError>;

    /// Set `field` on every document, returning how many were touched
    async fn set_field_all(
        &self,
        collection: &str,
        field: &str,
        value: Value,
    ) -> Result<usize, RemoteError>;

    /// The backend's clock, in epoch seconds
    async fn server_time(&self) -> Result<f64, RemoteError>;

    /// Subscribe to change events of every collection
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;
}
