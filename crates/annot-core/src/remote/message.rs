//! Document service protocol messages
//!
//! Frames exchanged between [`WsBackend`](super::WsBackend) and the document
//! server, CBOR encoded in binary WebSocket messages. Every request carries an
//! id echoed in its reply; change events are pushed unprompted.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::backend::{ChangeEvent, Document, Filter};
use super::credentials::Credentials;
use super::error::RemoteError;

/// Operations a client can ask of the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Authenticate {
        credentials: Credentials,
    },
    EnsureExpiryIndex {
        collection: String,
        field: String,
    },
    Find {
        collection: String,
        filter: Filter,
    },
    Insert {
        collection: String,
        document: Document,
    },
    DeleteIds {
        collection: String,
        ids: Vec<String>,
    },
    UpsertBy {
        collection: String,
        key: String,
        document: Document,
    },
    SetFieldAll {
        collection: String,
        field: String,
        value: Value,
    },
    ServerTime,
}

/// Result of a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply {
    Done,
    Documents { documents: Vec<Document> },
    Inserted { id: String },
    Count { count: u64 },
    Time { now: f64 },
    Failed { error: RemoteError },
}

/// Messages sent to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    pub id: u64,
    pub request: Request,
}

/// Messages received from the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Answer to the request with the same id
    Reply { id: u64, reply: Reply },
    /// A document changed
    Change { event: ChangeEvent },
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, RemoteError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes).map_err(RemoteError::protocol)?;
    Ok(bytes)
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, RemoteError> {
    ciborium::from_reader(bytes).map_err(RemoteError::protocol)
}

impl ClientMessage {
    /// Encode message to CBOR bytes
    pub fn encode(&self) -> Result<Vec<u8>, RemoteError> {
        encode(self)
    }

    /// Decode message from CBOR bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, RemoteError> {
        decode(bytes)
    }
}

impl ServerMessage {
    /// Encode message to CBOR bytes
    pub fn encode(&self) -> Result<Vec<u8>, RemoteError> {
        encode(self)
    }

    /// Decode message from CBOR bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, RemoteError> {
        decode(bytes)
    }
}
