//! In-process document backend
//!
//! Holds collections in memory and honors expiry indexes lazily: expired
//! documents are purged (with delete events) the next time their collection
//! is touched. Used by tests and hosted over WebSocket by `annot serve`.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use super::backend::{document_id, Change, ChangeEvent, Document, DocumentBackend, Filter, ID_FIELD};
use super::credentials::Credentials;
use super::error::RemoteError;
use crate::models::now_secs;

const CHANGE_CAPACITY: usize = 1024;

#[derive(Default)]
struct MemoryState {
    collections: HashMap<String, Vec<Document>>,
    /// (collection, field) pairs with an expiry index
    expiry: HashSet<(String, String)>,
    next_id: u64,
    clock_offset: f64,
}

/// Document backend kept entirely in memory
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    users: Option<HashMap<String, String>>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Backend accepting any credentials
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            state: Mutex::new(MemoryState::default()),
            users: None,
            changes,
        }
    }

    /// Backend accepting only the given username/password pairs
    pub fn with_users<I, U, P>(users: I) -> Self
    where
        I: IntoIterator<Item = (U, P)>,
        U: Into<String>,
        P: Into<String>,
    {
        let mut backend = Self::new();
        backend.users = Some(
            users
                .into_iter()
                .map(|(u, p)| (u.into(), p.into()))
                .collect(),
        );
        backend
    }

    /// Move the backend clock forward
    pub fn advance_clock(&self, secs: f64) {
        self.lock().clock_offset += secs;
    }

    /// Number of documents in a collection, expired ones excluded
    pub fn count(&self, collection: &str) -> usize {
        let (count, events) = {
            let mut state = self.lock();
            let events = purge_expired(&mut state, collection);
            let count = state.collections.get(collection).map_or(0, Vec::len);
            (count, events)
        };
        self.publish(events);
        count
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A poisoned lock only means a panic elsewhere mid-update; the maps stay usable
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, events: Vec<ChangeEvent>) {
        for event in events {
            // No subscribers is fine
            let _ = self.changes.send(event);
        }
    }

    /// Run `f` on a collection after purging it, then publish the events it produced
    fn with_collection<T>(
        &self,
        collection: &str,
        f: impl FnOnce(&mut Vec<Document>, &mut u64, &mut Vec<ChangeEvent>) -> T,
    ) -> T {
        let (result, events) = {
            let mut state = self.lock();
            let mut events = purge_expired(&mut state, collection);
            let state = &mut *state;
            let docs = state.collections.entry(collection.to_string()).or_default();
            let result = f(docs, &mut state.next_id, &mut events);
            (result, events)
        };
        self.publish(events);
        result
    }
}

fn now(state: &MemoryState) -> f64 {
    now_secs() + state.clock_offset
}

fn purge_expired(state: &mut MemoryState, collection: &str) -> Vec<ChangeEvent> {
    let fields: Vec<String> = state
        .expiry
        .iter()
        .filter(|(c, _)| c == collection)
        .map(|(_, f)| f.clone())
        .collect();
    if fields.is_empty() {
        return Vec::new();
    }

    let now = now(state);
    let Some(docs) = state.collections.get_mut(collection) else {
        return Vec::new();
    };

    let mut events = Vec::new();
    docs.retain(|doc| {
        let expired = fields.iter().any(|field| {
            doc.get(field)
                .and_then(Value::as_f64)
                .map_or(false, |at| at <= now)
        });
        if expired {
            if let Some(id) = document_id(doc) {
                events.push(ChangeEvent {
                    collection: collection.to_string(),
                    change: Change::Delete { id: id.to_string() },
                });
            }
        }
        !expired
    });

    if !events.is_empty() {
        debug!("Expired {} document(s) from {}", events.len(), collection);
    }
    events
}

fn assign_id(doc: &mut Document, next_id: &mut u64) -> String {
    if let Some(id) = document_id(doc) {
        return id.to_string();
    }
    *next_id += 1;
    let id = format!("m{}", next_id);
    doc.insert(ID_FIELD.to_string(), Value::String(id.clone()));
    id
}

#[async_trait]
impl DocumentBackend for MemoryBackend {
    async fn authenticate(&self, credentials: &Credentials) -> Result<(), RemoteError> {
        match &self.users {
            None => Ok(()),
            Some(users) if users.get(&credentials.username) == Some(&credentials.password) => {
                Ok(())
            }
            Some(_) => Err(RemoteError::AuthFailure(format!(
                "invalid credentials for user '{}'",
                credentials.username
            ))),
        }
    }

    async fn ensure_expiry_index(&self, collection: &str, field: &str) -> Result<(), RemoteError> {
        self.lock()
            .expiry
            .insert((collection.to_string(), field.to_string()));
        Ok(())
    }

    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, RemoteError> {
        Ok(self.with_collection(collection, |docs, _, _| {
            docs.iter().filter(|d| filter.matches(d)).cloned().collect()
        }))
    }

    async fn insert(&self, collection: &str, mut document: Document) -> Result<String, RemoteError> {
        Ok(self.with_collection(collection, |docs, next_id, events| {
            let id = assign_id(&mut document, next_id);
            docs.push(document.clone());
            events.push(ChangeEvent {
                collection: collection.to_string(),
                change: Change::Insert { document },
            });
            id
        }))
    }

    async fn delete_ids(&self, collection: &str, ids: &[String]) -> Result<usize, RemoteError> {
        Ok(self.with_collection(collection, |docs, _, events| {
            let before = docs.len();
            docs.retain(|doc| match document_id(doc) {
                Some(id) if ids.iter().any(|x| x == id) => {
                    events.push(ChangeEvent {
                        collection: collection.to_string(),
                        change: Change::Delete { id: id.to_string() },
                    });
                    false
                }
                _ => true,
            });
            before - docs.len()
        }))
    }

    async fn upsert_by(
        &self,
        collection: &str,
        key: &str,
        mut document: Document,
    ) -> Result<(), RemoteError> {
        let Some(key_value) = document.get(key).cloned() else {
            return Err(RemoteError::Protocol(format!(
                "upsert document has no '{}' field",
                key
            )));
        };

        self.with_collection(collection, |docs, next_id, events| {
            match docs.iter_mut().find(|d| d.get(key) == Some(&key_value)) {
                Some(existing) => {
                    let id = document_id(existing).unwrap_or_default().to_string();
                    let fields: Vec<String> = document.keys().cloned().collect();
                    document.insert(ID_FIELD.to_string(), Value::String(id.clone()));
                    *existing = document;
                    events.push(ChangeEvent {
                        collection: collection.to_string(),
                        change: Change::Update { id, fields },
                    });
                }
                None => {
                    assign_id(&mut document, next_id);
                    docs.push(document.clone());
                    events.push(ChangeEvent {
                        collection: collection.to_string(),
                        change: Change::Insert { document },
                    });
                }
            }
        });
        Ok(())
    }

    async fn set_field_all(
        &self,
        collection: &str,
        field: &str,
        value: Value,
    ) -> Result<usize, RemoteError> {
        Ok(self.with_collection(collection, |docs, _, events| {
            for doc in docs.iter_mut() {
                doc.insert(field.to_string(), value.clone());
                if let Some(id) = document_id(doc) {
                    events.push(ChangeEvent {
                        collection: collection.to_string(),
                        change: Change::Update {
                            id: id.to_string(),
                            fields: vec![field.to_string()],
                        },
                    });
                }
            }
            docs.len()
        }))
    }

    async fn server_time(&self) -> Result<f64, RemoteError> {
        Ok(now(&self.lock()))
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }
}
