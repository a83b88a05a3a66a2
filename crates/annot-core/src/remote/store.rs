//! Remote store
//!
//! Project-scoped view of the document backend. Threads and comments of a
//! project live in `comments_<uuid>`, findings in `diagnostics_<uuid>`, and the
//! shared project list in `projectDir`.
//!
//! ## Readiness
//!
//! `Disabled` → [`RemoteStore::enable`] → `CredentialCheck` → `Ready`, and
//! [`RemoteStore::disable`] goes back to `Disabled`. Collection operations
//! outside `Ready` fail with [`RemoteError::NotReady`].
//!
//! ## Writes
//!
//! Records are upserted by logical id as delete-then-insert. Each write is
//! announced to the [`EchoFilter`] first so its own change events are not
//! reported back as remote changes.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::backend::{document_id, Change, ChangeEvent, Document, DocumentBackend, Filter};
use super::credentials::{CredentialAction, CredentialPrompt, Credentials};
use super::echo::EchoFilter;
use super::error::RemoteError;
use super::record::{RemoteRecord, Tombstone, TombstoneTarget, TYPE_COMMENT, TYPE_THREAD};
use crate::cipher::{FieldCipher, PassThrough};
use crate::models::{Finding, Project};

/// Collection holding the shared project list
pub const PROJECTS_COLLECTION: &str = "projectDir";

/// Field carrying a write's echo token
pub const EPHEMERAL_FIELD: &str = "ephemeral_uuid";

/// Field carrying a document's expiry time
pub const EXPIRE_FIELD: &str = "expireAt";

/// How often expiry stamps are refreshed
pub const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Readiness of the remote store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    /// Not connected, not trying
    Disabled,
    /// Waiting on authentication
    CredentialCheck,
    /// Authenticated and listening for changes
    Ready,
}

/// A change made by another client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteChange {
    Comments,
    Findings,
}

/// Collection names of one project
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collections {
    pub comments: String,
    pub findings: String,
}

impl Collections {
    pub fn for_project(project: &Uuid) -> Self {
        Self {
            comments: format!("comments_{}", project),
            findings: format!("diagnostics_{}", project),
        }
    }
}

/// Result of pulling the comments collection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemotePull {
    /// Live threads and comments
    pub records: Vec<RemoteRecord>,
    /// Every tombstone
    pub tombstones: Vec<Tombstone>,
}

/// Remote document store bound to one project
pub struct RemoteStore {
    backend: Arc<dyn DocumentBackend>,
    collections: Option<Collections>,
    cipher: Arc<dyn FieldCipher>,
    retention: Option<Duration>,
    state_tx: watch::Sender<RemoteState>,
    state_rx: watch::Receiver<RemoteState>,
    echo: Arc<Mutex<EchoFilter>>,
    changes: broadcast::Sender<RemoteChange>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RemoteStore {
    /// Store over `backend` with no project bound
    pub fn new(backend: Arc<dyn DocumentBackend>) -> Self {
        let (state_tx, state_rx) = watch::channel(RemoteState::Disabled);
        let (changes, _) = broadcast::channel(64);
        Self {
            backend,
            collections: None,
            cipher: Arc::new(PassThrough),
            retention: None,
            state_tx,
            state_rx,
            echo: Arc::new(Mutex::new(EchoFilter::default())),
            changes,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Bind the store to a project's collections
    pub fn for_project(mut self, project: &Uuid) -> Self {
        self.collections = Some(Collections::for_project(project));
        self
    }

    /// Seal content fields with `cipher`
    pub fn with_cipher(mut self, cipher: Arc<dyn FieldCipher>) -> Self {
        self.cipher = cipher;
        self
    }

    /// Let documents expire `retention` after their last write or sweep
    pub fn with_retention(mut self, retention: Option<Duration>) -> Self {
        self.retention = retention;
        self
    }

    /// Replace the echo filter (to change its expiry window)
    pub fn with_echo_filter(mut self, filter: EchoFilter) -> Self {
        self.echo = Arc::new(Mutex::new(filter));
        self
    }

    pub fn collections(&self) -> Option<&Collections> {
        self.collections.as_ref()
    }

    pub fn state(&self) -> RemoteState {
        *self.state_rx.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == RemoteState::Ready
    }

    /// Subscribe to readiness changes
    pub fn subscribe_state(&self) -> watch::Receiver<RemoteState> {
        self.state_rx.clone()
    }

    /// Subscribe to changes made by other clients
    pub fn changes(&self) -> broadcast::Receiver<RemoteChange> {
        self.changes.subscribe()
    }

    fn set_state(&self, state: RemoteState) {
        if self.state() != state {
            debug!("Remote store {:?} -> {:?}", self.state(), state);
        }
        let _ = self.state_tx.send(state);
    }

    fn echo(&self) -> MutexGuard<'_, EchoFilter> {
        self.echo.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ==================== Lifecycle ====================

    /// Authenticate and start listening for changes
    ///
    /// Rejected credentials go to `prompt` until it provides working ones or
    /// cancels. Returns false when cancelled, leaving the store disabled.
    pub async fn enable(
        &self,
        credentials: Credentials,
        prompt: &dyn CredentialPrompt,
    ) -> Result<bool, RemoteError> {
        if self.is_ready() {
            return Ok(true);
        }

        let mut credentials = credentials;
        loop {
            self.set_state(RemoteState::CredentialCheck);
            match self.backend.authenticate(&credentials).await {
                Ok(()) => break,
                Err(RemoteError::AuthFailure(reason)) => {
                    warn!("Remote authentication failed: {}", reason);
                    match prompt.on_auth_failure(&credentials, &reason).await {
                        CredentialAction::Retry => {}
                        CredentialAction::Provide(next) => credentials = next,
                        CredentialAction::Cancel => {
                            info!("Remote sync cancelled at credential prompt");
                            self.set_state(RemoteState::Disabled);
                            return Ok(false);
                        }
                    }
                }
                Err(e) => {
                    self.set_state(RemoteState::Disabled);
                    return Err(e);
                }
            }
        }

        if let Err(e) = self.start().await {
            self.stop_tasks();
            self.set_state(RemoteState::Disabled);
            return Err(e);
        }
        self.set_state(RemoteState::Ready);
        info!("Remote store ready for {:?}", self.collections);

        if let Err(e) = self.touch_expirations().await {
            warn!("Failed to refresh expiry stamps: {}", e);
        }
        Ok(true)
    }

    /// Stop background tasks and go back to `Disabled`
    pub fn disable(&self) {
        self.stop_tasks();
        self.set_state(RemoteState::Disabled);
    }

    async fn start(&self) -> Result<(), RemoteError> {
        let names = self.collection_names();
        if self.retention.is_some() {
            for name in &names {
                self.backend.ensure_expiry_index(name, EXPIRE_FIELD).await?;
            }
        }

        let mut tasks = Vec::new();

        let mut events = self.backend.subscribe();
        let collections = self.collections.clone();
        let echo = self.echo.clone();
        let changes = self.changes.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let mut echo = echo.lock().unwrap_or_else(|e| e.into_inner());
                        if let Some(change) = classify(&event, collections.as_ref(), &mut echo) {
                            let _ = changes.send(change);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Missed {} remote change events, assuming both collections changed", n);
                        let _ = changes.send(RemoteChange::Comments);
                        let _ = changes.send(RemoteChange::Findings);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        if let Some(retention) = self.retention {
            let backend = self.backend.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(EXPIRY_SWEEP_INTERVAL);
                // The first tick fires immediately; enable() has just stamped
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if let Err(e) = stamp_all(backend.as_ref(), &names, retention).await {
                        warn!("Expiry sweep failed: {}", e);
                    }
                }
            }));
        }

        let mut held = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        held.extend(tasks);
        Ok(())
    }

    fn stop_tasks(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    fn collection_names(&self) -> Vec<String> {
        self.collections
            .as_ref()
            .map(|c| vec![c.comments.clone(), c.findings.clone()])
            .unwrap_or_default()
    }

    fn ready(&self) -> Result<(), RemoteError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(RemoteError::NotReady)
        }
    }

    fn ready_collections(&self) -> Result<&Collections, RemoteError> {
        self.ready()?;
        self.collections.as_ref().ok_or(RemoteError::NotReady)
    }

    // ==================== Writes ====================

    async fn expiry(&self) -> Result<Option<f64>, RemoteError> {
        match self.retention {
            Some(retention) => Ok(Some(
                self.backend.server_time().await? + retention.as_secs_f64(),
            )),
            None => Ok(None),
        }
    }

    /// Replace every document matching `key` with `doc`
    async fn replace(
        &self,
        collection: &str,
        key: &Filter,
        mut doc: Document,
        expire_at: Option<f64>,
    ) -> Result<(), RemoteError> {
        let token = Uuid::new_v4().to_string();
        self.echo().remember(token.clone());

        let existing: Vec<String> = self
            .backend
            .find(collection, key)
            .await?
            .iter()
            .filter_map(|d| document_id(d).map(str::to_string))
            .collect();
        if !existing.is_empty() {
            {
                let mut echo = self.echo();
                for id in &existing {
                    echo.remember(id.clone());
                }
            }
            self.backend.delete_ids(collection, &existing).await?;
        }

        doc.insert(EPHEMERAL_FIELD.to_string(), Value::String(token));
        if let Some(at) = expire_at {
            doc.insert(EXPIRE_FIELD.to_string(), json!(at));
        }
        self.backend.insert(collection, doc).await?;
        Ok(())
    }

    /// Upsert a thread, comment or tombstone by its logical id
    pub async fn push(&self, record: &RemoteRecord) -> Result<(), RemoteError> {
        let collections = self.ready_collections()?;
        let (collection, key) = match record {
            RemoteRecord::Thread(t) => (&collections.comments, thread_key(&t.id)),
            RemoteRecord::Comment(c) => (&collections.comments, comment_key(&c.id)),
            RemoteRecord::Tombstone(t) => match t.target {
                TombstoneTarget::Thread => (&collections.comments, thread_key(&t.id)),
                TombstoneTarget::Comment => (&collections.comments, comment_key(&t.id)),
            },
            RemoteRecord::Finding(f) => (&collections.findings, finding_key(&f.id)),
        };

        let doc = record.to_document(self.cipher.as_ref())?;
        let expire_at = self.expiry().await?;
        self.replace(collection, &key, doc, expire_at).await
    }

    /// Push a batch of findings
    ///
    /// With `replace`, every remote finding not in the batch is deleted first.
    pub async fn push_findings(&self, findings: &[Finding], replace: bool) -> Result<(), RemoteError> {
        let collections = self.ready_collections()?;
        if replace {
            self.delete_findings(None).await?;
        }

        let expire_at = self.expiry().await?;
        for finding in findings {
            let doc = RemoteRecord::Finding(finding.clone()).to_document(self.cipher.as_ref())?;
            if replace {
                let token = Uuid::new_v4().to_string();
                self.echo().remember(token.clone());
                let mut doc = doc;
                doc.insert(EPHEMERAL_FIELD.to_string(), Value::String(token));
                if let Some(at) = expire_at {
                    doc.insert(EXPIRE_FIELD.to_string(), json!(at));
                }
                self.backend.insert(&collections.findings, doc).await?;
            } else {
                self.replace(&collections.findings, &finding_key(&finding.id), doc, expire_at)
                    .await?;
            }
        }
        debug!("Pushed {} finding(s), replace={}", findings.len(), replace);
        Ok(())
    }

    /// Delete some findings by id, or all of them
    pub async fn delete_findings(&self, ids: Option<&[Uuid]>) -> Result<usize, RemoteError> {
        let collections = self.ready_collections()?;
        let filter = match ids {
            None => Filter::All,
            Some(ids) => Filter::or(ids.iter().map(finding_key).collect()),
        };

        let doc_ids: Vec<String> = self
            .backend
            .find(&collections.findings, &filter)
            .await?
            .iter()
            .filter_map(|d| document_id(d).map(str::to_string))
            .collect();
        if doc_ids.is_empty() {
            return Ok(0);
        }
        {
            let mut echo = self.echo();
            for id in &doc_ids {
                echo.remember(id.clone());
            }
        }
        self.backend.delete_ids(&collections.findings, &doc_ids).await
    }

    /// Re-stamp every document of the project with a fresh expiry time
    pub async fn touch_expirations(&self) -> Result<usize, RemoteError> {
        self.ready()?;
        match self.retention {
            Some(retention) => {
                stamp_all(self.backend.as_ref(), &self.collection_names(), retention).await
            }
            None => Ok(0),
        }
    }

    // ==================== Reads ====================

    /// Live threads and comments modified after `since`, plus every tombstone
    ///
    /// Documents that fail to decode are logged and skipped.
    pub async fn pull_comments_since(&self, since: f64) -> Result<RemotePull, RemoteError> {
        let collections = self.ready_collections()?;
        let filter = Filter::or(vec![
            Filter::and(vec![
                Filter::gt("timestampModified", since),
                Filter::eq("deleted", false),
            ]),
            Filter::eq("deleted", true),
        ]);

        let docs = self.backend.find(&collections.comments, &filter).await?;
        let mut pull = RemotePull::default();
        for doc in &docs {
            match RemoteRecord::from_comment_document(doc, self.cipher.as_ref()) {
                Ok(RemoteRecord::Tombstone(t)) => pull.tombstones.push(t),
                Ok(record) => pull.records.push(record),
                Err(e) => warn!("Skipping remote document {:?}: {}", document_id(doc), e),
            }
        }
        debug!(
            "Pulled {} record(s) and {} tombstone(s) since {}",
            pull.records.len(),
            pull.tombstones.len(),
            since
        );
        Ok(pull)
    }

    /// Every remote finding
    pub async fn pull_findings(&self) -> Result<Vec<Finding>, RemoteError> {
        let collections = self.ready_collections()?;
        let docs = self.backend.find(&collections.findings, &Filter::All).await?;

        let mut findings = Vec::with_capacity(docs.len());
        for doc in &docs {
            match RemoteRecord::from_finding_document(doc, self.cipher.as_ref()) {
                Ok(RemoteRecord::Finding(f)) => findings.push(f),
                Ok(other) => warn!("Unexpected record in findings collection: {:?}", other),
                Err(e) => warn!("Skipping remote finding {:?}: {}", document_id(doc), e),
            }
        }
        Ok(findings)
    }

    /// The backend's clock
    pub async fn server_time(&self) -> Result<f64, RemoteError> {
        self.ready()?;
        self.backend.server_time().await
    }

    // ==================== Project directory ====================

    /// Every project in the shared directory, tombstones included
    pub async fn list_projects(&self) -> Result<Vec<Project>, RemoteError> {
        self.ready()?;
        let docs = self.backend.find(PROJECTS_COLLECTION, &Filter::All).await?;

        let mut projects = Vec::with_capacity(docs.len());
        for doc in docs {
            match project_from_document(&doc) {
                Ok(project) => projects.push(project),
                Err(e) => warn!("Skipping remote project {:?}: {}", document_id(&doc), e),
            }
        }
        Ok(projects)
    }

    /// Add or update a project in the shared directory
    ///
    /// The project key itself is never sent.
    pub async fn push_project(&self, project: &Project) -> Result<(), RemoteError> {
        self.ready()?;
        let doc = json!({
            "uuid": project.uuid.to_string(),
            "name": project.name,
            "jwt": project.jwt,
            "deleted": project.deleted,
        });
        let Value::Object(doc) = doc else {
            return Err(RemoteError::Protocol("project did not encode to a document".into()));
        };
        self.backend.upsert_by(PROJECTS_COLLECTION, "uuid", doc).await
    }
}

impl Drop for RemoteStore {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

fn thread_key(id: &Uuid) -> Filter {
    Filter::and(vec![
        Filter::eq("type", TYPE_THREAD),
        Filter::eq("tid", id.to_string()),
    ])
}

fn comment_key(id: &Uuid) -> Filter {
    Filter::and(vec![
        Filter::eq("type", TYPE_COMMENT),
        Filter::eq("cid", id.to_string()),
    ])
}

fn finding_key(id: &Uuid) -> Filter {
    Filter::eq("id", id.to_string())
}

async fn stamp_all(
    backend: &dyn DocumentBackend,
    collections: &[String],
    retention: Duration,
) -> Result<usize, RemoteError> {
    let expire_at = backend.server_time().await? + retention.as_secs_f64();
    let mut touched = 0;
    for collection in collections {
        touched += backend
            .set_field_all(collection, EXPIRE_FIELD, json!(expire_at))
            .await?;
    }
    debug!("Stamped {} document(s) to expire at {}", touched, expire_at);
    Ok(touched)
}

/// Decide whether a backend event is someone else's change to this project
fn classify(
    event: &ChangeEvent,
    collections: Option<&Collections>,
    echo: &mut EchoFilter,
) -> Option<RemoteChange> {
    let collections = collections?;
    let change = if event.collection == collections.comments {
        RemoteChange::Comments
    } else if event.collection == collections.findings {
        RemoteChange::Findings
    } else {
        return None;
    };

    let own = match &event.change {
        Change::Insert { document } => document
            .get(EPHEMERAL_FIELD)
            .and_then(Value::as_str)
            .map_or(false, |token| echo.take(token)),
        Change::Delete { id } => echo.take(id),
        Change::Update { fields, .. } => {
            !fields.is_empty() && fields.iter().all(|f| f == EXPIRE_FIELD)
        }
    };

    if own {
        debug!("Dropped own or expiry-only change in {}", event.collection);
        None
    } else {
        Some(change)
    }
}

fn project_from_document(doc: &Document) -> Result<Project, RemoteError> {
    let uuid = doc
        .get("uuid")
        .and_then(Value::as_str)
        .ok_or_else(|| RemoteError::Protocol("project without uuid".into()))?;
    Ok(Project {
        uuid: Uuid::parse_str(uuid).map_err(RemoteError::protocol)?,
        name: doc
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        keys: None,
        jwt: doc.get("jwt").and_then(Value::as_str).map(str::to_string),
        deleted: doc.get("deleted").and_then(Value::as_bool).unwrap_or(false),
    })
}
