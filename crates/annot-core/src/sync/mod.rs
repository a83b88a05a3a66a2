//! Sync engines
//!
//! Reconcile the local store with the remote store, per target:
//!
//! - [`CommentSync`]: threads and comments, last writer wins per comment
//! - [`FindingSync`]: analysis findings, batch replace or merge by id
//! - [`sync_projects`]: the shared project directory
//!
//! Each engine runs at most one pass at a time (see [`Coalescer`]). A pass
//! ends quietly when the remote store is not ready, leaving local state as is.

pub mod coalesce;
pub mod comments;
pub mod findings;
pub mod projects;

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;

use crate::remote::{RemoteError, RemoteStore};
use crate::storage::{LocalStore, StorageError};
use crate::workspace::{Notifier, Workspace};

pub use coalesce::Coalescer;
pub use comments::{CommentSync, LiveThread, SyncOptions, SyncReport};
pub use findings::{BatchStrategy, FindingReport, FindingSync, LocatedFinding};
pub use projects::{remove_database, sync_projects, ProjectSyncReport};

/// Errors from a sync engine
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Local and remote state disagree in a way the protocol rules out
    #[error("Sync invariant violated: {0}")]
    InvariantViolation(String),

    /// The engine was disposed mid-operation
    #[error("Sync engine has been disposed")]
    Disposed,

    /// A document needed for an anchor could not be read
    #[error("Cannot read document: {0:?}")]
    Unreadable(PathBuf),
}

/// Collaborators shared by the engines of one open project
#[derive(Clone)]
pub struct SyncContext {
    pub local: Arc<Mutex<LocalStore>>,
    pub remote: Option<Arc<RemoteStore>>,
    pub workspace: Arc<dyn Workspace>,
    pub notifier: Arc<dyn Notifier>,
    /// Display name stamped on new comments
    pub author: String,
    /// Context lines captured each side of an anchored line
    pub anchor_lines: usize,
}

impl SyncContext {
    /// The remote store, if it is ready
    pub fn ready_remote(&self) -> Option<&Arc<RemoteStore>> {
        self.remote.as_ref().filter(|r| r.is_ready())
    }
}
