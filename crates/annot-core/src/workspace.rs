//! Workspace and notification seams
//!
//! The sync engines read current file content through a [`Workspace`] (to
//! relocate and recapture anchors) and report remote activity through a
//! [`Notifier`]. The CLI uses the filesystem and prints; tests substitute
//! their own.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use tracing::info;
use uuid::Uuid;

/// Files annotations are attached to
pub trait Workspace: Send + Sync {
    /// Root directory; remote paths are relative to it
    fn root(&self) -> &Path;

    /// Current content of a document, if it can be read
    fn read_document(&self, path: &Path) -> Option<String>;

    /// Workspace-relative form of `path`, with `/` separators
    ///
    /// Paths outside the workspace are returned whole.
    fn relative(&self, path: &Path) -> String {
        let Ok(relative) = path.strip_prefix(self.root()) else {
            return path.to_string_lossy().into_owned();
        };
        relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Absolute path of a workspace-relative path
    fn absolute(&self, relative: &str) -> PathBuf {
        let path = Path::new(relative);
        if path.is_absolute() {
            return path.to_path_buf();
        }
        relative
            .split('/')
            .filter(|part| !part.is_empty())
            .fold(self.root().to_path_buf(), |acc, part| acc.join(part))
    }
}

/// Workspace backed by a directory on disk
#[derive(Debug, Clone)]
pub struct FsWorkspace {
    root: PathBuf,
}

impl FsWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Workspace for FsWorkspace {
    fn root(&self) -> &Path {
        &self.root
    }

    fn read_document(&self, path: &Path) -> Option<String> {
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        std::fs::read_to_string(&path).ok()
    }
}

/// Workspace whose documents live in memory
///
/// For tests and for embedding in hosts that keep their own buffers.
#[derive(Debug, Default)]
pub struct MemoryWorkspace {
    root: PathBuf,
    documents: Mutex<HashMap<PathBuf, String>>,
}

impl MemoryWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            documents: Mutex::new(HashMap::new()),
        }
    }

    /// Set the content of a document (relative paths are under the root)
    pub fn set_document(&self, path: impl AsRef<Path>, content: impl Into<String>) {
        let path = self.resolve(path.as_ref());
        self.documents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path, content.into());
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

impl Workspace for MemoryWorkspace {
    fn root(&self) -> &Path {
        &self.root
    }

    fn read_document(&self, path: &Path) -> Option<String> {
        let path = self.resolve(path);
        self.documents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&path)
            .cloned()
    }
}

/// Something another client did that the user may want to see
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    ThreadAdded {
        thread_id: Uuid,
        file_path: String,
        line: usize,
    },
    CommentAdded {
        thread_id: Uuid,
        comment_id: Uuid,
        author: String,
        body: String,
    },
    CommentUpdated {
        thread_id: Uuid,
        comment_id: Uuid,
        body: String,
    },
    FindingsChanged {
        count: usize,
    },
}

/// Receives notifications about remote activity
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Notifier that writes to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        match notification {
            Notification::ThreadAdded {
                file_path, line, ..
            } => info!("New thread at {}:{}", file_path, line + 1),
            Notification::CommentAdded { author, body, .. } => {
                info!("{} commented: {}", author, body)
            }
            Notification::CommentUpdated { body, .. } => info!("Comment edited: {}", body),
            Notification::FindingsChanged { count } => info!("{} finding(s) updated", count),
        }
    }
}

/// Notifier that keeps every notification
#[derive(Debug, Default)]
pub struct CollectingNotifier {
    seen: Mutex<Vec<Notification>>,
}

impl CollectingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything collected so far
    pub fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.seen.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl Notifier for CollectingNotifier {
    fn notify(&self, notification: Notification) {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(notification);
    }
}
