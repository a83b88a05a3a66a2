//! annot Core Library
//!
//! This crate provides the core functionality for annot, which attaches
//! comment threads and static-analysis findings to lines of source files and
//! shares them between users through a remote document store.
//!
//! # Architecture
//!
//! - **Anchors**: a snippet of the text around an annotated line, relocated
//!   with a rolling-hash match when the file changes
//! - **SQLite**: per-project local store, the source of truth on this machine
//! - **Remote store**: peer document collections, reconciled last-writer-wins
//!
//! # Quick Start
//!
//! ```text
//! let session = ProjectSession::open(&config, project, workspace, notifier, None, SyncOptions::default()).await?;
//!
//! // Start a thread on line 12
//! let id = session.comments().create_thread(path, 12, "Needs a bounds check").await?;
//!
//! // Threads at their current lines
//! let threads = session.comments().threads().await;
//! ```
//!
//! # Modules
//!
//! - `anchor`: anchor capture, encoding and relocation
//! - `storage`: SQLite stores for annotations and the project directory
//! - `remote`: remote document store, backends and wire protocol
//! - `sync`: sync engines for comments, findings and projects
//! - `session`: the open project and its engines
//! - `analysis`: analyzer runs and report ingestion
//! - `diagram`: image references in graph descriptions
//! - `config`: Application configuration

pub mod analysis;
pub mod anchor;
pub mod cipher;
pub mod config;
pub mod diagram;
pub mod models;
pub mod remote;
pub mod session;
pub mod storage;
pub mod sync;
pub mod workspace;

pub use analysis::{AnalysisError, Analyzer};
pub use anchor::{Anchor, AnchorError};
pub use cipher::{CipherError, FieldCipher, PassThrough};
pub use config::Config;
pub use models::{Comment, DiagnosticPayload, Finding, Flag, Project, Thread};
pub use remote::{RemoteError, RemoteStore};
pub use session::{ProjectSession, RemoteBinding, SessionReport};
pub use storage::{LocalStore, ProjectDirectory, StorageError};
pub use sync::{CommentSync, FindingSync, SyncError, SyncOptions};
pub use workspace::{FsWorkspace, Notification, Notifier, Workspace};
