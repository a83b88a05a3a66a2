//! Storage layer
//!
//! Local SQLite persistence.
//!
//! ## Databases
//!
//! - **projects.db**: the project directory and the currently open project
//! - **annot-<uuid>.db**: threads, comments and findings of one project
//!
//! Local rows are the source of truth for what this machine knows; the
//! sync engines reconcile them against the remote store.

pub mod error;
pub mod local;
pub mod projects;
pub mod schema;

pub use error::{StorageError, StorageResult};
pub use local::{ActiveThread, LocalStore, Tombstones};
pub use projects::ProjectDirectory;
pub use schema::{init_schema, needs_init, SCHEMA_VERSION};
