//! Remote document store
//!
//! Everything needed to share annotations through a document database:
//!
//! - [`DocumentBackend`]: the database seam, with [`MemoryBackend`] in process
//!   and [`WsBackend`] over WebSocket (see [`server::serve`])
//! - [`RemoteRecord`]: typed records converted at the store boundary
//! - [`RemoteStore`]: project-scoped operations, readiness and change feed
//! - [`EchoFilter`]: suppression of a client's own change events

pub mod backend;
pub mod credentials;
pub mod echo;
pub mod error;
pub mod memory;
pub mod message;
pub mod record;
pub mod server;
pub mod store;
pub mod ws;

pub use backend::{Change, ChangeEvent, Document, DocumentBackend, Filter};
pub use credentials::{CredentialAction, CredentialPrompt, CredentialStore, Credentials, NoPrompt};
pub use echo::EchoFilter;
pub use error::RemoteError;
pub use memory::MemoryBackend;
pub use record::{CommentRecord, RemoteRecord, ThreadRecord, Tombstone, TombstoneTarget};
pub use store::{Collections, RemoteChange, RemotePull, RemoteState, RemoteStore};
pub use ws::WsBackend;
