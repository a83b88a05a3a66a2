//! Remote store errors

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cipher::CipherError;

/// Errors from the remote document store
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteError {
    /// The store has not completed its credential check
    #[error("Remote store is not ready")]
    NotReady,

    /// Credentials were rejected or lack write access
    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    /// Network or connection failure
    #[error("Remote transport error: {0}")]
    Transport(String),

    /// A message or stored document had an unexpected shape
    #[error("Remote protocol error: {0}")]
    Protocol(String),

    /// A sealed field could not be sealed or opened
    #[error("Field cipher error: {0}")]
    Cipher(String),
}

impl RemoteError {
    pub(crate) fn transport(e: impl std::fmt::Display) -> Self {
        RemoteError::Transport(e.to_string())
    }

    pub(crate) fn protocol(e: impl std::fmt::Display) -> Self {
        RemoteError::Protocol(e.to_string())
    }
}

impl From<CipherError> for RemoteError {
    fn from(e: CipherError) -> Self {
        RemoteError::Cipher(e.to_string())
    }
}
