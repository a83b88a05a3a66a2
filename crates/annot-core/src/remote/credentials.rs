//! Remote credentials
//!
//! Credentials are kept in a TOML file in the data directory, readable only by
//! the owner. A stored entry is offered only for the host it was saved for.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Login for the remote document store
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Remote URL these credentials belong to
    pub host: String,
}

impl Credentials {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            host: host.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .field("host", &self.host)
            .finish()
    }
}

/// What to do after the remote rejected credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialAction {
    /// Try the same credentials again
    Retry,
    /// Try these credentials instead
    Provide(Credentials),
    /// Give up and leave the remote disabled
    Cancel,
}

/// Asks the user what to do when authentication fails
#[async_trait]
pub trait CredentialPrompt: Send + Sync {
    async fn on_auth_failure(&self, attempted: &Credentials, reason: &str) -> CredentialAction;
}

/// Prompt that always cancels; for non-interactive use
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPrompt;

#[async_trait]
impl CredentialPrompt for NoPrompt {
    async fn on_auth_failure(&self, _attempted: &Credentials, _reason: &str) -> CredentialAction {
        CredentialAction::Cancel
    }
}

/// File-backed credential storage
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The stored credentials, if any
    pub fn load(&self) -> Result<Option<Credentials>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read credentials file: {:?}", self.path))?;
        let credentials = toml::from_str(&content)
            .with_context(|| format!("Failed to parse credentials file: {:?}", self.path))?;
        Ok(Some(credentials))
    }

    /// Stored credentials for `url`, ignoring entries saved for another host
    pub fn for_host(&self, url: &str) -> Result<Option<Credentials>> {
        let stored = self.load()?;
        Ok(stored.filter(|c| {
            let matches = c.host == url;
            if !matches {
                debug!("Stored credentials are for {}, not {}", c.host, url);
            }
            matches
        }))
    }

    /// Save credentials, replacing any stored ones
    pub fn save(&self, credentials: &Credentials) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let content =
            toml::to_string_pretty(credentials).context("Failed to serialize credentials")?;
        fs::write(&self.path, content)
            .with_context(|| format!("Failed to write credentials file: {:?}", self.path))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))
                .with_context(|| format!("Failed to restrict permissions on {:?}", self.path))?;
        }
        Ok(())
    }

    /// Remove stored credentials
    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)
                .with_context(|| format!("Failed to remove credentials file: {:?}", self.path))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let store = CredentialStore::new(temp.path().join("credentials.toml"));
        assert!(store.load().unwrap().is_none());

        let creds = Credentials::new("ana", "s3cret", "ws://localhost:3030");
        store.save(&creds).unwrap();
        assert_eq!(store.load().unwrap(), Some(creds));
    }

    #[cfg(unix)]
    #[test]
    fn test_saved_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let store = CredentialStore::new(temp.path().join("credentials.toml"));
        store
            .save(&Credentials::new("ana", "pw", "ws://h"))
            .unwrap();

        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_for_host_requires_matching_url() {
        let temp = TempDir::new().unwrap();
        let store = CredentialStore::new(temp.path().join("credentials.toml"));
        store
            .save(&Credentials::new("ana", "pw", "ws://one:3030"))
            .unwrap();

        assert!(store.for_host("ws://one:3030").unwrap().is_some());
        assert!(store.for_host("ws://two:3030").unwrap().is_none());
    }

    #[test]
    fn test_clear() {
        let temp = TempDir::new().unwrap();
        let store = CredentialStore::new(temp.path().join("credentials.toml"));
        store.save(&Credentials::new("a", "b", "c")).unwrap();
        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
        store.clear().unwrap();
    }

    #[test]
    fn test_debug_hides_password() {
        let creds = Credentials::new("ana", "hunter2", "ws://h");
        let shown = format!("{:?}", creds);
        assert!(!shown.contains("hunter2"));
        assert!(shown.contains("ana"));
    }

    #[tokio::test]
    async fn test_no_prompt_cancels() {
        let action = NoPrompt
            .on_auth_failure(&Credentials::new("a", "b", "c"), "denied")
            .await;
        assert_eq!(action, CredentialAction::Cancel);
    }
}
