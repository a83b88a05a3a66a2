//! Shared state for commands: configuration, project directory and sessions

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use uuid::Uuid;

use annot_core::remote::{CredentialStore, Credentials, DocumentBackend, WsBackend};
use annot_core::sync::{sync_projects, ProjectSyncReport};
use annot_core::workspace::LogNotifier;
use annot_core::{
    Config, FsWorkspace, Notifier, Project, ProjectDirectory, ProjectSession, RemoteBinding,
    RemoteStore, SyncOptions,
};

use crate::output::{short_id, Output, OutputFormat, PrintNotifier};
use crate::prompt::StdinPrompt;

/// Everything a command needs besides its arguments
pub struct AppContext {
    pub config: Config,
    pub directory: ProjectDirectory,
    pub output: Output,
    workspace: Arc<FsWorkspace>,
}

impl AppContext {
    /// Open the project directory and resolve the workspace root
    pub fn open(config: Config, workspace: Option<PathBuf>, output: Output) -> Result<Self> {
        let root = match workspace {
            Some(root) => absolute(&root)?,
            None => std::env::current_dir().context("Failed to read current directory")?,
        };
        let directory = ProjectDirectory::open(&config.projects_db_path())
            .context("Failed to open project directory")?;

        Ok(Self {
            config,
            directory,
            output,
            workspace: Arc::new(FsWorkspace::new(root)),
        })
    }

    pub fn workspace(&self) -> &Arc<FsWorkspace> {
        &self.workspace
    }

    /// Resolve a path argument against the current directory
    pub fn resolve_path(&self, path: &Path) -> Result<PathBuf> {
        absolute(path)
    }

    /// The open project
    pub fn current_project(&self) -> Result<Project> {
        let Some(uuid) = self.directory.current()? else {
            bail!(
                "No project open. Create one with:\n  \
                 annot project create <name>\n\
                 or open an existing one with:\n  \
                 annot project open <name>"
            );
        };
        match self.directory.get(&uuid)? {
            Some(project) if !project.deleted => Ok(project),
            _ => bail!("The open project {} no longer exists", short_id(&uuid)),
        }
    }

    /// Find a project by name, uuid or uuid prefix
    pub fn find_project(&self, key: &str) -> Result<Project> {
        self.directory
            .find(key)?
            .with_context(|| format!("No project found matching: {}", key))
    }

    /// Connect to the configured document server
    ///
    /// Returns `None` when no remote is configured or it cannot be reached;
    /// the latter is reported as a warning and commands carry on locally.
    pub async fn backend(&self) -> Option<Arc<dyn DocumentBackend>> {
        if !self.config.remote_configured() {
            return None;
        }
        let url = self.config.remote.url.as_deref()?;
        match WsBackend::connect(url).await {
            Ok(backend) => Some(Arc::new(backend)),
            Err(e) => {
                self.output
                    .warn(&format!("Remote store unavailable, working offline: {}", e));
                None
            }
        }
    }

    fn credential_store(&self) -> CredentialStore {
        CredentialStore::new(self.config.credentials_path())
    }

    /// Stored credentials for the configured remote, or a first guess
    fn initial_credentials(&self, url: &str) -> Result<Credentials> {
        let stored = self
            .credential_store()
            .for_host(url)
            .context("Failed to read stored credentials")?;
        Ok(stored.unwrap_or_else(|| Credentials::new(&self.config.author_name, "", url)))
    }

    /// Authenticate `remote`, prompting on failure
    ///
    /// Returns whether the remote is ready. Newly entered credentials are
    /// saved once they work.
    async fn enable_remote(&self, remote: &RemoteStore, url: &str) -> Result<bool> {
        let prompt = StdinPrompt::new(url);
        let enabled = remote
            .enable(self.initial_credentials(url)?, &prompt)
            .await
            .context("Failed to connect to remote store")?;
        if enabled {
            self.save_provided(&prompt);
        }
        Ok(enabled)
    }

    fn save_provided(&self, prompt: &StdinPrompt) {
        if let Some(credentials) = prompt.provided() {
            if let Err(e) = self.credential_store().save(&credentials) {
                self.output
                    .warn(&format!("Failed to save credentials: {:#}", e));
            }
        }
    }

    /// Reconcile the project directory with the remote one
    ///
    /// Returns `None` when there is no reachable remote.
    pub async fn sync_directory(&self) -> Result<Option<ProjectSyncReport>> {
        let Some(backend) = self.backend().await else {
            return Ok(None);
        };
        let url = self.config.remote.url.clone().unwrap_or_default();
        let remote = RemoteStore::new(backend);
        if !self.enable_remote(&remote, &url).await? {
            self.output.warn("Remote login cancelled, working offline");
            return Ok(None);
        }

        let report = sync_projects(&self.directory, &remote, &self.config).await;
        remote.disable();
        Ok(Some(report?))
    }

    /// Directory sync before reads; failures only warn
    pub async fn sync_directory_quiet(&self) {
        if let Err(e) = self.sync_directory().await {
            self.output
                .warn(&format!("Project directory sync failed: {:#}", e));
        }
    }

    /// Open a session on `project`, connected to the remote when `connect`
    /// is set and a remote is configured
    pub async fn open_session(&self, project: Project, connect: bool) -> Result<ProjectSession> {
        let binding = if !connect {
            None
        } else if project.is_encrypted() {
            self.output.warn(&format!(
                "Project {} is encrypted and no field cipher is available, working offline",
                project.name
            ));
            None
        } else {
            self.backend()
                .await
                .map(|backend| RemoteBinding {
                    backend,
                    cipher: None,
                })
        };
        let has_binding = binding.is_some();
        let notifier: Arc<dyn Notifier> = if self.output.format == OutputFormat::Human {
            Arc::new(PrintNotifier::new(self.output))
        } else {
            Arc::new(LogNotifier)
        };

        let mut session = ProjectSession::open(
            &self.config,
            project,
            self.workspace.clone(),
            notifier,
            binding,
            SyncOptions::default(),
        )
        .await
        .context("Failed to open project")?;
        session.load().await.context("Failed to load annotations")?;

        if has_binding {
            let url = self.config.remote.url.clone().unwrap_or_default();
            let prompt = StdinPrompt::new(url.as_str());
            let credentials = self.initial_credentials(&url)?;
            match session.connect(credentials, &prompt).await {
                Ok(true) => self.save_provided(&prompt),
                Ok(false) => self.output.warn("Remote login cancelled, working offline"),
                Err(e) => self
                    .output
                    .warn(&format!("Remote sync failed, working offline: {}", e)),
            }
        }
        Ok(session)
    }

    /// Open a session on the open project
    pub async fn open_current(&self, connect: bool) -> Result<ProjectSession> {
        let project = self.current_project()?;
        self.open_session(project, connect).await
    }

    /// Check that the remote settings are complete
    pub fn require_remote(&self) -> Result<&str> {
        if !self.config.remote.enabled {
            bail!(
                "Remote sync is not enabled. Enable it with:\n  \
                 annot config set remote.enabled true\n  \
                 annot config set remote.url ws://your-server:3030"
            );
        }
        let Some(url) = self.config.remote.url.as_deref() else {
            bail!(
                "Remote URL not configured. Set it with:\n  \
                 annot config set remote.url ws://your-server:3030"
            );
        };
        Ok(url)
    }
}

/// Resolve a path against the current directory
fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    Ok(cwd.join(path))
}

/// Resolve a full id or unique id prefix among candidates
///
/// `candidates` pairs each id with a label shown when the prefix is
/// ambiguous.
pub fn resolve_id<I>(kind: &str, id: &str, candidates: I) -> Result<Uuid>
where
    I: IntoIterator<Item = (Uuid, String)>,
{
    let candidates: Vec<(Uuid, String)> = candidates.into_iter().collect();

    // Try full UUID first
    if let Ok(uuid) = Uuid::parse_str(id) {
        if candidates.iter().any(|(c, _)| *c == uuid) {
            return Ok(uuid);
        }
        bail!("No {} found matching: {}", kind, id);
    }

    let needle = id.replace('-', "").to_ascii_lowercase();
    if needle.is_empty() {
        bail!("Empty {} id", kind);
    }
    let matches: Vec<&(Uuid, String)> = candidates
        .iter()
        .filter(|(c, _)| c.simple().to_string().starts_with(&needle))
        .collect();

    match matches.as_slice() {
        [] => bail!("No {} found matching: {}", kind, id),
        [(uuid, _)] => Ok(*uuid),
        _ => {
            eprintln!("Multiple {}s match '{}':", kind, id);
            for (uuid, label) in &matches {
                eprintln!("  {} - {}", uuid, label);
            }
            bail!("Ambiguous ID. Please provide more characters.");
        }
    }
}
