//! Project directory sync
//!
//! Shares the list of projects (never their keys) through the remote
//! directory collection. Removal wins: a project tombstoned on either side
//! ends up tombstoned on both, and its local database is deleted.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::SyncError;
use crate::config::Config;
use crate::models::Project;
use crate::remote::RemoteStore;
use crate::storage::ProjectDirectory;

/// What a directory sync did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProjectSyncReport {
    /// Projects learned from the remote directory
    pub added: usize,
    /// Local projects removed because they were removed remotely
    pub removed: usize,
    /// Projects or removals sent to the remote directory
    pub pushed: usize,
}

/// Reconcile the local project directory with the remote one
pub async fn sync_projects(
    directory: &ProjectDirectory,
    remote: &RemoteStore,
    config: &Config,
) -> Result<ProjectSyncReport, SyncError> {
    let mut report = ProjectSyncReport::default();

    let theirs: HashMap<Uuid, Project> = remote
        .list_projects()
        .await?
        .into_iter()
        .map(|p| (p.uuid, p))
        .collect();
    let ours: HashMap<Uuid, Project> = directory
        .list_all()?
        .into_iter()
        .map(|p| (p.uuid, p))
        .collect();

    for (uuid, local) in &ours {
        match theirs.get(uuid) {
            Some(remote_project) if remote_project.deleted && !local.deleted => {
                directory.remove(uuid)?;
                remove_database(config, uuid);
                report.removed += 1;
                info!("Project {} was removed remotely", uuid);
            }
            Some(remote_project) if local.deleted && !remote_project.deleted => {
                remote.push_project(local).await?;
                report.pushed += 1;
            }
            Some(_) => {}
            None => {
                remote.push_project(local).await?;
                report.pushed += 1;
                debug!("Shared project {} ({})", local.name, uuid);
            }
        }
    }

    for (uuid, remote_project) in theirs {
        if ours.contains_key(&uuid) {
            continue;
        }
        if !remote_project.deleted {
            report.added += 1;
        }
        directory.upsert(&Project {
            keys: None,
            ..remote_project
        })?;
    }

    if report != ProjectSyncReport::default() {
        info!("Project sync: {:?}", report);
    }
    Ok(report)
}

/// Delete the local database of a project, if present
pub fn remove_database(config: &Config, uuid: &Uuid) {
    let path = config.project_db_path(uuid);
    if !path.exists() {
        return;
    }
    match std::fs::remove_file(&path) {
        Ok(()) => debug!("Removed {:?}", path),
        Err(e) => warn!("Failed to remove {:?}: {}", path, e),
    }
}
