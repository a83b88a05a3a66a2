//! Project command handlers

use anyhow::{Context, Result};

use annot_core::cipher::{generate_key, key_proof};
use annot_core::sync::remove_database;
use annot_core::Project;

use crate::context::AppContext;
use crate::output::short_id;

/// Create a project and open it
pub async fn create(ctx: &AppContext, name: String, encrypted: bool) -> Result<()> {
    let mut project = Project::new(name.trim());
    if project.name.is_empty() {
        anyhow::bail!("Project name cannot be empty");
    }
    if encrypted {
        let key = generate_key();
        project.jwt = Some(key_proof(&key, &project.uuid));
        project.keys = Some(key);
    }

    ctx.directory
        .upsert(&project)
        .context("Failed to save project")?;
    ctx.directory.set_current(Some(project.uuid))?;
    ctx.sync_directory_quiet().await;

    if ctx.output.is_json() {
        ctx.output.json(&serde_json::json!({
            "uuid": project.uuid,
            "name": project.name,
            "encrypted": project.is_encrypted(),
        }))?;
    } else if ctx.output.is_quiet() {
        println!("{}", project.uuid);
    } else {
        ctx.output.success(&format!(
            "Created project {} ({})",
            project.name,
            short_id(&project.uuid)
        ));
    }
    Ok(())
}

/// List known projects
pub async fn list(ctx: &AppContext) -> Result<()> {
    ctx.sync_directory_quiet().await;
    let projects = ctx.directory.list()?;
    ctx.output.print_projects(&projects, ctx.directory.current()?)
}

/// Open a project and pull its annotations
pub async fn open(ctx: &AppContext, key: String) -> Result<()> {
    ctx.sync_directory_quiet().await;
    let project = ctx.find_project(&key)?;
    ctx.directory.set_current(Some(project.uuid))?;

    let session = ctx.open_session(project.clone(), true).await?;
    let threads = session.comments().threads().await.len();
    let findings = session.findings().findings().await?.len();
    session.close().await;

    if ctx.output.is_json() {
        ctx.output.json(&serde_json::json!({
            "uuid": project.uuid,
            "name": project.name,
            "threads": threads,
            "findings": findings,
        }))?;
    } else {
        ctx.output.success(&format!("Opened project {}", project.name));
        ctx.output.message(&format!(
            "  Threads: {}, Findings: {}",
            threads, findings
        ));
    }
    Ok(())
}

/// Remove a project here and, once synced, everywhere
pub async fn remove(ctx: &AppContext, key: String) -> Result<()> {
    let project = ctx.find_project(&key)?;

    ctx.directory.remove(&project.uuid)?;
    remove_database(&ctx.config, &project.uuid);
    ctx.sync_directory_quiet().await;

    ctx.output
        .success(&format!("Removed project {}", project.name));
    Ok(())
}

/// Sync the project directory with the remote
pub async fn sync(ctx: &AppContext) -> Result<()> {
    ctx.require_remote()?;
    let Some(report) = ctx.sync_directory().await? else {
        anyhow::bail!("Could not reach the remote store");
    };

    if ctx.output.is_json() {
        ctx.output.json(&report)?;
    } else {
        ctx.output.success("Project directory synced");
        ctx.output.message(&format!(
            "  Added: {}, Removed: {}, Pushed: {}",
            report.added, report.removed, report.pushed
        ));
    }
    Ok(())
}
