//! Sync command handler

use anyhow::{bail, Result};

use crate::context::AppContext;

/// Sync the project directory and the open project with the remote
pub async fn sync(ctx: &AppContext) -> Result<()> {
    let url = ctx.require_remote()?.to_string();
    ctx.output.message(&format!("Connecting to {}...", url));

    ctx.sync_directory_quiet().await;
    let session = ctx.open_current(true).await?;
    if !session.is_connected() {
        session.close().await;
        bail!("Could not sync with {}", url);
    }

    let report = session.sync().await;
    let threads = session.comments().threads().await.len();
    let findings = session.findings().findings().await.map(|f| f.len());
    session.close().await;
    let report = report?;
    let findings = findings?;

    if ctx.output.is_json() {
        ctx.output.json(&serde_json::json!({
            "report": report,
            "threads": threads,
            "findings": findings,
        }))?;
        return Ok(());
    }

    ctx.output.success("Sync complete");
    if let Some(comments) = &report.comments {
        if !comments.is_empty() {
            ctx.output.message(&format!(
                "  Threads added: {}, Comments added: {}, updated: {}, deletions applied: {}",
                comments.threads_added,
                comments.comments_added,
                comments.comments_updated,
                comments.tombstones_applied
            ));
        }
    }
    ctx.output.message(&format!(
        "  Threads: {}, Findings: {}",
        threads, findings
    ));
    Ok(())
}
