//! Thread and comment command handlers

use std::path::PathBuf;

use anyhow::{bail, Result};
use uuid::Uuid;

use annot_core::sync::LiveThread;
use annot_core::{ProjectSession, Workspace};

use crate::context::{resolve_id, AppContext};
use crate::output::short_id;

/// Start a thread on a 1-based line
pub async fn add(
    ctx: &AppContext,
    session: &ProjectSession,
    file: PathBuf,
    line: usize,
    body: String,
) -> Result<()> {
    if line == 0 {
        bail!("Line numbers start at 1");
    }
    let path = ctx.resolve_path(&file)?;
    let id = session
        .comments()
        .create_thread(&path, line - 1, &body)
        .await?;

    if ctx.output.is_quiet() {
        println!("{}", id);
    } else {
        ctx.output.success(&format!(
            "Started thread {} at {}:{}",
            short_id(&id),
            ctx.workspace().relative(&path),
            line
        ));
    }
    Ok(())
}

/// Add a comment to a thread
pub async fn reply(
    ctx: &AppContext,
    session: &ProjectSession,
    thread: String,
    body: String,
) -> Result<()> {
    let thread_id = resolve_thread(session, &thread).await?;
    let id = session.comments().reply(&thread_id, &body).await?;

    if ctx.output.is_quiet() {
        println!("{}", id);
    } else {
        ctx.output
            .success(&format!("Replied to thread {}", short_id(&thread_id)));
    }
    Ok(())
}

/// Replace the body of a comment
pub async fn edit(
    ctx: &AppContext,
    session: &ProjectSession,
    comment: String,
    body: String,
) -> Result<()> {
    let comment_id = resolve_comment(session, &comment).await?;
    session.comments().edit_comment(&comment_id, &body).await?;
    ctx.output
        .success(&format!("Edited comment {}", short_id(&comment_id)));
    Ok(())
}

/// Delete a thread or a single comment, or every thread with `all`
pub async fn delete(
    ctx: &AppContext,
    session: &ProjectSession,
    id: Option<String>,
    all: bool,
) -> Result<()> {
    if all {
        let removed = session.comments().delete_all().await?;
        ctx.output
            .success(&format!("Deleted {} thread(s)", removed));
        return Ok(());
    }
    let Some(id) = id else {
        bail!("Give a thread or comment id, or --all");
    };

    let threads = session.comments().threads().await;
    let mut candidates: Vec<(Uuid, String)> = Vec::new();
    for thread in &threads {
        candidates.push((thread.id, format!("thread at {}", thread.file_path)));
        for comment in &thread.comments {
            candidates.push((comment.id, format!("comment by {}", comment.author)));
        }
    }
    let target = resolve_id("thread or comment", &id, candidates)?;

    if threads.iter().any(|t| t.id == target) {
        session.comments().delete_thread(&target).await?;
        ctx.output
            .success(&format!("Deleted thread {}", short_id(&target)));
    } else {
        session.comments().delete_comment(&target).await?;
        ctx.output
            .success(&format!("Deleted comment {}", short_id(&target)));
    }
    Ok(())
}

/// List threads at their current lines, optionally for one file
pub async fn list(ctx: &AppContext, session: &ProjectSession, file: Option<PathBuf>) -> Result<()> {
    let filter = file
        .map(|f| ctx.resolve_path(&f))
        .transpose()?
        .map(|p| ctx.workspace().relative(&p));

    let threads: Vec<LiveThread> = session
        .comments()
        .threads()
        .await
        .into_iter()
        .map(|mut thread| {
            thread.file_path = ctx
                .workspace()
                .relative(std::path::Path::new(&thread.file_path));
            thread
        })
        .filter(|thread| filter.as_ref().map_or(true, |f| &thread.file_path == f))
        .collect();

    ctx.output.print_threads(&threads)
}

/// Re-anchor a thread to a 1-based line
pub async fn move_to(
    ctx: &AppContext,
    session: &ProjectSession,
    thread: String,
    line: usize,
) -> Result<()> {
    if line == 0 {
        bail!("Line numbers start at 1");
    }
    let thread_id = resolve_thread(session, &thread).await?;
    let landed = session.comments().reanchor(&thread_id, line - 1).await?;

    if landed + 1 != line {
        ctx.output.warn(&format!(
            "Line {} is past the end of the file, thread placed on line {}",
            line,
            landed + 1
        ));
    }
    ctx.output.success(&format!(
        "Moved thread {} to line {}",
        short_id(&thread_id),
        landed + 1
    ));
    Ok(())
}

async fn resolve_thread(session: &ProjectSession, id: &str) -> Result<Uuid> {
    let threads = session.comments().threads().await;
    resolve_id(
        "thread",
        id,
        threads
            .into_iter()
            .map(|t| (t.id, format!("{}:{}", t.file_path, t.line + 1))),
    )
}

async fn resolve_comment(session: &ProjectSession, id: &str) -> Result<Uuid> {
    let threads = session.comments().threads().await;
    resolve_id(
        "comment",
        id,
        threads.into_iter().flat_map(|t| {
            t.comments
                .into_iter()
                .map(|c| (c.id, format!("{}: {}", c.author, c.body)))
        }),
    )
}
