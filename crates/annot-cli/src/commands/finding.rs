//! Finding command handlers

use std::path::PathBuf;

use anyhow::{Context, Result};
use uuid::Uuid;

use annot_core::analysis::{parse_report, SOURCE_IMPORTED, SOURCE_LOCAL};
use annot_core::models::now_secs;
use annot_core::{Analyzer, Flag, ProjectSession, Workspace};

use crate::context::{resolve_id, AppContext};
use crate::output::short_id;

/// Import a semgrep JSON report
///
/// Paths in the report are relative to `base` (the workspace root by
/// default). Without `merge` the imported findings replace the current set.
pub async fn import(
    ctx: &AppContext,
    session: &ProjectSession,
    report: PathBuf,
    base: Option<PathBuf>,
    merge: bool,
) -> Result<()> {
    let raw = std::fs::read_to_string(&report)
        .with_context(|| format!("Failed to read report: {:?}", report))?;
    let base = match base {
        Some(base) => ctx.resolve_path(&base)?,
        None => ctx.workspace().root().to_path_buf(),
    };

    let findings = parse_report(
        &raw,
        &base,
        ctx.workspace().as_ref(),
        ctx.config.anchor_lines,
        SOURCE_IMPORTED,
        now_secs(),
    )?;
    let count = session.findings().import(&findings, !merge).await?;

    report_import(ctx, count, merge);
    Ok(())
}

/// Run the analyzer and import its results
pub async fn scan(
    ctx: &AppContext,
    session: &ProjectSession,
    dir: Option<PathBuf>,
    merge: bool,
) -> Result<()> {
    let dir = match dir {
        Some(dir) => ctx.resolve_path(&dir)?,
        None => ctx.workspace().root().to_path_buf(),
    };

    ctx.output
        .message(&format!("Running {}...", ctx.config.analyzer.command));
    let raw = Analyzer::new(ctx.config.analyzer.clone()).run(&dir).await?;
    let findings = parse_report(
        &raw,
        &dir,
        ctx.workspace().as_ref(),
        ctx.config.anchor_lines,
        SOURCE_LOCAL,
        now_secs(),
    )?;
    let count = session.findings().import(&findings, !merge).await?;

    report_import(ctx, count, merge);
    Ok(())
}

fn report_import(ctx: &AppContext, count: usize, merge: bool) {
    if ctx.output.is_quiet() {
        println!("{}", count);
    } else if merge {
        ctx.output
            .success(&format!("Merged {} finding(s)", count));
    } else {
        ctx.output
            .success(&format!("Imported {} finding(s)", count));
    }
}

/// List findings at their current lines
pub async fn list(ctx: &AppContext, session: &ProjectSession, flag: Option<String>) -> Result<()> {
    let flag: Option<Flag> = flag
        .map(|f| f.parse())
        .transpose()
        .map_err(anyhow::Error::msg)?;

    let findings: Vec<_> = session
        .findings()
        .findings()
        .await?
        .into_iter()
        .filter(|f| flag.map_or(true, |flag| f.finding.flag == flag))
        .collect();

    ctx.output.print_findings(&findings)
}

/// Set the triage flag of a finding
pub async fn flag(
    ctx: &AppContext,
    session: &ProjectSession,
    id: String,
    flag: String,
) -> Result<()> {
    let flag: Flag = flag.parse().map_err(anyhow::Error::msg)?;
    let id = resolve_finding(session, &id).await?;
    let finding = session.findings().set_flag(&id, flag).await?;

    if ctx.output.is_json() {
        ctx.output.json(&finding)?;
    } else {
        ctx.output.success(&format!(
            "Flagged {} as {}",
            short_id(&finding.id),
            finding.flag.label()
        ));
    }
    Ok(())
}

/// Delete one finding
pub async fn delete(ctx: &AppContext, session: &ProjectSession, id: String) -> Result<()> {
    let id = resolve_finding(session, &id).await?;
    session.findings().delete(&id).await?;
    ctx.output
        .success(&format!("Deleted finding {}", short_id(&id)));
    Ok(())
}

/// Delete every finding
pub async fn clear(ctx: &AppContext, session: &ProjectSession) -> Result<()> {
    let removed = session.findings().clear().await?;
    ctx.output
        .success(&format!("Deleted {} finding(s)", removed));
    Ok(())
}

async fn resolve_finding(session: &ProjectSession, id: &str) -> Result<Uuid> {
    let findings = session.findings().findings().await?;
    resolve_id(
        "finding",
        id,
        findings.into_iter().map(|f| {
            (
                f.finding.id,
                format!("{}:{} {}", f.finding.file_path, f.line + 1, f.finding.diagnostic.message),
            )
        }),
    )
}
