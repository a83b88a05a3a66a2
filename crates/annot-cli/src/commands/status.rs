//! Status command handler

use anyhow::Result;

use annot_core::Workspace;

use crate::context::AppContext;
use crate::output::{short_id, OutputFormat};

/// Show the open project and local counts, without contacting the remote
pub async fn show(ctx: &AppContext) -> Result<()> {
    let config = &ctx.config;
    let project = match ctx.directory.current()? {
        Some(_) => Some(ctx.current_project()?),
        None => None,
    };

    let (threads, findings) = match &project {
        Some(project) => {
            let session = ctx.open_session(project.clone(), false).await?;
            let threads = session.comments().threads().await.len();
            let findings = session.findings().findings().await.map(|f| f.len());
            session.close().await;
            (threads, findings?)
        }
        None => (0, 0),
    };

    match ctx.output.format {
        OutputFormat::Json => {
            ctx.output.json(&serde_json::json!({
                "project": project.as_ref().map(|p| serde_json::json!({
                    "uuid": p.uuid,
                    "name": p.name,
                    "encrypted": p.is_encrypted(),
                })),
                "workspace": ctx.workspace().root(),
                "remote": {
                    "enabled": config.remote.enabled,
                    "url": config.remote.url,
                },
                "data_dir": config.data_dir,
                "counts": {
                    "threads": threads,
                    "findings": findings,
                }
            }))?;
        }
        OutputFormat::Quiet => {
            if let Some(project) = &project {
                println!("{}", project.uuid);
            }
        }
        OutputFormat::Human => {
            println!("annot Status");
            println!("============");
            println!();
            match &project {
                Some(project) => {
                    println!("Project:");
                    println!("  Name: {}", project.name);
                    println!("  ID:   {}", short_id(&project.uuid));
                    if project.is_encrypted() {
                        println!("  Encrypted");
                    }
                }
                None => println!("No project open."),
            }
            println!();
            println!("Workspace: {}", ctx.workspace().root().display());
            println!();
            println!("Remote:");
            println!(
                "  Status: {}",
                if config.remote.enabled {
                    "enabled"
                } else {
                    "disabled"
                }
            );
            if let Some(ref url) = config.remote.url {
                println!("  Server: {}", url);
            }
            println!();
            println!("Storage:");
            println!("  Location: {}", config.data_dir.display());
            println!();
            println!("Contents:");
            println!("  Threads:  {}", threads);
            println!("  Findings: {}", findings);
        }
    }

    Ok(())
}
