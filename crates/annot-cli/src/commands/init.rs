//! Init command handler

use anyhow::{Context, Result};

use annot_core::{Config, ProjectDirectory};

use crate::output::Output;

/// Write a config file and create the data directory
pub fn run(output: &Output) -> Result<()> {
    let config_path = Config::config_file_path();
    let existed = config_path.exists();
    let config = Config::load().context("Failed to load configuration")?;

    if !existed {
        config.save().context("Failed to write configuration")?;
    }
    ProjectDirectory::open(&config.projects_db_path())
        .context("Failed to create project directory")?;

    if output.is_json() {
        output.json(&serde_json::json!({
            "config_file": config_path,
            "data_dir": config.data_dir,
            "created": !existed,
        }))?;
        return Ok(());
    }
    if output.is_quiet() {
        return Ok(());
    }

    println!();
    if existed {
        println!("Already initialized.");
    } else {
        println!("Initialized annot.");
    }
    println!("  Config file: {}", config_path.display());
    println!("  Data dir:    {}", config.data_dir.display());
    println!();
    println!("Create a project to start annotating:");
    println!("  annot project create <name>");
    if !config.remote_configured() {
        println!();
        println!("To share annotations, point annot at a document server:");
        println!("  annot config set remote.url ws://your-server:3030");
        println!("  annot config set remote.enabled true");
    }

    Ok(())
}
