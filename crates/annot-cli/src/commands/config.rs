//! Config command handlers

use anyhow::{bail, Context, Result};

use annot_core::Config;

use crate::output::{Output, OutputFormat};

/// Keys accepted by `annot config set`
const KEYS: &str = "data_dir, author_name, anchor_lines, remote.enabled, remote.url, \
                    remote.database, remote.expire_after_secs, analyzer.command, \
                    analyzer.timeout_secs";

/// Show current configuration
pub fn show(output: &Output) -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => output.json(&config)?,
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            println!("Configuration:");
            println!("  data_dir:                 {}", config.data_dir.display());
            println!("  author_name:              {}", config.author_name);
            println!("  anchor_lines:             {}", config.anchor_lines);
            println!("  remote.enabled:           {}", config.remote.enabled);
            println!(
                "  remote.url:               {}",
                config.remote.url.as_deref().unwrap_or("(not set)")
            );
            println!("  remote.database:          {}", config.remote.database);
            println!(
                "  remote.expire_after_secs: {}",
                config
                    .remote
                    .expire_after_secs
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "(never)".to_string())
            );
            println!("  analyzer.command:         {}", config.analyzer.command);
            println!("  analyzer.args:            {}", config.analyzer.args.join(" "));
            println!("  analyzer.timeout_secs:    {}", config.analyzer.timeout_secs);
            println!();
            println!("Config file: {}", Config::config_file_path().display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(key: String, value: String, output: &Output) -> Result<()> {
    let mut config = Config::load().context("Failed to load configuration")?;
    apply(&mut config, &key, &value)?;
    config.save().context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));

    Ok(())
}

fn optional(value: &str) -> Option<String> {
    if value.is_empty() || value == "none" {
        None
    } else {
        Some(value.to_string())
    }
}

fn apply(config: &mut Config, key: &str, value: &str) -> Result<()> {
    match key {
        "data_dir" => {
            config.data_dir = value.into();
        }
        "author_name" => {
            if value.is_empty() {
                bail!("author_name cannot be empty");
            }
            config.author_name = value.to_string();
        }
        "anchor_lines" => {
            config.anchor_lines = value
                .parse()
                .context("Invalid value for anchor_lines. Use a whole number.")?;
        }
        "remote.enabled" => {
            config.remote.enabled = value
                .parse()
                .context("Invalid value for remote.enabled. Use 'true' or 'false'.")?;
        }
        "remote.url" => {
            config.remote.url = optional(value);
        }
        "remote.database" => {
            if value.is_empty() {
                bail!("remote.database cannot be empty");
            }
            config.remote.database = value.to_string();
        }
        "remote.expire_after_secs" => {
            config.remote.expire_after_secs = optional(value)
                .map(|v| v.parse())
                .transpose()
                .context("Invalid value for remote.expire_after_secs. Use seconds or 'none'.")?;
        }
        "analyzer.command" => {
            if value.is_empty() {
                bail!("analyzer.command cannot be empty");
            }
            config.analyzer.command = value.to_string();
        }
        "analyzer.timeout_secs" => {
            config.analyzer.timeout_secs = value
                .parse()
                .context("Invalid value for analyzer.timeout_secs. Use seconds.")?;
        }
        _ => {
            bail!(
                "Unknown configuration key: '{}'\nValid keys: {}",
                key,
                KEYS
            );
        }
    }
    Ok(())
}
