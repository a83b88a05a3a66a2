//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use serde::Serialize;

use annot_core::models::Project;
use annot_core::sync::{LiveThread, LocatedFinding};
use annot_core::{Notification, Notifier};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
#[derive(Debug, Clone, Copy)]
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Check if output is in quiet mode
    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    /// Check if output is JSON
    pub fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Print any value as pretty JSON
    pub fn json<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let text = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
        println!("{}", text);
        Ok(())
    }

    /// Print threads with their comments
    pub fn print_threads(&self, threads: &[LiveThread]) -> Result<()> {
        match self.format {
            OutputFormat::Human => {
                if threads.is_empty() {
                    println!("No threads.");
                    return Ok(());
                }
                for thread in threads {
                    self.print_thread_human(thread);
                    println!();
                }
                println!("{} thread(s)", threads.len());
            }
            OutputFormat::Json => self.json(threads)?,
            OutputFormat::Quiet => {
                for thread in threads {
                    println!("{}", thread.id);
                }
            }
        }
        Ok(())
    }

    fn print_thread_human(&self, thread: &LiveThread) {
        println!(
            "{} {}:{}",
            short_id(&thread.id),
            thread.file_path,
            thread.line + 1
        );
        for comment in &thread.comments {
            println!(
                "  [{}] {} ({}): {}",
                short_id(&comment.id),
                comment.author,
                format_time(comment.last_modified),
                truncate_line(&comment.body, 60)
            );
        }
    }

    /// Print findings
    pub fn print_findings(&self, findings: &[LocatedFinding]) -> Result<()> {
        match self.format {
            OutputFormat::Human => {
                if findings.is_empty() {
                    println!("No findings.");
                    return Ok(());
                }
                for located in findings {
                    let finding = &located.finding;
                    println!(
                        "{} | {:<14} | {:<8} | {}:{} | {}",
                        short_id(&finding.id),
                        finding.flag.label(),
                        truncate(&finding.diagnostic.severity, 8),
                        finding.file_path,
                        located.line + 1,
                        truncate_line(&finding.diagnostic.message, 50)
                    );
                }
                println!("\n{} finding(s)", findings.len());
            }
            OutputFormat::Json => self.json(findings)?,
            OutputFormat::Quiet => {
                for located in findings {
                    println!("{}", located.finding.id);
                }
            }
        }
        Ok(())
    }

    /// Print the project directory, marking the open project
    pub fn print_projects(&self, projects: &[Project], current: Option<uuid::Uuid>) -> Result<()> {
        match self.format {
            OutputFormat::Human => {
                if projects.is_empty() {
                    println!("No projects. Create one with: annot project create <name>");
                    return Ok(());
                }
                for project in projects {
                    let marker = if Some(project.uuid) == current { "*" } else { " " };
                    let lock = if project.is_encrypted() { " [encrypted]" } else { "" };
                    println!(
                        "{} {} | {}{}",
                        marker,
                        short_id(&project.uuid),
                        project.name,
                        lock
                    );
                }
                println!("\n{} project(s)", projects.len());
            }
            OutputFormat::Json => {
                let listed: Vec<_> = projects
                    .iter()
                    .map(|p| {
                        serde_json::json!({
                            "uuid": p.uuid,
                            "name": p.name,
                            "encrypted": p.is_encrypted(),
                            "current": Some(p.uuid) == current,
                        })
                    })
                    .collect();
                self.json(&listed)?;
            }
            OutputFormat::Quiet => {
                for project in projects {
                    println!("{}", project.uuid);
                }
            }
        }
        Ok(())
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print a warning to stderr (suppressed in quiet mode)
    pub fn warn(&self, msg: &str) {
        if !self.is_quiet() {
            eprintln!("⚠ {}", msg);
        }
    }
}

/// Prints activity of other users as it is synced in
#[derive(Debug, Clone, Copy)]
pub struct PrintNotifier {
    output: Output,
}

impl PrintNotifier {
    pub fn new(output: Output) -> Self {
        Self { output }
    }
}

impl Notifier for PrintNotifier {
    fn notify(&self, notification: Notification) {
        if self.output.is_quiet() {
            return;
        }
        match notification {
            Notification::ThreadAdded {
                file_path, line, ..
            } => eprintln!("↳ new thread at {}:{}", file_path, line + 1),
            Notification::CommentAdded { author, body, .. } => {
                eprintln!("↳ {}: {}", author, truncate_line(&body, 60))
            }
            Notification::CommentUpdated { body, .. } => {
                eprintln!("↳ comment edited: {}", truncate_line(&body, 60))
            }
            Notification::FindingsChanged { count } => {
                eprintln!("↳ {} finding(s) updated", count)
            }
        }
    }
}

/// First 8 characters of an id
pub fn short_id(id: &uuid::Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

fn format_time(secs: f64) -> String {
    Utc.timestamp_millis_opt((secs * 1000.0) as i64)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "?".to_string())
}

/// Truncate a string to max length, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Truncate to first line and max length
fn truncate_line(s: &str, max_len: usize) -> String {
    let first_line = s.lines().next().unwrap_or("");
    truncate(first_line, max_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_flags() {
        assert_eq!(OutputFormat::from_flags(false, false), OutputFormat::Human);
        assert_eq!(OutputFormat::from_flags(true, false), OutputFormat::Json);
        assert_eq!(OutputFormat::from_flags(false, true), OutputFormat::Quiet);
        // Quiet takes precedence
        assert_eq!(OutputFormat::from_flags(true, true), OutputFormat::Quiet);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a long string", 10), "this is...");
        assert_eq!(truncate("ééééééé", 5), "éé...");
    }

    #[test]
    fn test_truncate_line() {
        assert_eq!(truncate_line("single line", 20), "single line");
        assert_eq!(truncate_line("line one\nline two", 20), "line one");
        assert_eq!(
            truncate_line("very long single line here", 10),
            "very lo..."
        );
    }

    #[test]
    fn test_short_id() {
        let id = uuid::Uuid::parse_str("67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap();
        assert_eq!(short_id(&id), "67e55044");
    }

    #[test]
    fn test_format_time() {
        assert_eq!(format_time(0.0), "1970-01-01 00:00");
        assert_eq!(format_time(86_400.0 + 90.5), "1970-01-02 00:01");
    }
}
