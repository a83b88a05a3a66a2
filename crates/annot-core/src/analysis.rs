//! Static analysis ingestion
//!
//! Runs the configured analyzer (semgrep by default) over a directory and
//! turns its JSON report into findings anchored in the current file content.
//! Reports produced elsewhere can be imported with [`parse_report`].

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::anchor::Anchor;
use crate::config::AnalyzerConfig;
use crate::models::{DiagnosticPayload, Finding};
use crate::workspace::Workspace;

/// Source recorded on findings from a local analyzer run
pub const SOURCE_LOCAL: &str = "semgrep-local";

/// Source recorded on findings from an imported report
pub const SOURCE_IMPORTED: &str = "semgrep-imported";

/// Errors from running the analyzer or reading its report
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Failed to start analyzer '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Analyzer timed out after {0}s")]
    Timeout(u64),

    #[error("Analyzer exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("Malformed analyzer report: {0}")]
    Report(#[from] serde_json::Error),
}

/// Top level of a semgrep `--json` report
#[derive(Debug, Deserialize)]
pub struct Report {
    #[serde(default)]
    pub results: Vec<ReportResult>,
}

#[derive(Debug, Deserialize)]
pub struct ReportResult {
    #[serde(default)]
    pub check_id: Option<String>,
    pub path: String,
    pub start: Position,
    pub end: Position,
    #[serde(default)]
    pub extra: Extra,
}

/// 1-based line and column
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Position {
    pub line: usize,
    pub col: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct Extra {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Default, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub references: Vec<String>,
}

/// Parse a report into findings
///
/// Paths in the report are taken relative to `base` (the directory the
/// analyzer ran in) and stored workspace-relative. Each finding is anchored
/// in the current content of its file; unreadable files get an anchor that
/// only remembers the line.
pub fn parse_report(
    raw: &str,
    base: &Path,
    workspace: &dyn Workspace,
    anchor_lines: usize,
    source: &str,
    created: f64,
) -> Result<Vec<Finding>, AnalysisError> {
    let report: Report = serde_json::from_str(raw)?;
    debug!("Analyzer report has {} result(s)", report.results.len());

    let findings = report
        .results
        .into_iter()
        .map(|result| {
            let path = resolve(base, &result.path);
            let line = result.start.line.saturating_sub(1);
            let anchor = match workspace.read_document(&path) {
                Some(document) => Anchor::capture(&document, line, anchor_lines),
                None => {
                    warn!("Finding references unreadable file {:?}", path);
                    Anchor {
                        line,
                        ..Default::default()
                    }
                }
            };

            let diagnostic = DiagnosticPayload {
                message: result.extra.message,
                severity: result
                    .extra
                    .metadata
                    .severity
                    .or(result.extra.severity)
                    .unwrap_or_default(),
                source: result
                    .extra
                    .metadata
                    .source
                    .unwrap_or_else(|| source.to_string()),
                references: result.extra.metadata.references,
                rule: result.check_id,
                start_column: result.start.col.saturating_sub(1),
                end_line: result.end.line.saturating_sub(1),
                end_column: result.end.col.saturating_sub(1),
            };
            Finding::new(diagnostic, anchor, workspace.relative(&path), created)
        })
        .collect();
    Ok(findings)
}

fn resolve(base: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        return path.to_path_buf();
    }
    path.components()
        .filter(|c| !matches!(c, std::path::Component::CurDir))
        .fold(base.to_path_buf(), |acc, c| acc.join(c))
}

/// Runs the configured analyzer
#[derive(Debug, Clone)]
pub struct Analyzer {
    config: AnalyzerConfig,
}

impl Analyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    /// Arguments passed for a run over the current directory
    pub fn args(&self) -> Vec<String> {
        let mut args = vec!["--json".to_string(), "--quiet".to_string()];
        args.extend(self.config.args.iter().cloned());
        args.push("./".to_string());
        args
    }

    /// Run in `dir` and return the raw JSON report
    pub async fn run(&self, dir: &Path) -> Result<String, AnalysisError> {
        info!("Running {} in {:?}", self.config.command, dir);
        let child = Command::new(&self.config.command)
            .args(self.args())
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| AnalysisError::Spawn {
                command: self.config.command.clone(),
                source,
            })?;

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| AnalysisError::Timeout(self.config.timeout_secs))?
            .map_err(|source| AnalysisError::Spawn {
                command: self.config.command.clone(),
                source,
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            return Err(AnalysisError::Failed {
                status: output.status.to_string(),
                stderr,
            });
        }
        if !stderr.is_empty() {
            warn!("Analyzer stderr: {}", stderr);
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Flag;
    use crate::workspace::MemoryWorkspace;

    const REPORT: &str = r#"{
        "results": [
            {
                "check_id": "rules.sql-injection",
                "path": "./src/db.rs",
                "start": {"line": 3, "col": 5},
                "end": {"line": 3, "col": 30},
                "extra": {
                    "message": "Query built from user input",
                    "severity": "ERROR",
                    "metadata": {"references": ["https://example.org/sqli"]}
                }
            },
            {
                "path": "gone.rs",
                "start": {"line": 10, "col": 1},
                "end": {"line": 10, "col": 2},
                "extra": {"message": "x", "metadata": {"source": "custom", "severity": "INFO"}}
            }
        ],
        "errors": []
    }"#;

    fn workspace() -> MemoryWorkspace {
        let ws = MemoryWorkspace::new("/ws");
        ws.set_document(
            "src/db.rs",
            "use db::run;\n\nfn query(input: &str) {\n    run(format!(\"SELECT {}\", input));\n}\n",
        );
        ws
    }

    #[test]
    fn test_parse_report() {
        let ws = workspace();
        let findings =
            parse_report(REPORT, Path::new("/ws"), &ws, 5, SOURCE_LOCAL, 42.0).unwrap();
        assert_eq!(findings.len(), 2);

        let first = &findings[0];
        assert_eq!(first.file_path, "src/db.rs");
        assert_eq!(first.anchor.line, 2);
        assert_eq!(first.anchor.lines_before, 2);
        assert_eq!(first.diagnostic.severity, "ERROR");
        assert_eq!(first.diagnostic.source, SOURCE_LOCAL);
        assert_eq!(first.diagnostic.rule.as_deref(), Some("rules.sql-injection"));
        assert_eq!(first.diagnostic.references, vec!["https://example.org/sqli"]);
        assert_eq!(first.diagnostic.start_column, 4);
        assert_eq!(first.flag, Flag::Unflagged);
        assert_eq!(first.created, 42.0);

        let second = &findings[1];
        assert_eq!(second.file_path, "gone.rs");
        assert_eq!(second.anchor.line, 9);
        assert!(second.anchor.text.is_empty());
        assert_eq!(second.diagnostic.source, "custom");
        assert_eq!(second.diagnostic.severity, "INFO");
    }

    #[test]
    fn test_report_relative_to_subdirectory() {
        let ws = workspace();
        let raw = r#"{"results": [{"path": "db.rs", "start": {"line": 1, "col": 1},
            "end": {"line": 1, "col": 2}, "extra": {"message": "m"}}]}"#;
        let findings =
            parse_report(raw, Path::new("/ws/src"), &ws, 5, SOURCE_IMPORTED, 1.0).unwrap();
        assert_eq!(findings[0].file_path, "src/db.rs");
        assert_eq!(findings[0].diagnostic.source, SOURCE_IMPORTED);
    }

    #[test]
    fn test_malformed_report() {
        let ws = workspace();
        let err = parse_report("not json", Path::new("/ws"), &ws, 5, SOURCE_LOCAL, 1.0);
        assert!(matches!(err, Err(AnalysisError::Report(_))));
    }

    #[test]
    fn test_args() {
        let analyzer = Analyzer::new(AnalyzerConfig::default());
        assert_eq!(
            analyzer.args(),
            vec!["--json", "--quiet", "--config", "auto", "./"]
        );
    }

    #[tokio::test]
    async fn test_missing_analyzer() {
        let analyzer = Analyzer::new(AnalyzerConfig {
            command: "annot-no-such-analyzer".into(),
            ..AnalyzerConfig::default()
        });
        let err = analyzer.run(Path::new(".")).await.unwrap_err();
        assert!(matches!(err, AnalysisError::Spawn { .. }));
    }
}
