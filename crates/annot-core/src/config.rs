//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/annot/config.toml)
//! 3. Environment variables (ANNOT_* prefix)
//!
//! Environment variables take precedence over config file values.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::anchor::DEFAULT_ANCHOR_LINES;

/// Environment variable prefix
const ENV_PREFIX: &str = "ANNOT";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for data storage (project databases, credentials)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Name recorded as the author of new comments
    #[serde(default = "default_author")]
    pub author_name: String,

    /// Lines of context captured on each side of an anchored line
    #[serde(default = "default_anchor_lines")]
    pub anchor_lines: usize,

    /// Remote document store
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Static analysis runner
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
}

/// Remote store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Whether the remote store is used at all
    #[serde(default)]
    pub enabled: bool,

    /// WebSocket URL of the document server
    #[serde(default)]
    pub url: Option<String>,

    /// Database name on the server
    #[serde(default = "default_database")]
    pub database: String,

    /// Retention window for remote documents, in seconds (none keeps forever)
    #[serde(default)]
    pub expire_after_secs: Option<u64>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            database: default_database(),
            expire_after_secs: None,
        }
    }
}

/// Analyzer invocation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// Executable to run
    #[serde(default = "default_analyzer_command")]
    pub command: String,

    /// Rule arguments passed before the target directory
    #[serde(default = "default_analyzer_args")]
    pub args: Vec<String>,

    /// Seconds before the run is abandoned
    #[serde(default = "default_analyzer_timeout")]
    pub timeout_secs: u64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            command: default_analyzer_command(),
            args: default_analyzer_args(),
            timeout_secs: default_analyzer_timeout(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            author_name: default_author(),
            anchor_lines: default_anchor_lines(),
            remote: RemoteConfig::default(),
            analyzer: AnalyzerConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (ANNOT_DATA_DIR, ANNOT_AUTHOR, ANNOT_REMOTE_URL, ANNOT_REMOTE_ENABLED)
    /// 2. Config file (~/.config/annot/config.toml or ANNOT_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // ANNOT_DATA_DIR
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        // ANNOT_AUTHOR
        if let Ok(val) = std::env::var(format!("{}_AUTHOR", ENV_PREFIX)) {
            if !val.is_empty() {
                self.author_name = val;
            }
        }

        // ANNOT_REMOTE_URL
        if let Ok(val) = std::env::var(format!("{}_REMOTE_URL", ENV_PREFIX)) {
            self.remote.url = if val.is_empty() { None } else { Some(val) };
        }

        // ANNOT_REMOTE_ENABLED
        if let Ok(val) = std::env::var(format!("{}_REMOTE_ENABLED", ENV_PREFIX)) {
            self.remote.enabled = val.eq_ignore_ascii_case("true") || val == "1";
        }
    }

    /// Ensure data directory exists
    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Save configuration to the default file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    /// Save configuration to a specific file
    pub fn save_to_path(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with ANNOT_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("annot")
            .join("config.toml")
    }

    /// Path to the project directory database
    pub fn projects_db_path(&self) -> PathBuf {
        self.data_dir.join("projects.db")
    }

    /// Path to the annotation database of one project
    pub fn project_db_path(&self, project: &Uuid) -> PathBuf {
        self.data_dir.join(format!("annot-{}.db", project))
    }

    /// Path to the stored remote credentials
    pub fn credentials_path(&self) -> PathBuf {
        self.data_dir.join("credentials.toml")
    }

    /// Whether the remote store should be brought up
    pub fn remote_configured(&self) -> bool {
        self.remote.enabled && self.remote.url.is_some()
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("annot")
}

fn default_author() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "anonymous".to_string())
}

fn default_anchor_lines() -> usize {
    DEFAULT_ANCHOR_LINES
}

fn default_database() -> String {
    "annot".to_string()
}

fn default_analyzer_command() -> String {
    "semgrep".to_string()
}

fn default_analyzer_args() -> Vec<String> {
    vec!["--config".to_string(), "auto".to_string()]
}

fn default_analyzer_timeout() -> u64 {
    240
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "ANNOT_DATA_DIR",
        "ANNOT_AUTHOR",
        "ANNOT_REMOTE_URL",
        "ANNOT_REMOTE_ENABLED",
    ];

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.remote.enabled);
        assert!(config.remote.url.is_none());
        assert_eq!(config.anchor_lines, 5);
        assert_eq!(config.analyzer.command, "semgrep");
        assert!(config.data_dir.ends_with("annot"));
        assert!(!config.remote_configured());
    }

    #[test]
    fn test_file_paths() {
        let config = Config::default();
        let project = Uuid::new_v4();

        assert!(config.projects_db_path().ends_with("projects.db"));
        assert!(config
            .project_db_path(&project)
            .ends_with(format!("annot-{}.db", project)));
        assert!(config.credentials_path().ends_with("credentials.toml"));
    }

    #[test]
    fn test_env_override_data_dir() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("ANNOT_DATA_DIR", "/tmp/annot-test");
        config.apply_env_overrides();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/annot-test"));
    }

    #[test]
    fn test_env_override_remote_enabled() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("ANNOT_REMOTE_ENABLED", "true");
        config.apply_env_overrides();
        assert!(config.remote.enabled);

        env::set_var("ANNOT_REMOTE_ENABLED", "1");
        config.remote.enabled = false;
        config.apply_env_overrides();
        assert!(config.remote.enabled);

        env::set_var("ANNOT_REMOTE_ENABLED", "false");
        config.apply_env_overrides();
        assert!(!config.remote.enabled);
    }

    #[test]
    fn test_env_override_remote_url() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("ANNOT_REMOTE_URL", "ws://localhost:4040");
        config.apply_env_overrides();
        assert_eq!(config.remote.url, Some("ws://localhost:4040".to_string()));

        // Empty string clears it
        env::set_var("ANNOT_REMOTE_URL", "");
        config.apply_env_overrides();
        assert!(config.remote.url.is_none());
    }

    #[test]
    fn test_env_override_author() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("ANNOT_AUTHOR", "reviewer");
        config.apply_env_overrides();
        assert_eq!(config.author_name, "reviewer");
    }

    #[test]
    fn test_serialization() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        config.data_dir = PathBuf::from("/data/annot");
        config.remote.url = Some("ws://sync.example.com".to_string());
        config.remote.enabled = true;
        config.remote.expire_after_secs = Some(86_400);

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("data_dir"));
        assert!(toml_str.contains("[remote]"));
        assert!(toml_str.contains("[analyzer]"));

        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.data_dir, config.data_dir);
        assert_eq!(parsed.remote.url, config.remote.url);
        assert_eq!(parsed.remote.expire_after_secs, Some(86_400));
        assert!(parsed.remote_configured());
    }

    #[test]
    fn test_load_from_str() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            data_dir = "/custom/data"
            author_name = "ada"

            [remote]
            enabled = true
            url = "ws://example.com"
        "#;

        let config = Config::load_from_str(toml).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.author_name, "ada");
        assert_eq!(config.remote.url, Some("ws://example.com".to_string()));
        assert_eq!(config.remote.database, "annot");
        assert!(config.remote.enabled);
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let _guard = EnvGuard::new(ENV_VARS);
        let dir = tempfile::TempDir::new().unwrap();
        env::set_var("ANNOT_DATA_DIR", dir.path().join("data"));

        let path = PathBuf::from("/nonexistent/config.toml");
        let config = Config::load_from_path(&path).unwrap();
        // Should return defaults when file doesn't exist
        assert!(!config.remote.enabled);
        assert!(config.data_dir.exists());
    }
}
