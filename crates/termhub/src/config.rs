//! Configuration management for termhub.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/termhub/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Smallest admissible session limit.
pub const MIN_SESSIONS: usize = 1;

/// Largest admissible session limit.
pub const MAX_SESSIONS: usize = 1000;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("scrollback_cap must be greater than 0, got {0}")]
    InvalidScrollbackCap(usize),

    #[error("output_batch_size must be greater than 0, got {0}")]
    InvalidBatchSize(usize),

    #[error("throttle_interval_ms must be greater than 0, got {0}")]
    InvalidThrottleInterval(u64),

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for termhub.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Session management configuration.
    pub session: SessionConfig,

    /// Working-directory boundary configuration.
    pub workspace: WorkspaceConfig,

    /// Spawned-process environment policy.
    pub environment: EnvironmentConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for daemon data (log files).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Session management configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Preferred shell. When unset, `$SHELL` is consulted.
    pub default_shell: Option<String>,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// Retained scrollback per session, in bytes.
    pub scrollback_cap: usize,

    /// Largest batch handed to data subscribers at once, in bytes.
    pub output_batch_size: usize,

    /// Delay between output flushes, in milliseconds.
    pub throttle_interval_ms: u64,

    /// Output suppression window after a resize, in milliseconds.
    pub resize_settle_ms: u64,

    /// Time between the graceful and the forced termination signal.
    pub kill_grace_ms: u64,

    /// Initial terminal width when a request does not specify one.
    pub cols: u16,

    /// Initial terminal height when a request does not specify one.
    pub rows: u16,
}

/// Working-directory boundary configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Roots a session may start in. Empty means all paths allowed.
    pub allowed_roots: Vec<PathBuf>,
}

/// Extra environment rules merged with the built-in policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Variable names (or `PREFIX_*` patterns) never passed to a shell.
    pub deny: Vec<String>,

    /// Variable names always passed through, even if denied.
    pub passthrough: Vec<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: None,
            max_sessions: MAX_SESSIONS,
            scrollback_cap: 50_000,
            output_batch_size: 4096,
            throttle_interval_ms: 4,
            resize_settle_ms: 150,
            kill_grace_ms: 1000,
            cols: 80,
            rows: 24,
        }
    }
}

impl SessionConfig {
    /// Delay between output flushes.
    pub fn throttle_interval(&self) -> Duration {
        Duration::from_millis(self.throttle_interval_ms)
    }

    /// Output suppression window after a resize.
    pub fn resize_settle(&self) -> Duration {
        Duration::from_millis(self.resize_settle_ms)
    }

    /// Grace period before a forced kill.
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termhub")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termhub")
}

/// Reads a non-empty environment variable.
fn env_override(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TERMHUB_MAX_SESSIONS: Override the session limit
    /// - TERMHUB_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - TERMHUB_SHELL: Override the preferred shell
    pub fn apply_env_overrides(&mut self) {
        if let Some(raw) = env_override("TERMHUB_MAX_SESSIONS") {
            match raw.trim().parse::<usize>() {
                Ok(max) => {
                    tracing::info!("Overriding max_sessions from environment: {}", max);
                    self.session.max_sessions = max;
                }
                Err(e) => {
                    tracing::warn!(value = %raw, error = %e, "Ignoring invalid TERMHUB_MAX_SESSIONS");
                }
            }
        }

        if let Some(level) = env_override("TERMHUB_LOG_LEVEL") {
            tracing::info!("Overriding log_level from environment: {}", level);
            self.daemon.log_level = level;
        }

        if let Some(shell) = env_override("TERMHUB_SHELL") {
            tracing::info!("Overriding default_shell from environment: {}", shell);
            self.session.default_shell = Some(shell);
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let session = &self.session;

        if !(MIN_SESSIONS..=MAX_SESSIONS).contains(&session.max_sessions) {
            return Err(ConfigError::InvalidMaxSessions(session.max_sessions));
        }

        if session.scrollback_cap == 0 {
            return Err(ConfigError::InvalidScrollbackCap(session.scrollback_cap));
        }

        if session.output_batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize(session.output_batch_size));
        }

        if session.throttle_interval_ms == 0 {
            return Err(ConfigError::InvalidThrottleInterval(
                session.throttle_interval_ms,
            ));
        }

        if let Some(shell) = &session.default_shell {
            let shell_path = Path::new(shell);
            let found = if shell_path.is_absolute() {
                shell_path.exists()
            } else {
                which::which(shell).is_ok()
            };
            if !found {
                return Err(ConfigError::InvalidShellPath(shell.clone()));
            }
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn clear_env() {
        std::env::remove_var("TERMHUB_MAX_SESSIONS");
        std::env::remove_var("TERMHUB_LOG_LEVEL");
        std::env::remove_var("TERMHUB_SHELL");
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.session.max_sessions, 1000);
        assert_eq!(config.session.scrollback_cap, 50_000);
        assert_eq!(config.session.output_batch_size, 4096);
        assert_eq!(config.session.throttle_interval(), Duration::from_millis(4));
        assert_eq!(config.session.resize_settle(), Duration::from_millis(150));
        assert_eq!(config.session.kill_grace(), Duration::from_millis(1000));
        assert!(config.session.default_shell.is_none());
        assert!(config.workspace.allowed_roots.is_empty());
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[daemon]
log_level = "debug"

[session]
max_sessions = 5
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.session.max_sessions, 5);
        assert_eq!(config.session.output_batch_size, 4096);
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[daemon]
data_dir = "/custom/data"
log_level = "trace"

[session]
default_shell = "/bin/zsh"
max_sessions = 20
scrollback_cap = 1024
output_batch_size = 256
throttle_interval_ms = 10
resize_settle_ms = 50
kill_grace_ms = 250
cols = 132
rows = 43

[workspace]
allowed_roots = ["/home", "/tmp"]

[environment]
deny = ["INTERNAL_*"]
passthrough = ["EDITOR"]
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.session.default_shell.as_deref(), Some("/bin/zsh"));
        assert_eq!(config.session.max_sessions, 20);
        assert_eq!(config.session.scrollback_cap, 1024);
        assert_eq!(config.session.output_batch_size, 256);
        assert_eq!(config.session.kill_grace(), Duration::from_millis(250));
        assert_eq!((config.session.cols, config.session.rows), (132, 43));
        assert_eq!(
            config.workspace.allowed_roots,
            vec![PathBuf::from("/home"), PathBuf::from("/tmp")]
        );
        assert_eq!(config.environment.deny, vec!["INTERNAL_*"]);
        assert_eq!(config.environment.passthrough, vec!["EDITOR"]);
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let result = Config::from_toml("[session\nmax_sessions = 3\n");
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[session]
max_sessions = "many"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = Config::default();
        original.session.max_sessions = 42;
        original.session.default_shell = Some("/bin/sh".to_string());
        original.environment.deny = vec!["SECRET_TOKEN".to_string()];

        let loaded = Config::from_toml(&original.to_toml().unwrap()).unwrap();
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut original = Config::default();
        original.session.max_sessions = 15;
        original.save(&config_path).unwrap();

        assert_eq!(Config::load(&config_path).unwrap(), original);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, "invalid [ toml").unwrap();

        let err = Config::load(&config_path).unwrap_err().to_string();
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.to_string_lossy().contains("termhub"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    #[serial]
    fn test_env_override_max_sessions() {
        clear_env();
        std::env::set_var("TERMHUB_MAX_SESSIONS", "12");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.session.max_sessions, 12);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_invalid_max_sessions_ignored() {
        clear_env();
        std::env::set_var("TERMHUB_MAX_SESSIONS", "lots");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.session.max_sessions, MAX_SESSIONS);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        clear_env();
        std::env::set_var("TERMHUB_LOG_LEVEL", "");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.daemon.log_level, "info");

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_shell_and_level() {
        clear_env();
        std::env::set_var("TERMHUB_LOG_LEVEL", "debug");
        std::env::set_var("TERMHUB_SHELL", "/bin/sh");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.session.default_shell.as_deref(), Some("/bin/sh"));

        clear_env();
    }

    #[test]
    fn test_validate_default_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_max_sessions_bounds() {
        let mut config = Config::default();

        config.session.max_sessions = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSessions(0)));

        config.session.max_sessions = 1001;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSessions(1001)));

        config.session.max_sessions = 1;
        assert!(config.validate().is_ok());

        config.session.max_sessions = 1000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_pipeline_sizes() {
        let mut config = Config::default();
        config.session.scrollback_cap = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidScrollbackCap(0)));

        let mut config = Config::default();
        config.session.output_batch_size = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidBatchSize(0)));

        let mut config = Config::default();
        config.session.throttle_interval_ms = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidThrottleInterval(0))
        );
    }

    #[test]
    #[cfg(unix)]
    fn test_validate_shell_path() {
        let mut config = Config::default();

        config.session.default_shell = Some("/bin/sh".to_string());
        assert!(config.validate().is_ok());

        config.session.default_shell = Some("sh".to_string());
        assert!(config.validate().is_ok());

        config.session.default_shell = Some("/nonexistent/shell".to_string());
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidShellPath("/nonexistent/shell".to_string()))
        );
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();

        config.daemon.log_level = "WARN".to_string();
        assert!(config.validate().is_ok());

        config.daemon.log_level = "warning".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("warning".to_string()))
        );
    }
}
