//! Configuration for pipewright.
//!
//! Configuration is loaded with the following priority (highest to lowest):
//! 1. Command-line arguments
//! 2. Environment variables
//! 3. Configuration file (JSON)
//! 4. Default values

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cli::Args;

/// Library and binary configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub execution: ExecutionSection,
    pub ssh: SshSection,
    pub session: SessionSection,
    pub logging: LoggingSection,
}

/// Defaults for running commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSection {
    /// Whole-run deadline in seconds; unset means none.
    pub timeout_secs: Option<u64>,
    /// Longest silence between two streamed lines, in seconds.
    pub line_timeout_secs: Option<u64>,
    /// Chunk size for stream reads.
    pub read_buffer_size: usize,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            timeout_secs: None,
            line_timeout_secs: None,
            read_buffer_size: crate::process::READ_BUFFER_SIZE,
        }
    }
}

/// How the `ssh` and `scp` clients are invoked.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSection {
    pub ssh_command: String,
    pub scp_command: String,
    /// Extra options passed to every `ssh` call.
    pub options: Vec<String>,
    pub connect_timeout_secs: u64,
}

impl Default for SshSection {
    fn default() -> Self {
        Self {
            ssh_command: "ssh".to_string(),
            scp_command: "scp".to_string(),
            options: Vec::new(),
            connect_timeout_secs: 10,
        }
    }
}

/// Persistent shell sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// Shell started for local sessions.
    pub shell: String,
    pub connect_timeout_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            connect_timeout_secs: 5,
        }
    }
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level or filter directive (error, warn, info, debug, trace).
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        serde_json::from_str(&content).map_err(ConfigError::Json)
    }

    /// Apply environment variable overrides.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(timeout) = std::env::var("PIPEWRIGHT_TIMEOUT") {
            let secs = timeout
                .parse()
                .map_err(|_| ConfigError::InvalidValue("PIPEWRIGHT_TIMEOUT", timeout))?;
            self.execution.timeout_secs = Some(secs);
        }

        if let Ok(ssh) = std::env::var("PIPEWRIGHT_SSH") {
            self.ssh.ssh_command = ssh;
        }

        if let Ok(shell) = std::env::var("PIPEWRIGHT_SHELL") {
            self.session.shell = shell;
        }

        if let Ok(level) = std::env::var("PIPEWRIGHT_LOG_LEVEL") {
            self.logging.level = level;
        } else if let Ok(level) = std::env::var("RUST_LOG") {
            self.logging.level = level;
        }
        Ok(())
    }

    /// Apply CLI argument overrides.
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(timeout) = args.timeout {
            self.execution.timeout_secs = Some(timeout);
        }

        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }
    }

    /// Load configuration with full priority chain.
    ///
    /// Priority: CLI args > env vars > config file > defaults
    pub fn load(args: &Args) -> Result<Self, ConfigError> {
        let mut config = match args.config {
            Some(ref path) => Config::from_file(path)?,
            None => Config::default(),
        };
        config.apply_env()?;
        config.apply_args(args);
        Ok(config)
    }

    /// Get the log level filter string.
    pub fn log_filter(&self) -> &str {
        &self.logging.level
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(std::io::Error),
    #[error("failed to parse config file: {0}")]
    Json(serde_json::Error),
    /// An environment variable holds an unusable value.
    #[error("invalid value for {0}: '{1}'")]
    InvalidValue(&'static str, String),
}
