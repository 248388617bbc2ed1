//! Error types for pipewright.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::command::StreamKind;

/// Continuation prefix used when a captured stream spans several lines.
const CONTINUATION: &str = "\n              | ";

/// A process ran but its exit code was not one the caller accepted.
///
/// Carries everything needed to explain the failure without running the
/// command again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExecutionError {
    /// Command line that was executed.
    pub argv: Vec<String>,
    /// Observed exit code, `None` when it could not be recovered.
    pub retcode: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Optional message replacing the default header.
    pub message: Option<String>,
    /// Remote host the command ran on.
    pub host: Option<String>,
}

impl ProcessExecutionError {
    /// Create a new execution error.
    pub fn new(
        argv: Vec<String>,
        retcode: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) -> Self {
        Self {
            argv,
            retcode,
            stdout: stdout.into(),
            stderr: stderr.into(),
            message: None,
            host: None,
        }
    }

    /// Set a message shown instead of "Unexpected exit code".
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Record the host the command ran on.
    pub fn with_host(mut self, host: Option<String>) -> Self {
        self.host = host;
        self
    }

    fn retcode_text(&self) -> String {
        match self.retcode {
            Some(code) => code.to_string(),
            None => "unknown".to_string(),
        }
    }
}

fn indented(text: &str) -> String {
    text.lines().collect::<Vec<_>>().join(CONTINUATION)
}

impl fmt::Display for ProcessExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => {
                writeln!(f, "{}", message)?;
                write!(f, "Return code:  | {}", self.retcode_text())?;
            }
            None => write!(f, "Unexpected exit code: {}", self.retcode_text())?,
        }
        write!(f, "\nCommand line: | {}", self.argv.join(" "))?;
        if let Some(host) = &self.host {
            write!(f, "\nHost:         | {}", host)?;
        }
        if !self.stdout.trim().is_empty() {
            write!(f, "\nStdout:       | {}", indented(self.stdout.trim_end()))?;
        }
        if !self.stderr.trim().is_empty() {
            write!(f, "\nStderr:       | {}", indented(self.stderr.trim_end()))?;
        }
        Ok(())
    }
}

impl std::error::Error for ProcessExecutionError {}

/// Kind of transport failure reported by a shell session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshCommsKind {
    /// The remote side rejected the credentials (ssh exit code 5).
    IncorrectLogin,
    /// The host key is not known (ssh exit code 6).
    HostPublicKeyUnknown,
    /// Generic communication failure.
    Comms,
    /// Communication failed while reading the error stream.
    Channel2,
}

impl fmt::Display for SshCommsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SshCommsKind::IncorrectLogin => "incorrect username or password",
            SshCommsKind::HostPublicKeyUnknown => "the authenticity of the host can't be established",
            SshCommsKind::Comms => "SSH communication failed",
            SshCommsKind::Channel2 => "SSH communication failed on the error channel",
        };
        f.write_str(text)
    }
}

/// Main error type for pipewright operations.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Exit code did not match the accepted set.
    #[error("{0}")]
    Execution(Box<ProcessExecutionError>),

    /// A program could not be found on the search path.
    #[error("command not found: {program} (searched {})", display_path(.path))]
    CommandNotFound {
        /// Program name that was looked up.
        program: String,
        /// Directories that were searched.
        path: Vec<PathBuf>,
    },

    /// The process exceeded its deadline and was killed.
    #[error("process timed out after {timeout:?}: {}", .argv.join(" "))]
    Timeout {
        /// Command line of the killed process.
        argv: Vec<String>,
        /// Deadline that expired.
        timeout: Duration,
    },

    /// No output line arrived within the line timeout.
    #[error("no output line within {timeout:?}: {}", .argv.join(" "))]
    LineTimeout {
        /// Command line of the killed process.
        argv: Vec<String>,
        /// Line deadline that expired.
        timeout: Duration,
        /// Remote host, if any.
        host: Option<String>,
    },

    /// The same stream was redirected twice.
    #[error("{0} is already redirected")]
    Redirection(StreamKind),

    /// Composition API misuse.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Shell session failure (closed, busy, protocol violation).
    #[error("shell session error: {0}")]
    Session(String),

    /// Transport failure detected by a shell session.
    #[error("{kind}\n{failure}")]
    SshComms {
        /// Failure category.
        kind: SshCommsKind,
        /// Details of the dead shell process.
        failure: Box<ProcessExecutionError>,
    },

    /// The backend does not offer this capability.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Genuine non-UTF-8 data in a decoded stream.
    #[error("output decode error: {0}")]
    Decode(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// PTY-related error.
    #[error("PTY error: {0}")]
    Pty(String),

    /// Internal lock was poisoned.
    #[error("internal lock poisoned")]
    LockPoisoned,
}

fn display_path(path: &[PathBuf]) -> String {
    let dirs: Vec<_> = path.iter().map(|p| p.display().to_string()).collect();
    format!("[{}]", dirs.join(", "))
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<ProcessExecutionError> for Error {
    fn from(err: ProcessExecutionError) -> Self {
        Error::Execution(Box::new(err))
    }
}

impl Error {
    /// Whether this is a whole-process or per-line timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. } | Error::LineTimeout { .. })
    }

    /// The execution failure carried by this error, if any.
    pub fn execution(&self) -> Option<&ProcessExecutionError> {
        match self {
            Error::Execution(err) => Some(err),
            Error::SshComms { failure, .. } => Some(failure),
            _ => None,
        }
    }
}

/// Convenience Result type for pipewright operations.
pub type Result<T> = std::result::Result<T, Error>;
