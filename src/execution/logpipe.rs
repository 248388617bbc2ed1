//! Sending a command's output to the log.

use std::time::Duration;

use tracing::{debug, error, info, trace, warn, Level};

use super::modifiers::Modifier;
use super::spawn::{popen, PopenOptions};
use crate::command::{Command, Retcode, StreamKind};
use crate::error::Result;
use crate::process::LinesOptions;

/// Log each stdout line at one level and each stderr line at another,
/// then return the exit code.
///
/// ```no_run
/// use pipewright::execution::LogPipe;
/// use pipewright::local;
/// use tracing::Level;
///
/// let make = local().command("make").unwrap();
/// let code = &make & LogPipe::new().prefix("make: ").stderr_level(Level::WARN);
/// ```
#[derive(Debug, Clone)]
pub struct LogPipe {
    pub stdout_level: Level,
    pub stderr_level: Level,
    pub prefix: String,
    pub retcode: Retcode,
    pub timeout: Option<Duration>,
    /// Longest silence tolerated between two lines.
    pub line_timeout: Option<Duration>,
}

impl Default for LogPipe {
    fn default() -> Self {
        Self {
            stdout_level: Level::INFO,
            stderr_level: Level::DEBUG,
            prefix: String::new(),
            retcode: Retcode::default(),
            timeout: None,
            line_timeout: Some(Duration::from_secs(600)),
        }
    }
}

impl LogPipe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stdout_level(mut self, level: Level) -> Self {
        self.stdout_level = level;
        self
    }

    pub fn stderr_level(mut self, level: Level) -> Self {
        self.stderr_level = level;
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn retcode(mut self, retcode: impl Into<Retcode>) -> Self {
        self.retcode = retcode.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn line_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.line_timeout = timeout;
        self
    }
}

fn log_line(level: Level, prefix: &str, line: &str) {
    if level == Level::ERROR {
        error!("{}{}", prefix, line);
    } else if level == Level::WARN {
        warn!("{}{}", prefix, line);
    } else if level == Level::INFO {
        info!("{}{}", prefix, line);
    } else if level == Level::DEBUG {
        debug!("{}{}", prefix, line);
    } else {
        trace!("{}{}", prefix, line);
    }
}

impl Modifier for LogPipe {
    type Output = Result<i32>;

    fn apply(&self, cmd: &Command) -> Result<i32> {
        let mut process = popen(cmd, PopenOptions::default())?;
        let options = LinesOptions {
            retcode: self.retcode.clone(),
            timeout: self.timeout,
            line_timeout: self.line_timeout,
            ..LinesOptions::default()
        };
        for line in process.iter_lines(options) {
            let (kind, text) = line?;
            let level = match kind {
                StreamKind::Stderr => self.stderr_level,
                _ => self.stdout_level,
            };
            log_line(level, &self.prefix, &text);
        }
        process.wait()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::machine::local;

    fn sh(script: &str) -> Command {
        local().command("sh").unwrap().bind(["-c", script])
    }

    #[test]
    fn test_defaults() {
        let pipe = LogPipe::default();
        assert_eq!(pipe.stdout_level, Level::INFO);
        assert_eq!(pipe.stderr_level, Level::DEBUG);
        assert_eq!(pipe.line_timeout, Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_returns_code() {
        let code = (&sh("echo a; echo b >&2") & LogPipe::new().prefix("t: ")).unwrap();
        assert_eq!(code, 0);
        let code = (&sh("exit 3") & LogPipe::new().retcode(Retcode::Any)).unwrap();
        assert_eq!(code, 3);
    }

    #[test]
    fn test_rejected_code() {
        let err = (&sh("echo partial; exit 5") & LogPipe::new()).unwrap_err();
        let failure = err.execution().unwrap();
        assert_eq!(failure.retcode, Some(5));
        assert_eq!(failure.stdout, "partial\n");
    }

    #[test]
    fn test_line_timeout() {
        let pipe = LogPipe::new().line_timeout(Some(Duration::from_millis(200)));
        let err = (&sh("sleep 5") & pipe).unwrap_err();
        assert!(err.is_timeout());
    }
}
