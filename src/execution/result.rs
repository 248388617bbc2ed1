//! Execution result types.

use std::time::Duration;

use crate::command::StreamKind;

/// Outcome of a command that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completed {
    /// Exit code. Negative for a process killed by a signal.
    pub retcode: i32,
    pub stdout: String,
    pub stderr: String,
    /// Wall time from spawn to exit.
    pub duration: Duration,
}

impl Completed {
    pub fn new(retcode: i32, stdout: impl Into<String>, stderr: impl Into<String>, duration: Duration) -> Self {
        Self {
            retcode,
            stdout: stdout.into(),
            stderr: stderr.into(),
            duration,
        }
    }

    /// Check if the command exited with 0.
    pub fn success(&self) -> bool {
        self.retcode == 0
    }

    /// Stdout, trimmed.
    pub fn output_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// Stdout lines.
    pub fn output_lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines()
    }
}

/// One line of streamed output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: StreamKind,
    /// The line without its terminator.
    pub text: String,
}

impl OutputLine {
    pub fn new(stream: StreamKind, text: impl Into<String>) -> Self {
        Self {
            stream,
            text: text.into(),
        }
    }

    pub fn stdout(text: impl Into<String>) -> Self {
        Self::new(StreamKind::Stdout, text)
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self::new(StreamKind::Stderr, text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completed_new() {
        let result = Completed::new(0, "hello\n", "", Duration::from_millis(100));
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.duration, Duration::from_millis(100));
        assert!(result.success());
    }

    #[test]
    fn test_completed_failed() {
        let result = Completed::new(-9, "", "killed", Duration::ZERO);
        assert!(!result.success());
    }

    #[test]
    fn test_output_trimmed() {
        let result = Completed::new(0, "  hello world  \n", "", Duration::ZERO);
        assert_eq!(result.output_trimmed(), "hello world");
    }

    #[test]
    fn test_output_lines() {
        let result = Completed::new(0, "line1\nline2\nline3", "", Duration::ZERO);
        let lines: Vec<_> = result.output_lines().collect();
        assert_eq!(lines, vec!["line1", "line2", "line3"]);
    }

    #[test]
    fn test_output_line_source() {
        assert_eq!(OutputLine::stdout("x").stream, StreamKind::Stdout);
        assert_eq!(OutputLine::stderr("y").text, "y");
    }
}
