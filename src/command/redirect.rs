//! Standard stream targets.

use std::fmt;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

/// One of the three standard streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
}

impl StreamKind {
    /// File descriptor number conventionally used for this stream.
    pub fn fd(&self) -> u8 {
        match self {
            StreamKind::Stdin => 0,
            StreamKind::Stdout => 1,
            StreamKind::Stderr => 2,
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StreamKind::Stdin => "stdin",
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        })
    }
}

/// Where a child's standard input comes from.
#[derive(Debug, Clone, Default)]
pub enum Input {
    /// Share the caller's stdin.
    Inherit,
    /// Read from the null device.
    Null,
    /// A pipe the caller can write to.
    #[default]
    Pipe,
    /// Read from a file.
    File(PathBuf),
    /// Feed these bytes, then close.
    Data(Vec<u8>),
    /// Read from an already-open file.
    Handle(Arc<File>),
}

impl Input {
    /// Whether this points somewhere other than a pipe or the caller's stream.
    pub fn is_redirect(&self) -> bool {
        !matches!(self, Input::Inherit | Input::Pipe)
    }

    pub(crate) fn display_tokens(&self) -> Vec<String> {
        match self {
            Input::Inherit | Input::Pipe | Input::Data(_) => Vec::new(),
            Input::Null => vec!["<".into(), null_device().into()],
            Input::File(path) => vec!["<".into(), crate::quoting::shquote(&path.to_string_lossy())],
            Input::Handle(_) => vec!["<".into(), "<handle>".into()],
        }
    }
}

/// Where a child's stdout or stderr goes.
#[derive(Debug, Clone, Default)]
pub enum Output {
    /// Share the caller's stream.
    Inherit,
    /// Discard.
    Null,
    /// A pipe the caller reads.
    #[default]
    Pipe,
    /// Truncate and write to a file.
    File(PathBuf),
    /// Append to a file.
    Append(PathBuf),
    /// Write to an already-open file.
    Handle(Arc<File>),
    /// Merge into stdout (`2>&1`); only valid for stderr.
    Stdout,
}

impl Output {
    /// Whether this points somewhere other than a pipe or the caller's stream.
    pub fn is_redirect(&self) -> bool {
        !matches!(self, Output::Inherit | Output::Pipe)
    }

    pub(crate) fn display_tokens(&self, kind: StreamKind) -> Vec<String> {
        let prefix = if kind == StreamKind::Stderr { "2" } else { "" };
        let quoted = |path: &PathBuf| crate::quoting::shquote(&path.to_string_lossy());
        match self {
            Output::Inherit | Output::Pipe => Vec::new(),
            Output::Null => vec![format!("{}>", prefix), null_device().into()],
            Output::File(path) => vec![format!("{}>", prefix), quoted(path)],
            Output::Append(path) => vec![format!("{}>>", prefix), quoted(path)],
            Output::Handle(_) => vec![format!("{}>", prefix), "<handle>".into()],
            Output::Stdout => vec!["2>&1".into()],
        }
    }
}

fn null_device() -> &'static str {
    if cfg!(windows) {
        "NUL"
    } else {
        "/dev/null"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_kind_display() {
        assert_eq!(StreamKind::Stdin.to_string(), "stdin");
        assert_eq!(StreamKind::Stderr.fd(), 2);
    }

    #[test]
    fn test_is_redirect() {
        assert!(!Input::Pipe.is_redirect());
        assert!(!Input::Inherit.is_redirect());
        assert!(Input::Data(b"x".to_vec()).is_redirect());
        assert!(!Output::Pipe.is_redirect());
        assert!(Output::File("/tmp/x".into()).is_redirect());
    }

    #[test]
    fn test_output_tokens() {
        let out = Output::File("/tmp/my file".into());
        assert_eq!(out.display_tokens(StreamKind::Stdout), vec![">", "'/tmp/my file'"]);
        let err = Output::Append("/tmp/log".into());
        assert_eq!(err.display_tokens(StreamKind::Stderr), vec!["2>>", "/tmp/log"]);
        assert_eq!(Output::Stdout.display_tokens(StreamKind::Stderr), vec!["2>&1"]);
    }
}
