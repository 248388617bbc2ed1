//! Shell state probes and the marker framing.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static MARKER_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Commands and parsers for querying a shell's state, plus the request
/// framing used by [`ShellSession`](super::ShellSession).
pub struct StateProbe;

impl StateProbe {
    /// Command that prints the working directory.
    pub fn cwd_command() -> &'static str {
        "pwd"
    }

    /// Command that lists the environment.
    pub fn env_command() -> &'static str {
        "env"
    }

    /// Parse the output of [`StateProbe::cwd_command`].
    pub fn parse_cwd(output: &str) -> Option<PathBuf> {
        output
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(PathBuf::from)
    }

    /// Parse `KEY=value` lines. Lines without `=` (continuations of
    /// multi-line values) are ignored.
    pub fn parse_env(output: &str) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        for line in output.lines() {
            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                if !key.is_empty() && !key.contains(char::is_whitespace) {
                    env.insert(key.to_string(), value.to_string());
                }
            }
        }
        env
    }

    /// A marker string that will not show up in ordinary output.
    pub fn marker() -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let n = MARKER_COUNTER.fetch_add(1, Ordering::Relaxed);
        format!("--.END{}{}.--", nanos, n)
    }

    /// The line written to the shell to run `cmd`.
    ///
    /// Prints the exit code, then the marker on stdout; without a TTY the
    /// marker is echoed to stderr as well so both streams end at a known
    /// point. An empty command runs `true`.
    pub fn frame(cmd: &str, marker: &str, isatty: bool) -> String {
        let cmd = cmd.trim();
        let cmd = if cmd.is_empty() { "true" } else { cmd };
        let mut line = format!("{} ; echo $? ; echo '{}'", cmd, marker);
        if !isatty {
            line.push_str(&format!(" ; echo '{}' 1>&2", marker));
        }
        line.push('\n');
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cwd() {
        assert_eq!(StateProbe::parse_cwd("/home/user\n"), Some(PathBuf::from("/home/user")));
        assert_eq!(StateProbe::parse_cwd("\n  /tmp \n"), Some(PathBuf::from("/tmp")));
        assert!(StateProbe::parse_cwd("").is_none());
    }

    #[test]
    fn test_parse_env() {
        let env = StateProbe::parse_env("PATH=/usr/bin\nHOME=/home/user\nEMPTY=\nA=b=c\ncontinued line\n");
        assert_eq!(env.get("PATH").map(String::as_str), Some("/usr/bin"));
        assert_eq!(env.get("EMPTY").map(String::as_str), Some(""));
        assert_eq!(env.get("A").map(String::as_str), Some("b=c"));
        assert_eq!(env.len(), 4);
    }

    #[test]
    fn test_markers_are_unique() {
        let a = StateProbe::marker();
        let b = StateProbe::marker();
        assert_ne!(a, b);
        assert!(a.starts_with("--.END") && a.ends_with(".--"));
    }

    #[test]
    fn test_frame() {
        assert_eq!(
            StateProbe::frame("ls -a", "M", false),
            "ls -a ; echo $? ; echo 'M' ; echo 'M' 1>&2\n"
        );
        assert_eq!(StateProbe::frame("  ", "M", true), "true ; echo $? ; echo 'M'\n");
    }
}
