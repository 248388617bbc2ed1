//! Running commands.
//!
//! [`popen`] starts a command tree and hands back a [`Process`]. On top of
//! that sit the synchronous [`Command::run`] family, the execution
//! modifiers combined with `&`, and a tokio facing layer.
//!
//! # Example
//!
//! ```no_run
//! use pipewright::execution::{BG, RETCODE, TF};
//! use pipewright::local;
//!
//! let m = local();
//! let ls = m.command("ls").unwrap();
//! let wc = m.command("wc").unwrap().arg("-l");
//!
//! let count = (&ls | &wc).call().unwrap();
//! let mut future = (&ls | &wc) & BG;
//! let code = &ls.arg("/missing") & RETCODE;
//! let ok = &ls & TF;
//! ```
//!
//! [`Process`]: crate::process::Process

mod async_adapter;
mod logpipe;
mod modifiers;
mod result;
mod run;
mod spawn;
mod state;

use std::path::{Path, PathBuf};

pub use async_adapter::{async_run, stream_lines};
pub use logpipe::LogPipe;
pub use modifiers::{Bg, ExitCode, Fg, Future, Modifier, Tee, Tf, BG, FG, RETCODE, TEE, TF};
pub use result::{Completed, OutputLine};
pub use run::{run_proc, RunOptions};
pub use spawn::{popen, PopenOptions};
pub use state::RunState;

use crate::command::{Command, Node, Output};
use crate::error::Result;
use crate::process::Process;

/// Detach a command so it outlives this process.
///
/// Defaults: run in `.`, write stdout to `nohup.out`, send stderr to the
/// same file and append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nohup {
    pub cwd: Option<PathBuf>,
    pub stdout: Option<PathBuf>,
    /// `None` shares the stdout file.
    pub stderr: Option<PathBuf>,
    pub append: bool,
}

/// [`Nohup`] with its defaults.
pub const NOHUP: Nohup = Nohup::new();

impl Default for Nohup {
    fn default() -> Self {
        Self::new()
    }
}

impl Nohup {
    pub const fn new() -> Self {
        Self {
            cwd: None,
            stdout: None,
            stderr: None,
            append: true,
        }
    }

    pub fn in_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn to_file(mut self, stdout: impl Into<PathBuf>) -> Self {
        self.stdout = Some(stdout.into());
        self
    }

    pub fn errors_to(mut self, stderr: impl Into<PathBuf>) -> Self {
        self.stderr = Some(stderr.into());
        self
    }

    /// Truncate the output files instead of appending.
    pub fn truncate(mut self) -> Self {
        self.append = false;
        self
    }

    /// Directory the detached process starts in, relative to the
    /// machine's working directory.
    pub fn working_dir(&self) -> &Path {
        self.cwd.as_deref().unwrap_or(Path::new("."))
    }

    pub fn stdout_path(&self) -> &Path {
        self.stdout.as_deref().unwrap_or(Path::new("nohup.out"))
    }

    pub fn stderr_path(&self) -> Option<&Path> {
        self.stderr.as_deref()
    }

    /// Detach `cmd` on its machine.
    ///
    /// A stdout redirection at the top of `cmd` replaces the output file.
    pub fn daemonize(&self, cmd: &Command) -> Result<Process> {
        if let Node::Redirection {
            inner,
            stdin: None,
            stdout: Some(target @ (Output::File(_) | Output::Append(_))),
            stderr,
        } = cmd.node()
        {
            let mut options = self.clone();
            match target {
                Output::File(path) => {
                    options.stdout = Some(path.clone());
                    options.append = false;
                }
                Output::Append(path) => {
                    options.stdout = Some(path.clone());
                    options.append = true;
                }
                _ => {}
            }
            match stderr {
                Some(Output::File(path) | Output::Append(path)) => options.stderr = Some(path.clone()),
                Some(Output::Stdout) => options.stderr = None,
                _ => {}
            }
            return inner.machine().daemonize(inner, &options);
        }
        cmd.machine().daemonize(cmd, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nohup_defaults() {
        assert_eq!(NOHUP, Nohup::default());
        assert_eq!(NOHUP.working_dir(), Path::new("."));
        assert_eq!(NOHUP.stdout_path(), Path::new("nohup.out"));
        assert_eq!(NOHUP.stderr_path(), None);
        assert!(NOHUP.append);
    }

    #[test]
    fn test_nohup_builders() {
        let nohup = Nohup::new().in_dir("/srv").to_file("out.log").errors_to("err.log").truncate();
        assert_eq!(nohup.working_dir(), Path::new("/srv"));
        assert_eq!(nohup.stdout_path(), Path::new("out.log"));
        assert_eq!(nohup.stderr_path(), Some(Path::new("err.log")));
        assert!(!nohup.append);
    }
}
