//! Execution backends.
//!
//! A [`Backend`] turns a formulated command into a running [`Process`]:
//! [`LocalMachine`] spawns OS processes, [`SshMachine`] drives the `ssh`
//! client, and [`ChannelMachine`] opens exec channels over a [`Transport`].
//! Commands hold their machine as a shared [`Machine`] handle.

mod channel;
mod cluster;
mod context;
mod local;
mod loopback;
mod remote;
mod ssh;

pub use channel::{Channel, ChannelMachine, FileTransfer, RemoteStat, Transport};
pub use cluster::Cluster;
pub use context::{ContextGuard, ExecContext};
pub use local::{local, LocalMachine};
pub use loopback::LoopbackTransport;
pub use ssh::{RemoteTempDir, SshMachine, SshOptions, Tunnel};

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::command::Command;
use crate::error::{Error, Result};
use crate::execution::Nohup;
use crate::process::{PipeReader, Process};
use crate::session::ShellSession;

/// Shared handle to a backend.
pub type Machine = Arc<dyn Backend>;

/// Where a spawned process reads stdin from.
#[derive(Debug, Default)]
pub enum SpawnInput {
    Inherit,
    Null,
    #[default]
    Pipe,
    File(File),
    /// The stdout of an upstream pipeline stage.
    Upstream(PipeReader),
}

/// Where a spawned process writes stdout or stderr.
#[derive(Debug, Default)]
pub enum SpawnOutput {
    Inherit,
    Null,
    #[default]
    Pipe,
    File(File),
    /// Merge into stdout (`2>&1`); only meaningful for stderr.
    ToStdout,
}

/// Everything a backend needs to spawn one program besides its argv.
#[derive(Debug, Default)]
pub struct SpawnRequest {
    pub stdin: SpawnInput,
    pub stdout: SpawnOutput,
    pub stderr: SpawnOutput,
    /// Working directory; relative paths resolve against the machine's.
    pub cwd: Option<PathBuf>,
    /// Variables added on top of the machine's environment.
    pub env: BTreeMap<String, String>,
    /// Start the process in a new session (POSIX `setsid`).
    pub new_session: bool,
}

impl SpawnRequest {
    /// A request with every stream piped.
    pub fn piped() -> Self {
        Self::default()
    }

    pub(crate) fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            stdin: clone_input(&self.stdin)?,
            stdout: clone_output(&self.stdout)?,
            stderr: clone_output(&self.stderr)?,
            cwd: self.cwd.clone(),
            env: self.env.clone(),
            new_session: self.new_session,
        })
    }
}

fn clone_input(input: &SpawnInput) -> Result<SpawnInput> {
    Ok(match input {
        SpawnInput::Inherit => SpawnInput::Inherit,
        SpawnInput::Null => SpawnInput::Null,
        SpawnInput::Pipe => SpawnInput::Pipe,
        SpawnInput::File(f) => SpawnInput::File(f.try_clone()?),
        SpawnInput::Upstream(_) => {
            return Err(Error::InvalidArgument(
                "an upstream pipe cannot feed several processes".into(),
            ))
        }
    })
}

pub(crate) fn clone_output(output: &SpawnOutput) -> Result<SpawnOutput> {
    Ok(match output {
        SpawnOutput::Inherit => SpawnOutput::Inherit,
        SpawnOutput::Null => SpawnOutput::Null,
        SpawnOutput::Pipe => SpawnOutput::Pipe,
        SpawnOutput::File(f) => SpawnOutput::File(f.try_clone()?),
        SpawnOutput::ToStdout => SpawnOutput::ToStdout,
    })
}

/// Capabilities of an execution backend.
pub trait Backend: Send + Sync + fmt::Debug {
    /// Display name (`local`, `user@host`, ...).
    fn name(&self) -> String;

    /// Formulation depth at which arguments get quoted: 2 for local
    /// machines, 1 for machines reached through a remote shell.
    fn quote_level(&self) -> usize;

    /// Remote host, for diagnostics.
    fn host(&self) -> Option<String> {
        None
    }

    fn is_remote(&self) -> bool {
        self.host().is_some()
    }

    /// Resolve `program` on the search path.
    fn which(&self, program: &str) -> Result<String>;

    /// Snapshot of the current working directory and environment.
    fn context(&self) -> Result<ExecContext>;

    /// Change the working directory used by later commands.
    fn chdir(&self, path: &Path) -> Result<()>;

    fn set_env(&self, key: &str, value: &str) -> Result<()>;

    fn unset_env(&self, key: &str) -> Result<()>;

    /// Put back a context saved earlier.
    fn restore_context(&self, ctx: ExecContext) -> Result<()>;

    /// Whether pipeline stages can be wired together one process at a
    /// time. Backends without this run a pipeline as one shell line.
    fn supports_native_pipelines(&self) -> bool;

    /// Spawn a single program.
    fn spawn_argv(&self, argv: &[String], req: SpawnRequest) -> Result<Process>;

    /// Run a whole shell command line as one process.
    fn spawn_shell_line(&self, line: &str, req: SpawnRequest) -> Result<Process> {
        let _ = (line, req);
        Err(Error::Unsupported(format!(
            "{} cannot run shell command lines",
            self.name()
        )))
    }

    /// Start `cmd` detached from this process.
    fn daemonize(&self, cmd: &Command, options: &Nohup) -> Result<Process>;

    /// Open a persistent shell.
    fn session(&self, isatty: bool) -> Result<ShellSession>;
}

/// A command for `name` on `machine`.
///
/// Names containing a path separator are used as given; anything else is
/// looked up with [`Backend::which`].
pub fn command(machine: &Machine, name: &str) -> Result<Command> {
    let is_path = name.contains('/') || (cfg!(windows) && name.contains('\\'));
    let executable = if is_path {
        name.to_string()
    } else {
        machine.which(name)?
    };
    Ok(Command::atomic(executable, machine.clone()))
}

/// `cd <cwd> && env K=V ... <argv>`, the line a remote shell runs for one
/// program.
pub(crate) fn remote_command_line(
    argv: &[String],
    cwd: Option<&Path>,
    env: &BTreeMap<String, String>,
) -> String {
    use crate::quoting::shquote;

    let mut line = String::new();
    if let Some(cwd) = cwd {
        line.push_str("cd ");
        line.push_str(&shquote(&cwd.to_string_lossy()));
        line.push_str(" && ");
    }
    if !env.is_empty() {
        line.push_str("env");
        for (k, v) in env {
            line.push(' ');
            line.push_str(&shquote(&format!("{}={}", k, v)));
        }
        line.push(' ');
    }
    line.push_str(&argv.join(" "));
    line
}


#[cfg(test)]
mod tests {
    use super::testing::fake_local;
    use super::*;

    #[test]
    fn test_command_resolution() {
        let machine = fake_local();
        assert_eq!(command(&machine, "ls").unwrap().executable(), Some("/usr/bin/ls"));
        assert_eq!(command(&machine, "./run.sh").unwrap().executable(), Some("./run.sh"));
    }

    #[test]
    fn test_remote_command_line() {
        let mut env = BTreeMap::new();
        env.insert("A".to_string(), "x y".to_string());
        let line = remote_command_line(
            &["ls".to_string(), "'a b'".to_string()],
            Some(Path::new("/srv/my app")),
            &env,
        );
        assert_eq!(line, "cd '/srv/my app' && env 'A=x y' ls 'a b'");
        assert_eq!(remote_command_line(&["true".to_string()], None, &BTreeMap::new()), "true");
    }

    #[test]
    fn test_request_clone_rejects_upstream() {
        let req = SpawnRequest {
            stdin: SpawnInput::Upstream(PipeReader::Stream(Box::new(std::io::empty()))),
            ..SpawnRequest::default()
        };
        assert!(req.try_clone().is_err());
        assert!(SpawnRequest::piped().try_clone().is_ok());
    }
}
