//! Remote machines reached over a channel-multiplexing transport.
//!
//! A [`Transport`] is an established connection that can open any number of
//! channels: exec channels for single commands, an interactive shell for
//! the control session, and forwarded TCP connections. File transfer goes
//! through a separate [`FileTransfer`] capability.

use std::fmt;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::remote::RemoteState;
use super::{command, Backend, ExecContext, Machine, SpawnInput, SpawnOutput, SpawnRequest};
use crate::command::{Command, Retcode, StreamKind};
use crate::error::{Error, ProcessExecutionError, Result};
use crate::execution::Nohup;
use crate::process::{spawn_pump, PipeReader, Process, RawProcess};
use crate::quoting::shquote;
use crate::session::{SessionOptions, SessionOutput, ShellSession};

/// One open channel on a [`Transport`].
pub trait Channel: Send + fmt::Debug {
    fn take_stdin(&mut self) -> Option<Box<dyn Write + Send>>;

    fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>>;

    /// Extended data. Shell channels on a terminal have none.
    fn take_stderr(&mut self) -> Option<Box<dyn Read + Send>>;

    fn exit_status_ready(&mut self) -> Result<bool>;

    /// Block until the remote side reports an exit status.
    fn recv_exit_status(&mut self) -> Result<i32>;

    fn close(&mut self) -> Result<()>;
}

/// Metadata of a remote file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoteStat {
    pub size: u64,
    /// Permission and type bits.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Seconds since the epoch.
    pub mtime: u64,
    pub is_dir: bool,
}

/// SFTP-like file operations.
pub trait FileTransfer: Send {
    fn get(&mut self, remote: &str, local: &Path) -> Result<()>;

    fn put(&mut self, local: &Path, remote: &str) -> Result<()>;

    fn listdir(&mut self, remote: &str) -> Result<Vec<String>>;

    fn stat(&mut self, remote: &str) -> Result<RemoteStat>;
}

/// An established connection to a remote host.
pub trait Transport: Send + Sync + fmt::Debug + 'static {
    /// Host name, for diagnostics.
    fn name(&self) -> String;

    /// Run `line` on a new exec channel.
    fn exec_command(&self, line: &str) -> Result<Box<dyn Channel>>;

    /// Start an interactive shell, optionally on a pseudo-terminal.
    fn invoke_shell(&self, pty: bool) -> Result<Box<dyn Channel>>;

    /// Open a channel of `kind` (`direct-tcpip`, ...) between `src` and
    /// `dest`.
    fn open_channel(&self, kind: &str, dest: (&str, u16), src: (&str, u16)) -> Result<Box<dyn Channel>>;

    fn sftp(&self) -> Result<Box<dyn FileTransfer>>;
}

/// A channel seen as a process.
#[derive(Debug)]
struct ChannelProcess {
    channel: Box<dyn Channel>,
}

impl RawProcess for ChannelProcess {
    fn try_wait(&mut self) -> Result<Option<i32>> {
        if self.channel.exit_status_ready()? {
            Ok(Some(self.channel.recv_exit_status()?))
        } else {
            Ok(None)
        }
    }

    fn wait(&mut self) -> Result<i32> {
        self.channel.recv_exit_status()
    }

    fn kill(&mut self) -> Result<()> {
        self.channel.close()
    }
}

fn channel_process(argv: Vec<String>, mut channel: Box<dyn Channel>) -> Process {
    let stdin = channel.take_stdin();
    let stdout = channel.take_stdout().map(PipeReader::Stream);
    let stderr = channel.take_stderr().map(PipeReader::Stream);
    Process::new(argv, Box::new(ChannelProcess { channel }), stdin, stdout, stderr)
}

/// A machine that runs every command on its own channel of a shared
/// transport.
///
/// Channels carry their streams independently, so pipeline stages are
/// wired by pumping one channel's stdout into the next one's stdin.
#[derive(Debug)]
pub struct ChannelMachine<T: Transport> {
    transport: T,
    state: RemoteState,
    connect_timeout: Duration,
}

impl<T: Transport> ChannelMachine<T> {
    /// Open the control shell on `transport` and probe the remote side.
    pub fn connect(transport: T, connect_timeout: Duration) -> Result<Arc<Self>> {
        let host = transport.name();
        let shell = channel_process(vec!["shell".to_string()], transport.invoke_shell(false)?);
        let session = ShellSession::new(
            shell,
            SessionOptions {
                isatty: false,
                connect_timeout: Some(connect_timeout),
                host: Some(host.clone()),
            },
        )?;
        let state = RemoteState::connect(host, session)?;
        Ok(Arc::new(Self {
            transport,
            state,
            connect_timeout,
        }))
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// A command for `name`, resolved on the remote `PATH`.
    pub fn command(self: &Arc<Self>, name: &str) -> Result<Command> {
        let machine: Machine = self.clone();
        command(&machine, name)
    }

    /// Run a line in the control session.
    pub fn session_run(&self, line: &str, retcode: impl Into<Retcode>) -> Result<SessionOutput> {
        self.state.run(line, retcode)
    }

    pub fn uname(&self) -> &str {
        self.state.uname()
    }

    /// A TCP connection to `dhost:dport` made from the remote side.
    pub fn connect_sock(&self, dport: u16, dhost: &str) -> Result<Box<dyn Channel>> {
        debug!("direct-tcpip to {}:{} via {}", dhost, dport, self.transport.name());
        self.transport
            .open_channel("direct-tcpip", (dhost, dport), ("127.0.0.1", 0))
    }

    pub fn upload(&self, src: &Path, dst: &str) -> Result<()> {
        self.transport.sftp()?.put(src, dst)
    }

    pub fn download(&self, src: &str, dst: &Path) -> Result<()> {
        self.transport.sftp()?.get(src, dst)
    }

    pub fn listdir(&self, path: &str) -> Result<Vec<String>> {
        self.transport.sftp()?.listdir(path)
    }

    pub fn stat(&self, path: &str) -> Result<RemoteStat> {
        self.transport.sftp()?.stat(path)
    }

    pub fn close(&self) -> Result<()> {
        self.state.close()
    }

    /// Exec `line` and hook the channel's streams up as `req` asks.
    fn exec(&self, line: &str, display: Vec<String>, req: SpawnRequest) -> Result<Process> {
        debug!("exec on {}: {}", self.transport.name(), line);
        let mut process =
            channel_process(display, self.transport.exec_command(line)?).with_host(Some(self.transport.name()));

        match req.stdin {
            SpawnInput::Pipe => {}
            SpawnInput::Upstream(reader) => {
                if let Some(writer) = process.take_stdin() {
                    spawn_pump("stdin", reader, writer)?;
                }
            }
            SpawnInput::File(file) => {
                if let Some(writer) = process.take_stdin() {
                    spawn_pump("stdin", file, writer)?;
                }
            }
            SpawnInput::Inherit => {
                if let Some(writer) = process.take_stdin() {
                    spawn_pump("stdin", io::stdin(), writer)?;
                }
            }
            SpawnInput::Null => drop(process.take_stdin()),
        }

        route_output(&mut process, StreamKind::Stdout, req.stdout)?;
        let stderr = match req.stderr {
            // the remote shell merged it already
            SpawnOutput::ToStdout => SpawnOutput::Null,
            other => other,
        };
        route_output(&mut process, StreamKind::Stderr, stderr)?;
        Ok(process)
    }
}

/// Send a channel stream where the request wants it. Piped streams stay
/// on the process.
fn route_output(process: &mut Process, kind: StreamKind, target: SpawnOutput) -> Result<()> {
    let writer: Box<dyn Write + Send> = match target {
        SpawnOutput::Pipe => return Ok(()),
        SpawnOutput::Null => Box::new(io::sink()),
        SpawnOutput::Inherit if kind == StreamKind::Stderr => Box::new(io::stderr()),
        SpawnOutput::Inherit => Box::new(io::stdout()),
        SpawnOutput::File(file) => Box::new(file),
        SpawnOutput::ToStdout => {
            return Err(Error::InvalidArgument("stdout cannot be merged into itself".into()))
        }
    };
    let stream = match kind {
        StreamKind::Stderr => process.take_stderr(),
        _ => process.take_stdout(),
    };
    if let Some(stream) = stream {
        let pump = spawn_pump(&format!("channel-{}", kind), stream, writer)?;
        process.add_pump(pump);
    }
    Ok(())
}

impl<T: Transport> Backend for ChannelMachine<T> {
    fn name(&self) -> String {
        self.transport.name()
    }

    fn quote_level(&self) -> usize {
        1
    }

    fn host(&self) -> Option<String> {
        Some(self.transport.name())
    }

    fn which(&self, program: &str) -> Result<String> {
        self.state.which(program)
    }

    fn context(&self) -> Result<ExecContext> {
        self.state.context()
    }

    fn chdir(&self, path: &Path) -> Result<()> {
        self.state.chdir(path)
    }

    fn set_env(&self, key: &str, value: &str) -> Result<()> {
        self.state.set_env(key, value)
    }

    fn unset_env(&self, key: &str) -> Result<()> {
        self.state.unset_env(key)
    }

    fn restore_context(&self, ctx: ExecContext) -> Result<()> {
        self.state.restore(ctx)
    }

    fn supports_native_pipelines(&self) -> bool {
        true
    }

    fn spawn_argv(&self, argv: &[String], req: SpawnRequest) -> Result<Process> {
        if argv.is_empty() {
            return Err(Error::InvalidArgument("empty argv".into()));
        }
        let merge = matches!(req.stderr, SpawnOutput::ToStdout);
        let line = self
            .state
            .command_line(argv, req.cwd.as_deref(), &req.env, merge)?;
        self.exec(&line, argv.to_vec(), req)
    }

    fn spawn_shell_line(&self, line: &str, req: SpawnRequest) -> Result<Process> {
        let merge = matches!(req.stderr, SpawnOutput::ToStdout);
        let full = self
            .state
            .shell_line(line, req.cwd.as_deref(), &req.env, merge)?;
        self.exec(&full, vec![line.to_string()], req)
    }

    fn daemonize(&self, cmd: &Command, options: &Nohup) -> Result<Process> {
        let (line, cwd) = match cmd.leaf() {
            Some(leaf) => {
                let line = super::remote_command_line(&leaf.argv, None, &leaf.env);
                (line, leaf.cwd.unwrap_or_else(|| options.working_dir().to_path_buf()))
            }
            None => (
                format!("sh -c {}", shquote(&cmd.shell_line())),
                options.working_dir().to_path_buf(),
            ),
        };
        let line = self.state.nohup_line(
            &line,
            &cwd,
            Some(options.stdout_path()),
            options.stderr_path(),
            options.append,
        )?;
        let line = format!("{} &", line);
        let req = SpawnRequest {
            stdin: SpawnInput::Null,
            ..SpawnRequest::piped()
        };
        let mut process = self.exec(&line, cmd.formulate(0), req)?;
        let (stdout, stderr) = process.communicate(None)?;
        let code = process.wait()?;
        if code != 0 {
            return Err(ProcessExecutionError::new(
                vec![line],
                Some(code),
                String::from_utf8_lossy(&stdout).into_owned(),
                String::from_utf8_lossy(&stderr).into_owned(),
            )
            .with_host(Some(self.transport.name()))
            .into());
        }
        Ok(process)
    }

    fn session(&self, isatty: bool) -> Result<ShellSession> {
        let shell = channel_process(vec!["shell".to_string()], self.transport.invoke_shell(isatty)?);
        ShellSession::new(
            shell,
            SessionOptions {
                isatty,
                connect_timeout: Some(self.connect_timeout),
                host: Some(self.transport.name()),
            },
        )
    }
}
