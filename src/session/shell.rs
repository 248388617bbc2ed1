//! Persistent shell sessions.

use std::io::{BufRead, BufReader, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, trace};

use super::probe::StateProbe;
use super::sanitize::OutputSanitizer;
use super::state::SessionState;
use crate::command::{Command, Retcode, StreamKind};
use crate::error::{Error, ProcessExecutionError, Result, SshCommsKind};
use crate::process::{PipeReader, Process};

/// The exit sequence written on close. Repeated to get out of nested
/// shells a failed command may have left open.
const EXIT_SEQUENCE: &[u8] = b"\nexit\n\n\nexit\n\n";

/// Grace period between writing the exit sequence and killing.
const CLOSE_GRACE: Duration = Duration::from_millis(50);

/// How long to wait for the exit code of a shell that hung up.
const DEAD_SHELL_WAIT: Duration = Duration::from_secs(1);

/// Options for [`ShellSession::new`].
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// The shell runs on a terminal: stderr is merged into stdout and the
    /// terminal echoes every command line back.
    pub isatty: bool,
    /// Bound on the startup round trip; the session is closed if the
    /// shell does not answer in time.
    pub connect_timeout: Option<Duration>,
    /// Remote host, for diagnostics.
    pub host: Option<String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            isatty: false,
            connect_timeout: Some(Duration::from_secs(5)),
            host: None,
        }
    }
}

impl SessionOptions {
    /// Startup timeout from the `session` section of `config`.
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(config.session.connect_timeout_secs)),
            ..Self::default()
        }
    }
}

/// Output of one command run in a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutput {
    /// Exit code printed by the shell; `None` if it could not be parsed.
    pub retcode: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

enum Line {
    Text(String),
    Eof,
}

fn spawn_line_reader(kind: StreamKind, reader: PipeReader) -> Result<Receiver<Line>> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name(format!("pipewright-session-{}", kind))
        .spawn(move || {
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf).into_owned();
                        if tx.send(Line::Text(line)).is_err() {
                            return;
                        }
                    }
                    #[cfg(unix)]
                    Err(e) if e.raw_os_error() == Some(libc::EIO) => break,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!("session {} reader: {}", kind, e);
                        break;
                    }
                }
            }
            let _ = tx.send(Line::Eof);
        })?;
    Ok(rx)
}

/// A long-lived shell that runs commands one after another.
///
/// Each command is framed with a unique marker so its output and exit code
/// can be recovered from the shell's plain output streams (see
/// [`StateProbe::frame`]). Working directory and environment changes live
/// in the shell process itself.
///
/// Runs are strictly sequential; `run` takes `&mut self`, so callers that
/// share a session between threads must serialize access themselves.
pub struct ShellSession {
    process: Process,
    stdin: Option<Box<dyn Write + Send>>,
    stdout: Receiver<Line>,
    stderr: Option<Receiver<Line>>,
    marker: String,
    isatty: bool,
    host: Option<String>,
    state: SessionState,
    startup: Option<SessionOutput>,
}

impl std::fmt::Debug for ShellSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellSession")
            .field("process", &self.process)
            .field("isatty", &self.isatty)
            .field("host", &self.host)
            .field("state", &self.state)
            .finish()
    }
}

impl ShellSession {
    /// Take over a running shell and drain its startup output.
    pub fn new(mut process: Process, options: SessionOptions) -> Result<Self> {
        let stdin = process
            .take_stdin()
            .ok_or_else(|| Error::Session("shell stdin is not piped".into()))?;
        let stdout = process
            .take_stdout()
            .ok_or_else(|| Error::Session("shell stdout is not piped".into()))?;
        let stdout = spawn_line_reader(StreamKind::Stdout, stdout)?;
        let stderr = match process.take_stderr() {
            Some(reader) if !options.isatty => Some(spawn_line_reader(StreamKind::Stderr, reader)?),
            _ => None,
        };

        let mut session = Self {
            process,
            stdin: Some(stdin),
            stdout,
            stderr,
            marker: StateProbe::marker(),
            isatty: options.isatty,
            host: options.host,
            state: SessionState::Starting,
            startup: None,
        };

        let deadline = options.connect_timeout.map(|t| Instant::now() + t);
        match session.exchange("", deadline) {
            Ok(output) => {
                session.startup = Some(output);
                Ok(session)
            }
            Err(e) => {
                if let (Some(timeout), Error::Session(_)) = (options.connect_timeout, &e) {
                    error!("connection to {:?} timed out ({:?})", session.process.argv(), timeout);
                }
                session.close();
                Err(e)
            }
        }
    }

    /// Output of the startup round trip (banners, MOTD).
    pub fn startup_output(&self) -> Option<&SessionOutput> {
        self.startup.as_ref()
    }

    pub fn isatty(&self) -> bool {
        self.isatty
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the shell process is still running.
    pub fn alive(&mut self) -> bool {
        self.state.is_alive() && matches!(self.process.poll(), Ok(None))
    }

    /// Run `cmd` and check its exit code against `retcode`.
    pub fn run(&mut self, cmd: &str, retcode: impl Into<Retcode>) -> Result<SessionOutput> {
        let retcode = retcode.into();
        let output = self.exchange(cmd, None)?;
        if !retcode.accepts(output.retcode) {
            return Err(ProcessExecutionError::new(
                vec![cmd.to_string()],
                output.retcode,
                output.stdout,
                output.stderr,
            )
            .with_host(self.host.clone())
            .into());
        }
        Ok(output)
    }

    /// Run a command expression, rendered for a shell.
    pub fn run_command(&mut self, cmd: &Command, retcode: impl Into<Retcode>) -> Result<SessionOutput> {
        let line = cmd.formulate(1).join(" ");
        self.run(&line, retcode)
    }

    fn exchange(&mut self, cmd: &str, deadline: Option<Instant>) -> Result<SessionOutput> {
        if !self.state.is_alive() {
            return Err(Error::Session("shell session has already been closed".into()));
        }
        self.state.transition_to(SessionState::Running)?;

        let framed = StateProbe::frame(cmd, &self.marker, self.isatty);
        debug!("running {:?}", framed.trim_end());
        let written = match self.stdin.as_mut() {
            Some(stdin) => stdin.write_all(framed.as_bytes()).and_then(|_| stdin.flush()),
            None => Err(std::io::ErrorKind::BrokenPipe.into()),
        };
        if let Err(e) = written {
            debug!("session write failed: {}", e);
            return Err(self.hung_up(cmd, StreamKind::Stdout, Vec::new(), Vec::new()));
        }

        let mut stdout = Vec::new();
        if let Some(kind) = self.read_until_marker(StreamKind::Stdout, &mut stdout, deadline)? {
            return Err(self.hung_up(cmd, kind, stdout, Vec::new()));
        }
        let mut stderr = Vec::new();
        if self.stderr.is_some() {
            if let Some(kind) = self.read_until_marker(StreamKind::Stderr, &mut stderr, deadline)? {
                return Err(self.hung_up(cmd, kind, stdout, stderr));
            }
        }

        if self.isatty && !stdout.is_empty() {
            // the terminal's echo of the command line
            stdout.remove(0);
        }
        let retcode = stdout.pop().and_then(|line| line.trim().parse::<i32>().ok());
        self.state.transition_to(SessionState::Idle)?;
        Ok(SessionOutput {
            retcode,
            stdout: stdout.concat(),
            stderr: stderr.concat(),
        })
    }

    /// Collect lines until the marker. Returns the stream that hit EOF
    /// instead, if any.
    fn read_until_marker(
        &mut self,
        kind: StreamKind,
        out: &mut Vec<String>,
        deadline: Option<Instant>,
    ) -> Result<Option<StreamKind>> {
        let rx = match kind {
            StreamKind::Stderr => match &self.stderr {
                Some(rx) => rx,
                None => return Ok(None),
            },
            _ => &self.stdout,
        };
        loop {
            let line = match deadline {
                None => rx.recv().unwrap_or(Line::Eof),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match rx.recv_timeout(remaining) {
                        Ok(line) => line,
                        Err(RecvTimeoutError::Disconnected) => Line::Eof,
                        Err(RecvTimeoutError::Timeout) => {
                            return Err(Error::Session(format!(
                                "no response from {:?} before the deadline",
                                self.process.argv()
                            )))
                        }
                    }
                }
            };
            match line {
                Line::Eof => {
                    trace!("{}> nothing returned", kind);
                    return Ok(Some(kind));
                }
                Line::Text(text) => {
                    let text = if self.isatty {
                        OutputSanitizer::clean_line(&text)
                    } else {
                        text
                    };
                    trace!("{}> {:?}", kind, text);
                    if text.trim() == self.marker {
                        return Ok(None);
                    }
                    out.push(text);
                }
            }
        }
    }

    /// Classify a shell that went away mid-command.
    fn hung_up(&mut self, cmd: &str, stream: StreamKind, stdout: Vec<String>, stderr: Vec<String>) -> Error {
        let code = match self.process.wait_timeout(DEAD_SHELL_WAIT) {
            Ok(code) => code,
            Err(_) => None,
        };
        let (kind, message) = match code {
            Some(5) => (SshCommsKind::IncorrectLogin, "Incorrect username or password provided"),
            Some(6) => (
                SshCommsKind::HostPublicKeyUnknown,
                "The authenticity of the host can't be established",
            ),
            Some(c) if c != 0 => (SshCommsKind::Comms, "SSH communication failed"),
            _ if stream == StreamKind::Stderr => (
                SshCommsKind::Channel2,
                "No stderr result detected. Does the remote have a POSIX shell as its default shell?",
            ),
            _ => (
                SshCommsKind::Comms,
                "No communication channel detected. Does the remote exist?",
            ),
        };
        self.close();
        let argv = vec![cmd.split(';').next().unwrap_or_default().trim().to_string()];
        Error::SshComms {
            kind,
            failure: Box::new(
                ProcessExecutionError::new(argv, code, stdout.concat(), stderr.concat())
                    .with_message(message)
                    .with_host(self.host.clone()),
            ),
        }
    }

    /// Terminate the shell. Calling it again does nothing.
    pub fn close(&mut self) {
        if !self.state.is_alive() {
            return;
        }
        self.state = SessionState::Closed;
        if let Some(mut stdin) = self.stdin.take() {
            if stdin.write_all(EXIT_SEQUENCE).and_then(|_| stdin.flush()).is_ok() {
                thread::sleep(CLOSE_GRACE);
            }
        }
        if let Ok(Some(_)) = self.process.poll() {
            return;
        }
        self.process.kill_and_reap();
    }
}

impl Drop for ShellSession {
    fn drop(&mut self) {
        self.close();
    }
}
