//! Process handles.
//!
//! [`Process`] is the uniform handle every backend returns: a single OS
//! child, a remote exec channel, a pipeline of stages, a concurrent group,
//! or a detached daemon. It exposes poll/wait/kill plus deadlock-free
//! [`Process::communicate`] and streaming [`Process::iter_lines`].

mod child;
mod daemon;
mod lines;
mod reader;

pub use child::LocalChild;
pub use daemon::DaemonProcess;
pub use lines::{Lines, LinesOptions};
pub use reader::{read_decode_safely, READ_BUFFER_SIZE};

#[cfg(unix)]
pub(crate) use child::os_pipe;
pub(crate) use child::exit_code;
#[cfg(unix)]
pub(crate) use daemon::spawn_detached;
pub(crate) use reader::{read_retrying, Collector, Event, LineBuffer, Next, ReadMode, Utf8Decoder};

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::process::{ChildStderr, ChildStdout, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::command::{Retcode, StreamKind};
use crate::error::{Error, ProcessExecutionError, Result};

/// Interval used when a handle has to poll for termination.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long teardown waits for a killed process to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// The read end of a child's output stream.
pub enum PipeReader {
    /// A local child's stdout.
    Stdout(ChildStdout),
    /// A local child's stderr.
    Stderr(ChildStderr),
    /// An OS pipe end.
    File(File),
    /// Any other byte source (remote channels, PTYs).
    Stream(Box<dyn Read + Send>),
}

impl fmt::Debug for PipeReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            PipeReader::Stdout(_) => "Stdout",
            PipeReader::Stderr(_) => "Stderr",
            PipeReader::File(_) => "File",
            PipeReader::Stream(_) => "Stream",
        };
        f.debug_tuple("PipeReader").field(&kind).finish()
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            PipeReader::Stdout(r) => r.read(buf),
            PipeReader::Stderr(r) => r.read(buf),
            PipeReader::File(r) => r.read(buf),
            PipeReader::Stream(r) => r.read(buf),
        }
    }
}

impl PipeReader {
    /// Turn into something a local child can use as stdin.
    ///
    /// OS-level handles are passed straight through. Other sources need a
    /// pump thread, so they come back alongside `Stdio::piped()`.
    pub(crate) fn into_stdio(self) -> (Stdio, Option<Box<dyn Read + Send>>) {
        match self {
            PipeReader::Stdout(r) => (Stdio::from(r), None),
            PipeReader::Stderr(r) => (Stdio::from(r), None),
            PipeReader::File(r) => (Stdio::from(r), None),
            PipeReader::Stream(r) => (Stdio::piped(), Some(r)),
        }
    }
}

/// Copy `reader` into `writer` on a background thread, closing `writer`
/// at the end.
pub(crate) fn spawn_pump<R, W>(name: &str, mut reader: R, mut writer: W) -> Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    let handle = thread::Builder::new()
        .name(format!("pipewright-{}", name))
        .spawn(move || {
            let mut buf = [0u8; READ_BUFFER_SIZE];
            loop {
                let n = match read_retrying(&mut reader, &mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                if writer.write_all(&buf[..n]).is_err() {
                    break;
                }
            }
            let _ = writer.flush();
        })?;
    Ok(handle)
}

/// Write `data` to `writer` on a background thread, then close it.
pub(crate) fn spawn_feeder(mut writer: Box<dyn Write + Send>, data: Vec<u8>) -> Result<()> {
    thread::Builder::new()
        .name("pipewright-stdin".into())
        .spawn(move || {
            if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                if e.kind() != io::ErrorKind::BrokenPipe {
                    debug!("stdin feeder: {}", e);
                }
            }
        })?;
    Ok(())
}

/// Low-level lifecycle operations of one spawned thing.
///
/// Exit codes follow the shell convention: a process killed by a signal
/// reports the negated signal number.
pub trait RawProcess: Send + fmt::Debug {
    /// Non-blocking check for termination.
    fn try_wait(&mut self) -> Result<Option<i32>>;

    /// Block until terminated.
    fn wait(&mut self) -> Result<i32>;

    /// Block for at most `timeout`.
    fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<i32>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(code) = self.try_wait()? {
                return Ok(Some(code));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Forcefully terminate.
    fn kill(&mut self) -> Result<()>;

    /// Deliver a signal.
    fn send_signal(&mut self, signal: i32) -> Result<()> {
        let _ = signal;
        Err(Error::Unsupported(
            "this process cannot receive signals".into(),
        ))
    }

    /// OS process id, when there is one.
    fn id(&self) -> Option<u32> {
        None
    }
}

enum Kind {
    Single(Box<dyn RawProcess>),
    Pipeline(Vec<Process>),
    Group(Vec<Process>),
}

/// A running (or finished) command.
pub struct Process {
    argv: Vec<String>,
    host: Option<String>,
    kind: Kind,
    returncode: Option<i32>,
    stdin: Option<Box<dyn Write + Send>>,
    stdout: Option<PipeReader>,
    stderr: Option<PipeReader>,
    pumps: Vec<JoinHandle<()>>,
    collector: Option<Collector>,
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            Kind::Single(raw) => format!("{:?}", raw),
            Kind::Pipeline(stages) => format!("Pipeline({})", stages.len()),
            Kind::Group(members) => format!("Group({})", members.len()),
        };
        f.debug_struct("Process")
            .field("argv", &self.argv)
            .field("host", &self.host)
            .field("kind", &kind)
            .field("returncode", &self.returncode)
            .finish()
    }
}

impl Process {
    /// Wrap a single spawned process and its pipes.
    pub fn new(
        argv: Vec<String>,
        raw: Box<dyn RawProcess>,
        stdin: Option<Box<dyn Write + Send>>,
        stdout: Option<PipeReader>,
        stderr: Option<PipeReader>,
    ) -> Self {
        Self {
            argv,
            host: None,
            kind: Kind::Single(raw),
            returncode: None,
            stdin,
            stdout,
            stderr,
            pumps: Vec::new(),
            collector: None,
        }
    }

    /// Join pipeline stages. Stdin comes from the first stage and stdout
    /// from the last; every stage's stderr stays with its stage.
    pub(crate) fn pipeline(argv: Vec<String>, mut stages: Vec<Process>) -> Self {
        let stdin = stages.first_mut().and_then(|s| s.stdin.take());
        let stdout = stages.last_mut().and_then(|s| s.stdout.take());
        let host = stages.iter().find_map(|s| s.host.clone());
        Self {
            argv,
            host,
            kind: Kind::Pipeline(stages),
            returncode: None,
            stdin,
            stdout,
            stderr: None,
            pumps: Vec::new(),
            collector: None,
        }
    }

    /// Group processes spawned together.
    pub(crate) fn group(argv: Vec<String>, members: Vec<Process>) -> Self {
        let host = members.iter().find_map(|m| m.host.clone());
        Self {
            argv,
            host,
            kind: Kind::Group(members),
            returncode: None,
            stdin: None,
            stdout: None,
            stderr: None,
            pumps: Vec::new(),
            collector: None,
        }
    }

    /// Record the remote host for diagnostics.
    pub fn with_host(mut self, host: Option<String>) -> Self {
        self.host = host;
        self
    }

    pub(crate) fn with_argv(mut self, argv: Vec<String>) -> Self {
        self.argv = argv;
        self
    }

    /// Threads that must finish before output is complete (for example
    /// copying a remote channel into a local file).
    pub(crate) fn add_pump(&mut self, pump: JoinHandle<()>) {
        self.pumps.push(pump);
    }

    /// Command line, for diagnostics.
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Remote host this process runs on.
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// OS process id of a single local process.
    pub fn id(&self) -> Option<u32> {
        match &self.kind {
            Kind::Single(raw) => raw.id(),
            _ => None,
        }
    }

    /// Exit code, once known.
    pub fn returncode(&self) -> Option<i32> {
        self.returncode
    }

    /// Writable stdin, if piped.
    pub fn stdin(&mut self) -> Option<&mut (dyn Write + Send + 'static)> {
        self.stdin.as_deref_mut()
    }

    /// Take ownership of stdin.
    pub fn take_stdin(&mut self) -> Option<Box<dyn Write + Send>> {
        self.stdin.take()
    }

    /// Take ownership of stdout.
    pub fn take_stdout(&mut self) -> Option<PipeReader> {
        self.stdout.take()
    }

    /// Take ownership of stderr.
    pub fn take_stderr(&mut self) -> Option<PipeReader> {
        self.stderr.take()
    }

    /// Sub-processes of a pipeline or group.
    pub fn children(&self) -> &[Process] {
        match &self.kind {
            Kind::Single(_) => &[],
            Kind::Pipeline(parts) | Kind::Group(parts) => parts,
        }
    }

    /// Non-blocking check for termination.
    pub fn poll(&mut self) -> Result<Option<i32>> {
        if self.returncode.is_some() {
            return Ok(self.returncode);
        }
        let code = match &mut self.kind {
            Kind::Single(raw) => raw.try_wait()?,
            Kind::Pipeline(stages) => {
                let codes = poll_all(stages)?;
                codes.map(|codes| pipeline_code(&codes))
            }
            Kind::Group(members) => {
                let codes = poll_all(members)?;
                codes.map(|codes| group_code(&codes))
            }
        };
        if code.is_some() {
            self.finish_pumps();
            self.returncode = code;
        }
        Ok(code)
    }

    /// Block until terminated. Groups and pipelines wait for every member.
    pub fn wait(&mut self) -> Result<i32> {
        if let Some(code) = self.returncode {
            return Ok(code);
        }
        let code = match &mut self.kind {
            Kind::Single(raw) => raw.wait()?,
            Kind::Pipeline(stages) => {
                let mut codes = Vec::with_capacity(stages.len());
                for stage in stages.iter_mut().rev() {
                    codes.push(stage.wait()?);
                }
                codes.reverse();
                pipeline_code(&codes)
            }
            Kind::Group(members) => {
                let mut codes = Vec::with_capacity(members.len());
                for member in members.iter_mut() {
                    codes.push(member.wait()?);
                }
                group_code(&codes)
            }
        };
        self.finish_pumps();
        self.returncode = Some(code);
        Ok(code)
    }

    /// Block for at most `timeout`.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<i32>> {
        if let Some(code) = self.returncode {
            return Ok(Some(code));
        }
        if let Kind::Single(raw) = &mut self.kind {
            let code = raw.wait_timeout(timeout)?;
            if code.is_some() {
                self.finish_pumps();
                self.returncode = code;
            }
            return Ok(code);
        }
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(code) = self.poll()? {
                return Ok(Some(code));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Forcefully terminate, including every stage or member.
    pub fn kill(&mut self) -> Result<()> {
        match &mut self.kind {
            Kind::Single(raw) => raw.kill(),
            Kind::Pipeline(parts) | Kind::Group(parts) => {
                let mut first_error = None;
                for part in parts.iter_mut() {
                    if part.returncode.is_some() {
                        continue;
                    }
                    if let Err(e) = part.kill() {
                        first_error.get_or_insert(e);
                    }
                }
                first_error.map_or(Ok(()), Err)
            }
        }
    }

    /// Deliver a signal to every underlying process.
    pub fn send_signal(&mut self, signal: i32) -> Result<()> {
        match &mut self.kind {
            Kind::Single(raw) => raw.send_signal(signal),
            Kind::Pipeline(parts) | Kind::Group(parts) => {
                for part in parts.iter_mut() {
                    part.send_signal(signal)?;
                }
                Ok(())
            }
        }
    }

    /// Kill, then reap, so nothing is left behind. Errors are logged.
    pub(crate) fn kill_and_reap(&mut self) {
        if let Err(e) = self.kill() {
            debug!("kill failed for {:?}: {}", self.argv, e);
        }
        match self.wait_timeout(REAP_TIMEOUT) {
            Ok(Some(_)) => {}
            Ok(None) => warn!("process {:?} survived kill", self.argv),
            Err(e) => warn!("reaping {:?} failed: {}", self.argv, e),
        }
    }

    fn finish_pumps(&mut self) {
        for pump in self.pumps.drain(..) {
            if pump.join().is_err() {
                warn!("output pump for {:?} panicked", self.argv);
            }
        }
    }

    fn take_streams(&mut self, streams: &mut Vec<(StreamKind, PipeReader)>) {
        if let Some(out) = self.stdout.take() {
            streams.push((StreamKind::Stdout, out));
        }
        if let Some(err) = self.stderr.take() {
            streams.push((StreamKind::Stderr, err));
        }
        match &mut self.kind {
            Kind::Single(_) => {}
            Kind::Pipeline(parts) | Kind::Group(parts) => {
                for part in parts.iter_mut() {
                    part.take_streams(streams);
                }
            }
        }
    }

    /// Start draining every piped output stream in the background.
    ///
    /// Later calls to [`Process::communicate`] or
    /// [`Process::iter_lines`] pick up what was buffered.
    pub fn start_draining(&mut self) -> Result<()> {
        if self.collector.is_none() {
            let collector = self.start_collector(ReadMode::Raw, READ_BUFFER_SIZE)?;
            self.collector = Some(collector);
        }
        Ok(())
    }

    pub(crate) fn start_collector(&mut self, mode: ReadMode, buf_size: usize) -> Result<Collector> {
        if let Some(collector) = self.collector.take() {
            return Ok(collector);
        }
        let mut streams = Vec::new();
        self.take_streams(&mut streams);
        Collector::start(streams, mode, buf_size)
    }

    fn feed_stdin(&mut self, input: Option<&[u8]>) -> Result<()> {
        if input.is_some() && matches!(self.kind, Kind::Group(_)) {
            return Err(Error::InvalidArgument(
                "cannot pass input to a concurrent group".into(),
            ));
        }
        let stdin = self.stdin.take();
        match (stdin, input) {
            (Some(writer), Some(data)) => spawn_feeder(writer, data.to_vec()),
            (None, Some(_)) => Err(Error::InvalidArgument("stdin is not piped".into())),
            _ => Ok(()),
        }
    }

    /// Drain stdout and stderr to EOF, then wait.
    pub fn communicate(&mut self, input: Option<&[u8]>) -> Result<(Vec<u8>, Vec<u8>)> {
        self.communicate_timeout(input, None)
    }

    /// Like [`Process::communicate`] with a deadline. On expiry the
    /// process is killed and reaped before [`Error::Timeout`] is returned.
    pub fn communicate_timeout(
        &mut self,
        input: Option<&[u8]>,
        timeout: Option<Duration>,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let deadline = timeout.map(|t| Instant::now() + t);
        self.feed_stdin(input)?;
        let mut collector = self.start_collector(ReadMode::Raw, READ_BUFFER_SIZE)?;
        loop {
            match collector.next(deadline) {
                Next::Finished => break,
                Next::Event(Event::Data { .. }) => {}
                Next::Event(Event::Failed(error)) => {
                    self.kill_and_reap();
                    return Err(error);
                }
                Next::TimedOut => return Err(self.timed_out(timeout)),
            }
        }
        self.wait_until(deadline, timeout)?;
        Ok(collector.output())
    }

    /// Wait with an optional deadline; kills on expiry.
    pub(crate) fn wait_until(&mut self, deadline: Option<Instant>, timeout: Option<Duration>) -> Result<i32> {
        match deadline {
            None => self.wait(),
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match self.wait_timeout(remaining)? {
                    Some(code) => Ok(code),
                    None => Err(self.timed_out(timeout)),
                }
            }
        }
    }

    pub(crate) fn timed_out(&mut self, timeout: Option<Duration>) -> Error {
        debug!("timeout expired for {:?}, killing", self.argv);
        self.kill_and_reap();
        Error::Timeout {
            argv: self.argv.clone(),
            timeout: timeout.unwrap_or_default(),
        }
    }

    /// Check `code` against `retcode`.
    pub fn verify(&self, retcode: &Retcode, code: Option<i32>, stdout: &str, stderr: &str) -> Result<()> {
        if retcode.accepts(code) {
            return Ok(());
        }
        Err(ProcessExecutionError::new(self.argv.clone(), code, stdout, stderr)
            .with_host(self.host.clone())
            .into())
    }

    /// Stream output line by line.
    pub fn iter_lines(&mut self, options: LinesOptions) -> Lines<'_> {
        Lines::new(self, options)
    }
}

fn poll_all(parts: &mut [Process]) -> Result<Option<Vec<i32>>> {
    let mut codes = Vec::with_capacity(parts.len());
    let mut done = true;
    for part in parts.iter_mut() {
        match part.poll()? {
            Some(code) => codes.push(code),
            None => done = false,
        }
    }
    Ok(if done { Some(codes) } else { None })
}

/// The last stage's code, unless it is zero, in which case the nearest
/// failing upstream stage's.
fn pipeline_code(codes: &[i32]) -> i32 {
    codes.iter().rev().copied().find(|c| *c != 0).unwrap_or(0)
}

/// The first non-zero code in member order.
fn group_code(codes: &[i32]) -> i32 {
    codes.iter().copied().find(|c| *c != 0).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Scripted {
        polls_until_done: u32,
        code: i32,
        killed: bool,
    }

    impl RawProcess for Scripted {
        fn try_wait(&mut self) -> Result<Option<i32>> {
            if self.killed {
                return Ok(Some(-9));
            }
            if self.polls_until_done == 0 {
                Ok(Some(self.code))
            } else {
                self.polls_until_done -= 1;
                Ok(None)
            }
        }

        fn wait(&mut self) -> Result<i32> {
            self.polls_until_done = 0;
            self.try_wait().map(|c| c.unwrap_or(self.code))
        }

        fn kill(&mut self) -> Result<()> {
            self.killed = true;
            Ok(())
        }
    }

    fn scripted(polls: u32, code: i32) -> Process {
        Process::new(
            vec!["x".into()],
            Box::new(Scripted {
                polls_until_done: polls,
                code,
                killed: false,
            }),
            None,
            None,
            None,
        )
    }

    #[test]
    fn test_group_code_is_first_failure_in_member_order() {
        assert_eq!(group_code(&[0, 0, 0]), 0);
        assert_eq!(group_code(&[0, 2, 1]), 2);
        assert_eq!(group_code(&[0, 0, 1]), 1);
    }

    #[test]
    fn test_pipeline_code_prefers_last_stage() {
        assert_eq!(pipeline_code(&[0, 0]), 0);
        assert_eq!(pipeline_code(&[3, 1]), 1);
        assert_eq!(pipeline_code(&[3, 0]), 3);
    }

    #[test]
    fn test_group_poll_waits_for_all_members() {
        let mut group = Process::group(
            vec!["g".into()],
            vec![scripted(0, 0), scripted(2, 4), scripted(0, 1)],
        );
        assert_eq!(group.poll().unwrap(), None);
        assert_eq!(group.poll().unwrap(), None);
        assert_eq!(group.poll().unwrap(), Some(4));
        assert_eq!(group.returncode(), Some(4));
        // cached afterwards
        assert_eq!(group.poll().unwrap(), Some(4));
    }

    #[test]
    fn test_group_wait_does_not_short_circuit() {
        let mut group = Process::group(vec!["g".into()], vec![scripted(5, 2), scripted(5, 0)]);
        assert_eq!(group.wait().unwrap(), 2);
        assert!(group.children().iter().all(|m| m.returncode().is_some()));
    }

    #[test]
    fn test_kill_propagates_to_members() {
        let mut group = Process::group(vec!["g".into()], vec![scripted(100, 0), scripted(100, 0)]);
        group.kill().unwrap();
        assert_eq!(group.wait().unwrap(), -9);
    }

    #[test]
    fn test_verify() {
        let p = scripted(0, 1);
        assert!(p.verify(&Retcode::Any, Some(1), "", "").is_ok());
        let err = p.verify(&Retcode::Exact(0), Some(1), "out", "err").unwrap_err();
        let failure = err.execution().unwrap();
        assert_eq!(failure.retcode, Some(1));
        assert_eq!(failure.stdout, "out");
    }

    #[test]
    fn test_group_rejects_input() {
        let mut group = Process::group(vec!["g".into()], vec![scripted(0, 0)]);
        assert!(matches!(
            group.communicate(Some(b"x")),
            Err(Error::InvalidArgument(_))
        ));
    }
}
