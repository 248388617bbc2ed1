//! Execution modifiers.
//!
//! A modifier picks how a command runs. It is combined with a command
//! through `&` and returns whatever that mode produces:
//!
//! | modifier  | result                 |
//! |-----------|------------------------|
//! | [`BG`]    | `Result<Future>`       |
//! | [`FG`]    | `Result<()>`           |
//! | [`TF`]    | `Result<bool>`         |
//! | [`RETCODE`] | `Result<i32>`        |
//! | [`TEE`]   | `Result<Completed>`    |
//! | [`NOHUP`](super::NOHUP) | `Result<Process>` |
//! | [`LogPipe`](super::LogPipe) | `Result<i32>` |

use std::io::{self, Write};
use std::ops::BitAnd;
use std::time::{Duration, Instant};

use tracing::debug;

use super::logpipe::LogPipe;
use super::result::Completed;
use super::run::run_proc;
use super::spawn::{popen, PopenOptions};
use super::state::RunState;
use super::Nohup;
use crate::command::{Command, Retcode, StreamKind};
use crate::error::Result;
use crate::process::{Event, Next, Process, ReadMode, Utf8Decoder, READ_BUFFER_SIZE};

/// A way of running a command.
pub trait Modifier {
    type Output;

    fn apply(&self, cmd: &Command) -> Self::Output;
}

macro_rules! modifier_ops {
    ($($ty:ty),* $(,)?) => {
        $(
            impl BitAnd<$ty> for &Command {
                type Output = <$ty as Modifier>::Output;

                fn bitand(self, modifier: $ty) -> Self::Output {
                    modifier.apply(self)
                }
            }

            impl BitAnd<$ty> for Command {
                type Output = <$ty as Modifier>::Output;

                fn bitand(self, modifier: $ty) -> Self::Output {
                    modifier.apply(&self)
                }
            }
        )*
    };
}

modifier_ops!(Bg, Fg, Tf, ExitCode, Tee, Nohup, LogPipe);

fn code_of(process: &mut Process, timeout: Option<Duration>) -> Result<i32> {
    let deadline = timeout.map(|t| Instant::now() + t);
    process.wait_until(deadline, timeout)
}

/// Run in the background and return a [`Future`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bg {
    pub retcode: Retcode,
    pub timeout: Option<Duration>,
}

pub const BG: Bg = Bg {
    retcode: Retcode::Exact(0),
    timeout: None,
};

impl Bg {
    pub fn retcode(mut self, retcode: impl Into<Retcode>) -> Self {
        self.retcode = retcode.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl Modifier for Bg {
    type Output = Result<Future>;

    fn apply(&self, cmd: &Command) -> Result<Future> {
        let mut state = RunState::NotStarted;
        let mut process = popen(cmd, PopenOptions::default())?;
        process.start_draining()?;
        state.transition_to(RunState::Running)?;
        debug!("started {} in the background", cmd);
        Ok(Future {
            process,
            retcode: self.retcode.clone(),
            timeout: self.timeout,
            state,
            outcome: None,
            started: Instant::now(),
        })
    }
}

/// A command running in the background.
///
/// The result is collected on the first call to [`Future::wait`] or any
/// accessor and kept; later calls return the same outcome, including the
/// same error.
#[derive(Debug)]
pub struct Future {
    process: Process,
    retcode: Retcode,
    timeout: Option<Duration>,
    state: RunState,
    outcome: Option<Result<Completed>>,
    started: Instant,
}

impl Future {
    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn process(&self) -> &Process {
        &self.process
    }

    /// Whether the process has exited. Never blocks.
    pub fn poll(&mut self) -> Result<bool> {
        if self.state.is_terminal() {
            return Ok(true);
        }
        Ok(self.process.poll()?.is_some())
    }

    /// Block until the process exits and check its exit code.
    pub fn wait(&mut self) -> Result<&Completed> {
        let outcome = match self.outcome.take() {
            Some(outcome) => outcome,
            None => {
                let remaining = self.timeout.map(|t| t.saturating_sub(self.started.elapsed()));
                let outcome = run_proc(&mut self.process, &self.retcode, remaining, None).map(|mut done| {
                    done.duration = self.started.elapsed();
                    done
                });
                self.state.transition_to(RunState::Done)?;
                outcome
            }
        };
        self.outcome.insert(outcome).as_ref().map_err(Clone::clone)
    }

    pub fn stdout(&mut self) -> Result<&str> {
        Ok(self.wait()?.stdout.as_str())
    }

    pub fn stderr(&mut self) -> Result<&str> {
        Ok(self.wait()?.stderr.as_str())
    }

    pub fn returncode(&mut self) -> Result<i32> {
        Ok(self.wait()?.retcode)
    }
}

/// Run with the caller's terminal: nothing is captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fg {
    pub retcode: Retcode,
    pub timeout: Option<Duration>,
}

pub const FG: Fg = Fg {
    retcode: Retcode::Exact(0),
    timeout: None,
};

impl Fg {
    pub fn retcode(mut self, retcode: impl Into<Retcode>) -> Self {
        self.retcode = retcode.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl Modifier for Fg {
    type Output = Result<()>;

    fn apply(&self, cmd: &Command) -> Result<()> {
        let mut process = popen(cmd, PopenOptions::inherit())?;
        let code = code_of(&mut process, self.timeout)?;
        process.verify(&self.retcode, Some(code), "", "")
    }
}

/// Report whether the exit code was accepted instead of failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tf {
    pub retcode: Retcode,
    /// Run in the foreground.
    pub fg: bool,
    pub timeout: Option<Duration>,
}

pub const TF: Tf = Tf {
    retcode: Retcode::Exact(0),
    fg: false,
    timeout: None,
};

impl Tf {
    pub fn retcode(mut self, retcode: impl Into<Retcode>) -> Self {
        self.retcode = retcode.into();
        self
    }

    pub fn fg(mut self) -> Self {
        self.fg = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl Modifier for Tf {
    type Output = Result<bool>;

    fn apply(&self, cmd: &Command) -> Result<bool> {
        let code = run_for_code(cmd, self.fg, self.timeout)?;
        Ok(self.retcode.accepts(Some(code)))
    }
}

/// Return the exit code whatever it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitCode {
    pub fg: bool,
    pub timeout: Option<Duration>,
}

pub const RETCODE: ExitCode = ExitCode {
    fg: false,
    timeout: None,
};

impl ExitCode {
    pub fn fg(mut self) -> Self {
        self.fg = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl Modifier for ExitCode {
    type Output = Result<i32>;

    fn apply(&self, cmd: &Command) -> Result<i32> {
        run_for_code(cmd, self.fg, self.timeout)
    }
}

fn run_for_code(cmd: &Command, fg: bool, timeout: Option<Duration>) -> Result<i32> {
    if fg {
        let mut process = popen(cmd, PopenOptions::inherit())?;
        return code_of(&mut process, timeout);
    }
    let mut process = popen(cmd, PopenOptions::default())?;
    Ok(run_proc(&mut process, &Retcode::Any, timeout, None)?.retcode)
}

/// Echo output to this process's stdout and stderr as it arrives while
/// also collecting it. The echo and the returned output are the bytes the
/// command wrote, unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tee {
    pub retcode: Retcode,
    /// Leave flushing to the sinks. When false the echo is flushed after
    /// every chunk.
    pub buffered: bool,
    pub timeout: Option<Duration>,
}

pub const TEE: Tee = Tee {
    retcode: Retcode::Exact(0),
    buffered: true,
    timeout: None,
};

impl Tee {
    pub fn retcode(mut self, retcode: impl Into<Retcode>) -> Self {
        self.retcode = retcode.into();
        self
    }

    pub fn unbuffered(mut self) -> Self {
        self.buffered = false;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Like applying the modifier, with explicit sinks for the echo.
    pub fn run_to(&self, cmd: &Command, out: &mut dyn Write, err: &mut dyn Write) -> Result<Completed> {
        let start = Instant::now();
        let deadline = self.timeout.map(|t| start + t);
        let mut process = popen(cmd, PopenOptions::default())?;
        let mut collector = process.start_collector(ReadMode::Decoded, READ_BUFFER_SIZE)?;
        let mut decoders = [Utf8Decoder::default(), Utf8Decoder::default()];

        let mut stdout = String::new();
        let mut stderr = String::new();
        loop {
            let event = match collector.next(deadline) {
                Next::Finished => break,
                Next::TimedOut => return Err(process.timed_out(self.timeout)),
                Next::Event(event) => event,
            };
            let echoed = match event {
                Event::Data {
                    kind: StreamKind::Stderr,
                    ..
                } => event
                    .into_text(&mut decoders[1])
                    .and_then(|(_, text)| self.echo(&mut *err, &mut stderr, text)),
                _ => event
                    .into_text(&mut decoders[0])
                    .and_then(|(_, text)| self.echo(&mut *out, &mut stdout, text)),
            };
            if let Err(e) = echoed {
                process.kill_and_reap();
                return Err(e);
            }
        }
        for decoder in &mut decoders {
            decoder.finish()?;
        }
        let code = process.wait_until(deadline, self.timeout)?;
        process.verify(&self.retcode, Some(code), &stdout, &stderr)?;
        Ok(Completed::new(code, stdout, stderr, start.elapsed()))
    }

    fn echo<W: Write + ?Sized>(&self, sink: &mut W, collected: &mut String, text: String) -> Result<()> {
        sink.write_all(text.as_bytes())?;
        if !self.buffered {
            sink.flush()?;
        }
        collected.push_str(&text);
        Ok(())
    }
}

impl Modifier for Tee {
    type Output = Result<Completed>;

    fn apply(&self, cmd: &Command) -> Result<Completed> {
        self.run_to(cmd, &mut io::stdout().lock(), &mut io::stderr().lock())
    }
}

impl Modifier for Nohup {
    type Output = Result<Process>;

    fn apply(&self, cmd: &Command) -> Result<Process> {
        self.daemonize(cmd)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::execution::NOHUP;
    use crate::machine::local;

    fn cmd(name: &str) -> Command {
        local().command(name).unwrap()
    }

    fn sh(script: &str) -> Command {
        cmd("sh").bind(["-c", script])
    }

    #[test]
    fn test_bg_future_waits_once() {
        let ls = cmd("ls");
        let wc = cmd("wc").arg("-l");
        let mut future = ((&ls | &wc) & BG).unwrap();
        future.wait().unwrap();
        assert!(future.poll().unwrap());
        assert_eq!(future.returncode().unwrap(), 0);
        let first = future.stdout().unwrap().to_string();
        assert!(!first.trim().is_empty());
        assert_eq!(future.stdout().unwrap(), first);
        assert_eq!(future.state(), RunState::Done);
    }

    #[test]
    fn test_bg_error_is_kept() {
        let mut future = (&sh("echo boom >&2; exit 4") & BG).unwrap();
        let first = future.wait().unwrap_err();
        assert_eq!(first.execution().unwrap().retcode, Some(4));
        let again = future.returncode().unwrap_err();
        assert_eq!(again.execution().unwrap().stderr, "boom\n");
    }

    #[test]
    fn test_bg_timeout() {
        let mut future = (&cmd("sleep").arg(10) & BG.timeout(Duration::from_millis(200))).unwrap();
        assert!(!future.poll().unwrap());
        assert!(future.wait().unwrap_err().is_timeout());
    }

    #[test]
    fn test_tf_and_retcode() {
        assert!((&cmd("true") & TF).unwrap());
        assert!(!(&cmd("false") & TF).unwrap());
        assert!((&cmd("false") & TF.retcode(1)).unwrap());
        assert_eq!((&sh("exit 7") & RETCODE).unwrap(), 7);
    }

    #[test]
    fn test_fg_checks_code() {
        assert!((&cmd("true") & FG).is_ok());
        let err = (&cmd("false") & FG).unwrap_err();
        assert!(matches!(err, Error::Execution(_)));
    }

    #[test]
    fn test_tee_echoes_and_collects() {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let done = TEE
            .run_to(&sh("echo one; echo two >&2; echo three"), &mut out, &mut err)
            .unwrap();
        assert_eq!(done.stdout, "one\nthree\n");
        assert_eq!(done.stderr, "two\n");
        assert_eq!(String::from_utf8(out).unwrap(), "one\nthree\n");
        assert_eq!(String::from_utf8(err).unwrap(), "two\n");

        let mut out = Vec::new();
        let done = TEE.unbuffered().run_to(&cmd("echo").arg("x"), &mut out, &mut io::sink()).unwrap();
        assert_eq!(done.stdout, "x\n");
        assert_eq!(out, b"x\n");
    }

    #[test]
    fn test_tee_keeps_bytes_unchanged() {
        let mut out = Vec::new();
        let done = TEE
            .run_to(&sh("printf 'a\\r\\nb'"), &mut out, &mut io::sink())
            .unwrap();
        assert_eq!(done.stdout, "a\r\nb");
        assert_eq!(out, b"a\r\nb");
    }

    #[test]
    fn test_tee_timeout() {
        let err = TEE
            .timeout(Duration::from_millis(200))
            .run_to(&cmd("sleep").arg(10), &mut io::sink(), &mut io::sink())
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_tee_rejects_code() {
        let err = TEE.run_to(&sh("exit 2"), &mut io::sink(), &mut io::sink()).unwrap_err();
        assert_eq!(err.execution().unwrap().retcode, Some(2));
    }

    #[test]
    fn test_nohup_honours_redirection() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("daemon.out");
        let echo = cmd("echo").arg("detached").redirect_out(out.clone()).unwrap();
        let mut handle = (&echo & NOHUP).unwrap();
        handle.wait().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while std::fs::read_to_string(&out).unwrap_or_default().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "detached\n");
    }
}
