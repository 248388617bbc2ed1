//! Synchronous runs.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::debug;

use super::result::Completed;
use super::spawn::{popen, PopenOptions};
use crate::command::{Command, Retcode};
use crate::config::Config;
use crate::error::Result;
use crate::process::Process;

/// Options for [`Command::run_with`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Accepted exit codes.
    pub retcode: Retcode,
    /// Deadline for the whole run; the process is killed when it passes.
    pub timeout: Option<Duration>,
    /// Bytes written to stdin.
    pub input: Option<Vec<u8>>,
    pub popen: PopenOptions,
}

impl RunOptions {
    /// Defaults from the `execution` section of `config`.
    pub fn from_config(config: &Config) -> Self {
        Self {
            timeout: config.execution.timeout_secs.map(Duration::from_secs),
            ..Self::default()
        }
    }

    pub fn retcode(mut self, retcode: impl Into<Retcode>) -> Self {
        self.retcode = retcode.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn input(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.popen.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.popen.env.insert(key.into(), value.into());
        self
    }
}

/// Drain a started process, wait for it and check its exit code.
///
/// On timeout the process is killed and reaped before the error is
/// returned.
pub fn run_proc(
    process: &mut Process,
    retcode: &Retcode,
    timeout: Option<Duration>,
    input: Option<&[u8]>,
) -> Result<Completed> {
    let start = Instant::now();
    let (stdout, stderr) = process.communicate_timeout(input, timeout)?;
    let code = process.wait()?;
    let stdout = String::from_utf8_lossy(&stdout).into_owned();
    let stderr = String::from_utf8_lossy(&stderr).into_owned();
    debug!("{:?} exited with {} after {:?}", process.argv(), code, start.elapsed());
    process.verify(retcode, Some(code), &stdout, &stderr)?;
    Ok(Completed::new(code, stdout, stderr, start.elapsed()))
}

impl Command {
    /// Start this command with every stream piped.
    pub fn popen(&self) -> Result<Process> {
        popen(self, PopenOptions::default())
    }

    pub fn popen_with(&self, options: PopenOptions) -> Result<Process> {
        popen(self, options)
    }

    /// Run to completion, requiring exit code 0.
    pub fn run(&self) -> Result<Completed> {
        self.run_with(RunOptions::default())
    }

    pub fn run_with(&self, options: RunOptions) -> Result<Completed> {
        debug!("running {}", self);
        let mut process = popen(self, options.popen)?;
        run_proc(&mut process, &options.retcode, options.timeout, options.input.as_deref())
    }

    /// Run to completion and return stdout.
    pub fn call(&self) -> Result<String> {
        Ok(self.run()?.stdout)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::machine::{local, LocalMachine};
    use std::sync::Arc;

    fn machine() -> Arc<LocalMachine> {
        local()
    }

    #[test]
    fn test_call_returns_stdout() {
        let echo = machine().command("echo").unwrap().bind(["hello", "world"]);
        assert_eq!(echo.call().unwrap(), "hello world\n");
    }

    #[test]
    fn test_rejected_code_keeps_output() {
        let sh = machine().command("sh").unwrap().bind(["-c", "echo out; echo err >&2; exit 3"]);
        let err = sh.run().unwrap_err();
        let failure = err.execution().unwrap();
        assert_eq!(failure.retcode, Some(3));
        assert_eq!(failure.stdout, "out\n");
        assert_eq!(failure.stderr, "err\n");

        let done = sh.run_with(RunOptions::default().retcode(3)).unwrap();
        assert_eq!(done.retcode, 3);
        let any = sh.run_with(RunOptions::default().retcode(Retcode::Any)).unwrap();
        assert_eq!(any.retcode, 3);
    }

    #[test]
    fn test_input_is_fed() {
        let cat = machine().command("cat").unwrap();
        let done = cat.run_with(RunOptions::default().input("abc")).unwrap();
        assert_eq!(done.stdout, "abc");
    }

    #[test]
    fn test_timeout_kills_and_reaps() {
        let sleep = machine().command("sleep").unwrap().arg(10);
        let start = Instant::now();
        let err = sleep
            .run_with(RunOptions::default().timeout(Duration::from_millis(300)))
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[test]
    fn test_from_config() {
        let mut config = Config::default();
        config.execution.timeout_secs = Some(7);
        assert_eq!(RunOptions::from_config(&config).timeout, Some(Duration::from_secs(7)));
    }
}
