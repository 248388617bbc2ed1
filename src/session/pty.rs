//! Shells running inside a pseudo-terminal (portable-pty).

use std::ffi::OsStr;
use std::fmt;
use std::io::Write;
use std::path::Path;

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, PtySize};

use crate::error::{Error, Result};
use crate::process::{PipeReader, Process, RawProcess};

fn pty_error(e: impl fmt::Display) -> Error {
    Error::Pty(e.to_string())
}

/// A child attached to a PTY. The master side is kept alive with it.
struct PtyChild {
    child: Box<dyn portable_pty::Child + Send + Sync>,
    _master: Box<dyn portable_pty::MasterPty + Send>,
}

impl fmt::Debug for PtyChild {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PtyChild")
            .field("pid", &self.child.process_id())
            .finish()
    }
}

fn status_code(status: portable_pty::ExitStatus) -> i32 {
    status.exit_code() as i32
}

impl RawProcess for PtyChild {
    fn try_wait(&mut self) -> Result<Option<i32>> {
        Ok(self.child.try_wait()?.map(status_code))
    }

    fn wait(&mut self) -> Result<i32> {
        Ok(status_code(self.child.wait()?))
    }

    fn kill(&mut self) -> Result<()> {
        match self.child.kill() {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn id(&self) -> Option<u32> {
        self.child.process_id()
    }
}

/// Spawn `argv` in a new PTY.
///
/// The returned process has stdin and stdout; a terminal merges stderr
/// into stdout, so there is no separate stderr.
pub fn spawn_in_pty<S: AsRef<OsStr>>(
    argv: &[S],
    cwd: Option<&Path>,
    env: &[(&str, &str)],
) -> Result<Process> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| Error::InvalidArgument("empty argv".into()))?;

    let pair = native_pty_system()
        .openpty(PtySize {
            rows: 24,
            cols: 200,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(pty_error)?;

    let mut cmd = CommandBuilder::new(program);
    cmd.args(args);
    if let Some(dir) = cwd {
        cmd.cwd(dir);
    }
    for (k, v) in env {
        cmd.env(k, v);
    }

    let child = pair.slave.spawn_command(cmd).map_err(pty_error)?;
    // the child holds its own copy of the slave
    drop(pair.slave);

    let reader = pair.master.try_clone_reader().map_err(pty_error)?;
    let writer: Box<dyn Write + Send> = pair.master.take_writer().map_err(pty_error)?;

    let argv: Vec<String> = argv
        .iter()
        .map(|s| s.as_ref().to_string_lossy().into_owned())
        .collect();
    Ok(Process::new(
        argv,
        Box::new(PtyChild {
            child,
            _master: pair.master,
        }),
        Some(writer),
        Some(PipeReader::Stream(reader)),
        None,
    ))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_and_reap() {
        let mut p = spawn_in_pty(&["/bin/sh", "-c", "exit 4"], None, &[]).unwrap();
        assert!(p.id().is_some());
        let (out, err) = p.communicate(None).unwrap();
        assert!(err.is_empty());
        let _ = out;
        assert_eq!(p.wait().unwrap(), 4);
    }

    #[test]
    fn test_empty_argv() {
        let empty: [&str; 0] = [];
        assert!(matches!(spawn_in_pty(&empty, None, &[]), Err(Error::InvalidArgument(_))));
    }
}
