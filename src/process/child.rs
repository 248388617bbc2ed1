//! Local OS children.

use std::io;
use std::process::{Child, ExitStatus};
use std::time::Duration;

use tracing::trace;
use wait_timeout::ChildExt;

use super::RawProcess;
use crate::error::{Error, Result};

/// Exit code of a finished child. Signals map to their negated number.
pub(crate) fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}

/// A child process spawned on this machine.
#[derive(Debug)]
pub struct LocalChild {
    child: Child,
}

impl LocalChild {
    pub fn new(child: Child) -> Self {
        Self { child }
    }
}

impl RawProcess for LocalChild {
    fn try_wait(&mut self) -> Result<Option<i32>> {
        Ok(self.child.try_wait()?.map(exit_code))
    }

    fn wait(&mut self) -> Result<i32> {
        Ok(exit_code(self.child.wait()?))
    }

    fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<i32>> {
        Ok(self.child.wait_timeout(timeout)?.map(exit_code))
    }

    fn kill(&mut self) -> Result<()> {
        match self.child.kill() {
            Ok(()) => Ok(()),
            // already reaped
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[cfg(unix)]
    fn send_signal(&mut self, signal: i32) -> Result<()> {
        let pid = self.child.id() as libc::pid_t;
        trace!("sending signal {} to {}", signal, pid);
        // SAFETY: kill(2) has no memory-safety preconditions.
        if unsafe { libc::kill(pid, signal) } == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            return Err(err.into());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn send_signal(&mut self, signal: i32) -> Result<()> {
        trace!("signal {} requested, terminating instead", signal);
        self.kill()
    }

    fn id(&self) -> Option<u32> {
        Some(self.child.id())
    }
}

/// An anonymous OS pipe, both ends close-on-exec.
#[cfg(unix)]
pub(crate) fn os_pipe() -> Result<(std::fs::File, std::fs::File)> {
    use std::os::unix::io::FromRawFd;

    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: `fds` has room for the two descriptors pipe(2) writes.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
        return Err(Error::from(io::Error::last_os_error()));
    }
    for fd in fds {
        // SAFETY: `fd` was just returned by pipe(2) and is owned here.
        unsafe {
            libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
        }
    }
    // SAFETY: each descriptor is open and owned by exactly one File.
    let (read, write) = unsafe {
        (
            std::fs::File::from_raw_fd(fds[0]),
            std::fs::File::from_raw_fd(fds[1]),
        )
    };
    Ok((read, write))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::process::Command;

    #[test]
    fn test_exit_code_and_wait() {
        let child = Command::new("sh").args(["-c", "exit 3"]).spawn().unwrap();
        let mut raw = LocalChild::new(child);
        assert_eq!(raw.wait().unwrap(), 3);
        // killing a reaped child is not an error
        raw.kill().unwrap();
    }

    #[test]
    fn test_kill_reports_negative_signal() {
        let child = Command::new("sleep").arg("10").spawn().unwrap();
        let mut raw = LocalChild::new(child);
        assert_eq!(raw.wait_timeout(Duration::from_millis(50)).unwrap(), None);
        raw.kill().unwrap();
        assert_eq!(raw.wait().unwrap(), -libc::SIGKILL);
    }

    #[test]
    fn test_os_pipe() {
        let (mut r, mut w) = os_pipe().unwrap();
        w.write_all(b"ping").unwrap();
        drop(w);
        let mut s = String::new();
        r.read_to_string(&mut s).unwrap();
        assert_eq!(s, "ping");
    }
}
