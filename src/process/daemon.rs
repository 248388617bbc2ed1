//! Detached (daemonized) processes.
//!
//! On POSIX the program is started through a double fork: the first child
//! becomes a session leader, ignores `SIGHUP`, forks again and exits after
//! reporting the grandchild's pid over a pipe. The grandchild is no longer
//! our child, so its handle can only observe it through `kill(pid, 0)`.

use std::time::Duration;

use tracing::debug;

use super::RawProcess;
use crate::error::Result;

/// Poll interval for daemon liveness checks.
const DAEMON_POLL: Duration = Duration::from_millis(100);

/// Handle to a process that is not our child.
#[derive(Debug)]
pub struct DaemonProcess {
    pid: u32,
    returncode: Option<i32>,
}

impl DaemonProcess {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            returncode: None,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

#[cfg(unix)]
mod imp {
    use std::fs::File;
    use std::io::{self, Read};
    use std::os::unix::io::AsRawFd;
    use std::os::unix::process::CommandExt;
    use std::process::Command;

    use tracing::debug;

    use super::DaemonProcess;
    use crate::error::{Error, ProcessExecutionError, Result};
    use crate::process::{exit_code, os_pipe};

    /// Whether `pid` names a zombie (Linux only; elsewhere never).
    pub(super) fn is_zombie(pid: u32) -> bool {
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
            return false;
        };
        // "pid (comm) S ..."; comm may itself contain parentheses
        stat.rfind(')')
            .and_then(|i| stat[i + 1..].split_whitespace().next())
            .map_or(false, |state| state == "Z")
    }

    pub(super) fn alive(pid: u32) -> io::Result<bool> {
        // SAFETY: signal 0 only performs the permission and existence check.
        if unsafe { libc::kill(pid as libc::pid_t, 0) } == 0 {
            return Ok(!is_zombie(pid));
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ESRCH) => Ok(false),
            Some(libc::EPERM) => Ok(true),
            _ => Err(err),
        }
    }

    pub(super) fn signal(pid: u32, signal: i32) -> Result<()> {
        // SAFETY: kill(2) has no memory-safety preconditions.
        if unsafe { libc::kill(pid as libc::pid_t, signal) } == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Write `n` in decimal without allocating.
    fn write_pid(fd: libc::c_int, mut n: u32) {
        let mut buf = [0u8; 10];
        let mut i = buf.len();
        loop {
            i -= 1;
            buf[i] = b'0' + (n % 10) as u8;
            n /= 10;
            if n == 0 {
                break;
            }
        }
        // SAFETY: `buf[i..]` is valid for the given length.
        unsafe {
            libc::write(fd, buf[i..].as_ptr().cast(), buf.len() - i);
        }
    }

    /// Spawn `cmd` fully detached and return the daemon's pid.
    ///
    /// Stdio, cwd and env must already be configured on `cmd`.
    pub(crate) fn spawn_detached(mut cmd: Command) -> Result<DaemonProcess> {
        let (mut pid_reader, pid_writer): (File, File) = os_pipe()?;
        let wfd = pid_writer.as_raw_fd();

        // SAFETY: the closure runs between fork and exec and only makes
        // async-signal-safe calls.
        unsafe {
            cmd.pre_exec(move || {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                libc::umask(0);
                libc::signal(libc::SIGHUP, libc::SIG_IGN);
                match libc::fork() {
                    -1 => Err(io::Error::last_os_error()),
                    0 => Ok(()),
                    pid => {
                        write_pid(wfd, pid as u32);
                        libc::_exit(0);
                    }
                }
            });
        }

        let argv: Vec<String> = std::iter::once(cmd.get_program())
            .chain(cmd.get_args())
            .map(|s| s.to_string_lossy().into_owned())
            .collect();
        let mut first = cmd.spawn().map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::CommandNotFound {
                    program: argv[0].clone(),
                    path: Vec::new(),
                }
            } else {
                Error::from(e)
            }
        })?;
        drop(pid_writer);
        let rc = exit_code(first.wait()?);

        let mut output = String::new();
        pid_reader.read_to_string(&mut output)?;
        match output.trim().parse::<u32>() {
            Ok(pid) if rc == 0 => {
                debug!("daemonized {:?} as pid {}", argv, pid);
                Ok(DaemonProcess::new(pid))
            }
            _ => Err(ProcessExecutionError::new(argv, Some(rc), "", output)
                .with_message("Failed to daemonize")
                .into()),
        }
    }
}

#[cfg(unix)]
pub(crate) use imp::spawn_detached;

/// Creation flags that detach a child from the parent's console.
#[cfg(windows)]
pub(crate) const DETACHED_FLAGS: u32 = 0x0000_0200 | 0x0000_0008; // CREATE_NEW_PROCESS_GROUP | DETACHED_PROCESS

impl RawProcess for DaemonProcess {
    #[cfg(unix)]
    fn try_wait(&mut self) -> Result<Option<i32>> {
        if self.returncode.is_none() && !imp::alive(self.pid)? {
            debug!("daemon {} is gone", self.pid);
            // the real status belongs to init
            self.returncode = Some(0);
        }
        Ok(self.returncode)
    }

    #[cfg(not(unix))]
    fn try_wait(&mut self) -> Result<Option<i32>> {
        Err(crate::error::Error::Unsupported(
            "daemon handles are pid-based on POSIX only".into(),
        ))
    }

    fn wait(&mut self) -> Result<i32> {
        loop {
            if let Some(code) = self.try_wait()? {
                return Ok(code);
            }
            std::thread::sleep(DAEMON_POLL);
        }
    }

    #[cfg(unix)]
    fn kill(&mut self) -> Result<()> {
        imp::signal(self.pid, libc::SIGKILL)
    }

    #[cfg(not(unix))]
    fn kill(&mut self) -> Result<()> {
        Err(crate::error::Error::Unsupported("kill of a daemon handle".into()))
    }

    #[cfg(unix)]
    fn send_signal(&mut self, signal: i32) -> Result<()> {
        imp::signal(self.pid, signal)
    }

    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::process::POLL_INTERVAL;
    use std::process::{Command, Stdio};
    use std::time::Instant;

    #[test]
    fn test_daemon_outlives_spawn_and_can_be_killed() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let mut daemon = spawn_detached(cmd).unwrap();
        assert_eq!(daemon.try_wait().unwrap(), None);
        daemon.kill().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while daemon.try_wait().unwrap().is_none() {
            assert!(Instant::now() < deadline, "daemon survived SIGKILL");
            std::thread::sleep(POLL_INTERVAL);
        }
        assert_eq!(daemon.returncode, Some(0));
    }

    #[test]
    fn test_missing_daemon_program() {
        let cmd = Command::new("/nonexistent/pipewright-daemon");
        assert!(spawn_detached(cmd).is_err());
    }
}
