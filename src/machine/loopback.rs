//! A [`Transport`] whose "remote" side is this machine.
//!
//! Exec channels are `sh -c` child processes, forwarded connections are
//! plain TCP sockets and file transfer copies files. Useful for dry runs of
//! remote code paths and for tests.

use std::fs;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use tracing::debug;

use super::{local, Backend, Channel, FileTransfer, LocalMachine, RemoteStat, SpawnRequest, Transport};
use crate::error::{Error, Result};
use crate::process::Process;
use crate::session::spawn_in_pty;

#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    machine: Arc<LocalMachine>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::with_machine(local())
    }

    /// Run channels with `machine`'s environment.
    pub fn with_machine(machine: Arc<LocalMachine>) -> Self {
        Self { machine }
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for LoopbackTransport {
    fn name(&self) -> String {
        "loopback".to_string()
    }

    fn exec_command(&self, line: &str) -> Result<Box<dyn Channel>> {
        let argv = vec!["/bin/sh".to_string(), "-c".to_string(), line.to_string()];
        let process = self.machine.spawn_argv(&argv, SpawnRequest::piped())?;
        Ok(Box::new(ProcessChannel { process }))
    }

    fn invoke_shell(&self, pty: bool) -> Result<Box<dyn Channel>> {
        let process = if pty {
            let cwd = self.machine.context()?.cwd;
            spawn_in_pty(&["/bin/sh"], Some(&cwd), &[("PS1", ""), ("TERM", "dumb")])?
        } else {
            self.machine
                .spawn_argv(&["/bin/sh".to_string()], SpawnRequest::piped())?
        };
        Ok(Box::new(ProcessChannel { process }))
    }

    fn open_channel(&self, kind: &str, dest: (&str, u16), _src: (&str, u16)) -> Result<Box<dyn Channel>> {
        if kind != "direct-tcpip" {
            return Err(Error::Unsupported(format!("{} channels", kind)));
        }
        debug!("loopback connect to {}:{}", dest.0, dest.1);
        let stream = TcpStream::connect(dest)?;
        Ok(Box::new(TcpChannel {
            stream,
            closed: false,
        }))
    }

    fn sftp(&self) -> Result<Box<dyn FileTransfer>> {
        Ok(Box::new(LocalFiles))
    }
}

#[derive(Debug)]
struct ProcessChannel {
    process: Process,
}

impl Channel for ProcessChannel {
    fn take_stdin(&mut self) -> Option<Box<dyn Write + Send>> {
        self.process.take_stdin()
    }

    fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>> {
        self.process
            .take_stdout()
            .map(|r| Box::new(r) as Box<dyn Read + Send>)
    }

    fn take_stderr(&mut self) -> Option<Box<dyn Read + Send>> {
        self.process
            .take_stderr()
            .map(|r| Box::new(r) as Box<dyn Read + Send>)
    }

    fn exit_status_ready(&mut self) -> Result<bool> {
        Ok(self.process.poll()?.is_some())
    }

    fn recv_exit_status(&mut self) -> Result<i32> {
        self.process.wait()
    }

    fn close(&mut self) -> Result<()> {
        if self.process.poll()?.is_none() {
            self.process.kill_and_reap();
        }
        Ok(())
    }
}

#[derive(Debug)]
struct TcpChannel {
    stream: TcpStream,
    closed: bool,
}

impl Channel for TcpChannel {
    fn take_stdin(&mut self) -> Option<Box<dyn Write + Send>> {
        self.stream
            .try_clone()
            .ok()
            .map(|s| Box::new(s) as Box<dyn Write + Send>)
    }

    fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>> {
        self.stream
            .try_clone()
            .ok()
            .map(|s| Box::new(s) as Box<dyn Read + Send>)
    }

    fn take_stderr(&mut self) -> Option<Box<dyn Read + Send>> {
        None
    }

    fn exit_status_ready(&mut self) -> Result<bool> {
        Ok(self.closed)
    }

    fn recv_exit_status(&mut self) -> Result<i32> {
        if self.closed {
            Ok(0)
        } else {
            Err(Error::Unsupported("tcp channels have no exit status".into()))
        }
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e.into()),
            _ => Ok(()),
        }
    }
}

struct LocalFiles;

impl FileTransfer for LocalFiles {
    fn get(&mut self, remote: &str, local: &Path) -> Result<()> {
        fs::copy(remote, local)?;
        Ok(())
    }

    fn put(&mut self, local: &Path, remote: &str) -> Result<()> {
        fs::copy(local, remote)?;
        Ok(())
    }

    fn listdir(&mut self, remote: &str) -> Result<Vec<String>> {
        fs::read_dir(remote)?
            .map(|entry| Ok(entry?.file_name().to_string_lossy().into_owned()))
            .collect()
    }

    fn stat(&mut self, remote: &str) -> Result<RemoteStat> {
        let meta = fs::metadata(remote)?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs());
        #[cfg(unix)]
        let (mode, uid, gid) = {
            use std::os::unix::fs::MetadataExt;
            (meta.mode(), meta.uid(), meta.gid())
        };
        #[cfg(not(unix))]
        let (mode, uid, gid) = (if meta.permissions().readonly() { 0o444 } else { 0o644 }, 0, 0);
        Ok(RemoteStat {
            size: meta.len(),
            mode,
            uid,
            gid,
            mtime,
            is_dir: meta.is_dir(),
        })
    }
}
