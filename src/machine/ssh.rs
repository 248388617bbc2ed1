//! Remote machines driven through the `ssh` client.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::remote::RemoteState;
use super::{command, local, Backend, ExecContext, LocalMachine, Machine, SpawnInput, SpawnOutput, SpawnRequest};
use crate::command::{Command, Retcode};
use crate::config::Config;
use crate::error::{Error, ProcessExecutionError, Result};
use crate::execution::Nohup;
use crate::process::Process;
use crate::quoting::shquote;
use crate::session::{SessionOptions, SessionOutput, ShellSession};

/// How to reach a host with `ssh`.
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub host: String,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub keyfile: Option<PathBuf>,
    pub ssh_command: String,
    pub scp_command: String,
    /// Extra arguments for every `ssh` invocation.
    pub ssh_opts: Vec<String>,
    /// Extra arguments for every `scp` invocation.
    pub scp_opts: Vec<String>,
    pub connect_timeout: Duration,
}

impl SshOptions {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: None,
            port: None,
            keyfile: None,
            ssh_command: "ssh".to_string(),
            scp_command: "scp".to_string(),
            ssh_opts: Vec::new(),
            scp_opts: Vec::new(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Client commands, extra options and timeout from `config`.
    pub fn from_config(host: impl Into<String>, config: &Config) -> Self {
        Self {
            ssh_command: config.ssh.ssh_command.clone(),
            scp_command: config.ssh.scp_command.clone(),
            ssh_opts: config.ssh.options.clone(),
            connect_timeout: Duration::from_secs(config.ssh.connect_timeout_secs),
            ..Self::new(host)
        }
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn keyfile(mut self, keyfile: impl Into<PathBuf>) -> Self {
        self.keyfile = Some(keyfile.into());
        self
    }

    pub fn ssh_opt(mut self, opt: impl Into<String>) -> Self {
        self.ssh_opts.push(opt.into());
        self
    }

    /// `user@host`, or just the host.
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    /// `ssh [opts] [-p port] [-i key] <flags> <destination>`
    fn ssh_argv(&self, flags: &[&str]) -> Vec<String> {
        let mut argv = vec![self.ssh_command.clone()];
        argv.extend(self.ssh_opts.iter().cloned());
        if let Some(port) = self.port {
            argv.push("-p".to_string());
            argv.push(port.to_string());
        }
        if let Some(key) = &self.keyfile {
            argv.push("-i".to_string());
            argv.push(key.to_string_lossy().into_owned());
        }
        argv.extend(flags.iter().map(|f| f.to_string()));
        argv.push(self.destination());
        argv
    }

    /// `scp [opts] [-P port] [-i key] -r <src> <dst>`
    fn scp_argv(&self, src: &str, dst: &str) -> Vec<String> {
        let mut argv = vec![self.scp_command.clone()];
        argv.extend(self.scp_opts.iter().cloned());
        if let Some(port) = self.port {
            argv.push("-P".to_string());
            argv.push(port.to_string());
        }
        if let Some(key) = &self.keyfile {
            argv.push("-i".to_string());
            argv.push(key.to_string_lossy().into_owned());
        }
        argv.push("-r".to_string());
        argv.push(src.to_string());
        argv.push(dst.to_string());
        argv
    }

    fn remote_path(&self, path: &str) -> String {
        format!("{}:{}", self.destination(), path)
    }
}

/// Run a local helper (`scp`, `ssh -f`) to completion.
fn run_local(local: &LocalMachine, argv: &[String], host: &str) -> Result<Process> {
    let req = SpawnRequest {
        stdin: SpawnInput::Null,
        ..SpawnRequest::piped()
    };
    let mut process = local.spawn_argv(argv, req)?;
    let (stdout, stderr) = process.communicate(None)?;
    let code = process.wait()?;
    if code != 0 {
        return Err(ProcessExecutionError::new(
            argv.to_vec(),
            Some(code),
            String::from_utf8_lossy(&stdout).into_owned(),
            String::from_utf8_lossy(&stderr).into_owned(),
        )
        .with_host(Some(host.to_string()))
        .into());
    }
    Ok(process)
}

/// A machine reached by spawning the `ssh` client for every command.
///
/// A persistent session tracks the remote working directory and
/// environment and answers `which` lookups. Every command is its own
/// `ssh` invocation, so pipeline stages cannot be wired together; a
/// pipeline of plain commands runs as one remote shell line instead.
#[derive(Debug)]
pub struct SshMachine {
    options: SshOptions,
    local: Arc<LocalMachine>,
    state: RemoteState,
}

impl SshMachine {
    /// Open the control session and probe the remote side.
    pub fn connect(options: SshOptions) -> Result<Arc<Self>> {
        let local = local();
        let session = open_session(&local, &options, &["-T"], false)?;
        let state = RemoteState::connect(options.destination(), session)?;
        Ok(Arc::new(Self {
            options,
            local,
            state,
        }))
    }

    pub fn options(&self) -> &SshOptions {
        &self.options
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

    /// Output of `uname` on the remote side.
    pub fn uname(&self) -> &str {
        self.state.uname()
    }

    /// Forward `lhost:lport` on this side to `dhost:dport` as seen from
    /// the remote side. The forward lives as long as the tunnel.
    pub fn tunnel(&self, lport: u16, dport: u16, lhost: &str, dhost: &str) -> Result<Tunnel> {
        let spec = format!("{}:{}:{}:{}", lhost, lport, dhost, dport);
        debug!("tunnel {} via {}", spec, self.options.destination());
        let session = open_session(&self.local, &self.options, &["-L", &spec, "-T"], false)?;
        Ok(Tunnel {
            session,
            local_port: lport,
            remote_port: dport,
        })
    }

    /// Copy a local file or directory to `dst` on the remote side.
    pub fn upload(&self, src: &Path, dst: &str) -> Result<()> {
        let argv = self
            .options
            .scp_argv(&src.to_string_lossy(), &self.options.remote_path(dst));
        run_local(&self.local, &argv, &self.options.host).map(drop)
    }

    /// Copy a remote file or directory to `dst` on this side.
    pub fn download(&self, src: &str, dst: &Path) -> Result<()> {
        let argv = self
            .options
            .scp_argv(&self.options.remote_path(src), &dst.to_string_lossy());
        run_local(&self.local, &argv, &self.options.host).map(drop)
    }

    /// A fresh remote directory, removed when the guard drops.
    pub fn tempdir(self: &Arc<Self>) -> Result<RemoteTempDir> {
        let path = self.state.mktemp_dir()?;
        Ok(RemoteTempDir {
            machine: self.clone(),
            path,
        })
    }

    /// Close the control session. Commands already spawned keep running.
    pub fn close(&self) -> Result<()> {
        self.state.close()
    }

    fn spawn_remote(&self, line: String, display: Vec<String>, mut req: SpawnRequest) -> Result<Process> {
        let mut argv = self.options.ssh_argv(&["-T"]);
        argv.push("--".to_string());
        argv.push(line);
        if matches!(req.stderr, SpawnOutput::ToStdout) {
            req.stderr = SpawnOutput::Pipe;
        }
        req.cwd = None;
        req.env = BTreeMap::new();
        let process = self.local.spawn_argv(&argv, req)?;
        Ok(process.with_argv(display).with_host(Some(self.options.host.clone())))
    }
}

fn open_session(local: &LocalMachine, options: &SshOptions, flags: &[&str], isatty: bool) -> Result<ShellSession> {
    let argv = options.ssh_argv(flags);
    let process = local.spawn_argv(&argv, SpawnRequest::piped())?;
    ShellSession::new(
        process,
        SessionOptions {
            isatty,
            connect_timeout: Some(options.connect_timeout),
            host: Some(options.host.clone()),
        },
    )
}

impl Backend for SshMachine {
    fn name(&self) -> String {
        self.options.destination()
    }

    fn quote_level(&self) -> usize {
        1
    }

    fn host(&self) -> Option<String> {
        Some(self.options.host.clone())
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
        false
    }

    fn spawn_argv(&self, argv: &[String], req: SpawnRequest) -> Result<Process> {
        if argv.is_empty() {
            return Err(Error::InvalidArgument("empty argv".into()));
        }
        let merge = matches!(req.stderr, SpawnOutput::ToStdout);
        let line = self
            .state
            .command_line(argv, req.cwd.as_deref(), &req.env, merge)?;
        self.spawn_remote(line, argv.to_vec(), req)
    }

    fn spawn_shell_line(&self, line: &str, req: SpawnRequest) -> Result<Process> {
        let merge = matches!(req.stderr, SpawnOutput::ToStdout);
        let full = self
            .state
            .shell_line(line, req.cwd.as_deref(), &req.env, merge)?;
        self.spawn_remote(full, vec![line.to_string()], req)
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
        let mut argv = self.options.ssh_argv(&["-f"]);
        argv.push("--".to_string());
        argv.push(line);
        debug!("daemonizing {} on {}", cmd, self.options.host);
        Ok(run_local(&self.local, &argv, &self.options.host)?
            .with_argv(cmd.formulate(0))
            .with_host(Some(self.options.host.clone())))
    }

    fn session(&self, isatty: bool) -> Result<ShellSession> {
        let flag = if isatty { "-tt" } else { "-T" };
        open_session(&self.local, &self.options, &[flag], isatty)
    }
}

/// A local port forward through `ssh -L`.
#[derive(Debug)]
pub struct Tunnel {
    session: ShellSession,
    local_port: u16,
    remote_port: u16,
}

impl Tunnel {
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    /// Tear the forward down. Dropping the tunnel does the same.
    pub fn close(&mut self) {
        self.session.close();
    }
}

/// A directory created with `mktemp -d` on a remote machine, removed with
/// `rm -rf` on drop.
#[derive(Debug)]
pub struct RemoteTempDir {
    machine: Arc<SshMachine>,
    path: String,
}

impl RemoteTempDir {
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for RemoteTempDir {
    fn drop(&mut self) {
        let line = format!("rm -rf {}", shquote(&self.path));
        if let Err(e) = self.machine.session_run(&line, Retcode::Any) {
            warn!("failed to remove {} on {}: {}", self.path, self.machine.options.host, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> SshOptions {
        SshOptions::new("example.org")
            .user("deploy")
            .port(2222)
            .keyfile("/keys/id")
            .ssh_opt("-oBatchMode=yes")
    }

    #[test]
    fn test_ssh_argv() {
        let argv = options().ssh_argv(&["-T"]);
        assert_eq!(
            argv,
            ["ssh", "-oBatchMode=yes", "-p", "2222", "-i", "/keys/id", "-T", "deploy@example.org"]
        );
        assert_eq!(SshOptions::new("h").ssh_argv(&["-tt"]), ["ssh", "-tt", "h"]);
    }

    #[test]
    fn test_scp_argv_uses_capital_port() {
        let opts = options();
        let argv = opts.scp_argv("/tmp/a", &opts.remote_path("/srv/a"));
        assert_eq!(
            argv,
            ["scp", "-P", "2222", "-i", "/keys/id", "-r", "/tmp/a", "deploy@example.org:/srv/a"]
        );
    }

    #[test]
    fn test_from_config() {
        let mut config = Config::default();
        config.ssh.ssh_command = "/opt/ssh".into();
        config.ssh.options = vec!["-v".into()];
        config.ssh.connect_timeout_secs = 3;
        let opts = SshOptions::from_config("h", &config);
        assert_eq!(opts.ssh_command, "/opt/ssh");
        assert_eq!(opts.ssh_opts, ["-v"]);
        assert_eq!(opts.connect_timeout, Duration::from_secs(3));
        assert_eq!(opts.destination(), "h");
    }

    #[cfg(unix)]
    #[test]
    fn test_connect_failure_is_reported() {
        let opts = SshOptions {
            ssh_command: "false".into(),
            connect_timeout: Duration::from_secs(2),
            ..SshOptions::new("nowhere")
        };
        assert!(matches!(SshMachine::connect(opts), Err(Error::SshComms { .. })));
    }
}
