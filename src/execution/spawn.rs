//! Turning a command tree into running processes.
//!
//! Plain commands go straight to their machine's backend. Pipelines are
//! wired stage by stage, passing each stage's stdout to the next as its
//! stdin, unless the machine cannot do that; then a pipeline of plain
//! commands runs as a single shell line. Redirections are opened on this
//! side and handed to the backend as files.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::command::{Command, Input, Node, Output, StreamKind};
use crate::error::{Error, Result};
use crate::machine::{clone_output, local, remote_command_line, Backend, SpawnInput, SpawnOutput, SpawnRequest};
use crate::process::{spawn_feeder, Process};

/// Stream, directory and environment choices for [`popen`].
///
/// Explicit values here win over bindings on the command.
#[derive(Debug, Clone, Default)]
pub struct PopenOptions {
    pub stdin: Input,
    pub stdout: Output,
    pub stderr: Output,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// Start in a new session (POSIX `setsid`).
    pub new_session: bool,
}

impl PopenOptions {
    pub fn stdin(mut self, stdin: impl Into<Input>) -> Self {
        self.stdin = stdin.into();
        self
    }

    pub fn stdout(mut self, stdout: impl Into<Output>) -> Self {
        self.stdout = stdout.into();
        self
    }

    pub fn stderr(mut self, stderr: impl Into<Output>) -> Self {
        self.stderr = stderr.into();
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Every stream shared with the caller.
    pub fn inherit() -> Self {
        Self {
            stdin: Input::Inherit,
            stdout: Output::Inherit,
            stderr: Output::Inherit,
            ..Self::default()
        }
    }
}

/// Env and cwd collected on the way down the tree. Whatever is set first
/// (closest to the caller) wins.
#[derive(Debug, Clone, Default)]
struct Scope {
    env: BTreeMap<String, String>,
    cwd: Option<PathBuf>,
}

impl Scope {
    fn enter(&self, env: &BTreeMap<String, String>, cwd: &Option<PathBuf>) -> Scope {
        let mut scope = self.clone();
        for (k, v) in env {
            scope.env.entry(k.clone()).or_insert_with(|| v.clone());
        }
        if scope.cwd.is_none() {
            scope.cwd = cwd.clone();
        }
        scope
    }
}

/// Streams the caller of [`popen`] chose explicitly. A redirection in the
/// command may not choose them again.
#[derive(Debug, Clone, Copy, Default)]
struct Claimed {
    stdin: bool,
    stdout: bool,
    stderr: bool,
}

impl Claimed {
    fn from_options(options: &PopenOptions) -> Self {
        Self {
            stdin: !matches!(options.stdin, Input::Pipe | Input::Inherit),
            stdout: !matches!(options.stdout, Output::Pipe | Output::Inherit),
            stderr: !matches!(options.stderr, Output::Pipe | Output::Inherit),
        }
    }

    /// Walk the streams the caller's choices reach: stdin goes to the
    /// first pipeline stage, stdout to the last, stderr everywhere.
    fn check(self, cmd: &Command) -> Result<()> {
        match cmd.node() {
            Node::Env { base, .. } => self.check(base),
            Node::Redirection {
                inner,
                stdin,
                stdout,
                stderr,
            } => {
                let mut claimed = self;
                for (set, taken, kind) in [
                    (stdin.is_some(), &mut claimed.stdin, StreamKind::Stdin),
                    (stdout.is_some(), &mut claimed.stdout, StreamKind::Stdout),
                    (stderr.is_some(), &mut claimed.stderr, StreamKind::Stderr),
                ] {
                    if set && *taken {
                        return Err(Error::Redirection(kind));
                    }
                    *taken |= set;
                }
                claimed.check(inner)
            }
            Node::Pipeline(stages) => {
                let last = stages.len().saturating_sub(1);
                stages.iter().enumerate().try_for_each(|(i, stage)| {
                    Claimed {
                        stdin: self.stdin && i == 0,
                        stdout: self.stdout && i == last,
                        stderr: self.stderr,
                    }
                    .check(stage)
                })
            }
            Node::Concurrent(members) => members.iter().try_for_each(|m| self.check(m)),
            _ => Ok(()),
        }
    }
}

/// Start `cmd`.
///
/// Fails with [`Error::Redirection`] when `options` set a stream that a
/// redirection in `cmd` also sets.
pub fn popen(cmd: &Command, options: PopenOptions) -> Result<Process> {
    Claimed::from_options(&options).check(cmd)?;
    let (stdin, data) = open_input(&options.stdin)?;
    let req = SpawnRequest {
        stdin,
        stdout: open_output(&options.stdout, StreamKind::Stdout)?,
        stderr: open_output(&options.stderr, StreamKind::Stderr)?,
        cwd: None,
        env: BTreeMap::new(),
        new_session: options.new_session,
    };
    let scope = Scope {
        env: options.env,
        cwd: options.cwd,
    };
    let mut process = spawn(cmd, req, &scope)?;
    if let Some(data) = data {
        feed(&mut process, data)?;
    }
    Ok(process)
}

fn feed(process: &mut Process, data: Vec<u8>) -> Result<()> {
    match process.take_stdin() {
        Some(writer) => spawn_feeder(writer, data),
        None => Err(Error::InvalidArgument("stdin is not piped".into())),
    }
}

fn spawn(cmd: &Command, mut req: SpawnRequest, scope: &Scope) -> Result<Process> {
    if let Some(leaf) = cmd.leaf() {
        let scope = scope.enter(&leaf.env, &leaf.cwd);
        req.env = scope.env;
        req.cwd = scope.cwd;
        return leaf.machine.spawn_argv(&leaf.argv, req);
    }
    match cmd.node() {
        Node::Env { base, env, cwd } => spawn(base, req, &scope.enter(env, cwd)),
        Node::Pipeline(stages) => spawn_pipeline(cmd, stages, req, scope),
        Node::Redirection {
            inner,
            stdin,
            stdout,
            stderr,
        } => {
            let mut data = None;
            if let Some(stdin) = stdin {
                let (input, bytes) = open_input(stdin)?;
                req.stdin = input;
                data = bytes;
            }
            if let Some(stdout) = stdout {
                req.stdout = open_output(stdout, StreamKind::Stdout)?;
            }
            if let Some(stderr) = stderr {
                req.stderr = open_output(stderr, StreamKind::Stderr)?;
            }
            let mut process = spawn(inner, req, scope)?;
            if let Some(data) = data {
                feed(&mut process, data)?;
            }
            Ok(process)
        }
        Node::Concurrent(members) => {
            let mut spawned = Vec::with_capacity(members.len());
            for member in members {
                match req.try_clone().and_then(|r| spawn(member, r, scope)) {
                    Ok(process) => spawned.push(process),
                    Err(e) => {
                        abort(spawned);
                        return Err(e);
                    }
                }
            }
            Ok(Process::group(cmd.formulate(0), spawned))
        }
        Node::Atomic { .. } | Node::Bound { .. } => {
            Err(Error::InvalidArgument(format!("cannot spawn {}", cmd)))
        }
    }
}

/// Kill and reap what was already started for a composite that failed
/// half way.
fn abort(spawned: Vec<Process>) {
    for mut process in spawned {
        process.kill_and_reap();
    }
}

fn spawn_pipeline(cmd: &Command, stages: &[Command], req: SpawnRequest, scope: &Scope) -> Result<Process> {
    let native = stages.iter().all(|s| s.machine().supports_native_pipelines());
    if !native {
        return spawn_flattened(cmd, stages, req, scope);
    }

    let SpawnRequest {
        stdin,
        stdout,
        stderr,
        new_session,
        ..
    } = req;
    let mut upstream = Some(stdin);
    let mut last_stdout = Some(stdout);
    let last = stages.len() - 1;
    let mut spawned: Vec<Process> = Vec::with_capacity(stages.len());

    for (i, stage) in stages.iter().enumerate() {
        let stage_stderr = match (&stderr, i == last) {
            (SpawnOutput::ToStdout, false) => Ok(SpawnOutput::Pipe),
            (other, _) => clone_output(other),
        };
        let stage_req = stage_stderr.map(|stage_stderr| SpawnRequest {
            stdin: upstream.take().unwrap_or_default(),
            stdout: if i == last {
                last_stdout.take().unwrap_or_default()
            } else {
                SpawnOutput::Pipe
            },
            stderr: stage_stderr,
            cwd: None,
            env: BTreeMap::new(),
            new_session,
        });
        let result = stage_req.and_then(|r| spawn(stage, r, scope));
        let mut process = match result {
            Ok(process) => process,
            Err(e) => {
                abort(spawned);
                return Err(e);
            }
        };
        if i != last {
            // a stage whose stdout went to a file feeds nothing downstream
            upstream = Some(
                process
                    .take_stdout()
                    .map_or(SpawnInput::Null, SpawnInput::Upstream),
            );
        }
        spawned.push(process);
    }
    debug!("pipeline of {} stages: {}", spawned.len(), cmd);
    Ok(Process::pipeline(cmd.formulate(0), spawned))
}

/// A pipeline on a machine that cannot wire stages: run it as one shell
/// line there.
fn spawn_flattened(cmd: &Command, stages: &[Command], mut req: SpawnRequest, scope: &Scope) -> Result<Process> {
    let leaves: Vec<_> = stages.iter().map(Command::leaf).collect::<Option<_>>().ok_or_else(|| {
        Error::Unsupported(format!(
            "{}: only pipelines of plain commands can run on a machine without native pipelines",
            cmd
        ))
    })?;
    let machine = leaves[0].machine.clone();
    if leaves.iter().any(|l| !Arc::ptr_eq(&l.machine, &machine)) {
        return Err(Error::Unsupported(format!(
            "{}: pipeline spans several machines and {} cannot pipe natively",
            cmd,
            machine.name()
        )));
    }

    let parts: Vec<String> = leaves
        .iter()
        .map(|leaf| {
            let env: BTreeMap<String, String> = leaf
                .env
                .iter()
                .filter(|(k, _)| !scope.env.contains_key(*k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            let cwd = leaf.cwd.as_deref().filter(|_| scope.cwd.is_none());
            if env.is_empty() && cwd.is_none() {
                leaf.argv.join(" ")
            } else {
                format!("( {} )", remote_command_line(&leaf.argv, cwd, &env))
            }
        })
        .collect();
    let line = parts.join(" | ");
    req.env = scope.env.clone();
    req.cwd = scope.cwd.clone();
    debug!("flattened pipeline for {}: {}", machine.name(), line);
    Ok(machine.spawn_shell_line(&line, req)?.with_argv(cmd.formulate(0)))
}

/// Local paths in redirections resolve against the local machine's
/// working directory.
fn local_path(path: &Path) -> Result<PathBuf> {
    Ok(local().context()?.resolve(path))
}

fn open_input(input: &Input) -> Result<(SpawnInput, Option<Vec<u8>>)> {
    Ok(match input {
        Input::Inherit => (SpawnInput::Inherit, None),
        Input::Null => (SpawnInput::Null, None),
        Input::Pipe => (SpawnInput::Pipe, None),
        Input::File(path) => (SpawnInput::File(File::open(local_path(path)?)?), None),
        Input::Data(data) => (SpawnInput::Pipe, Some(data.clone())),
        Input::Handle(file) => (SpawnInput::File(file.try_clone()?), None),
    })
}

fn open_output(output: &Output, kind: StreamKind) -> Result<SpawnOutput> {
    Ok(match output {
        Output::Inherit => SpawnOutput::Inherit,
        Output::Null => SpawnOutput::Null,
        Output::Pipe => SpawnOutput::Pipe,
        Output::File(path) => SpawnOutput::File(File::create(local_path(path)?)?),
        Output::Append(path) => SpawnOutput::File(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(local_path(path)?)?,
        ),
        Output::Handle(file) => SpawnOutput::File(file.try_clone()?),
        Output::Stdout if kind == StreamKind::Stderr => SpawnOutput::ToStdout,
        Output::Stdout => {
            return Err(Error::InvalidArgument(
                "stdout cannot be merged into itself".into(),
            ))
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::machine::testing::fake_remote;
    use crate::machine::LocalMachine;
    use std::io::Read;

    fn machine() -> Arc<LocalMachine> {
        Arc::new(LocalMachine::new().unwrap())
    }

    fn output(mut p: Process) -> (i32, String, String) {
        let (out, err) = p.communicate(None).unwrap();
        let code = p.wait().unwrap();
        (
            code,
            String::from_utf8(out).unwrap(),
            String::from_utf8(err).unwrap(),
        )
    }

    #[test]
    fn test_pipeline_is_wired_natively() {
        let m = machine();
        let printf = m.command("printf").unwrap().bind(["a\\nb\\nc\\n"]);
        let wc = m.command("wc").unwrap().arg("-l");
        let p = popen(&printf.pipe(&wc), PopenOptions::default()).unwrap();
        assert_eq!(p.children().len(), 2);
        let (code, out, _) = output(p);
        assert_eq!(code, 0);
        assert_eq!(out.trim(), "3");
    }

    #[test]
    fn test_scope_outer_env_wins_and_options_win_over_nodes() {
        let m = machine();
        let sh = m.command("sh").unwrap().bind(["-c", "echo $PW_A $PW_B"]);
        let cmd = sh.with_env("PW_A", "inner").with_env("PW_B", "node");
        let cmd = cmd.with_envs([("PW_A", "outer")]);
        let (_, out, _) = output(popen(&cmd, PopenOptions::default().env("PW_B", "opt")).unwrap());
        assert_eq!(out, "outer opt\n");
    }

    #[test]
    fn test_stdin_data_and_file_redirection() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.txt");
        let m = machine();
        let cat = m.command("cat").unwrap();
        let cmd = cat.stdin_data("hello\n").unwrap().redirect_out(target.clone()).unwrap();
        let (code, out, _) = output(popen(&cmd, PopenOptions::default()).unwrap());
        assert_eq!(code, 0);
        assert_eq!(out, "");
        let mut text = String::new();
        File::open(&target).unwrap().read_to_string(&mut text).unwrap();
        assert_eq!(text, "hello\n");
    }

    #[test]
    fn test_explicit_stream_and_redirection_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("node.txt");
        let explicit = dir.path().join("explicit.txt");
        let m = machine();
        let echo = m.command("echo").unwrap().arg("x");
        let redirected = echo.redirect_out(target.clone()).unwrap();

        let err = popen(&redirected, PopenOptions::default().stdout(explicit.clone())).unwrap_err();
        assert!(matches!(err, Error::Redirection(StreamKind::Stdout)));
        assert!(!explicit.exists());

        let cat = m.command("cat").unwrap();
        let fed = cat.stdin_data("hi").unwrap().pipe(&cat);
        let err = popen(&fed, PopenOptions::default().stdin(Input::Null)).unwrap_err();
        assert!(matches!(err, Error::Redirection(StreamKind::Stdin)));

        // stdout of a middle stage is not the caller's
        let middle = redirected.pipe(&cat);
        let (code, _, _) = output(popen(&middle, PopenOptions::default().stdout(Output::Null)).unwrap());
        assert_eq!(code, 0);

        // pipes and inherited streams are not explicit choices
        let (code, _, _) = output(popen(&redirected, PopenOptions::default()).unwrap());
        assert_eq!(code, 0);
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "x\n");
    }

    #[test]
    fn test_group_spawns_every_member() {
        let m = machine();
        let t = m.command("true").unwrap();
        let f = m.command("false").unwrap();
        let mut p = popen(&t.concurrently(&f).concurrently(&t), PopenOptions::default()).unwrap();
        assert_eq!(p.children().len(), 3);
        assert_eq!(p.wait().unwrap(), 1);
    }

    #[test]
    fn test_missing_stage_aborts_the_pipeline() {
        let m = machine();
        let sleep = m.command("sleep").unwrap().arg("5");
        let missing = Command::atomic("/nonexistent/prog", m.clone());
        let err = popen(&sleep.pipe(&missing), PopenOptions::default()).unwrap_err();
        assert!(matches!(err, Error::CommandNotFound { .. }));
    }

    #[test]
    fn test_mixed_pipeline_on_non_native_machine_is_unsupported() {
        let remote = fake_remote();
        let a = Command::atomic("a", remote.clone());
        let b = Command::atomic("b", remote);
        let group = a.concurrently(&b);
        let result = spawn_flattened(&a.pipe(&group), &[a.clone(), group], SpawnRequest::piped(), &Scope::default());
        assert!(matches!(result, Err(Error::Unsupported(_))));
    }
}
