//! The local machine.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tracing::{debug, trace};

use super::{command, Backend, ExecContext, Machine, SpawnInput, SpawnOutput, SpawnRequest};
use crate::command::Command;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::execution::Nohup;
use crate::process::{spawn_pump, LocalChild, PipeReader, Process};
use crate::session::{spawn_in_pty, SessionOptions, ShellSession};

static LOCAL: OnceLock<Arc<LocalMachine>> = OnceLock::new();

/// The process-wide local machine.
///
/// Its context starts as a snapshot of this process's working directory
/// and environment; changing it does not touch the real process state.
pub fn local() -> Arc<LocalMachine> {
    LOCAL
        .get_or_init(|| {
            let context = ExecContext::from_process().unwrap_or_else(|_| ExecContext {
                cwd: PathBuf::from("."),
                env: std::env::vars().collect(),
            });
            Arc::new(LocalMachine::with_context(context))
        })
        .clone()
}

/// Runs programs as child processes of this process.
#[derive(Debug)]
pub struct LocalMachine {
    context: Mutex<ExecContext>,
    which_cache: Mutex<HashMap<(String, String), String>>,
    session_shell: String,
    session_options: SessionOptions,
}

impl LocalMachine {
    /// A new local machine with its own copy of the process context.
    pub fn new() -> Result<Self> {
        Ok(Self::with_context(ExecContext::from_process()?))
    }

    pub fn with_context(context: ExecContext) -> Self {
        Self {
            context: Mutex::new(context),
            which_cache: Mutex::new(HashMap::new()),
            session_shell: "sh".to_string(),
            session_options: SessionOptions::default(),
        }
    }

    /// Shell and startup timeout used by [`Backend::session`].
    pub fn with_session_shell(mut self, shell: impl Into<String>, connect_timeout: Duration) -> Self {
        self.session_shell = shell.into();
        self.session_options.connect_timeout = Some(connect_timeout);
        self
    }

    /// A local machine whose sessions follow the `session` section of
    /// `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut machine = Self::new()?;
        machine.session_shell = config.session.shell.clone();
        machine.session_options = SessionOptions::from_config(config);
        Ok(machine)
    }

    /// A command for `name`, resolved on this machine's `PATH`.
    pub fn command(self: &Arc<Self>, name: &str) -> Result<Command> {
        let machine: Machine = self.clone();
        command(&machine, name)
    }

    /// Directories on this machine's `PATH`.
    pub fn path_dirs(&self) -> Result<Vec<PathBuf>> {
        let ctx = self.context()?;
        Ok(ctx
            .get_env("PATH")
            .map(|p| std::env::split_paths(p).collect())
            .unwrap_or_default())
    }

    fn lock_context(&self) -> Result<std::sync::MutexGuard<'_, ExecContext>> {
        self.context.lock().map_err(|_| Error::LockPoisoned)
    }

    fn not_found(program: &str, ctx: &ExecContext) -> Error {
        Error::CommandNotFound {
            program: program.to_string(),
            path: ctx
                .get_env("PATH")
                .map(|p| std::env::split_paths(p).collect())
                .unwrap_or_default(),
        }
    }

    /// Map a spawn failure. `NotFound` means a missing program only when
    /// the working directory exists.
    fn spawn_error(program: &str, ctx: &ExecContext, cwd: &Path, e: io::Error) -> Error {
        if e.kind() != io::ErrorKind::NotFound {
            return Error::from(e);
        }
        if !cwd.is_dir() {
            return Self::missing_cwd(cwd);
        }
        Self::not_found(program, ctx)
    }

    fn missing_cwd(cwd: &Path) -> Error {
        Error::from(io::Error::new(
            io::ErrorKind::NotFound,
            format!("working directory {} does not exist", cwd.display()),
        ))
    }
}

/// Lookup candidates for `name`: as given, then with `_` turned into `-`
/// and into `.`.
fn alternatives(name: &str) -> Vec<String> {
    let mut names = vec![name.to_string()];
    for sep in ['-', '.'] {
        let alt = name.replace('_', &sep.to_string());
        if !names.contains(&alt) {
            names.push(alt);
        }
    }
    names
}

fn output_stdio(output: SpawnOutput) -> Result<Stdio> {
    Ok(match output {
        SpawnOutput::Inherit => Stdio::inherit(),
        SpawnOutput::Null => Stdio::null(),
        SpawnOutput::Pipe => Stdio::piped(),
        SpawnOutput::File(f) => Stdio::from(f),
        SpawnOutput::ToStdout => {
            return Err(Error::InvalidArgument(
                "stdout cannot be merged into itself".into(),
            ))
        }
    })
}

/// Stdio for stdout and stderr when stderr is merged into stdout, plus the
/// reader for the merged stream if it is piped.
fn merged_stdio(stdout: SpawnOutput) -> Result<(Stdio, Stdio, Option<PipeReader>)> {
    Ok(match stdout {
        SpawnOutput::Inherit => (Stdio::inherit(), Stdio::from(io::stdout()), None),
        SpawnOutput::Null => (Stdio::null(), Stdio::null(), None),
        SpawnOutput::File(f) => {
            let err = f.try_clone()?;
            (Stdio::from(f), Stdio::from(err), None)
        }
        #[cfg(unix)]
        SpawnOutput::Pipe => {
            let (read, write) = crate::process::os_pipe()?;
            let err = write.try_clone()?;
            (Stdio::from(write), Stdio::from(err), Some(PipeReader::File(read)))
        }
        #[cfg(not(unix))]
        SpawnOutput::Pipe => {
            return Err(Error::Unsupported(
                "merging stderr into a piped stdout".into(),
            ))
        }
        SpawnOutput::ToStdout => {
            return Err(Error::InvalidArgument(
                "stdout cannot be merged into itself".into(),
            ))
        }
    })
}

impl Backend for LocalMachine {
    fn name(&self) -> String {
        "local".to_string()
    }

    fn quote_level(&self) -> usize {
        2
    }

    fn which(&self, program: &str) -> Result<String> {
        let ctx = self.context()?;
        let path = ctx.get_env("PATH").unwrap_or_default().to_string();
        let key = (program.to_string(), path.clone());
        if let Some(hit) = self
            .which_cache
            .lock()
            .map_err(|_| Error::LockPoisoned)?
            .get(&key)
        {
            return Ok(hit.clone());
        }

        for name in alternatives(program) {
            if let Ok(found) = which::which_in(&name, Some(&path), &ctx.cwd) {
                let found = found.to_string_lossy().into_owned();
                trace!("which {} -> {}", program, found);
                self.which_cache
                    .lock()
                    .map_err(|_| Error::LockPoisoned)?
                    .insert(key, found.clone());
                return Ok(found);
            }
        }
        Err(Self::not_found(program, &ctx))
    }

    fn context(&self) -> Result<ExecContext> {
        Ok(self.lock_context()?.clone())
    }

    fn chdir(&self, path: &Path) -> Result<()> {
        let mut ctx = self.lock_context()?;
        let target = ctx.resolve(path);
        if !target.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is not a directory", target.display()),
            )
            .into());
        }
        debug!("local cwd -> {}", target.display());
        ctx.cwd = target;
        Ok(())
    }

    fn set_env(&self, key: &str, value: &str) -> Result<()> {
        self.lock_context()?.set_env(key, value);
        Ok(())
    }

    fn unset_env(&self, key: &str) -> Result<()> {
        self.lock_context()?.remove_env(key);
        Ok(())
    }

    fn restore_context(&self, ctx: ExecContext) -> Result<()> {
        *self.lock_context()? = ctx;
        Ok(())
    }

    fn supports_native_pipelines(&self) -> bool {
        true
    }

    fn spawn_argv(&self, argv: &[String], req: SpawnRequest) -> Result<Process> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::InvalidArgument("empty argv".into()))?;
        let ctx = self.context()?;
        let cwd = req.cwd.as_deref().map_or_else(|| ctx.cwd.clone(), |c| ctx.resolve(c));

        let mut cmd = std::process::Command::new(program);
        cmd.args(args)
            .env_clear()
            .envs(&ctx.env)
            .envs(&req.env)
            .current_dir(&cwd);

        let mut stdin_source = None;
        cmd.stdin(match req.stdin {
            SpawnInput::Inherit => Stdio::inherit(),
            SpawnInput::Null => Stdio::null(),
            SpawnInput::Pipe => Stdio::piped(),
            SpawnInput::File(f) => Stdio::from(f),
            SpawnInput::Upstream(reader) => {
                let (stdio, source) = reader.into_stdio();
                stdin_source = source;
                stdio
            }
        });

        let mut merged = None;
        if matches!(req.stderr, SpawnOutput::ToStdout) {
            let (out, err, reader) = merged_stdio(req.stdout)?;
            cmd.stdout(out).stderr(err);
            merged = reader;
        } else {
            cmd.stdout(output_stdio(req.stdout)?);
            cmd.stderr(output_stdio(req.stderr)?);
        }

        #[cfg(unix)]
        if req.new_session {
            use std::os::unix::process::CommandExt;
            // SAFETY: setsid is async-signal-safe.
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Self::spawn_error(program, &ctx, &cwd, e))?;
        // our copies of the pipe ends go away with `cmd`
        drop(cmd);
        debug!("spawned {:?} (pid {})", argv, child.id());

        let mut stdin: Option<Box<dyn io::Write + Send>> = child
            .stdin
            .take()
            .map(|s| Box::new(s) as Box<dyn io::Write + Send>);
        if let Some(source) = stdin_source {
            if let Some(writer) = stdin.take() {
                spawn_pump("stdin", source, writer)?;
            }
        }
        let stdout = merged.or_else(|| child.stdout.take().map(PipeReader::Stdout));
        let stderr = child.stderr.take().map(PipeReader::Stderr);
        Ok(Process::new(
            argv.to_vec(),
            Box::new(LocalChild::new(child)),
            stdin,
            stdout,
            stderr,
        ))
    }

    fn spawn_shell_line(&self, line: &str, req: SpawnRequest) -> Result<Process> {
        let argv = vec!["/bin/sh".to_string(), "-c".to_string(), line.to_string()];
        Ok(self.spawn_argv(&argv, req)?.with_argv(vec![line.to_string()]))
    }

    fn daemonize(&self, cmd: &Command, options: &Nohup) -> Result<Process> {
        let ctx = self.context()?;
        let (argv, env, cwd) = match cmd.leaf() {
            Some(leaf) => (leaf.argv, leaf.env, leaf.cwd),
            None => (
                vec!["/bin/sh".to_string(), "-c".to_string(), cmd.shell_line()],
                Default::default(),
                None,
            ),
        };
        let cwd = ctx.resolve(cwd.as_deref().unwrap_or(options.working_dir()));

        let open = |path: &Path| {
            let path = if path.is_absolute() {
                path.to_path_buf()
            } else {
                cwd.join(path)
            };
            OpenOptions::new()
                .create(true)
                .write(true)
                .append(options.append)
                .truncate(!options.append)
                .open(path)
        };
        let stdout = open(options.stdout_path())?;
        let stderr = match options.stderr_path() {
            Some(path) => open(path)?,
            None => stdout.try_clone()?,
        };

        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::InvalidArgument("empty argv".into()))?;
        let mut os = std::process::Command::new(program);
        os.args(args)
            .env_clear()
            .envs(&ctx.env)
            .envs(&env)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        #[cfg(unix)]
        {
            let daemon = crate::process::spawn_detached(os).map_err(|e| match e {
                Error::CommandNotFound { .. } if !cwd.is_dir() => Self::missing_cwd(&cwd),
                Error::CommandNotFound { program, .. } => Error::CommandNotFound {
                    path: ctx
                        .get_env("PATH")
                        .map(|p| std::env::split_paths(p).collect())
                        .unwrap_or_default(),
                    program,
                },
                other => other,
            })?;
            Ok(Process::new(argv, Box::new(daemon), None, None, None))
        }
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            os.creation_flags(crate::process::DETACHED_FLAGS);
            let child = os.spawn().map_err(|e| Self::spawn_error(program, &ctx, &cwd, e))?;
            Ok(Process::new(argv, Box::new(LocalChild::new(child)), None, None, None))
        }
    }

    fn session(&self, isatty: bool) -> Result<ShellSession> {
        let ctx = self.context()?;
        let options = SessionOptions {
            isatty,
            ..self.session_options.clone()
        };
        let process = if isatty {
            spawn_in_pty(&[self.session_shell.as_str()], Some(&ctx.cwd), &[("PS1", ""), ("TERM", "dumb")])?
        } else {
            self.spawn_argv(&[self.session_shell.clone()], SpawnRequest::piped())?
        };
        ShellSession::new(process, options)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::Read;

    fn machine() -> LocalMachine {
        LocalMachine::new().unwrap()
    }

    #[test]
    fn test_from_config_session() {
        let mut config = Config::default();
        config.session.shell = "/bin/sh".to_string();
        config.session.connect_timeout_secs = 2;
        let m = LocalMachine::from_config(&config).unwrap();
        assert_eq!(m.session_shell, "/bin/sh");
        assert_eq!(m.session_options.connect_timeout, Some(Duration::from_secs(2)));
        let mut session = m.session(false).unwrap();
        assert_eq!(session.run("echo $((1 + 2))", 0).unwrap().stdout, "3\n");
        session.close();
    }

    #[test]
    fn test_alternatives() {
        assert_eq!(alternatives("ls"), vec!["ls"]);
        assert_eq!(alternatives("foo_bar"), vec!["foo_bar", "foo-bar", "foo.bar"]);
    }

    #[test]
    fn test_which_and_cache() {
        let m = machine();
        let sh = m.which("sh").unwrap();
        assert!(sh.ends_with("/sh"));
        assert_eq!(m.which("sh").unwrap(), sh);
    }

    #[test]
    fn test_which_miss_carries_path() {
        let m = machine();
        m.set_env("PATH", "/nonexistent/a:/nonexistent/b").unwrap();
        match m.which("definitely_not_a_real_cmd_xyz") {
            Err(Error::CommandNotFound { program, path }) => {
                assert_eq!(program, "definitely_not_a_real_cmd_xyz");
                assert_eq!(path, vec![PathBuf::from("/nonexistent/a"), PathBuf::from("/nonexistent/b")]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_spawn_merged_stderr() {
        let m = machine();
        let req = SpawnRequest {
            stderr: SpawnOutput::ToStdout,
            ..SpawnRequest::default()
        };
        let argv = ["sh", "-c", "echo out; echo err 1>&2"].map(String::from);
        let mut p = m.spawn_argv(&argv, req).unwrap();
        let mut out = String::new();
        p.take_stdout().unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(p.wait().unwrap(), 0);
        assert!(out.contains("out\n") && out.contains("err\n"));
    }

    #[test]
    fn test_spawn_uses_context() {
        let m = machine();
        m.chdir(Path::new("/tmp")).unwrap();
        m.set_env("PW_LOCAL_TEST", "yes").unwrap();
        let argv = ["sh", "-c", "pwd; echo $PW_LOCAL_TEST"].map(String::from);
        let mut p = m.spawn_argv(&argv, SpawnRequest::piped()).unwrap();
        let (out, _) = p.communicate(None).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.ends_with("yes\n"));
        assert!(out.starts_with("/tmp") || out.starts_with("/private/tmp"));
    }

    #[test]
    fn test_spawn_missing_program() {
        let m = machine();
        let argv = vec!["/nonexistent/prog".to_string()];
        assert!(matches!(
            m.spawn_argv(&argv, SpawnRequest::piped()),
            Err(Error::CommandNotFound { .. })
        ));
    }

    #[test]
    fn test_spawn_missing_cwd_is_not_a_missing_program() {
        let m = machine();
        let req = SpawnRequest {
            cwd: Some(PathBuf::from("/nonexistent/workdir")),
            ..SpawnRequest::piped()
        };
        let argv = vec!["sh".to_string(), "-c".to_string(), "true".to_string()];
        let err = m.spawn_argv(&argv, req).unwrap_err();
        assert!(matches!(err, Error::Io(_)), "unexpected: {:?}", err);
        assert!(err.to_string().contains("/nonexistent/workdir"));
    }

    #[test]
    fn test_chdir_rejects_missing_dir() {
        assert!(machine().chdir(Path::new("/nonexistent/dir")).is_err());
    }
}
