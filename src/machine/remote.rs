//! State shared by machines reached through a remote shell.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, trace};

use super::{remote_command_line, ExecContext};
use crate::command::Retcode;
use crate::error::{Error, Result};
use crate::quoting::shquote;
use crate::session::{SessionOutput, ShellSession, StateProbe};

/// Lookup candidates for `name` on a remote search path.
fn alternatives(name: &str) -> Vec<String> {
    let mut names = vec![name.to_string()];
    for sep in ["-", "."] {
        let alt = name.replace('_', sep);
        if !names.contains(&alt) {
            names.push(alt);
        }
    }
    names
}

/// The persistent session of a remote machine and the context tracked
/// alongside it.
///
/// The login environment is read once when connecting. Every later change
/// is applied to the live shell and to the tracked copy, and one-shot
/// commands carry only the difference against the login environment.
#[derive(Debug)]
pub(crate) struct RemoteState {
    host: String,
    session: Mutex<ShellSession>,
    login_env: BTreeMap<String, String>,
    context: Mutex<ExecContext>,
    which_cache: Mutex<HashMap<String, String>>,
    uname: String,
}

impl RemoteState {
    /// Probe a freshly opened session for its environment, working
    /// directory and system name.
    pub fn connect(host: impl Into<String>, mut session: ShellSession) -> Result<Self> {
        let host = host.into();
        let env = StateProbe::parse_env(&session.run(StateProbe::env_command(), 0)?.stdout);
        let cwd = StateProbe::parse_cwd(&session.run(StateProbe::cwd_command(), 0)?.stdout)
            .ok_or_else(|| Error::Session(format!("cannot read the working directory on {}", host)))?;
        let uname = match session.run("uname", Retcode::Any)? {
            SessionOutput {
                retcode: Some(0),
                stdout,
                ..
            } => stdout.trim().to_string(),
            _ => "Windows".to_string(),
        };
        debug!("connected to {} ({}, cwd {})", host, uname, cwd.display());

        Ok(Self {
            host,
            session: Mutex::new(session),
            login_env: env.clone(),
            context: Mutex::new(ExecContext { cwd, env }),
            which_cache: Mutex::new(HashMap::new()),
            uname,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn uname(&self) -> &str {
        &self.uname
    }

    fn lock_session(&self) -> Result<MutexGuard<'_, ShellSession>> {
        self.session.lock().map_err(|_| Error::LockPoisoned)
    }

    fn lock_context(&self) -> Result<MutexGuard<'_, ExecContext>> {
        self.context.lock().map_err(|_| Error::LockPoisoned)
    }

    /// Run one line in the shared session.
    pub fn run(&self, line: &str, retcode: impl Into<Retcode>) -> Result<SessionOutput> {
        self.lock_session()?.run(line, retcode)
    }

    pub fn close(&self) -> Result<()> {
        self.lock_session()?.close();
        Ok(())
    }

    pub fn which(&self, program: &str) -> Result<String> {
        if let Some(hit) = self
            .which_cache
            .lock()
            .map_err(|_| Error::LockPoisoned)?
            .get(program)
        {
            return Ok(hit.clone());
        }
        for name in alternatives(program) {
            let out = self.run(&format!("which {}", shquote(&name)), Retcode::Any)?;
            let found = out.stdout.lines().next().map(str::trim).unwrap_or_default();
            if out.retcode == Some(0) && !found.is_empty() {
                trace!("which {} on {} -> {}", program, self.host, found);
                self.which_cache
                    .lock()
                    .map_err(|_| Error::LockPoisoned)?
                    .insert(program.to_string(), found.to_string());
                return Ok(found.to_string());
            }
        }
        let ctx = self.context()?;
        Err(Error::CommandNotFound {
            program: program.to_string(),
            path: ctx
                .get_env("PATH")
                .map(|p| p.split(':').map(PathBuf::from).collect())
                .unwrap_or_default(),
        })
    }

    pub fn context(&self) -> Result<ExecContext> {
        Ok(self.lock_context()?.clone())
    }

    pub fn chdir(&self, path: &Path) -> Result<()> {
        let mut ctx = self.lock_context()?;
        let target = ctx.resolve(path);
        let mut session = self.lock_session()?;
        session.run(&format!("cd {}", shquote(&target.to_string_lossy())), 0)?;
        let out = session.run(StateProbe::cwd_command(), 0)?;
        ctx.cwd = StateProbe::parse_cwd(&out.stdout).unwrap_or(target);
        debug!("{} cwd -> {}", self.host, ctx.cwd.display());
        Ok(())
    }

    pub fn set_env(&self, key: &str, value: &str) -> Result<()> {
        check_env_key(key)?;
        let mut ctx = self.lock_context()?;
        self.run(&format!("export {}={}", key, shquote(value)), 0)?;
        ctx.set_env(key, value);
        Ok(())
    }

    pub fn unset_env(&self, key: &str) -> Result<()> {
        check_env_key(key)?;
        let mut ctx = self.lock_context()?;
        self.run(&format!("unset {}", key), 0)?;
        ctx.remove_env(key);
        Ok(())
    }

    /// Bring the live shell and the tracked context back to `saved`.
    pub fn restore(&self, saved: ExecContext) -> Result<()> {
        let current = self.context()?;
        for key in current.env.keys().filter(|k| !saved.env.contains_key(*k)) {
            self.unset_env(key)?;
        }
        for (key, value) in saved.env_delta(&current.env) {
            self.set_env(&key, &value)?;
        }
        if saved.cwd != current.cwd {
            self.chdir(&saved.cwd)?;
        }
        Ok(())
    }

    /// Variables to send with a one-shot command. Removed login variables
    /// are sent empty.
    fn env_delta(&self, ctx: &ExecContext, extra: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut delta = ctx.env_delta(&self.login_env);
        for key in self.login_env.keys().filter(|k| !ctx.env.contains_key(*k)) {
            delta.insert(key.clone(), String::new());
        }
        delta.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        delta
    }

    /// `cd <cwd> && env ... <argv>` for one program.
    pub fn command_line(
        &self,
        argv: &[String],
        cwd: Option<&Path>,
        env: &BTreeMap<String, String>,
        merge_stderr: bool,
    ) -> Result<String> {
        let ctx = self.context()?;
        let cwd = cwd.map_or_else(|| ctx.cwd.clone(), |c| ctx.resolve(c));
        let mut line = remote_command_line(argv, Some(&cwd), &self.env_delta(&ctx, env));
        if merge_stderr {
            line.push_str(" 2>&1");
        }
        Ok(line)
    }

    /// A whole shell line, run from the tracked directory with the
    /// tracked environment exported.
    pub fn shell_line(
        &self,
        line: &str,
        cwd: Option<&Path>,
        env: &BTreeMap<String, String>,
        merge_stderr: bool,
    ) -> Result<String> {
        let ctx = self.context()?;
        let cwd = cwd.map_or_else(|| ctx.cwd.clone(), |c| ctx.resolve(c));
        let mut full = format!("cd {} && ", shquote(&cwd.to_string_lossy()));
        let delta = self.env_delta(&ctx, env);
        if !delta.is_empty() {
            full.push_str("export");
            for (k, v) in &delta {
                full.push(' ');
                full.push_str(k);
                full.push('=');
                full.push_str(&shquote(v));
            }
            full.push_str(" && ");
        }
        full.push_str(&format!("( {} )", line));
        if merge_stderr {
            full.push_str(" 2>&1");
        }
        Ok(full)
    }

    /// The detached form of `line`: `cd <cwd> && nohup <line> >out 2>err </dev/null`.
    pub fn nohup_line(
        &self,
        line: &str,
        cwd: &Path,
        stdout: Option<&Path>,
        stderr: Option<&Path>,
        append: bool,
    ) -> Result<String> {
        let ctx = self.context()?;
        let cwd = ctx.resolve(cwd);
        let out = stdout.map_or_else(|| "/dev/null".to_string(), |p| shquote(&p.to_string_lossy()));
        let redirect = if append { ">>" } else { ">" };
        let err = match stderr {
            Some(p) => format!("2{}{}", redirect, shquote(&p.to_string_lossy())),
            None => "2>&1".to_string(),
        };
        let mut full = format!("cd {} && ", shquote(&cwd.to_string_lossy()));
        let delta = self.env_delta(&ctx, &BTreeMap::new());
        if !delta.is_empty() {
            full.push_str("env ");
            for (k, v) in &delta {
                full.push_str(&shquote(&format!("{}={}", k, v)));
                full.push(' ');
            }
        }
        full.push_str(&format!("nohup {} {}{} {} </dev/null", line, redirect, out, err));
        Ok(full)
    }

    /// `mktemp -d` in the remote temp directory.
    pub fn mktemp_dir(&self) -> Result<String> {
        let out = self.run("mktemp -d", 0)?;
        let path = out.stdout.trim().to_string();
        if path.is_empty() {
            return Err(Error::Session(format!("mktemp printed nothing on {}", self.host)));
        }
        Ok(path)
    }
}

/// Keys reach the remote shell unquoted, so only shell identifiers pass.
fn check_env_key(key: &str) -> Result<()> {
    let mut chars = key.chars();
    let valid = chars
        .next()
        .map_or(false, |c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!("invalid environment variable name: {:?}", key)))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::process::{LocalChild, PipeReader, Process};
    use crate::session::SessionOptions;
    use std::io::Write;
    use std::process::{Command as OsCommand, Stdio};

    fn state() -> RemoteState {
        let mut child = OsCommand::new("sh")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let stdin = child.stdin.take().map(|s| Box::new(s) as Box<dyn Write + Send>);
        let stdout = child.stdout.take().map(PipeReader::Stdout);
        let stderr = child.stderr.take().map(PipeReader::Stderr);
        let process = Process::new(vec!["sh".into()], Box::new(LocalChild::new(child)), stdin, stdout, stderr);
        let session = ShellSession::new(process, SessionOptions::default()).unwrap();
        RemoteState::connect("loopback", session).unwrap()
    }

    #[test]
    fn test_connect_probes_context() {
        let state = state();
        let ctx = state.context().unwrap();
        assert!(ctx.cwd.is_absolute());
        assert!(ctx.get_env("PATH").is_some());
        assert!(!state.uname().is_empty());
    }

    #[test]
    fn test_which_through_session() {
        let state = state();
        assert!(state.which("sh").unwrap().ends_with("/sh"));
        assert!(matches!(
            state.which("definitely_not_a_real_cmd_xyz"),
            Err(Error::CommandNotFound { .. })
        ));
    }

    #[test]
    fn test_env_changes_reach_the_shell_and_the_delta() {
        let state = state();
        state.set_env("PW_REMOTE", "a b").unwrap();
        let out = state.run("echo $PW_REMOTE", 0).unwrap();
        assert_eq!(out.stdout, "a b\n");

        let line = state
            .command_line(&["true".to_string()], Some(Path::new("/tmp")), &BTreeMap::new(), false)
            .unwrap();
        assert_eq!(line, "cd /tmp && env 'PW_REMOTE=a b' true");

        state.unset_env("PW_REMOTE").unwrap();
        let line = state
            .command_line(&["true".to_string()], Some(Path::new("/tmp")), &BTreeMap::new(), true)
            .unwrap();
        assert_eq!(line, "cd /tmp && true 2>&1");
    }

    #[test]
    fn test_env_key_must_be_an_identifier() {
        let state = state();
        for key in ["", "1ABC", "A-B", "X;touch /tmp/pw", "A B", "A=B"] {
            assert!(
                matches!(state.set_env(key, "v"), Err(Error::InvalidArgument(_))),
                "accepted {:?}",
                key
            );
            assert!(matches!(state.unset_env(key), Err(Error::InvalidArgument(_))));
        }
        state.set_env("_PW_OK9", "v").unwrap();
        assert_eq!(state.context().unwrap().get_env("_PW_OK9"), Some("v"));
    }

    #[test]
    fn test_chdir_and_restore() {
        let state = state();
        let saved = state.context().unwrap();
        state.chdir(Path::new("/")).unwrap();
        assert_eq!(state.context().unwrap().cwd, PathBuf::from("/"));
        state.set_env("PW_RESTORE", "1").unwrap();
        state.restore(saved.clone()).unwrap();
        let now = state.context().unwrap();
        assert_eq!(now.cwd, saved.cwd);
        assert!(now.get_env("PW_RESTORE").is_none());
    }

    #[test]
    fn test_nohup_line() {
        let state = state();
        let line = state
            .nohup_line("sleep 1", Path::new("/tmp"), Some(Path::new("out.log")), None, true)
            .unwrap();
        assert_eq!(line, "cd /tmp && nohup sleep 1 >>out.log 2>&1 </dev/null");
    }
}
