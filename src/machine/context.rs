//! Per-machine execution context and scoped overrides.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::warn;

use super::Machine;
use crate::error::Result;

/// Working directory and environment used for commands that carry no
/// bindings of their own.
///
/// Each machine owns one. Commands that need isolation from other threads
/// should bind `cwd`/`env` on the command itself instead of changing this.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecContext {
    /// Current working directory.
    pub cwd: PathBuf,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
}

impl ExecContext {
    /// Snapshot of this process's working directory and environment.
    pub fn from_process() -> Result<Self> {
        Ok(Self {
            cwd: std::env::current_dir()?,
            env: std::env::vars().collect(),
        })
    }

    /// Get a specific environment variable.
    pub fn get_env(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.insert(key.into(), value.into());
    }

    pub fn remove_env(&mut self, key: &str) -> Option<String> {
        self.env.remove(key)
    }

    /// Merge variables, overwriting existing ones.
    pub fn merge_env<I, K, V>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
    }

    /// `path` resolved against the working directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.cwd.join(path)
        }
    }

    /// Variables in `self` that differ from (or are missing in) `base`.
    pub fn env_delta(&self, base: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        self.env
            .iter()
            .filter(|(k, v)| base.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Restores a machine's saved context when dropped.
///
/// ```no_run
/// use pipewright::machine::{local, ContextGuard, Machine};
///
/// let machine: Machine = local();
/// {
///     let _guard = ContextGuard::cwd(&machine, "/tmp")?;
///     // commands on `machine` now default to /tmp
/// }
/// // back to the previous directory
/// # Ok::<(), pipewright::Error>(())
/// ```
#[must_use = "the context is restored as soon as the guard is dropped"]
pub struct ContextGuard {
    machine: Machine,
    saved: Option<ExecContext>,
}

impl ContextGuard {
    /// Save the current context without changing it.
    pub fn save(machine: &Machine) -> Result<Self> {
        Ok(Self {
            saved: Some(machine.context()?),
            machine: machine.clone(),
        })
    }

    /// Save, then change the working directory.
    pub fn cwd(machine: &Machine, path: impl AsRef<Path>) -> Result<Self> {
        let guard = Self::save(machine)?;
        machine.chdir(path.as_ref())?;
        Ok(guard)
    }

    /// Save, then set environment variables.
    pub fn env<I, K, V>(machine: &Machine, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let guard = Self::save(machine)?;
        for (k, v) in vars {
            machine.set_env(k.as_ref(), v.as_ref())?;
        }
        Ok(guard)
    }

    /// The context that will be restored.
    pub fn saved(&self) -> Option<&ExecContext> {
        self.saved.as_ref()
    }

    /// Restore now and report failures.
    pub fn restore(mut self) -> Result<()> {
        match self.saved.take() {
            Some(ctx) => self.machine.restore_context(ctx),
            None => Ok(()),
        }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if let Some(ctx) = self.saved.take() {
            if let Err(e) = self.machine.restore_context(ctx) {
                warn!("failed to restore context on {}: {}", self.machine.name(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ExecContext {
        let mut ctx = ExecContext {
            cwd: PathBuf::from("/home/user"),
            env: BTreeMap::new(),
        };
        ctx.set_env("PATH", "/usr/bin");
        ctx.set_env("HOME", "/home/user");
        ctx
    }

    #[test]
    fn test_env_accessors() {
        let mut ctx = ctx();
        assert_eq!(ctx.get_env("PATH"), Some("/usr/bin"));
        assert_eq!(ctx.get_env("NONEXISTENT"), None);
        assert_eq!(ctx.remove_env("PATH"), Some("/usr/bin".to_string()));
        assert_eq!(ctx.get_env("PATH"), None);
        ctx.merge_env([("A", "1"), ("HOME", "/root")]);
        assert_eq!(ctx.get_env("HOME"), Some("/root"));
        assert_eq!(ctx.get_env("A"), Some("1"));
    }

    #[test]
    fn test_resolve() {
        let ctx = ctx();
        assert_eq!(ctx.resolve(Path::new("src")), PathBuf::from("/home/user/src"));
        assert_eq!(ctx.resolve(Path::new("/etc")), PathBuf::from("/etc"));
    }

    #[test]
    fn test_env_delta() {
        let base = ctx().env;
        let mut current = ctx();
        current.set_env("HOME", "/root");
        current.set_env("NEW", "x");
        let delta = current.env_delta(&base);
        assert_eq!(delta.len(), 2);
        assert_eq!(delta.get("HOME").map(String::as_str), Some("/root"));
        assert!(!delta.contains_key("PATH"));
    }
}
