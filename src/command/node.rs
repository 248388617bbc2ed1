//! The command expression tree.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use super::{Arg, Input, Output, StreamKind};
use crate::error::{Error, Result};
use crate::machine::Machine;
use crate::quoting::shquote;

/// An immutable, cheaply cloneable command expression.
///
/// Every builder method returns a new `Command` and leaves `self`
/// untouched; sub-trees are shared.
#[derive(Clone)]
pub struct Command {
    node: Arc<Node>,
}

#[derive(Debug)]
pub(crate) enum Node {
    /// A resolved program on a machine.
    Atomic { executable: String, machine: Machine },
    /// An atomic command with positional arguments.
    Bound { base: Command, args: Vec<Arg> },
    /// Environment and working directory bound to a command.
    Env {
        base: Command,
        env: BTreeMap<String, String>,
        cwd: Option<PathBuf>,
    },
    /// Two or more stages, stdout of each feeding stdin of the next.
    Pipeline(Vec<Command>),
    /// Standard streams pointed at files, data, or handles.
    Redirection {
        inner: Command,
        stdin: Option<Input>,
        stdout: Option<Output>,
        stderr: Option<Output>,
    },
    /// Members spawned together; fails if any member fails.
    Concurrent(Vec<Command>),
}

/// Shape of a command node, for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Atomic,
    Bound,
    Env,
    Pipeline,
    Redirection,
    Concurrent,
}

/// Everything needed to spawn a single program.
#[derive(Debug, Clone)]
pub(crate) struct Leaf {
    pub machine: Machine,
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

#[derive(Default)]
struct Slots {
    stdin: Option<Input>,
    stdout: Option<Output>,
    stderr: Option<Output>,
}

impl Command {
    fn from_node(node: Node) -> Self {
        Self {
            node: Arc::new(node),
        }
    }

    /// A resolved program on `machine`.
    ///
    /// Machines hand these out through their `command` factories; building
    /// one directly skips the search-path lookup.
    pub fn atomic(executable: impl Into<String>, machine: Machine) -> Self {
        Self::from_node(Node::Atomic {
            executable: executable.into(),
            machine,
        })
    }

    pub(crate) fn node(&self) -> &Node {
        &self.node
    }

    /// Shape of the outermost node.
    pub fn kind(&self) -> NodeKind {
        match &*self.node {
            Node::Atomic { .. } => NodeKind::Atomic,
            Node::Bound { .. } => NodeKind::Bound,
            Node::Env { .. } => NodeKind::Env,
            Node::Pipeline(_) => NodeKind::Pipeline,
            Node::Redirection { .. } => NodeKind::Redirection,
            Node::Concurrent(_) => NodeKind::Concurrent,
        }
    }

    /// Stages of a pipeline or members of a concurrent group.
    pub fn parts(&self) -> &[Command] {
        match &*self.node {
            Node::Pipeline(parts) | Node::Concurrent(parts) => parts,
            _ => &[],
        }
    }

    /// Machine this command runs on (the first stage's, for composites).
    pub fn machine(&self) -> Machine {
        match &*self.node {
            Node::Atomic { machine, .. } => machine.clone(),
            Node::Bound { base, .. } | Node::Env { base, .. } => base.machine(),
            Node::Redirection { inner, .. } => inner.machine(),
            Node::Pipeline(parts) | Node::Concurrent(parts) => parts[0].machine(),
        }
    }

    /// The program path of the underlying atomic command, if this is a
    /// plain command.
    pub fn executable(&self) -> Option<&str> {
        match &*self.node {
            Node::Atomic { executable, .. } => Some(executable),
            Node::Bound { base, .. } | Node::Env { base, .. } => base.executable(),
            _ => None,
        }
    }

    /// Bind positional arguments.
    ///
    /// Binding a bound command concatenates the argument lists. Binding a
    /// pipeline binds its last stage, binding a redirection binds the
    /// redirected command, and binding a concurrent group binds every
    /// member. An empty argument list returns the command unchanged.
    pub fn bind<I>(&self, args: I) -> Command
    where
        I: IntoIterator,
        I::Item: Into<Arg>,
    {
        let args: Vec<Arg> = args.into_iter().map(Into::into).collect();
        if args.is_empty() {
            return self.clone();
        }
        self.bind_args(args)
    }

    /// Bind a single argument.
    pub fn arg(&self, arg: impl Into<Arg>) -> Command {
        self.bind_args(vec![arg.into()])
    }

    fn bind_args(&self, args: Vec<Arg>) -> Command {
        match &*self.node {
            Node::Atomic { .. } => Self::from_node(Node::Bound {
                base: self.clone(),
                args,
            }),
            Node::Bound { base, args: bound } => {
                let mut joined = bound.clone();
                joined.extend(args);
                Self::from_node(Node::Bound {
                    base: base.clone(),
                    args: joined,
                })
            }
            Node::Env { base, env, cwd } => Self::from_node(Node::Env {
                base: base.bind_args(args),
                env: env.clone(),
                cwd: cwd.clone(),
            }),
            Node::Pipeline(stages) => {
                let mut stages = stages.clone();
                if let Some(last) = stages.last_mut() {
                    *last = last.bind_args(args);
                }
                Self::from_node(Node::Pipeline(stages))
            }
            Node::Redirection {
                inner,
                stdin,
                stdout,
                stderr,
            } => Self::from_node(Node::Redirection {
                inner: inner.bind_args(args),
                stdin: stdin.clone(),
                stdout: stdout.clone(),
                stderr: stderr.clone(),
            }),
            Node::Concurrent(members) => Self::from_node(Node::Concurrent(
                members.iter().map(|m| m.bind_args(args.clone())).collect(),
            )),
        }
    }

    /// Pipe this command's stdout into `next`.
    ///
    /// Nested pipelines on either side are flattened.
    pub fn pipe(&self, next: &Command) -> Command {
        let mut stages = Vec::new();
        for side in [self, next] {
            match &*side.node {
                Node::Pipeline(inner) => stages.extend(inner.iter().cloned()),
                _ => stages.push(side.clone()),
            }
        }
        Self::from_node(Node::Pipeline(stages))
    }

    /// Run this command and `other` together as one group.
    ///
    /// Nested groups on either side are flattened.
    pub fn concurrently(&self, other: &Command) -> Command {
        let mut members = Vec::new();
        for side in [self, other] {
            match &*side.node {
                Node::Concurrent(inner) => members.extend(inner.iter().cloned()),
                _ => members.push(side.clone()),
            }
        }
        Self::from_node(Node::Concurrent(members))
    }

    /// Set an environment variable for this command.
    pub fn with_env(&self, key: impl Into<String>, value: impl Into<String>) -> Command {
        let mut vars = BTreeMap::new();
        vars.insert(key.into(), value.into());
        self.with_envs(vars)
    }

    /// Set several environment variables for this command.
    pub fn with_envs<I, K, V>(&self, vars: I) -> Command
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars = vars.into_iter().map(|(k, v)| (k.into(), v.into()));
        match &*self.node {
            Node::Env { base, env, cwd } => {
                let mut env = env.clone();
                env.extend(vars);
                Self::from_node(Node::Env {
                    base: base.clone(),
                    env,
                    cwd: cwd.clone(),
                })
            }
            _ => Self::from_node(Node::Env {
                base: self.clone(),
                env: vars.collect(),
                cwd: None,
            }),
        }
    }

    /// Run this command in `cwd`.
    pub fn with_cwd(&self, cwd: impl Into<PathBuf>) -> Command {
        match &*self.node {
            Node::Env { base, env, .. } => Self::from_node(Node::Env {
                base: base.clone(),
                env: env.clone(),
                cwd: Some(cwd.into()),
            }),
            _ => Self::from_node(Node::Env {
                base: self.clone(),
                env: BTreeMap::new(),
                cwd: Some(cwd.into()),
            }),
        }
    }

    fn redirected(&self, set: impl FnOnce(&mut Slots) -> Result<()>) -> Result<Command> {
        let (inner, mut slots) = match &*self.node {
            Node::Redirection {
                inner,
                stdin,
                stdout,
                stderr,
            } => (
                inner.clone(),
                Slots {
                    stdin: stdin.clone(),
                    stdout: stdout.clone(),
                    stderr: stderr.clone(),
                },
            ),
            _ => (self.clone(), Slots::default()),
        };
        set(&mut slots)?;
        Ok(Self::from_node(Node::Redirection {
            inner,
            stdin: slots.stdin,
            stdout: slots.stdout,
            stderr: slots.stderr,
        }))
    }

    /// Point stdin at `source`.
    pub fn redirect_in(&self, source: impl Into<Input>) -> Result<Command> {
        let source = source.into();
        self.redirected(|slots| {
            if slots.stdin.is_some() {
                return Err(Error::Redirection(StreamKind::Stdin));
            }
            slots.stdin = Some(source);
            Ok(())
        })
    }

    /// Feed `data` to stdin.
    pub fn stdin_data(&self, data: impl Into<Vec<u8>>) -> Result<Command> {
        self.redirect_in(Input::Data(data.into()))
    }

    /// Point stdout at `target`.
    pub fn redirect_out(&self, target: impl Into<Output>) -> Result<Command> {
        let target = target.into();
        if matches!(target, Output::Stdout) {
            return Err(Error::InvalidArgument(
                "stdout cannot be merged into itself".into(),
            ));
        }
        self.redirected(|slots| {
            if slots.stdout.is_some() {
                return Err(Error::Redirection(StreamKind::Stdout));
            }
            slots.stdout = Some(target);
            Ok(())
        })
    }

    /// Append stdout to the file at `path`.
    pub fn redirect_append(&self, path: impl Into<PathBuf>) -> Result<Command> {
        self.redirect_out(Output::Append(path.into()))
    }

    /// Point stderr at `target`.
    pub fn redirect_err(&self, target: impl Into<Output>) -> Result<Command> {
        let target = target.into();
        self.redirected(|slots| {
            if slots.stderr.is_some() {
                return Err(Error::Redirection(StreamKind::Stderr));
            }
            slots.stderr = Some(target);
            Ok(())
        })
    }

    /// Merge stderr into stdout (`2>&1`).
    pub fn err_to_out(&self) -> Result<Command> {
        self.redirect_err(Output::Stdout)
    }

    /// Render into tokens at quoting depth `level`.
    pub fn formulate(&self, level: usize) -> Vec<String> {
        self.formulate_with(level, &[])
    }

    fn formulate_with(&self, level: usize, extra: &[Arg]) -> Vec<String> {
        match &*self.node {
            Node::Atomic {
                executable,
                machine,
            } => {
                let quote_level = machine.quote_level();
                let mut argv = vec![executable.clone()];
                for arg in extra {
                    arg.render(level, quote_level, &mut argv);
                }
                argv
            }
            Node::Bound { base, args } => {
                if extra.is_empty() {
                    base.formulate_with(level + 1, args)
                } else {
                    let mut all = args.clone();
                    all.extend(extra.iter().cloned());
                    base.formulate_with(level + 1, &all)
                }
            }
            Node::Env { base, .. } => base.formulate_with(level, extra),
            Node::Pipeline(stages) => {
                let mut tokens = Vec::new();
                let last = stages.len() - 1;
                for (i, stage) in stages.iter().enumerate() {
                    if i > 0 {
                        tokens.push("|".to_string());
                    }
                    if i == last {
                        tokens.extend(stage.formulate_with(level + 1, extra));
                    } else {
                        tokens.extend(stage.formulate(level + 1));
                    }
                }
                tokens
            }
            Node::Redirection {
                inner,
                stdin,
                stdout,
                stderr,
            } => {
                let mut tokens = Vec::new();
                if let Some(Input::Data(data)) = stdin {
                    tokens.push("echo".to_string());
                    tokens.push(shquote(&String::from_utf8_lossy(data)));
                    tokens.push("|".to_string());
                }
                tokens.extend(inner.formulate_with(level + 1, extra));
                if let Some(stdin) = stdin {
                    tokens.extend(stdin.display_tokens());
                }
                if let Some(stdout) = stdout {
                    tokens.extend(stdout.display_tokens(StreamKind::Stdout));
                }
                if let Some(stderr) = stderr {
                    tokens.extend(stderr.display_tokens(StreamKind::Stderr));
                }
                tokens
            }
            Node::Concurrent(members) => {
                let mut tokens = vec!["(".to_string()];
                for (i, member) in members.iter().enumerate() {
                    if i > 0 {
                        tokens.push("&".to_string());
                    }
                    tokens.extend(member.formulate_with(level, extra));
                }
                tokens.push(")".to_string());
                tokens
            }
        }
    }

    /// One command line for a POSIX shell on this command's machine, with
    /// every argument quoted.
    pub fn shell_line(&self) -> String {
        let level = self.machine().quote_level().saturating_sub(1);
        self.formulate(level).join(" ")
    }

    /// Resolve a plain command (atomic, bound, or env-bound) into the
    /// parts needed to spawn it. Outer env bindings win over inner ones.
    pub(crate) fn leaf(&self) -> Option<Leaf> {
        let mut env = BTreeMap::new();
        let mut cwd = None;
        let mut current = self;
        loop {
            match &*current.node {
                Node::Env {
                    base,
                    env: bound,
                    cwd: bound_cwd,
                } => {
                    for (k, v) in bound {
                        env.entry(k.clone()).or_insert_with(|| v.clone());
                    }
                    if cwd.is_none() {
                        cwd = bound_cwd.clone();
                    }
                    current = base;
                }
                Node::Atomic { machine, .. } => {
                    return Some(Leaf {
                        machine: machine.clone(),
                        argv: self.formulate(0),
                        env,
                        cwd,
                    });
                }
                Node::Bound { base, .. } => current = base,
                _ => return None,
            }
        }
    }

    /// Whether two commands share the same underlying node.
    pub fn ptr_eq(&self, other: &Command) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.formulate(0).join(" "))
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("kind", &self.kind())
            .field("machine", &self.machine().name())
            .field("argv", &self.formulate(0))
            .finish()
    }
}

impl From<PathBuf> for Input {
    fn from(path: PathBuf) -> Self {
        Input::File(path)
    }
}

impl From<&str> for Input {
    fn from(path: &str) -> Self {
        Input::File(path.into())
    }
}

impl From<&std::path::Path> for Input {
    fn from(path: &std::path::Path) -> Self {
        Input::File(path.to_path_buf())
    }
}

impl From<PathBuf> for Output {
    fn from(path: PathBuf) -> Self {
        Output::File(path)
    }
}

impl From<&str> for Output {
    fn from(path: &str) -> Self {
        Output::File(path.into())
    }
}

impl From<&std::path::Path> for Output {
    fn from(path: &std::path::Path) -> Self {
        Output::File(path.to_path_buf())
    }
}
