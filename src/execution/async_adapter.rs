//! Async adapters over the blocking engine.
//!
//! Plain local commands run on `tokio::process`; everything else runs on
//! the blocking pool so the tokio runtime is never stalled.

use std::collections::BTreeMap;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::result::{Completed, OutputLine};
use super::run::RunOptions;
use super::spawn::{popen, PopenOptions};
use crate::command::{Command, Input, Output};
use crate::error::{Error, Result};
use crate::process::{LinesOptions, Process};

fn join_error(err: tokio::task::JoinError) -> Error {
    Error::Io(Arc::new(io::Error::other(err)))
}

/// Whether `options` leave every stream piped, so the run can be served
/// by `tokio::process`.
fn all_piped(options: &PopenOptions) -> bool {
    matches!(options.stdin, Input::Pipe)
        && matches!(options.stdout, Output::Pipe)
        && matches!(options.stderr, Output::Pipe)
        && !options.new_session
}

/// Run `cmd` to completion without blocking the runtime.
///
/// Behaves like [`Command::run_with`]: the exit code is checked and a
/// timeout kills the process before [`Error::Timeout`] is returned.
pub async fn async_run(cmd: &Command, options: RunOptions) -> Result<Completed> {
    if let Some(leaf) = cmd.leaf() {
        if !leaf.machine.is_remote() && all_piped(&options.popen) {
            return run_tokio(leaf.machine.as_ref(), &leaf.argv, leaf.env, leaf.cwd, options).await;
        }
    }
    let cmd = cmd.clone();
    tokio::task::spawn_blocking(move || cmd.run_with(options))
        .await
        .map_err(join_error)?
}

async fn run_tokio(
    machine: &dyn crate::machine::Backend,
    argv: &[String],
    env: BTreeMap<String, String>,
    cwd: Option<std::path::PathBuf>,
    options: RunOptions,
) -> Result<Completed> {
    let ctx = machine.context()?;
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| Error::InvalidArgument("empty argv".into()))?;
    let cwd = options.popen.cwd.as_deref().or(cwd.as_deref()).map_or_else(|| ctx.cwd.clone(), |p| ctx.resolve(p));

    let start = Instant::now();
    let mut child = tokio::process::Command::new(program)
        .args(args)
        .env_clear()
        .envs(&ctx.env)
        .envs(&env)
        .envs(&options.popen.env)
        .current_dir(&cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::CommandNotFound {
                program: program.clone(),
                path: ctx
                    .get_env("PATH")
                    .map(|p| std::env::split_paths(p).collect())
                    .unwrap_or_default(),
            },
            _ => Error::from(e),
        })?;
    debug!("spawned {:?} on the tokio runtime", argv);

    if let Some(mut stdin) = child.stdin.take() {
        let input = options.input.unwrap_or_default();
        tokio::spawn(async move {
            if !input.is_empty() {
                let _ = stdin.write_all(&input).await;
            }
        });
    }
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let out_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(s) = stdout.as_mut() {
            s.read_to_end(&mut buf).await?;
        }
        Ok::<_, io::Error>(buf)
    });
    let err_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(s) = stderr.as_mut() {
            s.read_to_end(&mut buf).await?;
        }
        Ok::<_, io::Error>(buf)
    });

    let status = match options.timeout {
        Some(timeout) => match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                debug!("timeout expired for {:?}, killing", argv);
                child.kill().await?;
                return Err(Error::Timeout {
                    argv: argv.to_vec(),
                    timeout,
                });
            }
        },
        None => child.wait().await?,
    };
    let stdout = out_task.await.map_err(join_error)??;
    let stderr = err_task.await.map_err(join_error)??;
    let code = crate::process::exit_code(status);
    let stdout = String::from_utf8_lossy(&stdout).into_owned();
    let stderr = String::from_utf8_lossy(&stderr).into_owned();

    if !options.retcode.accepts(Some(code)) {
        return Err(crate::error::ProcessExecutionError::new(argv.to_vec(), Some(code), stdout, stderr).into());
    }
    Ok(Completed::new(code, stdout, stderr, start.elapsed()))
}

/// Start `cmd` and stream its output lines over a channel.
///
/// Returns the receiving end and a handle resolving to the exit code once
/// the process is done and its code has been checked. Must be called from
/// within a tokio runtime. Dropping the receiver stops the forwarding but
/// the process still runs to completion.
pub fn stream_lines(
    cmd: &Command,
    options: LinesOptions,
) -> Result<(mpsc::Receiver<OutputLine>, JoinHandle<Result<i32>>)> {
    let (tx, rx) = mpsc::channel::<OutputLine>(64);
    let mut process: Process = popen(cmd, PopenOptions::default())?;

    let handle = tokio::task::spawn_blocking(move || {
        let mut forwarding = true;
        for line in process.iter_lines(options) {
            let (kind, text) = line?;
            if forwarding && tx.blocking_send(OutputLine::new(kind, text)).is_err() {
                debug!("line receiver dropped");
                forwarding = false;
            }
        }
        process.wait()
    });
    Ok((rx, handle))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::command::StreamKind;
    use crate::machine::local;
    use std::time::Duration;

    fn cmd(name: &str) -> Command {
        local().command(name).unwrap()
    }

    #[tokio::test]
    async fn test_async_run_local_leaf() {
        let echo = cmd("echo").arg("hi");
        let done = async_run(&echo, RunOptions::default()).await.unwrap();
        assert_eq!(done.stdout, "hi\n");
        assert!(done.success());
    }

    #[tokio::test]
    async fn test_async_run_env_and_input() {
        let sh = cmd("sh").bind(["-c", "read x; echo $x $GREETING"]).with_env("GREETING", "hello");
        let done = async_run(&sh, RunOptions::default().input("abc\n")).await.unwrap();
        assert_eq!(done.stdout, "abc hello\n");
    }

    #[tokio::test]
    async fn test_async_run_pipeline_goes_through_blocking_pool() {
        let pipeline = cmd("printf").arg("a\\nb\\n") | cmd("wc").arg("-l");
        let done = async_run(&pipeline, RunOptions::default()).await.unwrap();
        assert_eq!(done.output_trimmed(), "2");
    }

    #[tokio::test]
    async fn test_async_run_timeout() {
        let sleep = cmd("sleep").arg(10);
        let err = async_run(&sleep, RunOptions::default().timeout(Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_async_run_rejected_code() {
        let sh = cmd("sh").bind(["-c", "exit 2"]);
        let err = async_run(&sh, RunOptions::default()).await.unwrap_err();
        assert_eq!(err.execution().unwrap().retcode, Some(2));
        let done = async_run(&sh, RunOptions::default().retcode(2)).await.unwrap();
        assert_eq!(done.retcode, 2);
    }

    #[tokio::test]
    async fn test_stream_lines() {
        let sh = cmd("sh").bind(["-c", "echo one; echo two >&2; echo three"]);
        let (mut rx, handle) = stream_lines(&sh, LinesOptions::default()).unwrap();
        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        assert_eq!(handle.await.unwrap().unwrap(), 0);
        let stdout: Vec<_> = lines
            .iter()
            .filter(|l| l.stream == StreamKind::Stdout)
            .map(|l| l.text.as_str())
            .collect();
        assert_eq!(stdout, ["one", "three"]);
        assert!(lines.contains(&OutputLine::stderr("two")));
    }

    #[test]
    fn test_async_run_with_block_on() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let done = rt.block_on(async_run(&cmd("true"), RunOptions::default())).unwrap();
        assert_eq!(done.retcode, 0);
        let code = tokio_test::block_on(async {
            let done = async_run(&cmd("true"), RunOptions::default()).await;
            done.map(|d| d.retcode)
        });
        assert_eq!(code.unwrap(), 0);
    }
}
