//! Sessions and remote machines, exercised without a network.
//!
//! The ssh client is replaced by a small script that runs everything
//! after `--` with `/bin/sh -c`, or an interactive `/bin/sh` otherwise.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use pipewright::execution::{RETCODE, TEE};
use pipewright::machine::{ChannelMachine, LoopbackTransport, SshMachine, SshOptions};
use pipewright::{local, Backend, Error, Machine};

const FAKE_SSH: &str = r#"#!/bin/sh
while [ $# -gt 0 ]; do
    if [ "$1" = "--" ]; then
        shift
        exec /bin/sh -c "$*"
    fi
    shift
done
exec /bin/sh
"#;

fn fake_ssh() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ssh");
    fs::write(&path, FAKE_SSH).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    (dir, path)
}

fn ssh_machine() -> (TempDir, Arc<SshMachine>) {
    let (dir, path) = fake_ssh();
    let mut options = SshOptions::new("fakehost").user("tester").port(2222);
    options.ssh_command = path.to_string_lossy().into_owned();
    options.connect_timeout = Duration::from_secs(5);
    (dir, SshMachine::connect(options).unwrap())
}

// ============================================================================
// Shell sessions
// ============================================================================

#[test]
fn test_session_close_is_idempotent() {
    let mut session = local().session(false).unwrap();
    assert!(session.startup_output().is_some());
    let out = session.run("echo hi; echo there >&2", 0).unwrap();
    assert_eq!(out.stdout, "hi\n");
    assert_eq!(out.stderr, "there\n");
    session.close();
    session.close();
    assert!(!session.alive());
    assert!(matches!(session.run("echo again", 0), Err(Error::Session(_))));
}

#[test]
fn test_session_keeps_state() {
    let scratch = tempfile::tempdir().unwrap();
    let mut session = local().session(false).unwrap();
    session
        .run(&format!("cd {}", pipewright::shquote(&scratch.path().to_string_lossy())), 0)
        .unwrap();
    session.run("export MARK=kept", 0).unwrap();
    let out = session.run("pwd; echo $MARK", 0).unwrap();
    let mut lines = out.stdout.lines();
    assert_eq!(
        fs::canonicalize(lines.next().unwrap()).unwrap(),
        fs::canonicalize(scratch.path()).unwrap()
    );
    assert_eq!(lines.next(), Some("kept"));
    let echo = local().command("echo").unwrap().bind(["it's", "$MARK"]);
    assert_eq!(session.run_command(&echo, 0).unwrap().stdout, "it's $MARK\n");
    let failed = session.run("false", 0).unwrap_err();
    assert_eq!(failed.execution().unwrap().retcode, Some(1));
    session.close();
}

#[test]
#[ignore = "depends on terminal echo timing"]
fn test_pty_session_runs_commands() {
    let mut session = local().session(true).unwrap();
    let out = session.run("echo from-a-pty", 0).unwrap();
    assert!(out.stdout.contains("from-a-pty"));
    assert!(!out.stdout.contains('\r'));
    session.close();
    assert!(!session.alive());
}

// ============================================================================
// ssh client machine
// ============================================================================

#[test]
fn test_ssh_machine_runs_commands() {
    let (_dir, machine) = ssh_machine();
    assert_eq!(machine.name(), "tester@fakehost");
    assert_eq!(machine.quote_level(), 1);
    assert!(!machine.supports_native_pipelines());

    let echo = machine.command("/bin/echo").unwrap().bind(["two words", "$HOME"]);
    assert_eq!(echo.call().unwrap(), "two words $HOME\n");

    let sh = machine.command("/bin/sh").unwrap().bind(["-c", "exit 6"]);
    assert_eq!((&sh & RETCODE).unwrap(), 6);
    machine.close().unwrap();
}

#[test]
fn test_ssh_pipeline_is_flattened() {
    let (_dir, machine) = ssh_machine();
    let printf = machine.command("/usr/bin/printf").unwrap().arg("a\\nb\\nc\\n");
    let wc = machine.command("/usr/bin/wc").unwrap().arg("-l");
    let pipeline = printf.pipe(&wc);
    assert_eq!(pipeline.call().unwrap().trim(), "3");
    machine.close().unwrap();
}

#[test]
fn test_ssh_env_and_cwd_follow_the_session() {
    let (_dir, machine) = ssh_machine();
    let scratch = tempfile::tempdir().unwrap();
    machine.chdir(scratch.path()).unwrap();
    machine.set_env("PW_MARK", "remote value").unwrap();

    let sh = machine.command("/bin/sh").unwrap().bind(["-c", "pwd; echo \"$PW_MARK\""]);
    let out = sh.call().unwrap();
    let mut lines = out.lines();
    assert_eq!(
        fs::canonicalize(lines.next().unwrap()).unwrap(),
        fs::canonicalize(scratch.path()).unwrap()
    );
    assert_eq!(lines.next(), Some("remote value"));

    let session = machine.session_run("echo $PW_MARK", 0).unwrap();
    assert_eq!(session.stdout, "remote value\n");
    machine.close().unwrap();
}

#[test]
fn test_ssh_connect_failure() {
    let mut options = SshOptions::new("nowhere");
    options.ssh_command = "false".to_string();
    options.connect_timeout = Duration::from_secs(2);
    assert!(SshMachine::connect(options).is_err());
}

// ============================================================================
// Channel machine over the loopback transport
// ============================================================================

#[test]
fn test_loopback_channel_machine() {
    let machine = ChannelMachine::connect(LoopbackTransport::new(), Duration::from_secs(5)).unwrap();
    assert!(machine.supports_native_pipelines());
    assert!(!machine.uname().is_empty());

    let printf = machine.command("/usr/bin/printf").unwrap().arg("x\\ny\\n");
    let wc = machine.command("/usr/bin/wc").unwrap().arg("-l");
    let done = (&printf.pipe(&wc) & TEE.unbuffered()).unwrap();
    assert_eq!(done.retcode, 0);
    assert_eq!(printf.pipe(&wc).call().unwrap().trim(), "2");

    let scratch = tempfile::tempdir().unwrap();
    let src = scratch.path().join("src.txt");
    fs::write(&src, "payload").unwrap();
    let dst = scratch.path().join("dst.txt");
    machine.upload(&src, &dst.to_string_lossy()).unwrap();
    assert_eq!(fs::read_to_string(&dst).unwrap(), "payload");
    let names = machine.listdir(&scratch.path().to_string_lossy()).unwrap();
    assert!(names.contains(&"dst.txt".to_string()));
    assert_eq!(machine.stat(&dst.to_string_lossy()).unwrap().size, 7);
    machine.close().unwrap();
}

#[test]
fn test_mixed_machines_in_one_pipeline() {
    let channel = ChannelMachine::connect(LoopbackTransport::new(), Duration::from_secs(5)).unwrap();
    let remote: Machine = channel.clone();
    let echo = pipewright::machine::command(&remote, "/bin/echo").unwrap().arg("from afar");
    let tr = local().command("tr").unwrap().bind(["a-z", "A-Z"]);
    assert_eq!(echo.pipe(&tr).call().unwrap(), "FROM AFAR\n");
    channel.close().unwrap();
}

#[test]
fn test_channel_machine_tunnels_tcp() {
    use std::io::{Read, Write};
    use std::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = std::thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        conn.write_all(b"tunnelled").unwrap();
    });

    let machine = ChannelMachine::connect(LoopbackTransport::new(), Duration::from_secs(5)).unwrap();
    let mut chan = machine.connect_sock(port, "127.0.0.1").unwrap();
    let mut buf = String::new();
    chan.take_stdout().unwrap().read_to_string(&mut buf).unwrap();
    assert_eq!(buf, "tunnelled");
    server.join().unwrap();
    chan.close().unwrap();
    machine.close().unwrap();
}
