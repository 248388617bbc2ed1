//! `pw` binary entry point.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use pipewright::cli::{self, Args};
use pipewright::config::Config;
use pipewright::execution::{Tee, TEE};
use pipewright::machine::{LocalMachine, SshMachine, SshOptions};
use pipewright::{logging, Command, Error};
use tracing::{debug, error};

/// Exit status when the program exceeds its deadline, as `timeout(1)` uses.
const TIMEOUT_EXIT: u8 = 124;
/// Exit status when the program cannot be found, as shells use.
const NOT_FOUND_EXIT: u8 = 127;
const USAGE_EXIT: u8 = 2;

fn main() -> ExitCode {
    let args = match cli::parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("pw: {}", e);
            eprintln!("Try 'pw --help' for more information.");
            return ExitCode::from(USAGE_EXIT);
        }
    };

    if args.help {
        cli::print_help();
        return ExitCode::SUCCESS;
    }
    if args.version {
        cli::print_version();
        return ExitCode::SUCCESS;
    }

    let config = match Config::load(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("pw: {}", e);
            return ExitCode::from(USAGE_EXIT);
        }
    };
    let _ = logging::init_with_level(config.log_filter());

    let Some(program) = args.program.as_deref() else {
        eprintln!("pw: no program given");
        eprintln!("Try 'pw --help' for more information.");
        return ExitCode::from(USAGE_EXIT);
    };

    match run(&args, &config, program) {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(e) => {
            error!("{}", e);
            eprintln!("pw: {}", e);
            ExitCode::from(exit_status(&e))
        }
    }
}

/// Exit status reported for a failure.
fn exit_status(err: &Error) -> u8 {
    match err {
        Error::Timeout { .. } | Error::LineTimeout { .. } => TIMEOUT_EXIT,
        Error::CommandNotFound { .. } => NOT_FOUND_EXIT,
        Error::Execution(failure) => match failure.retcode {
            Some(code) if (1..=255).contains(&code) => code as u8,
            _ => 1,
        },
        _ => 1,
    }
}

fn build_command(args: &Args, config: &Config, program: &str) -> pipewright::Result<Command> {
    let cmd = match &args.host {
        Some(host) => {
            let mut options = SshOptions::from_config(host.as_str(), config);
            if let Some(user) = &args.user {
                options = options.user(user.as_str());
            }
            if let Some(port) = args.port {
                options = options.port(port);
            }
            if let Some(identity) = &args.identity {
                options = options.keyfile(identity.as_path());
            }
            debug!("connecting to {}", options.destination());
            SshMachine::connect(options)?.command(program)?
        }
        None => Arc::new(LocalMachine::from_config(config)?).command(program)?,
    };

    let mut cmd = cmd.bind(&args.args);
    if !args.env.is_empty() {
        cmd = cmd.with_envs(args.env.iter().cloned());
    }
    if let Some(cwd) = &args.cwd {
        cmd = cmd.with_cwd(cwd.as_path());
    }
    Ok(cmd)
}

fn run(args: &Args, config: &Config, program: &str) -> pipewright::Result<i32> {
    let cmd = build_command(args, config, program)?;
    let mut tee = Tee {
        retcode: args.retcode(),
        buffered: false,
        ..TEE
    };
    if let Some(secs) = config.execution.timeout_secs {
        tee = tee.timeout(Duration::from_secs(secs));
    }
    debug!("running {}", cmd);
    Ok((&cmd & tee)?.retcode)
}
