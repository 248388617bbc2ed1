//! Command-line interface for `pw`.
//!
//! Uses lexopt for minimal binary size overhead.

use std::ffi::OsString;
use std::path::PathBuf;

use thiserror::Error;

use crate::command::Retcode;

/// Command-line arguments.
#[derive(Debug, Clone, Default)]
pub struct Args {
    /// Remote host; the program runs locally when unset.
    pub host: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    /// SSH identity file.
    pub identity: Option<PathBuf>,
    /// Working directory for the program.
    pub cwd: Option<PathBuf>,
    /// Extra environment, in order given.
    pub env: Vec<(String, String)>,
    /// Deadline in seconds.
    pub timeout: Option<u64>,
    /// Accepted exit codes; empty means `0`.
    pub retcodes: Vec<i32>,
    /// Accept any exit code.
    pub any_retcode: bool,
    /// Path to configuration file.
    pub config: Option<PathBuf>,
    /// Log level (error, warn, info, debug, trace).
    pub log_level: Option<String>,
    /// Show version and exit.
    pub version: bool,
    /// Show help and exit.
    pub help: bool,
    /// Program to run.
    pub program: Option<String>,
    /// Arguments for the program, passed through untouched.
    pub args: Vec<String>,
}

impl Args {
    /// The accepted exit codes as a policy.
    pub fn retcode(&self) -> Retcode {
        if self.any_retcode {
            return Retcode::Any;
        }
        match self.retcodes.as_slice() {
            [] => Retcode::Exact(0),
            [code] => Retcode::Exact(*code),
            codes => Retcode::one_of(codes.iter().copied()),
        }
    }
}

/// Parse command-line arguments.
pub fn parse_args() -> Result<Args, ArgsError> {
    parse_args_from(std::env::args_os())
}

fn os_to_string(value: OsString) -> Result<String, ArgsError> {
    value
        .into_string()
        .map_err(|v| ArgsError::InvalidValue("argument", v.to_string_lossy().into_owned()))
}

/// Parse arguments from an iterator (for testing).
pub fn parse_args_from<I>(args: I) -> Result<Args, ArgsError>
where
    I: IntoIterator<Item = OsString>,
{
    use lexopt::prelude::*;

    let mut result = Args::default();
    let mut parser = lexopt::Parser::from_iter(args);

    while let Some(arg) = parser.next()? {
        match arg {
            Short('h') | Long("help") => {
                result.help = true;
            }
            Short('V') | Long("version") => {
                result.version = true;
            }
            Short('H') | Long("host") => {
                result.host = Some(parser.value()?.parse()?);
            }
            Short('u') | Long("user") => {
                result.user = Some(parser.value()?.parse()?);
            }
            Short('p') | Long("port") => {
                let value: String = parser.value()?.parse()?;
                result.port = Some(
                    value
                        .parse()
                        .map_err(|_| ArgsError::InvalidValue("port", value))?,
                );
            }
            Short('i') | Long("identity") => {
                result.identity = Some(parser.value()?.parse()?);
            }
            Short('C') | Long("cwd") => {
                result.cwd = Some(parser.value()?.parse()?);
            }
            Short('e') | Long("env") => {
                let value: String = parser.value()?.parse()?;
                let (key, val) = value
                    .split_once('=')
                    .filter(|(key, _)| !key.is_empty())
                    .ok_or_else(|| ArgsError::InvalidValue("env", value.clone()))?;
                result.env.push((key.to_string(), val.to_string()));
            }
            Short('t') | Long("timeout") => {
                let value: String = parser.value()?.parse()?;
                result.timeout = Some(
                    value
                        .parse()
                        .map_err(|_| ArgsError::InvalidValue("timeout", value))?,
                );
            }
            Short('r') | Long("retcode") => {
                let value: String = parser.value()?.parse()?;
                let code = value
                    .parse()
                    .map_err(|_| ArgsError::InvalidValue("retcode", value))?;
                result.retcodes.push(code);
            }
            Long("any-retcode") => {
                result.any_retcode = true;
            }
            Short('c') | Long("config") => {
                result.config = Some(parser.value()?.parse()?);
            }
            Short('l') | Long("log-level") => {
                result.log_level = Some(parser.value()?.parse()?);
            }
            Value(program) => {
                result.program = Some(os_to_string(program)?);
                for rest in parser.raw_args()? {
                    result.args.push(os_to_string(rest)?);
                }
            }
            _ => return Err(arg.unexpected().into()),
        }
    }

    Ok(result)
}

/// Print help message.
pub fn print_help() {
    let version = env!("CARGO_PKG_VERSION");
    println!(
        r#"pw {version}
Run a program locally or over SSH, echoing its output as it arrives

USAGE:
    pw [OPTIONS] [--] PROGRAM [ARGS...]

OPTIONS:
    -H, --host <HOST>       Run on this host over ssh
    -u, --user <USER>       SSH user
    -p, --port <PORT>       SSH port
    -i, --identity <FILE>   SSH identity file
    -C, --cwd <DIR>         Working directory for the program
    -e, --env <K=V>         Set an environment variable (repeatable)
    -t, --timeout <SECS>    Kill the program after this many seconds
    -r, --retcode <N>       Accepted exit code (repeatable) [default: 0]
        --any-retcode       Accept any exit code
    -c, --config <FILE>     Path to configuration file (JSON)
    -l, --log-level <LVL>   Log level (error, warn, info, debug, trace)
    -h, --help              Print help
    -V, --version           Print version

ENVIRONMENT VARIABLES:
    PIPEWRIGHT_TIMEOUT      Default timeout in seconds (overrides config)
    PIPEWRIGHT_SSH          ssh client command (overrides config)
    PIPEWRIGHT_SHELL        Shell for sessions (overrides config)
    PIPEWRIGHT_LOG_LEVEL    Log level (overrides config)
    RUST_LOG                Alternative log level setting

EXAMPLES:
    # Count lines of a local file
    pw wc -l Cargo.toml

    # Run on a remote host in a given directory
    pw -H build01 -u ci -C /srv/app -- make -j4

    # Accept exit codes 0 and 1
    pw -r 0 -r 1 grep pattern notes.txt
"#
    );
}

/// Print version.
pub fn print_version() {
    println!("pw {}", env!("CARGO_PKG_VERSION"));
}

/// Why `pw`'s arguments were rejected.
#[derive(Debug, Error)]
pub enum ArgsError {
    #[error(transparent)]
    Lexopt(#[from] lexopt::Error),
    #[error("invalid value for --{0}: '{1}'")]
    InvalidValue(&'static str, String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(args: &[&str]) -> Vec<OsString> {
        std::iter::once("pw")
            .chain(args.iter().copied())
            .map(OsString::from)
            .collect()
    }

    #[test]
    fn test_default_args() {
        let result = parse_args_from(args(&[])).unwrap();
        assert!(result.host.is_none());
        assert!(result.program.is_none());
        assert_eq!(result.retcode(), Retcode::Exact(0));
    }

    #[test]
    fn test_program_and_args() {
        let result = parse_args_from(args(&["ls", "-la", "/tmp"])).unwrap();
        assert_eq!(result.program.as_deref(), Some("ls"));
        assert_eq!(result.args, ["-la", "/tmp"]);
    }

    #[test]
    fn test_options_after_program_belong_to_program() {
        let result = parse_args_from(args(&["-t", "5", "grep", "-r", "x", "--help"])).unwrap();
        assert_eq!(result.timeout, Some(5));
        assert!(result.retcodes.is_empty());
        assert!(!result.help);
        assert_eq!(result.args, ["-r", "x", "--help"]);
    }

    #[test]
    fn test_double_dash() {
        let result = parse_args_from(args(&["--", "-weird-name", "a"])).unwrap();
        assert_eq!(result.program.as_deref(), Some("-weird-name"));
        assert_eq!(result.args, ["a"]);
    }

    #[test]
    fn test_ssh_options() {
        let result = parse_args_from(args(&[
            "-H", "build01", "-u", "ci", "-p", "2222", "-i", "/keys/id", "uptime",
        ]))
        .unwrap();
        assert_eq!(result.host.as_deref(), Some("build01"));
        assert_eq!(result.user.as_deref(), Some("ci"));
        assert_eq!(result.port, Some(2222));
        assert_eq!(result.identity, Some(PathBuf::from("/keys/id")));
    }

    #[test]
    fn test_env_and_cwd() {
        let result = parse_args_from(args(&["-e", "A=1", "--env", "B=x=y", "-C", "/srv", "env"])).unwrap();
        assert_eq!(
            result.env,
            [("A".to_string(), "1".to_string()), ("B".to_string(), "x=y".to_string())]
        );
        assert_eq!(result.cwd, Some(PathBuf::from("/srv")));
    }

    #[test]
    fn test_bad_env() {
        assert!(parse_args_from(args(&["-e", "NOEQUALS", "env"])).is_err());
        assert!(parse_args_from(args(&["-e", "=v", "env"])).is_err());
    }

    #[test]
    fn test_retcodes() {
        let result = parse_args_from(args(&["-r", "1", "false"])).unwrap();
        assert_eq!(result.retcode(), Retcode::Exact(1));
        let result = parse_args_from(args(&["-r", "0", "--retcode", "2", "x"])).unwrap();
        assert_eq!(result.retcode(), Retcode::OneOf(vec![0, 2]));
        let result = parse_args_from(args(&["--any-retcode", "-r", "3", "x"])).unwrap();
        assert_eq!(result.retcode(), Retcode::Any);
    }

    #[test]
    fn test_help_flag() {
        let result = parse_args_from(args(&["-h"])).unwrap();
        assert!(result.help);

        let result = parse_args_from(args(&["--help"])).unwrap();
        assert!(result.help);
    }

    #[test]
    fn test_version_flag() {
        let result = parse_args_from(args(&["-V"])).unwrap();
        assert!(result.version);

        let result = parse_args_from(args(&["--version"])).unwrap();
        assert!(result.version);
    }

    #[test]
    fn test_log_level() {
        let result = parse_args_from(args(&["-l", "debug"])).unwrap();
        assert_eq!(result.log_level, Some("debug".to_string()));
    }

    #[test]
    fn test_invalid_numbers() {
        assert!(parse_args_from(args(&["-p", "invalid"])).is_err());
        assert!(parse_args_from(args(&["-t", "soon"])).is_err());
        assert!(parse_args_from(args(&["-r", "zero"])).is_err());
    }

    #[test]
    fn test_unknown_option() {
        assert!(parse_args_from(args(&["--frobnicate"])).is_err());
    }
}
