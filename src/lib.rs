//! # pipewright
//!
//! Composable shell commands for local and SSH execution.
//!
//! Commands are immutable expression trees: bind arguments, pipe with `|`,
//! redirect streams, group with `&`, then run the result synchronously or
//! hand it to an execution modifier such as [`BG`](execution::BG) or
//! [`TEE`](execution::TEE). The same tree runs on the local machine, over
//! the `ssh` client, or over any [`Transport`](machine::Transport).
//!
//! ## Quick Start
//!
//! ```no_run
//! use pipewright::execution::{BG, RETCODE};
//! use pipewright::local;
//!
//! fn main() -> pipewright::Result<()> {
//!     pipewright::logging::try_init().ok();
//!
//!     let m = local();
//!     let ls = m.command("ls")?;
//!     let grep = m.command("grep")?.arg("rs");
//!     let wc = m.command("wc")?.arg("-l");
//!
//!     let pipeline = &ls.arg("-a") | &grep | &wc;
//!     println!("{} -> {}", pipeline, pipeline.call()?.trim());
//!
//!     let mut future = (&pipeline & BG)?;
//!     println!("background: {}", future.stdout()?.trim());
//!
//!     let code = (&ls.arg("/does/not/exist") & RETCODE)?;
//!     println!("exit code {}", code);
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod command;
pub mod config;
pub mod error;
pub mod execution;
pub mod logging;
pub mod machine;
pub mod process;
pub mod quoting;
pub mod session;

// Re-export commonly used types
pub use command::{Arg, Command, Input, NodeKind, Output, Retcode, StreamKind};
pub use error::{Error, ProcessExecutionError, Result};
pub use execution::{Completed, Future, PopenOptions, RunOptions};
pub use machine::{local, Backend, Cluster, LocalMachine, Machine, SshMachine, SshOptions};
pub use process::{LinesOptions, Process};
pub use quoting::shquote;
pub use session::{SessionOptions, ShellSession};
