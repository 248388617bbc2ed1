//! Persistent shell sessions.
//!
//! A [`ShellSession`] keeps one shell (local, PTY-backed, or remote) alive
//! and runs commands through it with a marker-framed request/response
//! protocol.

mod probe;
mod pty;
mod sanitize;
mod shell;
mod state;

pub use probe::StateProbe;
pub use pty::spawn_in_pty;
pub use sanitize::OutputSanitizer;
pub use shell::{SessionOptions, SessionOutput, ShellSession};
pub use state::SessionState;
