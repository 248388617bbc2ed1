//! Command expression model.
//!
//! A [`Command`] is an immutable tree: atomic programs, bound arguments,
//! env/cwd bindings, pipelines, redirections and concurrent groups. Every
//! node renders itself with [`Command::formulate`]; the quoting depth grows
//! by one for each nested shell layer.

mod arg;
mod node;
mod ops;
mod redirect;
mod retcode;

pub use arg::Arg;
pub use node::{Command, NodeKind};
pub use redirect::{Input, Output, StreamKind};
pub use retcode::Retcode;

pub(crate) use node::{Leaf, Node};
