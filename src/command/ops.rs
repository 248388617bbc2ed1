//! Operator sugar over the named builder methods.
//!
//! `a | b` is [`Command::pipe`] and `a & b` is [`Command::concurrently`].
//! Execution modifiers add their own `&` impls.

use std::ops::{BitAnd, BitOr};

use super::Command;

impl BitOr<&Command> for &Command {
    type Output = Command;

    fn bitor(self, rhs: &Command) -> Command {
        self.pipe(rhs)
    }
}

impl BitOr<Command> for Command {
    type Output = Command;

    fn bitor(self, rhs: Command) -> Command {
        self.pipe(&rhs)
    }
}

impl BitOr<&Command> for Command {
    type Output = Command;

    fn bitor(self, rhs: &Command) -> Command {
        self.pipe(rhs)
    }
}

impl BitAnd<&Command> for &Command {
    type Output = Command;

    fn bitand(self, rhs: &Command) -> Command {
        self.concurrently(rhs)
    }
}

impl BitAnd<Command> for Command {
    type Output = Command;

    fn bitand(self, rhs: Command) -> Command {
        self.concurrently(&rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::NodeKind;
    use crate::machine::testing::fake_local;

    #[test]
    fn test_pipe_operator() {
        let a = Command::atomic("a", fake_local());
        let b = Command::atomic("b", fake_local());
        let c = Command::atomic("c", fake_local());
        let p = &a | &b;
        let p = p | c;
        assert_eq!(p.kind(), NodeKind::Pipeline);
        assert_eq!(p.to_string(), "a | b | c");
    }

    #[test]
    fn test_and_operator() {
        let a = Command::atomic("a", fake_local());
        let b = Command::atomic("b", fake_local());
        let g = &a & &b;
        assert_eq!(g.kind(), NodeKind::Concurrent);
        assert_eq!(g.to_string(), "( a & b )");
    }
}
