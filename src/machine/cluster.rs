//! Several machines addressed as one.

use super::{command, Machine};
use crate::command::Command;
use crate::error::{Error, Result};

/// A set of machines that run the same command side by side.
#[derive(Debug, Clone)]
pub struct Cluster {
    machines: Vec<Machine>,
}

impl Cluster {
    pub fn new(machines: impl IntoIterator<Item = Machine>) -> Result<Self> {
        let machines: Vec<Machine> = machines.into_iter().collect();
        if machines.is_empty() {
            return Err(Error::InvalidArgument("a cluster needs at least one machine".into()));
        }
        Ok(Self { machines })
    }

    pub fn machines(&self) -> &[Machine] {
        &self.machines
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    /// `name` on every member, as one concurrent group. Fails if any member
    /// cannot resolve it.
    pub fn command(&self, name: &str) -> Result<Command> {
        let mut members = self.machines.iter().map(|m| command(m, name));
        let first = members
            .next()
            .ok_or_else(|| Error::InvalidArgument("empty cluster".into()))??;
        members.try_fold(first, |group, next| Ok(group.concurrently(&next?)))
    }

    /// Where each member finds `program`, in member order.
    pub fn which(&self, program: &str) -> Result<Vec<String>> {
        self.machines.iter().map(|m| m.which(program)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::NodeKind;
    use crate::machine::testing::{fake_local, fake_remote};

    #[test]
    fn test_command_is_a_concurrent_group() {
        let cluster = Cluster::new([fake_local(), fake_remote(), fake_local()]).unwrap();
        let cmd = cluster.command("uptime").unwrap();
        assert_eq!(cmd.kind(), NodeKind::Concurrent);
        assert_eq!(cmd.parts().len(), 3);
        assert_eq!(cmd.parts()[1].machine().name(), "remote");
    }

    #[test]
    fn test_single_member_is_plain() {
        let cluster = Cluster::new([fake_local()]).unwrap();
        assert_eq!(cluster.command("ls").unwrap().kind(), NodeKind::Atomic);
        assert_eq!(cluster.which("ls").unwrap(), ["/usr/bin/ls"]);
    }

    #[test]
    fn test_empty_cluster_is_rejected() {
        assert!(Cluster::new(Vec::new()).is_err());
    }
}
