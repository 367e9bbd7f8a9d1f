use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::keys::IdentityDigest;

/// What the node knows about a peer from the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub nickname: String,
    pub identity: IdentityDigest,
    pub host: String,
    pub port: u16,
}

pub trait Directory: Send + Sync {
    fn lookup(&self, identity: &IdentityDigest) -> Option<NodeDescriptor>;
}

/// Fixed set of peers, typically the `[[peers]]` table of the config file.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    nodes: HashMap<IdentityDigest, NodeDescriptor>,
}

impl StaticDirectory {
    pub fn new(nodes: impl IntoIterator<Item = NodeDescriptor>) -> Self {
        Self {
            nodes: nodes
                .into_iter()
                .map(|node| (node.identity, node))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Directory for StaticDirectory {
    fn lookup(&self, identity: &IdentityDigest) -> Option<NodeDescriptor> {
        self.nodes.get(identity).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_identity() {
        let alice = NodeDescriptor {
            nickname: "alice".to_string(),
            identity: IdentityDigest([0xaa; 32]),
            host: "10.0.0.1".to_string(),
            port: 48099,
        };
        let directory = StaticDirectory::new([alice.clone()]);
        assert_eq!(directory.lookup(&alice.identity), Some(alice));
        assert_eq!(directory.lookup(&IdentityDigest([0xbb; 32])), None);
    }
}
