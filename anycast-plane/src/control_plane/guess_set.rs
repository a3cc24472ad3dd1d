//! Fallback hosting-node guesses, rebuilt only from authoritative updates.

use crate::identity::NodeId;
use std::collections::BTreeSet;

/// The set of hosting-node ids the localisation manager believes are valid.
///
/// Used as a routing fallback when the topology service cannot answer. The
/// set is superset-consistent with the last known localisation set and is
/// mutated only by `update_localisation_set`: every update clears and
/// rebuilds it from the authoritative node list.
#[derive(Clone, Default, PartialEq, Eq, Debug)]
pub struct GuessSet {
    nodes: BTreeSet<NodeId>,
    remote: BTreeSet<NodeId>,
    has_local: bool,
}

impl GuessSet {
    /// Rebuilds the guesses from an authoritative node list. The remote
    /// subset is the same set minus the local node.
    pub fn rebuild(local: NodeId, nodes: &BTreeSet<NodeId>) -> Self {
        let has_local = nodes.contains(&local);
        let mut remote = nodes.clone();
        remote.remove(&local);

        GuessSet {
            nodes: nodes.clone(),
            remote,
            has_local,
        }
    }

    pub fn nodes(&self) -> &BTreeSet<NodeId> {
        &self.nodes
    }

    pub fn remote_nodes(&self) -> &BTreeSet<NodeId> {
        &self.remote
    }

    pub fn has_local(&self) -> bool {
        self.has_local
    }

    pub fn has_remote(&self) -> bool {
        !self.remote.is_empty()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains(&node)
    }
}
