//! Topology/workload lookup collaborator boundary.
//!
//! The control plane never decides cluster placement itself: it asks the
//! topology service for a hosting node and treats an absent selection as a
//! normal outcome, falling back to the locally cached guess set.

use crate::identity::{DestinationId, NodeId};
use async_trait::async_trait;
use std::collections::BTreeSet;

/// What the requester intends to do with the chosen node.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Capability {
    Put,
    Get,
}

/// A hosting-node choice returned by the topology service.
#[derive(Clone, Copy, Debug)]
pub struct Selection {
    pub node: NodeId,
}

/// A bus-link endpoint choice returned by the topology service.
#[derive(Clone, Copy, Debug)]
pub struct LinkSelection {
    /// The node currently hosting the link's outbound queue point.
    pub node: NodeId,
}

/// Cluster placement oracle.
///
/// `None` from the choose methods means "no answer right now" and is expected
/// whenever the workload manager is unreachable or has nothing advertised;
/// callers fall back to their guess sets rather than failing.
#[async_trait]
pub trait TopologyService: Send + Sync {
    /// Picks a hosting node for a destination from the advertised set,
    /// honoring a caller preference when one is given.
    async fn choose_hosting_node(
        &self,
        guesses: &BTreeSet<NodeId>,
        preferred: Option<NodeId>,
        capability: Capability,
    ) -> Option<Selection>;

    /// Picks the current endpoint for a bus-to-bus link.
    async fn choose_link(&self, link: DestinationId) -> Option<LinkSelection>;

    /// Whether a node is still advertised as a host.
    async fn is_still_advertised(&self, node: NodeId) -> bool;
}
