//! Identity newtypes and composite keys used across the control plane.

use std::fmt;
use std::fmt::{Debug, Display, Formatter};
use uuid::Uuid;

/// Namespace for deriving pseudo-destination ids from durable subscriptions.
const PSEUDO_DESTINATION_NAMESPACE: Uuid = Uuid::from_bytes([
    0x5a, 0x1c, 0x7e, 0x09, 0x4b, 0x6d, 0x45, 0x2f, 0x92, 0x3a, 0xd4, 0x10, 0x6b, 0x88, 0x31, 0xc5,
]);

/// Identifies one messaging engine (a cluster node able to host destinations).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(Uuid);

impl NodeId {
    pub fn new(id: Uuid) -> Self {
        NodeId(id)
    }

    pub fn random() -> Self {
        NodeId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Debug for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one destination (queue, topic space, or bus link).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DestinationId(Uuid);

impl DestinationId {
    pub fn new(id: Uuid) -> Self {
        DestinationId(id)
    }

    pub fn random() -> Self {
        DestinationId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Derives the synthetic destination identity carrying one remote durable
    /// subscription's anycast traffic. Deterministic for a (home, subscriber)
    /// pair so both ends agree on it without exchanging state.
    pub fn pseudo_for_durable(home: NodeId, subscriber: &SubscriberId) -> Self {
        let mut material = Vec::with_capacity(16 + subscriber.as_str().len() + 1);
        material.extend_from_slice(home.as_uuid().as_bytes());
        material.push(b'#');
        material.extend_from_slice(subscriber.as_str().as_bytes());
        DestinationId(Uuid::new_v5(&PSEUDO_DESTINATION_NAMESPACE, &material))
    }
}

impl Debug for DestinationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "DestinationId({})", self.0)
    }
}

impl Display for DestinationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a durable subscription within one topic space
/// (conventionally `client##subscription`).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(String);

impl SubscriberId {
    pub fn new(id: impl Into<String>) -> Self {
        SubscriberId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Debug for SubscriberId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriberId({})", self.0)
    }
}

impl Display for SubscriberId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Composite key identifying one anycast input-handler instance.
///
/// At most one live input handler and container stream pair exists per key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteAccessKey {
    /// The peer node of the access: who is asking, seen from the hosting
    /// side, or whose data is being fetched, seen from the consuming side.
    pub requesting_node: NodeId,
    /// Set when the access gathers from a target other than the destination
    /// itself, e.g. the pseudo destination of a remote durable subscription.
    pub gathering_target: Option<DestinationId>,
}

impl RemoteAccessKey {
    pub fn direct(requesting_node: NodeId) -> Self {
        RemoteAccessKey {
            requesting_node,
            gathering_target: None,
        }
    }

    pub fn gathering(requesting_node: NodeId, target: DestinationId) -> Self {
        RemoteAccessKey {
            requesting_node,
            gathering_target: Some(target),
        }
    }
}

impl Debug for RemoteAccessKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.gathering_target {
            Some(target) => write!(
                f,
                "RemoteAccessKey({} gathering {})",
                self.requesting_node, target
            ),
            None => write!(f, "RemoteAccessKey({})", self.requesting_node),
        }
    }
}
