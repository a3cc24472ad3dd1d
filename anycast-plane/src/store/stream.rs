//! Transactional stream handles and the store contract.
//!
//! Persisted layout (one root stream per destination): one container stream
//! and one receive stream per remote-access key, one local-message stream per
//! local localisation, one transmit stream per remote localisation, one
//! reference stream per durable subscription. Everything is rediscoverable at
//! restart by a filtered kind scan over the root's children; there is no
//! separate index file.

use crate::durable::state::DurableSubscriptionState;
use crate::error::Fault;
use crate::identity::{DestinationId, NodeId, RemoteAccessKey};
use crate::store::transaction::Transaction;
use async_trait::async_trait;
use std::error::Error;
use std::fmt;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;
use uuid::Uuid;

/// Identifies one persisted stream.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(Uuid);

impl StreamId {
    pub fn new(id: Uuid) -> Self {
        StreamId(id)
    }

    pub fn random() -> Self {
        StreamId(Uuid::new_v4())
    }
}

impl Debug for StreamId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({})", self.0)
    }
}

impl Display for StreamId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Runtime type of a child stream, used for filtered scans at restart.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum StreamKind {
    /// Messages held for local consumers.
    LocalMessage,
    /// Messages awaiting transmission to one remote node.
    Transmit,
    /// Anycast protocol state for one remote-access key.
    AnycastContainer,
    /// Messages received over anycast for one remote-access key.
    AnycastReceive,
    /// References held by one durable subscription.
    SubscriptionReference,
}

/// What a stream belongs to. Persisted with the stream so restart scans can
/// rebuild the in-memory maps without an index.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum StreamTag {
    LocalQueue,
    TransmitTo(NodeId),
    /// Transmit stream of a bus link's queue point. The remote node travels
    /// on the handler, not the tag, because it may be unresolved or change
    /// while queued messages remain.
    LinkRemote,
    RemoteAccess(RemoteAccessKey),
    /// Reference stream of one durable subscription; carries the full
    /// subscription state so restart needs no side table.
    Subscription(DurableSubscriptionState),
}

/// Creation-time description of a child stream.
#[derive(Clone, Debug)]
pub struct StreamDescriptor {
    pub kind: StreamKind,
    pub tag: StreamTag,
}

impl StreamDescriptor {
    pub fn new(kind: StreamKind, tag: StreamTag) -> Self {
        StreamDescriptor { kind, tag }
    }
}

/// Point-in-time item counts for one stream.
#[derive(Clone, Copy, Default, Debug)]
pub struct StreamStatistics {
    pub total_items: u64,
    /// Items with an uncommitted (in-doubt) remove against them.
    pub removing_items: u64,
    /// Items not yet assigned to any remote request.
    pub unassigned_items: u64,
}

/// Handle to one persisted transactional stream.
#[async_trait]
pub trait StreamHandle: Send + Sync {
    fn id(&self) -> StreamId;

    fn descriptor(&self) -> StreamDescriptor;

    /// Whether the stream is logically removed but retained until drained.
    fn is_to_be_deleted(&self) -> bool;

    fn statistics(&self) -> StreamStatistics;

    /// Persists the to-be-deleted mark; reverted if the transaction rolls
    /// back.
    async fn mark_to_be_deleted(&self, txn: &dyn Transaction) -> Result<(), Fault>;

    /// Cancels a pending to-be-deleted mark, resurrecting the stream.
    async fn cancel_to_be_deleted(&self, txn: &dyn Transaction) -> Result<(), Fault>;

    /// Removes items not yet assigned to any remote request, so that later
    /// removal of assigned items can reject cleanly.
    async fn remove_unassigned(&self, txn: &dyn Transaction) -> Result<(), Fault>;

    /// Removes every item on the stream.
    async fn remove_all(&self, txn: &dyn Transaction) -> Result<(), Fault>;
}

/// Failure adding a child stream.
pub enum AddChildError {
    /// The destination's root stream is marked deleted; the add was invalid.
    /// Expected while a destination delete races remote-access creation.
    RootDeleted,
    /// The store itself failed.
    Fault(Fault),
}

impl Debug for AddChildError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AddChildError::RootDeleted => write!(f, "RootDeleted"),
            AddChildError::Fault(fault) => write!(f, "Fault({fault:?})"),
        }
    }
}

impl Display for AddChildError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AddChildError::RootDeleted => {
                write!(f, "root stream is marked deleted; child add rejected")
            }
            AddChildError::Fault(fault) => write!(f, "{fault}"),
        }
    }
}

impl Error for AddChildError {}

impl From<Fault> for AddChildError {
    fn from(fault: Fault) -> Self {
        AddChildError::Fault(fault)
    }
}

/// The persistent transactional store collaborator.
#[async_trait]
pub trait TransactionalStore: Send + Sync {
    async fn begin(&self) -> Result<Arc<dyn Transaction>, Fault>;

    /// Creates the root stream for a destination.
    async fn add_root(
        &self,
        destination: DestinationId,
        txn: &dyn Transaction,
    ) -> Result<(), Fault>;

    /// Marks a destination's root stream deleted. Subsequent child adds fail
    /// with [`AddChildError::RootDeleted`].
    async fn mark_root_to_be_deleted(
        &self,
        destination: DestinationId,
        txn: &dyn Transaction,
    ) -> Result<(), Fault>;

    /// Adds a child stream under a destination's root.
    async fn add_child_stream(
        &self,
        destination: DestinationId,
        descriptor: StreamDescriptor,
        txn: &dyn Transaction,
    ) -> Result<Arc<dyn StreamHandle>, AddChildError>;

    /// Filtered scan over a destination's persisted children.
    async fn children_of_kind(
        &self,
        destination: DestinationId,
        kind: StreamKind,
    ) -> Result<Vec<Arc<dyn StreamHandle>>, Fault>;

    /// Physically removes a child stream.
    async fn remove_stream(
        &self,
        destination: DestinationId,
        stream: StreamId,
        txn: &dyn Transaction,
    ) -> Result<(), Fault>;
}

#[cfg(test)]
mod tests {
    use super::AddChildError;
    use crate::error::Fault;

    #[test]
    fn add_child_error_wraps_faults() {
        let err = AddChildError::from(Fault::resource("disk full"));
        assert!(matches!(err, AddChildError::Fault(Fault::Resource(_))));
        assert!(format!("{err}").contains("disk full"));
    }
}
