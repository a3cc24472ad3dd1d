//! Output-handler capabilities and the anycast collaborator boundary.
//!
//! An [`OutputHandler`] is the routing decision's result: the capability a
//! producer or consumer request is handed once a hosting node is chosen. The
//! variants form a closed set keyed 1:1 from hosting-node id inside the
//! localisation manager.

use crate::destination::DestinationDefinition;
use crate::durable::state::DurableSubscriptionState;
use crate::error::{Fault, LockedReason};
use crate::identity::{DestinationId, NodeId};
use crate::store::stream::StreamHandle;
use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use uuid::Uuid;

/// Identifies one attached consumer point.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerPointId(Uuid);

impl ConsumerPointId {
    pub fn new(id: Uuid) -> Self {
        ConsumerPointId(id)
    }

    pub fn random() -> Self {
        ConsumerPointId(Uuid::new_v4())
    }
}

impl Debug for ConsumerPointId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ConsumerPointId({})", self.0)
    }
}

/// Proof of one attach, used to detach again.
#[derive(Clone, Copy, Debug)]
pub struct AttachKey {
    pub point: ConsumerPointId,
}

/// Local delivery capability over one local-message or reference stream.
///
/// Also represents a durable subscription's dispatcher, in which case
/// [`ConsumerDispatcher::durable_state`] is populated.
pub struct ConsumerDispatcher {
    destination: DestinationId,
    stream: Arc<dyn StreamHandle>,
    send_allowed: AtomicBool,
    high_message_threshold: u64,
    receive_exclusive: bool,
    attached: StdMutex<HashSet<ConsumerPointId>>,
    durable_state: Option<DurableSubscriptionState>,
}

impl ConsumerDispatcher {
    pub fn new(definition: &DestinationDefinition, stream: Arc<dyn StreamHandle>) -> Self {
        ConsumerDispatcher {
            destination: definition.id,
            stream,
            send_allowed: AtomicBool::new(definition.send_allowed),
            high_message_threshold: definition.high_message_threshold,
            receive_exclusive: definition.receive_exclusive,
            attached: StdMutex::new(HashSet::new()),
            durable_state: None,
        }
    }

    pub fn for_durable_subscription(
        definition: &DestinationDefinition,
        stream: Arc<dyn StreamHandle>,
        state: DurableSubscriptionState,
    ) -> Self {
        ConsumerDispatcher {
            destination: definition.id,
            stream,
            send_allowed: AtomicBool::new(definition.send_allowed),
            high_message_threshold: definition.high_message_threshold,
            receive_exclusive: !state.cloned,
            attached: StdMutex::new(HashSet::new()),
            durable_state: Some(state),
        }
    }

    pub fn destination(&self) -> DestinationId {
        self.destination
    }

    pub fn stream(&self) -> &Arc<dyn StreamHandle> {
        &self.stream
    }

    pub fn durable_state(&self) -> Option<&DurableSubscriptionState> {
        self.durable_state.as_ref()
    }

    pub fn has_consumers_attached(&self) -> bool {
        !self.attached.lock().expect("attached set poisoned").is_empty()
    }

    pub fn consumer_count(&self) -> usize {
        self.attached.lock().expect("attached set poisoned").len()
    }

    /// Attaches one consumer point. Exclusive dispatchers admit a single
    /// consumer at a time.
    pub fn attach_consumer_point(&self, point: ConsumerPointId) -> Result<AttachKey, Fault> {
        let mut attached = self.attached.lock().expect("attached set poisoned");
        if self.receive_exclusive && !attached.is_empty() {
            return Err(Fault::locked(
                LockedReason::ConsumersAttached,
                format!("destination {} is receive-exclusive", self.destination),
            ));
        }
        attached.insert(point);
        Ok(AttachKey { point })
    }

    pub fn detach_consumer_point(&self, key: AttachKey) {
        self.attached
            .lock()
            .expect("attached set poisoned")
            .remove(&key.point);
    }

    pub fn set_send_allowed(&self, allowed: bool) {
        self.send_allowed.store(allowed, Ordering::SeqCst);
    }

    /// Capacity and send-allowed check. `force_put` overrides a full queue
    /// but not an administratively disabled handler.
    pub fn put_allowed(&self, force_put: bool) -> bool {
        if !self.send_allowed.load(Ordering::SeqCst) {
            return false;
        }
        force_put || self.stream.statistics().total_items < self.high_message_threshold
    }

    /// Whether the backing stream holds uncommitted receives.
    pub fn has_uncommitted_receives(&self) -> bool {
        self.stream.statistics().removing_items != 0
    }
}

impl Debug for ConsumerDispatcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerDispatcher")
            .field("destination", &self.destination)
            .field("stream", &self.stream.id())
            .field("durable", &self.durable_state.is_some())
            .finish_non_exhaustive()
    }
}

/// Transmit capability toward one remote node (point-to-point or link).
///
/// The node is optional only for the link specialisation, whose remote end
/// may not have been resolved yet; ordinary remote-transmit handlers always
/// carry a node.
pub struct TransmitHandler {
    destination: DestinationId,
    node: StdMutex<Option<NodeId>>,
    stream: Arc<dyn StreamHandle>,
    is_guess: AtomicBool,
    send_allowed: AtomicBool,
    high_message_threshold: u64,
}

impl TransmitHandler {
    pub fn new(
        definition: &DestinationDefinition,
        node: Option<NodeId>,
        stream: Arc<dyn StreamHandle>,
    ) -> Self {
        TransmitHandler {
            destination: definition.id,
            node: StdMutex::new(node),
            stream,
            is_guess: AtomicBool::new(false),
            send_allowed: AtomicBool::new(definition.send_allowed),
            high_message_threshold: definition.high_message_threshold,
        }
    }

    pub fn destination(&self) -> DestinationId {
        self.destination
    }

    pub fn node(&self) -> Option<NodeId> {
        *self.node.lock().expect("node slot poisoned")
    }

    /// Rebinds the handler to a newly resolved node (link migration).
    pub fn set_node(&self, node: Option<NodeId>) {
        *self.node.lock().expect("node slot poisoned") = node;
    }

    pub fn stream(&self) -> &Arc<dyn StreamHandle> {
        &self.stream
    }

    pub fn is_guess(&self) -> bool {
        self.is_guess.load(Ordering::SeqCst)
    }

    pub fn set_guess(&self, guess: bool) {
        self.is_guess.store(guess, Ordering::SeqCst);
    }

    pub fn set_send_allowed(&self, allowed: bool) {
        self.send_allowed.store(allowed, Ordering::SeqCst);
    }

    pub fn put_allowed(&self, force_put: bool) -> bool {
        if !self.send_allowed.load(Ordering::SeqCst) {
            return false;
        }
        force_put || self.stream.statistics().total_items < self.high_message_threshold
    }
}

impl Debug for TransmitHandler {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransmitHandler")
            .field("destination", &self.destination)
            .field("node", &self.node())
            .field("guess", &self.is_guess())
            .finish_non_exhaustive()
    }
}

/// Fan-out capability toward one publish/subscribe neighbour.
pub struct NeighbourHandler {
    destination: DestinationId,
    node: NodeId,
}

impl NeighbourHandler {
    pub fn new(destination: DestinationId, node: NodeId) -> Self {
        NeighbourHandler { destination, node }
    }

    pub fn destination(&self) -> DestinationId {
        self.destination
    }

    pub fn node(&self) -> NodeId {
        self.node
    }
}

impl Debug for NeighbourHandler {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("NeighbourHandler")
            .field("destination", &self.destination)
            .field("node", &self.node)
            .finish()
    }
}

/// Closed set of routing capabilities, keyed 1:1 from hosting-node id.
#[derive(Clone, Debug)]
pub enum OutputHandler {
    /// Local consumer dispatch.
    Local(Arc<ConsumerDispatcher>),
    /// Point-to-point transmission to a remote localisation.
    RemoteTransmit(Arc<TransmitHandler>),
    /// Publish/subscribe fan-out to a neighbour.
    Neighbour(Arc<NeighbourHandler>),
    /// Transmission over a bus-to-bus link.
    Link(Arc<TransmitHandler>),
}

impl OutputHandler {
    pub fn is_local(&self) -> bool {
        matches!(self, OutputHandler::Local(_))
    }

    pub fn node(&self) -> Option<NodeId> {
        match self {
            OutputHandler::Local(_) => None,
            OutputHandler::RemoteTransmit(handler) | OutputHandler::Link(handler) => {
                handler.node()
            }
            OutputHandler::Neighbour(handler) => Some(handler.node()),
        }
    }

    pub fn put_allowed(&self, force_put: bool) -> bool {
        match self {
            OutputHandler::Local(dispatcher) => dispatcher.put_allowed(force_put),
            OutputHandler::RemoteTransmit(handler) | OutputHandler::Link(handler) => {
                handler.put_allowed(force_put)
            }
            OutputHandler::Neighbour(_) => true,
        }
    }
}

/// Construction parameters for one anycast input handler.
#[derive(Clone, Debug)]
pub struct InputHandlerSpec {
    /// Destination (or pseudo destination) name the handler serves.
    pub name: String,
    /// Destination (or pseudo destination) the handler is bound to.
    pub destination: DestinationId,
    /// Whether the remote access is receive-exclusive.
    pub exclusive: bool,
}

/// One side of the anycast protocol pair, owned by the requesting node.
///
/// This layer only orchestrates creation, lookup, and teardown; the message
/// exchange internals live behind this trait.
#[async_trait]
pub trait AnycastInputHandler: Send + Sync {
    /// Whether the remote end reported its destination deleted.
    fn destination_deleted(&self) -> bool;

    /// Attaches a consumer point that will receive remotely fetched messages.
    async fn attach_consumer_point(&self, point: ConsumerPointId) -> Result<(), Fault>;

    /// Registers a callback to run once the handler's stream has flushed.
    fn add_flushed_callback(&self, callback: Box<dyn FnOnce() + Send>);

    /// Tears the handler down, releasing its protocol state.
    async fn delete(&self) -> Result<(), Fault>;
}

/// Constructs anycast handler pairs. The processor context the pair needs is
/// captured by the factory implementation.
#[async_trait]
pub trait AnycastHandlerFactory: Send + Sync {
    async fn create_input_handler(
        &self,
        spec: InputHandlerSpec,
        container: Arc<dyn StreamHandle>,
        receive: Arc<dyn StreamHandle>,
        flush_on_bind: bool,
    ) -> Result<Arc<dyn AnycastInputHandler>, Fault>;
}

#[cfg(test)]
mod tests {
    use super::{ConsumerDispatcher, ConsumerPointId, TransmitHandler};
    use crate::destination::{DestinationDefinition, DestinationKind};
    use crate::error::{Fault, LockedReason};
    use crate::identity::DestinationId;
    use crate::store::stream::{
        StreamDescriptor, StreamHandle, StreamId, StreamKind, StreamStatistics, StreamTag,
    };
    use crate::store::transaction::Transaction;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    struct FixedStream {
        id: StreamId,
        total_items: AtomicU64,
    }

    impl FixedStream {
        fn with_items(total_items: u64) -> Arc<Self> {
            Arc::new(FixedStream {
                id: StreamId::random(),
                total_items: AtomicU64::new(total_items),
            })
        }
    }

    #[async_trait]
    impl StreamHandle for FixedStream {
        fn id(&self) -> StreamId {
            self.id
        }

        fn descriptor(&self) -> StreamDescriptor {
            StreamDescriptor::new(StreamKind::LocalMessage, StreamTag::LocalQueue)
        }

        fn is_to_be_deleted(&self) -> bool {
            false
        }

        fn statistics(&self) -> StreamStatistics {
            StreamStatistics {
                total_items: self.total_items.load(Ordering::SeqCst),
                ..StreamStatistics::default()
            }
        }

        async fn mark_to_be_deleted(&self, _txn: &dyn Transaction) -> Result<(), Fault> {
            Ok(())
        }

        async fn cancel_to_be_deleted(&self, _txn: &dyn Transaction) -> Result<(), Fault> {
            Ok(())
        }

        async fn remove_unassigned(&self, _txn: &dyn Transaction) -> Result<(), Fault> {
            Ok(())
        }

        async fn remove_all(&self, _txn: &dyn Transaction) -> Result<(), Fault> {
            Ok(())
        }
    }

    fn queue_definition() -> DestinationDefinition {
        DestinationDefinition::new(DestinationId::random(), "orders", DestinationKind::Queue)
            .high_message_threshold(10)
    }

    #[test]
    fn exclusive_dispatcher_rejects_second_attach() {
        let definition = queue_definition().receive_exclusive(true);
        let dispatcher = ConsumerDispatcher::new(&definition, FixedStream::with_items(0));

        dispatcher
            .attach_consumer_point(ConsumerPointId::random())
            .expect("first attach");
        let err = dispatcher
            .attach_consumer_point(ConsumerPointId::random())
            .expect_err("second attach must be rejected");

        assert_eq!(err.locked_reason(), Some(LockedReason::ConsumersAttached));
        assert_eq!(dispatcher.consumer_count(), 1);
    }

    #[test]
    fn detach_releases_the_exclusive_slot() {
        let definition = queue_definition().receive_exclusive(true);
        let dispatcher = ConsumerDispatcher::new(&definition, FixedStream::with_items(0));

        let key = dispatcher
            .attach_consumer_point(ConsumerPointId::random())
            .expect("attach");
        dispatcher.detach_consumer_point(key);

        assert!(!dispatcher.has_consumers_attached());
        assert!(dispatcher
            .attach_consumer_point(ConsumerPointId::random())
            .is_ok());
    }

    #[test]
    fn force_put_overrides_depth_but_not_send_disable() {
        let definition = queue_definition();
        let dispatcher = ConsumerDispatcher::new(&definition, FixedStream::with_items(10));

        assert!(!dispatcher.put_allowed(false));
        assert!(dispatcher.put_allowed(true));

        dispatcher.set_send_allowed(false);
        assert!(!dispatcher.put_allowed(true));
    }

    #[test]
    fn transmit_handler_tracks_guess_flag_and_node() {
        let definition = queue_definition();
        let handler = TransmitHandler::new(&definition, None, FixedStream::with_items(0));

        assert_eq!(handler.node(), None);
        assert!(!handler.is_guess());

        let node = crate::identity::NodeId::random();
        handler.set_node(Some(node));
        handler.set_guess(true);

        assert_eq!(handler.node(), Some(node));
        assert!(handler.is_guess());
    }
}
