#![allow(dead_code)]

//! In-memory collaborators shared by the integration suites: a transactional
//! store with real commit/rollback hook semantics, a scripted topology
//! service, and a counting anycast handler factory.

use anycast_plane::destination::{DestinationDefinition, DestinationKind};
use anycast_plane::error::Fault;
use anycast_plane::handler::{
    AnycastHandlerFactory, AnycastInputHandler, ConsumerPointId, InputHandlerSpec,
};
use anycast_plane::identity::{DestinationId, NodeId};
use anycast_plane::store::stream::{
    AddChildError, StreamDescriptor, StreamHandle, StreamId, StreamKind, StreamStatistics,
    TransactionalStore,
};
use anycast_plane::store::transaction::{CommitHook, Transaction};
use anycast_plane::topology::{Capability, LinkSelection, Selection, TopologyService};
use anycast_plane::{DestinationFabric, FabricConfig, StartMode};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;

/// Failure injection and counters shared between the store and its streams.
#[derive(Default)]
pub struct Toggles {
    /// Fail the next transaction commit (hooks see a rollback).
    pub fail_next_commit: AtomicBool,
    /// Fail the next `mark_to_be_deleted`.
    pub fail_next_mark: AtomicBool,
    /// Successful commits so far, for asserting transaction granularity.
    pub commits: AtomicUsize,
}

#[derive(Clone, Copy, Default)]
struct MemStreamState {
    to_be_deleted: bool,
    total: u64,
    removing: u64,
    unassigned: u64,
}

/// One persisted stream; mutations apply eagerly and register rollback
/// hooks that restore the prior state.
pub struct MemStream {
    id: StreamId,
    descriptor: StreamDescriptor,
    toggles: Arc<Toggles>,
    state: Arc<StdMutex<MemStreamState>>,
}

impl MemStream {
    fn new(descriptor: StreamDescriptor, toggles: Arc<Toggles>) -> Arc<Self> {
        Arc::new(MemStream {
            id: StreamId::random(),
            descriptor,
            toggles,
            state: Arc::new(StdMutex::new(MemStreamState::default())),
        })
    }

    pub fn set_statistics(&self, total: u64, removing: u64, unassigned: u64) {
        let mut state = self.state.lock().unwrap();
        state.total = total;
        state.removing = removing;
        state.unassigned = unassigned;
    }

    fn snapshot(&self) -> MemStreamState {
        *self.state.lock().unwrap()
    }

    async fn restore_on_rollback(&self, txn: &dyn Transaction, before: MemStreamState) {
        let state = self.state.clone();
        txn.register_hook(CommitHook::new("mem-stream-undo").on_rollback(move || async move {
            *state.lock().unwrap() = before;
        }))
        .await;
    }
}

#[async_trait]
impl StreamHandle for MemStream {
    fn id(&self) -> StreamId {
        self.id
    }

    fn descriptor(&self) -> StreamDescriptor {
        self.descriptor.clone()
    }

    fn is_to_be_deleted(&self) -> bool {
        self.state.lock().unwrap().to_be_deleted
    }

    fn statistics(&self) -> StreamStatistics {
        let state = self.state.lock().unwrap();
        StreamStatistics {
            total_items: state.total,
            removing_items: state.removing,
            unassigned_items: state.unassigned,
        }
    }

    async fn mark_to_be_deleted(&self, txn: &dyn Transaction) -> Result<(), Fault> {
        if self.toggles.fail_next_mark.swap(false, Ordering::SeqCst) {
            return Err(Fault::Resource("injected mark failure".into()));
        }
        let before = self.snapshot();
        self.state.lock().unwrap().to_be_deleted = true;
        self.restore_on_rollback(txn, before).await;
        Ok(())
    }

    async fn cancel_to_be_deleted(&self, txn: &dyn Transaction) -> Result<(), Fault> {
        let before = self.snapshot();
        self.state.lock().unwrap().to_be_deleted = false;
        self.restore_on_rollback(txn, before).await;
        Ok(())
    }

    async fn remove_unassigned(&self, txn: &dyn Transaction) -> Result<(), Fault> {
        let before = self.snapshot();
        {
            let mut state = self.state.lock().unwrap();
            state.total = state.total.saturating_sub(state.unassigned);
            state.unassigned = 0;
        }
        self.restore_on_rollback(txn, before).await;
        Ok(())
    }

    async fn remove_all(&self, txn: &dyn Transaction) -> Result<(), Fault> {
        let before = self.snapshot();
        {
            let mut state = self.state.lock().unwrap();
            state.total = 0;
            state.removing = 0;
            state.unassigned = 0;
        }
        self.restore_on_rollback(txn, before).await;
        Ok(())
    }
}

struct RootSlot {
    deleted: bool,
    children: HashMap<StreamId, Arc<MemStream>>,
}

#[derive(Default)]
struct StoreState {
    roots: HashMap<DestinationId, RootSlot>,
}

pub struct MemTransaction {
    hooks: Mutex<Vec<CommitHook>>,
    toggles: Arc<Toggles>,
}

impl MemTransaction {
    async fn run_hooks(&self, committed: bool) {
        let mut hooks = std::mem::take(&mut *self.hooks.lock().await);
        if !committed {
            hooks.reverse();
        }
        for hook in hooks {
            hook.complete(committed).await;
        }
    }
}

#[async_trait]
impl Transaction for MemTransaction {
    async fn register_hook(&self, hook: CommitHook) {
        self.hooks.lock().await.push(hook);
    }

    async fn commit(&self) -> Result<(), Fault> {
        if self.toggles.fail_next_commit.swap(false, Ordering::SeqCst) {
            self.run_hooks(false).await;
            return Err(Fault::Resource("injected commit failure".into()));
        }
        self.toggles.commits.fetch_add(1, Ordering::SeqCst);
        self.run_hooks(true).await;
        Ok(())
    }

    async fn rollback(&self) -> Result<(), Fault> {
        self.run_hooks(false).await;
        Ok(())
    }
}

/// In-memory transactional store. Structural changes apply eagerly and are
/// undone by rollback hooks, matching the visibility the crate expects from
/// the host's persistence layer.
pub struct MemStore {
    state: Arc<StdMutex<StoreState>>,
    pub toggles: Arc<Toggles>,
}

impl MemStore {
    pub fn new() -> Arc<Self> {
        Arc::new(MemStore {
            state: Arc::new(StdMutex::new(StoreState::default())),
            toggles: Arc::new(Toggles::default()),
        })
    }

    /// Concrete handles to every persisted child of a destination with the
    /// given kind, for assertions and statistics injection.
    pub fn streams_of_kind(&self, destination: DestinationId, kind: StreamKind) -> Vec<Arc<MemStream>> {
        let state = self.state.lock().unwrap();
        state
            .roots
            .get(&destination)
            .map(|root| {
                root.children
                    .values()
                    .filter(|stream| stream.descriptor.kind == kind)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn child_count(&self, destination: DestinationId) -> usize {
        let state = self.state.lock().unwrap();
        state
            .roots
            .get(&destination)
            .map(|root| root.children.len())
            .unwrap_or(0)
    }

    pub fn root_exists(&self, destination: DestinationId) -> bool {
        self.state.lock().unwrap().roots.contains_key(&destination)
    }

    /// A caller-owned transaction, as the hosting broker's session layer
    /// would supply one.
    pub async fn begin_for_test(&self) -> Arc<dyn Transaction> {
        self.begin().await.expect("begin never fails in memory")
    }
}

#[async_trait]
impl TransactionalStore for MemStore {
    async fn begin(&self) -> Result<Arc<dyn Transaction>, Fault> {
        Ok(Arc::new(MemTransaction {
            hooks: Mutex::new(Vec::new()),
            toggles: self.toggles.clone(),
        }))
    }

    async fn add_root(
        &self,
        destination: DestinationId,
        txn: &dyn Transaction,
    ) -> Result<(), Fault> {
        self.state.lock().unwrap().roots.insert(
            destination,
            RootSlot {
                deleted: false,
                children: HashMap::new(),
            },
        );
        let state = self.state.clone();
        txn.register_hook(CommitHook::new("mem-root-undo").on_rollback(move || async move {
            state.lock().unwrap().roots.remove(&destination);
        }))
        .await;
        Ok(())
    }

    async fn mark_root_to_be_deleted(
        &self,
        destination: DestinationId,
        txn: &dyn Transaction,
    ) -> Result<(), Fault> {
        {
            let mut state = self.state.lock().unwrap();
            let root = state
                .roots
                .get_mut(&destination)
                .ok_or_else(|| Fault::Resource(format!("no root for {destination}")))?;
            root.deleted = true;
        }
        let state = self.state.clone();
        txn.register_hook(CommitHook::new("mem-root-mark-undo").on_rollback(
            move || async move {
                if let Some(root) = state.lock().unwrap().roots.get_mut(&destination) {
                    root.deleted = false;
                }
            },
        ))
        .await;
        Ok(())
    }

    async fn add_child_stream(
        &self,
        destination: DestinationId,
        descriptor: StreamDescriptor,
        txn: &dyn Transaction,
    ) -> Result<Arc<dyn StreamHandle>, AddChildError> {
        let stream = MemStream::new(descriptor, self.toggles.clone());
        {
            let mut state = self.state.lock().unwrap();
            let root = state.roots.get_mut(&destination).ok_or_else(|| {
                AddChildError::Fault(Fault::Resource(format!("no root for {destination}")))
            })?;
            if root.deleted {
                return Err(AddChildError::RootDeleted);
            }
            root.children.insert(stream.id, stream.clone());
        }
        let state = self.state.clone();
        let id = stream.id;
        txn.register_hook(CommitHook::new("mem-child-undo").on_rollback(move || async move {
            if let Some(root) = state.lock().unwrap().roots.get_mut(&destination) {
                root.children.remove(&id);
            }
        }))
        .await;
        Ok(stream)
    }

    async fn children_of_kind(
        &self,
        destination: DestinationId,
        kind: StreamKind,
    ) -> Result<Vec<Arc<dyn StreamHandle>>, Fault> {
        Ok(self
            .streams_of_kind(destination, kind)
            .into_iter()
            .map(|stream| stream as Arc<dyn StreamHandle>)
            .collect())
    }

    async fn remove_stream(
        &self,
        destination: DestinationId,
        stream: StreamId,
        txn: &dyn Transaction,
    ) -> Result<(), Fault> {
        let removed = {
            let mut state = self.state.lock().unwrap();
            let root = state
                .roots
                .get_mut(&destination)
                .ok_or_else(|| Fault::Resource(format!("no root for {destination}")))?;
            root.children
                .remove(&stream)
                .ok_or_else(|| Fault::Resource(format!("no stream {stream} to remove")))?
        };
        let state = self.state.clone();
        txn.register_hook(CommitHook::new("mem-remove-undo").on_rollback(move || async move {
            if let Some(root) = state.lock().unwrap().roots.get_mut(&destination) {
                root.children.insert(removed.id, removed);
            }
        }))
        .await;
        Ok(())
    }
}

/// Topology whose answers the test scripts. With nothing scripted it has no
/// answer, which exercises the guess-set fallbacks.
#[derive(Default)]
pub struct ScriptedTopology {
    hosting: StdMutex<Option<NodeId>>,
    link: StdMutex<Option<NodeId>>,
}

impl ScriptedTopology {
    pub fn new() -> Arc<Self> {
        Arc::new(ScriptedTopology::default())
    }

    pub fn script_hosting(&self, node: Option<NodeId>) {
        *self.hosting.lock().unwrap() = node;
    }

    pub fn script_link(&self, node: Option<NodeId>) {
        *self.link.lock().unwrap() = node;
    }
}

#[async_trait]
impl TopologyService for ScriptedTopology {
    async fn choose_hosting_node(
        &self,
        _guesses: &BTreeSet<NodeId>,
        _preferred: Option<NodeId>,
        _capability: Capability,
    ) -> Option<Selection> {
        self.hosting
            .lock()
            .unwrap()
            .map(|node| Selection { node })
    }

    async fn choose_link(&self, _link: DestinationId) -> Option<LinkSelection> {
        self.link.lock().unwrap().map(|node| LinkSelection { node })
    }

    async fn is_still_advertised(&self, _node: NodeId) -> bool {
        true
    }
}

/// Anycast input handler that records calls instead of speaking a protocol.
#[derive(Default)]
pub struct MockInputHandler {
    destination_deleted: AtomicBool,
    deleted: AtomicBool,
    fail_attach: AtomicBool,
    attached: StdMutex<Vec<ConsumerPointId>>,
}

impl MockInputHandler {
    pub fn set_destination_deleted(&self) {
        self.destination_deleted.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_attach(&self) {
        self.fail_attach.store(true, Ordering::SeqCst);
    }

    pub fn was_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    pub fn attached_count(&self) -> usize {
        self.attached.lock().unwrap().len()
    }
}

#[async_trait]
impl AnycastInputHandler for MockInputHandler {
    fn destination_deleted(&self) -> bool {
        self.destination_deleted.load(Ordering::SeqCst)
    }

    async fn attach_consumer_point(&self, point: ConsumerPointId) -> Result<(), Fault> {
        if self.fail_attach.swap(false, Ordering::SeqCst) {
            return Err(Fault::Resource("injected attach failure".into()));
        }
        self.attached.lock().unwrap().push(point);
        Ok(())
    }

    fn add_flushed_callback(&self, callback: Box<dyn FnOnce() + Send>) {
        callback();
    }

    async fn delete(&self) -> Result<(), Fault> {
        self.deleted.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory that counts creations and keeps every handler it made.
#[derive(Default)]
pub struct MockFactory {
    created: AtomicUsize,
    fail_create: AtomicBool,
    handlers: StdMutex<Vec<Arc<MockInputHandler>>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(MockFactory::default())
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn fail_next_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    pub fn handlers(&self) -> Vec<Arc<MockInputHandler>> {
        self.handlers.lock().unwrap().clone()
    }
}

#[async_trait]
impl AnycastHandlerFactory for MockFactory {
    async fn create_input_handler(
        &self,
        _spec: InputHandlerSpec,
        _container: Arc<dyn StreamHandle>,
        _receive: Arc<dyn StreamHandle>,
        _flush_on_bind: bool,
    ) -> Result<Arc<dyn AnycastInputHandler>, Fault> {
        if self.fail_create.swap(false, Ordering::SeqCst) {
            return Err(Fault::Resource("injected factory failure".into()));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        let handler = Arc::new(MockInputHandler::default());
        self.handlers.lock().unwrap().push(handler.clone());
        Ok(handler)
    }
}

/// Everything a test needs to drive the fabric against the mocks.
pub struct Harness {
    pub local: NodeId,
    pub store: Arc<MemStore>,
    pub topology: Arc<ScriptedTopology>,
    pub factory: Arc<MockFactory>,
    pub fabric: DestinationFabric,
}

impl Harness {
    pub fn new() -> Self {
        Harness::with_start_mode(StartMode::Normal)
    }

    pub fn with_start_mode(start_mode: StartMode) -> Self {
        Harness::with_flags(start_mode, false)
    }

    pub fn secured() -> Self {
        Harness::with_flags(StartMode::Normal, true)
    }

    fn with_flags(start_mode: StartMode, secured: bool) -> Self {
        // First harness in the process wins; later calls are no-ops.
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let local = NodeId::random();
        let store = MemStore::new();
        let topology = ScriptedTopology::new();
        let factory = MockFactory::new();
        let fabric = DestinationFabric::new(
            FabricConfig {
                local_node: local,
                start_mode,
                secured,
            },
            store.clone(),
            topology.clone(),
            factory.clone(),
        );
        Harness {
            local,
            store,
            topology,
            factory,
            fabric,
        }
    }

    /// A second fabric over the same store, as after a process restart.
    pub fn restarted(&self, start_mode: StartMode) -> Harness {
        let topology = ScriptedTopology::new();
        let factory = MockFactory::new();
        let fabric = DestinationFabric::new(
            FabricConfig {
                local_node: self.local,
                start_mode,
                secured: false,
            },
            self.store.clone(),
            topology.clone(),
            factory.clone(),
        );
        Harness {
            local: self.local,
            store: self.store.clone(),
            topology,
            factory,
            fabric,
        }
    }
}

pub fn queue(name: &str) -> DestinationDefinition {
    DestinationDefinition::new(DestinationId::random(), name, DestinationKind::Queue)
}

pub fn topic_space(name: &str) -> DestinationDefinition {
    DestinationDefinition::new(DestinationId::random(), name, DestinationKind::TopicSpace)
}

pub fn link(name: &str) -> DestinationDefinition {
    DestinationDefinition::new(DestinationId::random(), name, DestinationKind::Link)
}
