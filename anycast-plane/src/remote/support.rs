//! Remote-access registry: one live input handler and container stream per
//! remote-access key, one transmit pair per remote node.

use crate::destination::DestinationDefinition;
use crate::error::{Fault, LockedReason};
use crate::handler::{
    AnycastHandlerFactory, AnycastInputHandler, InputHandlerSpec, TransmitHandler,
};
use crate::identity::{DestinationId, NodeId, RemoteAccessKey};
use crate::observability::{events, fields};
use crate::store::stream::{
    AddChildError, StreamDescriptor, StreamHandle, StreamKind, StreamTag, TransactionalStore,
};
use crate::store::transaction::{CommitHook, Transaction, TxnScope};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

const COMPONENT: &str = "remote_support";

/// Attempts and spacing of the wait-and-recheck loop used when a racing
/// create or delete holds a key's slot.
const RACE_POLL_ATTEMPTS: usize = 10;
const RACE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How the hosting engine started, which decides restart-recovery behavior.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StartMode {
    /// Warm start; recovered handlers resume where they left off.
    Normal,
    /// Restart after failover; recovered handler streams are flushed on bind.
    RecoveryFlush,
    /// Restart from a stale backup of the store. Inconsistencies that a
    /// normal start absorbs are fatal here, since silent absorption would
    /// hide data loss.
    StaleBackup,
}

/// One live remote access: the consumer-facing input handler plus the two
/// streams backing the anycast exchange for its key.
pub struct RemoteAccess {
    key: RemoteAccessKey,
    handler: Arc<dyn AnycastInputHandler>,
    container: Arc<dyn StreamHandle>,
    receive: Arc<dyn StreamHandle>,
}

impl std::fmt::Debug for RemoteAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteAccess")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl RemoteAccess {
    pub(super) fn new(
        key: RemoteAccessKey,
        handler: Arc<dyn AnycastInputHandler>,
        container: Arc<dyn StreamHandle>,
        receive: Arc<dyn StreamHandle>,
    ) -> Self {
        RemoteAccess {
            key,
            handler,
            container,
            receive,
        }
    }

    pub fn key(&self) -> RemoteAccessKey {
        self.key
    }

    pub fn handler(&self) -> &Arc<dyn AnycastInputHandler> {
        &self.handler
    }

    pub fn container(&self) -> &Arc<dyn StreamHandle> {
        &self.container
    }

    pub fn receive(&self) -> &Arc<dyn StreamHandle> {
        &self.receive
    }
}

/// Map slot for one remote-access key. A `Pending` marker holds the slot
/// while a create or delete is in flight so racing callers wait instead of
/// duplicating streams.
pub(super) enum AccessEntry {
    Pending,
    Ready(Arc<RemoteAccess>),
}

/// Map slot for one remote node's transmit pair, with the same `Pending`
/// discipline as the access map so lookups never wait on store writes.
pub(super) enum TransmitEntry {
    Pending,
    Ready(Arc<TransmitHandler>),
}

/// Per-destination anycast bookkeeping.
///
/// Registries are mutated only from transaction completion hooks (or, for
/// `Pending` markers, under the map lock), so a rolled-back create never
/// leaves a handler visible.
pub struct RemoteSupport {
    pub(super) definition: DestinationDefinition,
    pub(super) start_mode: StartMode,
    pub(super) store: Arc<dyn TransactionalStore>,
    pub(super) factory: Arc<dyn AnycastHandlerFactory>,
    pub(super) accesses: Arc<Mutex<HashMap<RemoteAccessKey, AccessEntry>>>,
    pub(super) transmits: Arc<Mutex<HashMap<NodeId, TransmitEntry>>>,
    pub(super) pseudo_index: Mutex<HashMap<DestinationId, Arc<RemoteAccess>>>,
}

impl RemoteSupport {
    pub fn new(
        definition: DestinationDefinition,
        start_mode: StartMode,
        store: Arc<dyn TransactionalStore>,
        factory: Arc<dyn AnycastHandlerFactory>,
    ) -> Self {
        RemoteSupport {
            definition,
            start_mode,
            store,
            factory,
            accesses: Arc::new(Mutex::new(HashMap::new())),
            transmits: Arc::new(Mutex::new(HashMap::new())),
            pseudo_index: Mutex::new(HashMap::new()),
        }
    }

    pub fn destination(&self) -> DestinationId {
        self.definition.id
    }

    /// Looks up (and optionally creates) the input handler for one key.
    ///
    /// `Ok(None)` means no handler exists and either creation was not
    /// requested or the destination is being deleted; the latter is absorbed
    /// rather than propagated because a consumer racing a destination delete
    /// is an ordinary shutdown ordering, not an error. On a stale-backup
    /// restart the same condition is fatal instead.
    pub async fn get_or_create_input_handler(
        &self,
        key: RemoteAccessKey,
        create_if_absent: bool,
    ) -> Result<Option<Arc<RemoteAccess>>, Fault> {
        for attempt in 0..RACE_POLL_ATTEMPTS {
            {
                let mut accesses = self.accesses.lock().await;
                match accesses.get(&key) {
                    Some(AccessEntry::Ready(access)) => return Ok(Some(access.clone())),
                    Some(AccessEntry::Pending) => {}
                    None => {
                        if !create_if_absent {
                            return Ok(None);
                        }
                        accesses.insert(key, AccessEntry::Pending);
                        drop(accesses);
                        return self.create_access(key).await;
                    }
                }
            }
            debug!(
                component = COMPONENT,
                event = events::REMOTE_ACCESS_WAIT,
                destination = %self.definition.id,
                key = fields::format_access_key(&key),
                attempt,
            );
            sleep(RACE_POLL_INTERVAL).await;
        }
        Err(Fault::locked(
            LockedReason::CreateOrDeleteInFlight,
            format!(
                "remote access {} did not settle within {RACE_POLL_ATTEMPTS} attempts",
                fields::format_access_key(&key)
            ),
        ))
    }

    /// Creates the container/receive streams and the handler for a key whose
    /// slot this caller has already marked `Pending`.
    async fn create_access(
        &self,
        key: RemoteAccessKey,
    ) -> Result<Option<Arc<RemoteAccess>>, Fault> {
        let result = self.try_create_access(key).await;
        match result {
            Ok(access) => Ok(Some(access)),
            Err(CreateFailure::RootDeleted) => {
                self.clear_pending_access(key).await;
                if self.start_mode == StartMode::StaleBackup {
                    let fault = Fault::invariant(format!(
                        "destination {} root stream deleted in stale-backup restart",
                        self.definition.id
                    ));
                    error!(
                        component = COMPONENT,
                        event = events::INVARIANT_VIOLATED,
                        destination = %self.definition.id,
                        err = %fault,
                    );
                    return Err(fault);
                }
                info!(
                    component = COMPONENT,
                    event = events::REMOTE_ACCESS_CREATE_ABSORBED,
                    destination = %self.definition.id,
                    key = fields::format_access_key(&key),
                );
                Ok(None)
            }
            Err(CreateFailure::Fault(fault)) => {
                self.clear_pending_access(key).await;
                Err(fault)
            }
        }
    }

    /// Clears the `Pending` marker left by a failed create. A rollback hook
    /// may already have cleared it; a `Ready` entry is never touched.
    async fn clear_pending_access(&self, key: RemoteAccessKey) {
        let mut accesses = self.accesses.lock().await;
        if matches!(accesses.get(&key), Some(AccessEntry::Pending)) {
            accesses.remove(&key);
        }
    }

    async fn try_create_access(
        &self,
        key: RemoteAccessKey,
    ) -> Result<Arc<RemoteAccess>, CreateFailure> {
        let txn = self.store.begin().await.map_err(CreateFailure::Fault)?;

        let access = match self.build_access(key, txn.as_ref()).await {
            Ok(access) => access,
            Err(failure) => {
                // Undo whatever the failing step left behind under the open
                // transaction, the container stream included.
                TxnScope::owned(txn).abandon().await;
                return Err(failure);
            }
        };

        // The Ready entry appears only once the streams are durable; a
        // rollback drops the Pending marker so a retry can start clean.
        let accesses = self.accesses.clone();
        let committed_access = access.clone();
        let rollback_accesses = self.accesses.clone();
        txn.register_hook(
            CommitHook::new("remote-access-create")
                .on_commit(move || async move {
                    accesses
                        .lock()
                        .await
                        .insert(key, AccessEntry::Ready(committed_access));
                })
                .on_rollback(move || async move {
                    rollback_accesses.lock().await.remove(&key);
                }),
        )
        .await;

        txn.commit().await.map_err(CreateFailure::Fault)?;

        info!(
            component = COMPONENT,
            event = events::REMOTE_ACCESS_CREATED,
            destination = %self.definition.id,
            key = fields::format_access_key(&key),
        );
        Ok(access)
    }

    /// Adds the container/receive stream pair and constructs the input
    /// handler under the given transaction.
    async fn build_access(
        &self,
        key: RemoteAccessKey,
        txn: &dyn Transaction,
    ) -> Result<Arc<RemoteAccess>, CreateFailure> {
        let destination = self.definition.id;
        let container = self
            .store
            .add_child_stream(
                destination,
                StreamDescriptor::new(StreamKind::AnycastContainer, StreamTag::RemoteAccess(key)),
                txn,
            )
            .await
            .map_err(CreateFailure::from)?;
        let receive = self
            .store
            .add_child_stream(
                destination,
                StreamDescriptor::new(StreamKind::AnycastReceive, StreamTag::RemoteAccess(key)),
                txn,
            )
            .await
            .map_err(CreateFailure::from)?;

        let handler = self
            .factory
            .create_input_handler(
                InputHandlerSpec {
                    name: self.definition.name.clone(),
                    destination,
                    exclusive: self.definition.receive_exclusive,
                },
                container.clone(),
                receive.clone(),
                false,
            )
            .await
            .map_err(CreateFailure::Fault)?;

        Ok(Arc::new(RemoteAccess::new(key, handler, container, receive)))
    }

    /// Tears down one remote access: the handler first, then the unassigned
    /// receive items, then the streams, then the map entry. Each persisted
    /// step commits its own transaction so a crash mid-sequence leaves
    /// partial state the next restart can recover, never a dangling handler.
    pub async fn remove_input_handler_and_stream(&self, key: RemoteAccessKey) -> Result<(), Fault> {
        let access = {
            let mut accesses = self.accesses.lock().await;
            match accesses.get(&key) {
                Some(AccessEntry::Ready(access)) => {
                    let access = access.clone();
                    accesses.insert(key, AccessEntry::Pending);
                    access
                }
                Some(AccessEntry::Pending) => {
                    return Err(Fault::locked(
                        LockedReason::CreateOrDeleteInFlight,
                        format!(
                            "remote access {} has a create or delete in flight",
                            fields::format_access_key(&key)
                        ),
                    ))
                }
                None => {
                    return Err(Fault::not_found(format!(
                        "no remote access for key {}",
                        fields::format_access_key(&key)
                    )))
                }
            }
        };

        let outcome = self.teardown_access(&access).await;

        // The slot is surrendered either way; failed stream removal is
        // re-attempted by the restart scan, not by retrying against a
        // half-deleted handler.
        self.accesses.lock().await.remove(&key);
        self.pseudo_index
            .lock()
            .await
            .retain(|_, indexed| indexed.key() != key);

        match outcome {
            Ok(()) => {
                info!(
                    component = COMPONENT,
                    event = events::REMOTE_ACCESS_REMOVED,
                    destination = %self.definition.id,
                    key = fields::format_access_key(&key),
                );
                Ok(())
            }
            Err(fault) => {
                warn!(
                    component = COMPONENT,
                    event = events::CLEANUP_DEFERRED,
                    destination = %self.definition.id,
                    key = fields::format_access_key(&key),
                    err = %fault,
                );
                Err(fault)
            }
        }
    }

    /// Removes the receive-side unassigned items, then the receive stream,
    /// then the container stream, each step under its own committed
    /// transaction; a crash between steps leaves only work the restart scan
    /// can finish. A failing step rolls its own transaction back before
    /// propagating.
    async fn teardown_access(&self, access: &RemoteAccess) -> Result<(), Fault> {
        let destination = self.definition.id;
        access.handler.delete().await?;

        // Unassigned items first: once they are gone, removal of items that a
        // remote request still holds can reject cleanly.
        let txn = self.store.begin().await?;
        if let Err(fault) = access.receive.remove_unassigned(txn.as_ref()).await {
            TxnScope::owned(txn).abandon().await;
            return Err(fault);
        }
        txn.commit().await?;

        let txn = self.store.begin().await?;
        let removed: Result<(), Fault> = async {
            access.receive.remove_all(txn.as_ref()).await?;
            self.store
                .remove_stream(destination, access.receive.id(), txn.as_ref())
                .await
        }
        .await;
        if let Err(fault) = removed {
            TxnScope::owned(txn).abandon().await;
            return Err(fault);
        }
        txn.commit().await?;

        let txn = self.store.begin().await?;
        let removed: Result<(), Fault> = async {
            access.container.remove_all(txn.as_ref()).await?;
            self.store
                .remove_stream(destination, access.container.id(), txn.as_ref())
                .await
        }
        .await;
        if let Err(fault) = removed {
            TxnScope::owned(txn).abandon().await;
            return Err(fault);
        }
        txn.commit().await
    }

    /// Tears down every remote access held for a node that is no longer in
    /// the localisation set. Failures are logged and left to the restart
    /// scan; one stuck access must not keep a departed node's others alive.
    pub async fn close_remote_consumers(&self, retained: &BTreeSet<NodeId>) {
        let stale: Vec<RemoteAccessKey> = {
            let accesses = self.accesses.lock().await;
            accesses
                .keys()
                .filter(|key| !retained.contains(&key.requesting_node))
                .copied()
                .collect()
        };
        if stale.is_empty() {
            return;
        }

        let mut closed = 0usize;
        for key in stale {
            match self.remove_input_handler_and_stream(key).await {
                Ok(()) => closed += 1,
                Err(fault) => warn!(
                    component = COMPONENT,
                    destination = %self.definition.id,
                    key = fields::format_access_key(&key),
                    err = %fault,
                    "closing remote consumer failed",
                ),
            }
        }
        info!(
            component = COMPONENT,
            event = events::REMOTE_CONSUMERS_CLOSED,
            destination = %self.definition.id,
            closed,
        );
    }

    /// Looks up (or creates) the transmit handler toward one remote node,
    /// backed by its own persisted transmit stream.
    ///
    /// A `Pending` marker holds the slot while the stream is written, so the
    /// map lock never spans store I/O and racing callers wait instead of
    /// duplicating the stream.
    pub async fn transmit_pair(&self, node: NodeId) -> Result<Arc<TransmitHandler>, Fault> {
        for attempt in 0..RACE_POLL_ATTEMPTS {
            {
                let mut transmits = self.transmits.lock().await;
                match transmits.get(&node) {
                    Some(TransmitEntry::Ready(handler)) => return Ok(handler.clone()),
                    Some(TransmitEntry::Pending) => {}
                    None => {
                        transmits.insert(node, TransmitEntry::Pending);
                        drop(transmits);
                        return self.create_transmit(node).await;
                    }
                }
            }
            debug!(
                component = COMPONENT,
                event = events::TRANSMIT_PAIR_WAIT,
                destination = %self.definition.id,
                node = %node,
                attempt,
            );
            sleep(RACE_POLL_INTERVAL).await;
        }
        Err(Fault::locked(
            LockedReason::CreateOrDeleteInFlight,
            format!("transmit pair toward {node} did not settle within {RACE_POLL_ATTEMPTS} attempts"),
        ))
    }

    /// Creates the persisted transmit stream for a node whose slot this
    /// caller has already marked `Pending`.
    async fn create_transmit(&self, node: NodeId) -> Result<Arc<TransmitHandler>, Fault> {
        let result = self.try_create_transmit(node).await;
        if result.is_err() {
            let mut transmits = self.transmits.lock().await;
            if matches!(transmits.get(&node), Some(TransmitEntry::Pending)) {
                transmits.remove(&node);
            }
        }
        result
    }

    async fn try_create_transmit(&self, node: NodeId) -> Result<Arc<TransmitHandler>, Fault> {
        let txn = self.store.begin().await?;
        let added = self
            .store
            .add_child_stream(
                self.definition.id,
                StreamDescriptor::new(StreamKind::Transmit, StreamTag::TransmitTo(node)),
                txn.as_ref(),
            )
            .await
            .map_err(|err| match err {
                AddChildError::RootDeleted => Fault::not_found(format!(
                    "destination {} is being deleted",
                    self.definition.id
                )),
                AddChildError::Fault(fault) => fault,
            });
        let stream = match added {
            Ok(stream) => stream,
            Err(fault) => {
                TxnScope::owned(txn).abandon().await;
                return Err(fault);
            }
        };

        let handler = Arc::new(TransmitHandler::new(&self.definition, Some(node), stream));

        // The Ready entry appears only once the stream is durable; a rollback
        // drops the Pending marker so a retry can start clean.
        let transmits = self.transmits.clone();
        let committed = handler.clone();
        let rollback_transmits = self.transmits.clone();
        txn.register_hook(
            CommitHook::new("transmit-pair-create")
                .on_commit(move || async move {
                    transmits
                        .lock()
                        .await
                        .insert(node, TransmitEntry::Ready(committed));
                })
                .on_rollback(move || async move {
                    rollback_transmits.lock().await.remove(&node);
                }),
        )
        .await;
        txn.commit().await?;

        info!(
            component = COMPONENT,
            event = events::TRANSMIT_PAIR_CREATED,
            destination = %self.definition.id,
            node = %node,
        );
        Ok(handler)
    }

    /// The transmit stream toward a node, when one exists.
    pub async fn xmit_stream(&self, node: NodeId) -> Option<Arc<dyn StreamHandle>> {
        self.lookup_transmit(node)
            .await
            .map(|handler| handler.stream().clone())
    }

    pub async fn lookup_transmit(&self, node: NodeId) -> Option<Arc<TransmitHandler>> {
        match self.transmits.lock().await.get(&node) {
            Some(TransmitEntry::Ready(handler)) => Some(handler.clone()),
            _ => None,
        }
    }

    pub async fn remove_transmit(&self, node: NodeId) -> Option<Arc<TransmitHandler>> {
        let mut transmits = self.transmits.lock().await;
        match transmits.remove(&node) {
            Some(TransmitEntry::Ready(handler)) => Some(handler),
            Some(TransmitEntry::Pending) => {
                // The in-flight create owns the marker; its hook will publish
                // or clear it.
                transmits.insert(node, TransmitEntry::Pending);
                None
            }
            None => None,
        }
    }

    /// Indexes a remote access under the pseudo destination carrying one
    /// durable subscription's traffic.
    pub async fn register_pseudo(&self, pseudo: DestinationId, access: Arc<RemoteAccess>) {
        self.pseudo_index.lock().await.insert(pseudo, access);
    }

    pub async fn lookup_pseudo(&self, pseudo: DestinationId) -> Option<Arc<RemoteAccess>> {
        self.pseudo_index.lock().await.get(&pseudo).cloned()
    }

    pub async fn deregister_pseudo(&self, pseudo: DestinationId) -> Option<Arc<RemoteAccess>> {
        self.pseudo_index.lock().await.remove(&pseudo)
    }

    /// Number of live (ready) remote accesses.
    pub async fn access_count(&self) -> usize {
        self.accesses
            .lock()
            .await
            .values()
            .filter(|entry| matches!(entry, AccessEntry::Ready(_)))
            .count()
    }
}

enum CreateFailure {
    RootDeleted,
    Fault(Fault),
}

impl From<AddChildError> for CreateFailure {
    fn from(err: AddChildError) -> Self {
        match err {
            AddChildError::RootDeleted => CreateFailure::RootDeleted,
            AddChildError::Fault(fault) => CreateFailure::Fault(fault),
        }
    }
}
