//! Node-local durable subscription table.

use crate::destination::DestinationDefinition;
use crate::durable::state::DurableSubscriptionState;
use crate::error::{Fault, LockedReason};
use crate::handler::{AttachKey, ConsumerDispatcher, ConsumerPointId};
use crate::identity::SubscriberId;
use crate::observability::events;
use crate::store::stream::{
    AddChildError, StreamDescriptor, StreamKind, StreamTag, TransactionalStore,
};
use crate::store::transaction::{CommitHook, Transaction, TxnScope};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

const COMPONENT: &str = "durable_table";

/// Outcome of a durable operation driven from another node, where faults
/// must travel as a status rather than an error chain.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DurableOpStatus {
    Completed,
    NotFound,
    Locked,
}

/// One subscriber's slot. `Creating` and `PendingDelete` hold the slot while
/// the corresponding transaction or cleanup is in flight.
enum TableEntry {
    Creating,
    Ready(Arc<ConsumerDispatcher>),
    PendingDelete(Arc<ConsumerDispatcher>),
}

/// Durable subscriptions homed on this node for one topic space.
///
/// Entries become `Ready` only from inside the create transaction's commit
/// hook and are dereferenced by its rollback hook, so a rolled-back create
/// is indistinguishable from no create at all.
pub struct DurableSubscriptionTable {
    definition: DestinationDefinition,
    /// Whether the bus is secured; decides if the creating principal is
    /// checked on attach.
    secured: bool,
    store: Arc<dyn TransactionalStore>,
    entries: Arc<Mutex<HashMap<SubscriberId, TableEntry>>>,
}

impl DurableSubscriptionTable {
    pub fn new(
        definition: DestinationDefinition,
        secured: bool,
        store: Arc<dyn TransactionalStore>,
    ) -> Self {
        DurableSubscriptionTable {
            definition,
            secured,
            store,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Creates a durable subscription homed on this node.
    ///
    /// The reference stream and dispatcher are created inside the caller's
    /// transaction (or an autocommit one); the table entry turns `Ready`
    /// only on commit and is dropped on rollback.
    pub async fn create_local(
        &self,
        state: DurableSubscriptionState,
        txn: Option<Arc<dyn Transaction>>,
    ) -> Result<Arc<ConsumerDispatcher>, Fault> {
        let subscriber = state.subscriber_id.clone();
        {
            let mut entries = self.entries.lock().await;
            if entries.contains_key(&subscriber) {
                return Err(Fault::AlreadyExists(format!(
                    "durable subscription {subscriber} already exists"
                )));
            }
            entries.insert(subscriber.clone(), TableEntry::Creating);
        }

        match self.try_create_local(state, txn).await {
            Ok(dispatcher) => Ok(dispatcher),
            Err(fault) => {
                self.entries.lock().await.remove(&subscriber);
                Err(fault)
            }
        }
    }

    async fn try_create_local(
        &self,
        state: DurableSubscriptionState,
        txn: Option<Arc<dyn Transaction>>,
    ) -> Result<Arc<ConsumerDispatcher>, Fault> {
        let subscriber = state.subscriber_id.clone();
        let scope = match txn {
            Some(txn) => TxnScope::caller(txn),
            None => TxnScope::owned(self.store.begin().await?),
        };

        let stream = match self
            .store
            .add_child_stream(
                self.definition.id,
                StreamDescriptor::new(
                    StreamKind::SubscriptionReference,
                    StreamTag::Subscription(state.clone()),
                ),
                scope.transaction().as_ref(),
            )
            .await
        {
            Ok(stream) => stream,
            Err(AddChildError::RootDeleted) => {
                scope.abandon().await;
                return Err(Fault::not_found(format!(
                    "topic space {} is being deleted",
                    self.definition.id
                )));
            }
            Err(AddChildError::Fault(fault)) => {
                scope.abandon().await;
                return Err(fault);
            }
        };

        let dispatcher = Arc::new(ConsumerDispatcher::for_durable_subscription(
            &self.definition,
            stream,
            state,
        ));

        let entries = self.entries.clone();
        let rollback_entries = self.entries.clone();
        let committed = dispatcher.clone();
        let commit_id = subscriber.clone();
        let rollback_id = subscriber.clone();
        let destination = self.definition.id;
        scope
            .transaction()
            .register_hook(
                CommitHook::new("durable-create")
                    .on_commit(move || async move {
                        info!(
                            component = COMPONENT,
                            event = events::DURABLE_CREATED,
                            destination = %destination,
                            subscriber = %commit_id,
                        );
                        entries
                            .lock()
                            .await
                            .insert(commit_id, TableEntry::Ready(committed));
                    })
                    .on_rollback(move || async move {
                        info!(
                            component = COMPONENT,
                            event = events::DURABLE_CREATE_ROLLED_BACK,
                            destination = %destination,
                            subscriber = %rollback_id,
                        );
                        rollback_entries.lock().await.remove(&rollback_id);
                    }),
            )
            .await;

        scope.conclude().await?;
        Ok(dispatcher)
    }

    /// Attaches a consumer to a subscription homed here.
    pub async fn attach_local(
        &self,
        requested: &DurableSubscriptionState,
        point: ConsumerPointId,
    ) -> Result<(AttachKey, Arc<ConsumerDispatcher>), Fault> {
        let subscriber = &requested.subscriber_id;
        let dispatcher = {
            let entries = self.entries.lock().await;
            match entries.get(subscriber) {
                Some(TableEntry::Ready(dispatcher)) => dispatcher.clone(),
                Some(TableEntry::Creating) | Some(TableEntry::PendingDelete(_)) => {
                    return Err(Fault::locked(
                        LockedReason::CreateOrDeleteInFlight,
                        format!("durable subscription {subscriber} is being created or deleted"),
                    ))
                }
                None => {
                    return Err(Fault::not_found(format!(
                        "durable subscription {subscriber} does not exist"
                    )))
                }
            }
        };

        let existing = dispatcher
            .durable_state()
            .ok_or_else(|| Fault::invariant(format!(
                "table entry for {subscriber} has no subscription state"
            )))?;
        if !existing.matches(requested) {
            return Err(Fault::mismatch(format!(
                "attach parameters for {subscriber} differ from the existing subscription"
            )));
        }
        if self.secured && !existing.same_user(requested) {
            return Err(Fault::mismatch(format!(
                "attach principal for {subscriber} differs from the creating principal"
            )));
        }

        let key = dispatcher.attach_consumer_point(point)?;
        info!(
            component = COMPONENT,
            event = events::DURABLE_ATTACHED,
            destination = %self.definition.id,
            subscriber = %subscriber,
        );
        Ok((key, dispatcher))
    }

    /// Deletes a subscription homed here.
    ///
    /// The to-be-deleted mark persists first; only then does the entry leave
    /// the table, and physical stream removal is best-effort afterwards. If
    /// persisting the mark fails the entry reverts to `Ready` untouched.
    pub async fn delete_local(&self, subscriber: &SubscriberId) -> Result<(), Fault> {
        let dispatcher = {
            let mut entries = self.entries.lock().await;
            match entries.get(subscriber) {
                Some(TableEntry::Ready(dispatcher)) => {
                    if dispatcher.has_consumers_attached() {
                        return Err(Fault::locked(
                            LockedReason::ConsumersAttached,
                            format!("durable subscription {subscriber} has attached consumers"),
                        ));
                    }
                    if dispatcher.has_uncommitted_receives() {
                        return Err(Fault::locked(
                            LockedReason::UncommittedReceives,
                            format!(
                                "durable subscription {subscriber} has uncommitted receives"
                            ),
                        ));
                    }
                    let dispatcher = dispatcher.clone();
                    entries.insert(
                        subscriber.clone(),
                        TableEntry::PendingDelete(dispatcher.clone()),
                    );
                    dispatcher
                }
                Some(TableEntry::Creating) => {
                    return Err(Fault::locked(
                        LockedReason::CreateOrDeleteInFlight,
                        format!("durable subscription {subscriber} is still being created"),
                    ))
                }
                Some(TableEntry::PendingDelete(_)) | None => {
                    return Err(Fault::not_found(format!(
                        "durable subscription {subscriber} does not exist"
                    )))
                }
            }
        };

        let marked = async {
            let txn = self.store.begin().await?;
            dispatcher.stream().mark_to_be_deleted(txn.as_ref()).await?;
            txn.commit().await
        }
        .await;
        if let Err(fault) = marked {
            // The mark never became durable, so the subscription stays fully
            // usable.
            self.entries
                .lock()
                .await
                .insert(subscriber.clone(), TableEntry::Ready(dispatcher));
            warn!(
                component = COMPONENT,
                event = events::DURABLE_DELETE_REVERTED,
                destination = %self.definition.id,
                subscriber = %subscriber,
                err = %fault,
            );
            return Err(fault);
        }

        self.entries.lock().await.remove(subscriber);
        info!(
            component = COMPONENT,
            event = events::DURABLE_DELETED,
            destination = %self.definition.id,
            subscriber = %subscriber,
        );

        let cleaned = async {
            let txn = self.store.begin().await?;
            dispatcher.stream().remove_all(txn.as_ref()).await?;
            self.store
                .remove_stream(self.definition.id, dispatcher.stream().id(), txn.as_ref())
                .await?;
            txn.commit().await
        }
        .await;
        if let Err(fault) = cleaned {
            warn!(
                component = COMPONENT,
                event = events::CLEANUP_DEFERRED,
                destination = %self.definition.id,
                subscriber = %subscriber,
                err = %fault,
            );
        }
        Ok(())
    }

    /// Delete driven from another node. Expected rejections travel as a
    /// status; only genuine failures become faults.
    pub async fn delete_from_remote(
        &self,
        subscriber: &SubscriberId,
    ) -> Result<DurableOpStatus, Fault> {
        match self.delete_local(subscriber).await {
            Ok(()) => Ok(DurableOpStatus::Completed),
            Err(Fault::NotFound(_)) => Ok(DurableOpStatus::NotFound),
            Err(Fault::Locked { .. }) => Ok(DurableOpStatus::Locked),
            Err(fault) => Err(fault),
        }
    }

    pub async fn lookup(&self, subscriber: &SubscriberId) -> Option<Arc<ConsumerDispatcher>> {
        match self.entries.lock().await.get(subscriber) {
            Some(TableEntry::Ready(dispatcher)) => Some(dispatcher.clone()),
            _ => None,
        }
    }

    /// Ids of every ready subscription, for admin enumeration.
    pub async fn subscription_list(&self) -> Vec<SubscriberId> {
        let entries = self.entries.lock().await;
        let mut ids: Vec<SubscriberId> = entries
            .iter()
            .filter(|(_, entry)| matches!(entry, TableEntry::Ready(_)))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Rebuilds the table from persisted reference streams. Streams still
    /// marked to-be-deleted get their interrupted cleanup finished instead
    /// of a table entry.
    pub async fn reconstitute(&self) -> Result<(), Fault> {
        for stream in self
            .store
            .children_of_kind(self.definition.id, StreamKind::SubscriptionReference)
            .await?
        {
            let StreamTag::Subscription(state) = stream.descriptor().tag else {
                let fault = Fault::invariant(format!(
                    "reference stream {} carries no subscription state",
                    stream.id()
                ));
                error!(
                    component = COMPONENT,
                    event = events::INVARIANT_VIOLATED,
                    destination = %self.definition.id,
                    err = %fault,
                );
                return Err(fault);
            };
            let subscriber = state.subscriber_id.clone();

            if stream.is_to_be_deleted() {
                let cleaned = async {
                    let txn = self.store.begin().await?;
                    stream.remove_all(txn.as_ref()).await?;
                    self.store
                        .remove_stream(self.definition.id, stream.id(), txn.as_ref())
                        .await?;
                    txn.commit().await
                }
                .await;
                if let Err(fault) = cleaned {
                    warn!(
                        component = COMPONENT,
                        event = events::CLEANUP_DEFERRED,
                        destination = %self.definition.id,
                        subscriber = %subscriber,
                        err = %fault,
                    );
                }
                continue;
            }

            let dispatcher = Arc::new(ConsumerDispatcher::for_durable_subscription(
                &self.definition,
                stream,
                state,
            ));
            info!(
                component = COMPONENT,
                event = events::RECONSTITUTE_HANDLER_BOUND,
                destination = %self.definition.id,
                subscriber = %subscriber,
                kind = "durable_subscription",
            );
            self.entries
                .lock()
                .await
                .insert(subscriber, TableEntry::Ready(dispatcher));
        }
        Ok(())
    }
}
