/********************************************************************************
 * Copyright (c) 2026 Contributors to the Eclipse Foundation
 *
 * See the NOTICE file(s) distributed with this work for additional
 * information regarding copyright ownership.
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 ********************************************************************************/

//! Per-destination realizations: the façade composing one localisation
//! manager and one remote-support instance, plus the kind-specific routing
//! behavior (point-to-point, publish/subscribe, bus link).

pub(crate) mod link;
pub(crate) mod ptp;
pub(crate) mod pubsub;

pub use link::LinkRouting;
pub use ptp::PtoPChoice;
pub use pubsub::PubSubRealization;

use crate::control_plane::LocalisationManager;
use crate::destination::DestinationDefinition;
use crate::error::Fault;
use crate::handler::{ConsumerDispatcher, OutputHandler};
use crate::identity::NodeId;
use crate::observability::events;
use crate::remote::RemoteSupport;
use crate::store::stream::{
    AddChildError, StreamDescriptor, StreamKind, StreamTag, TransactionalStore,
};
use crate::store::transaction::{CommitHook, Transaction, TxnScope};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, info, warn};

const COMPONENT: &str = "realization";

/// Kind-specific state and behavior of one realization. A closed set; every
/// destination is exactly one of these for its whole life.
pub enum RealizationKind {
    PointToPoint,
    PublishSubscribe(PubSubRealization),
    Link(LinkRouting),
}

/// Per-destination façade over localisation and remote-access state.
///
/// All cross-references go through ids resolved in the owning fabric; a
/// realization never holds a pointer back to its owner.
pub struct DestinationRealization {
    definition: DestinationDefinition,
    kind: RealizationKind,
    manager: Arc<LocalisationManager>,
    support: Arc<RemoteSupport>,
    store: Arc<dyn TransactionalStore>,
}

impl std::fmt::Debug for DestinationRealization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DestinationRealization")
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}

impl DestinationRealization {
    pub fn new(
        definition: DestinationDefinition,
        kind: RealizationKind,
        manager: Arc<LocalisationManager>,
        support: Arc<RemoteSupport>,
        store: Arc<dyn TransactionalStore>,
    ) -> Self {
        DestinationRealization {
            definition,
            kind,
            manager,
            support,
            store,
        }
    }

    pub fn definition(&self) -> &DestinationDefinition {
        &self.definition
    }

    pub fn kind(&self) -> &RealizationKind {
        &self.kind
    }

    pub fn manager(&self) -> &Arc<LocalisationManager> {
        &self.manager
    }

    pub fn support(&self) -> &Arc<RemoteSupport> {
        &self.support
    }

    pub(crate) fn store(&self) -> &Arc<dyn TransactionalStore> {
        &self.store
    }

    pub fn as_pubsub(&self) -> Option<&PubSubRealization> {
        match &self.kind {
            RealizationKind::PublishSubscribe(pubsub) => Some(pubsub),
            _ => None,
        }
    }

    pub fn as_link(&self) -> Option<&LinkRouting> {
        match &self.kind {
            RealizationKind::Link(link) => Some(link),
            _ => None,
        }
    }

    /// Creates the local queue point: its persisted message stream plus the
    /// consumer dispatcher, registered with the localisation manager only
    /// once the transaction commits.
    pub async fn add_local_localisation(
        &self,
        txn: Option<Arc<dyn Transaction>>,
    ) -> Result<Arc<ConsumerDispatcher>, Fault> {
        if self.manager.local_handler().await.is_some() {
            let fault = Fault::invariant(format!(
                "destination {} already has a local message stream",
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

        let scope = self.open_scope(txn).await?;
        let stream = match self
            .store
            .add_child_stream(
                self.definition.id,
                StreamDescriptor::new(StreamKind::LocalMessage, StreamTag::LocalQueue),
                scope.transaction().as_ref(),
            )
            .await
        {
            Ok(stream) => stream,
            Err(AddChildError::RootDeleted) => {
                scope.abandon().await;
                return Err(Fault::not_found(format!(
                    "destination {} is being deleted",
                    self.definition.id
                )));
            }
            Err(AddChildError::Fault(fault)) => {
                scope.abandon().await;
                return Err(fault);
            }
        };

        let dispatcher = Arc::new(ConsumerDispatcher::new(&self.definition, stream));
        let manager = self.manager.clone();
        let local_node = self.manager.local_node();
        let registered = dispatcher.clone();
        scope
            .transaction()
            .register_hook(
                CommitHook::new("local-localisation-add").on_commit(move || async move {
                    if let Err(fault) = manager
                        .assign(local_node, OutputHandler::Local(registered))
                        .await
                    {
                        error!(
                            component = COMPONENT,
                            event = events::INVARIANT_VIOLATED,
                            node = %local_node,
                            err = %fault,
                        );
                    }
                }),
            )
            .await;

        scope.conclude().await?;
        Ok(dispatcher)
    }

    /// Marks the local queue point to-be-deleted and deregisters its handler
    /// once the transaction commits. The stream is retained until drained.
    pub async fn remove_local_localisation(
        &self,
        txn: Option<Arc<dyn Transaction>>,
    ) -> Result<(), Fault> {
        let local_node = self.manager.local_node();
        let Some(OutputHandler::Local(dispatcher)) = self.manager.lookup(local_node).await else {
            return Err(Fault::not_found(format!(
                "destination {} has no local localisation",
                self.definition.id
            )));
        };

        let scope = self.open_scope(txn).await?;
        if let Err(fault) = dispatcher
            .stream()
            .mark_to_be_deleted(scope.transaction().as_ref())
            .await
        {
            scope.abandon().await;
            return Err(fault);
        }

        let manager = self.manager.clone();
        scope
            .transaction()
            .register_hook(
                CommitHook::new("local-localisation-remove").on_commit(move || async move {
                    manager.remove(local_node).await;
                }),
            )
            .await;
        scope.conclude().await
    }

    /// Creates (or reuses) the transmit pair toward a remote hosting node
    /// and registers it as that node's output handler.
    pub async fn add_remote_localisation(&self, node: NodeId) -> Result<(), Fault> {
        let handler = self.support.transmit_pair(node).await?;
        self.manager
            .assign(node, OutputHandler::RemoteTransmit(handler))
            .await
    }

    /// Applies an authoritative localisation set: rebuilds the guesses,
    /// materialises transmit pairs for newly added remote nodes, retires
    /// handlers for departed ones, and closes remote consumers held against
    /// nodes no longer in the set.
    pub async fn update_localisation_set(&self, nodes: &BTreeSet<NodeId>) -> Result<(), Fault> {
        let local_node = self.manager.local_node();
        let update = self.manager.update_localisation_set(nodes).await;

        for node in &update.added {
            if *node == local_node {
                continue;
            }
            if self.manager.lookup(*node).await.is_none() {
                self.add_remote_localisation(*node).await?;
            }
        }

        for node in &update.removed {
            if *node == local_node {
                // The local queue point outlives the set change until its
                // messages drain; only its handler registration goes.
                if self.manager.lookup(local_node).await.is_some() {
                    if let Err(fault) = self.remove_local_localisation(None).await {
                        warn!(
                            component = COMPONENT,
                            event = events::CLEANUP_DEFERRED,
                            destination = %self.definition.id,
                            err = %fault,
                            "retiring local queue point failed",
                        );
                    }
                }
                continue;
            }
            self.retire_remote_localisation(*node).await;
        }

        self.support.close_remote_consumers(nodes).await;
        Ok(())
    }

    /// Best-effort teardown of one departed remote localisation. Failures
    /// leave the transmit stream for the next cleanup pass.
    async fn retire_remote_localisation(&self, node: NodeId) {
        self.manager.remove(node).await;
        let Some(handler) = self.support.remove_transmit(node).await else {
            return;
        };

        let outcome = async {
            let txn = self.store.begin().await?;
            if let Err(fault) = handler.stream().mark_to_be_deleted(txn.as_ref()).await {
                TxnScope::owned(txn).abandon().await;
                return Err(fault);
            }
            txn.commit().await
        }
        .await;
        if let Err(fault) = outcome {
            warn!(
                component = COMPONENT,
                event = events::CLEANUP_DEFERRED,
                destination = %self.definition.id,
                node = %node,
                err = %fault,
                "marking departed transmit stream failed",
            );
        }
    }

    /// Rebuilds this realization's runtime state from persisted streams
    /// after a restart: the local queue point, the remote-access maps, the
    /// link transmit binding, and (for topic spaces) the subscription table.
    pub async fn reconstitute(&self) -> Result<(), Fault> {
        let locals = self
            .store
            .children_of_kind(self.definition.id, StreamKind::LocalMessage)
            .await?;
        if locals.len() > 1 {
            return Err(Fault::invariant(format!(
                "destination {} recovered {} local message streams",
                self.definition.id,
                locals.len()
            )));
        }
        if let Some(stream) = locals.into_iter().next() {
            let dispatcher = Arc::new(ConsumerDispatcher::new(&self.definition, stream));
            self.manager
                .assign(
                    self.manager.local_node(),
                    OutputHandler::Local(dispatcher),
                )
                .await?;
            info!(
                component = COMPONENT,
                event = events::RECONSTITUTE_HANDLER_BOUND,
                destination = %self.definition.id,
                kind = "local_queue_point",
            );
        }

        self.support.reconstitute().await?;

        match &self.kind {
            RealizationKind::PointToPoint => {}
            RealizationKind::PublishSubscribe(pubsub) => {
                pubsub.reconstitute(&self.definition, &self.store).await?;
            }
            RealizationKind::Link(link) => {
                link.reconstitute(&self.definition, &self.store).await?;
            }
        }
        Ok(())
    }

    async fn open_scope(&self, txn: Option<Arc<dyn Transaction>>) -> Result<TxnScope, Fault> {
        Ok(match txn {
            Some(txn) => TxnScope::caller(txn),
            None => TxnScope::owned(self.store.begin().await?),
        })
    }
}
