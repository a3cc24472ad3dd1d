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

//! The destination fabric: central registry owning every realization on this
//! node. Cross-references between realizations go through destination-id
//! lookups here, never through back-pointers.

use crate::control_plane::LocalisationManager;
use crate::destination::{DestinationDefinition, DestinationKind};
use crate::durable::table::DurableSubscriptionTable;
use crate::error::Fault;
use crate::identity::{DestinationId, NodeId};
use crate::observability::events;
use crate::realization::{DestinationRealization, LinkRouting, PubSubRealization, RealizationKind};
use crate::remote::{RemoteSupport, StartMode};
use crate::store::stream::TransactionalStore;
use crate::store::transaction::{CommitHook, Transaction, TxnScope};
use crate::topology::TopologyService;
use crate::handler::AnycastHandlerFactory;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

const COMPONENT: &str = "fabric";

/// Node-level settings the fabric hands to every realization it builds.
#[derive(Clone, Copy, Debug)]
pub struct FabricConfig {
    pub local_node: NodeId,
    pub start_mode: StartMode,
    /// Whether the bus is secured; durable attaches then check principals.
    pub secured: bool,
}

enum FabricEntry {
    Creating,
    Ready(Arc<DestinationRealization>),
}

/// Registry of every destination realization hosted or routed by this node.
///
/// Creation and deletion are transactional: an entry becomes visible (or
/// disappears) only from inside the commit hook of the transaction that made
/// the destination's root stream durable (or marked it deleted).
pub struct DestinationFabric {
    config: FabricConfig,
    store: Arc<dyn TransactionalStore>,
    topology: Arc<dyn TopologyService>,
    factory: Arc<dyn AnycastHandlerFactory>,
    destinations: Arc<Mutex<HashMap<DestinationId, FabricEntry>>>,
}

impl DestinationFabric {
    pub fn new(
        config: FabricConfig,
        store: Arc<dyn TransactionalStore>,
        topology: Arc<dyn TopologyService>,
        factory: Arc<dyn AnycastHandlerFactory>,
    ) -> Self {
        DestinationFabric {
            config,
            store,
            topology,
            factory,
            destinations: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn local_node(&self) -> NodeId {
        self.config.local_node
    }

    fn build_realization(&self, definition: DestinationDefinition) -> Arc<DestinationRealization> {
        let kind = match definition.kind {
            DestinationKind::Queue => RealizationKind::PointToPoint,
            DestinationKind::TopicSpace => {
                RealizationKind::PublishSubscribe(PubSubRealization::new(Arc::new(
                    DurableSubscriptionTable::new(
                        definition.clone(),
                        self.config.secured,
                        self.store.clone(),
                    ),
                )))
            }
            DestinationKind::Link => RealizationKind::Link(LinkRouting::new()),
        };
        let manager = Arc::new(LocalisationManager::new(
            definition.id,
            self.config.local_node,
            self.topology.clone(),
        ));
        let support = Arc::new(RemoteSupport::new(
            definition.clone(),
            self.config.start_mode,
            self.store.clone(),
            self.factory.clone(),
        ));
        Arc::new(DestinationRealization::new(
            definition,
            kind,
            manager,
            support,
            self.store.clone(),
        ))
    }

    /// Creates a destination: its persisted root stream plus a realization
    /// that becomes visible only once the transaction commits.
    pub async fn create_destination(
        &self,
        definition: DestinationDefinition,
        txn: Option<Arc<dyn Transaction>>,
    ) -> Result<Arc<DestinationRealization>, Fault> {
        let id = definition.id;
        {
            let mut destinations = self.destinations.lock().await;
            if destinations.contains_key(&id) {
                return Err(Fault::AlreadyExists(format!(
                    "destination {id} already exists"
                )));
            }
            destinations.insert(id, FabricEntry::Creating);
        }

        match self.try_create_destination(definition, txn).await {
            Ok(realization) => Ok(realization),
            Err(fault) => {
                self.destinations.lock().await.remove(&id);
                Err(fault)
            }
        }
    }

    async fn try_create_destination(
        &self,
        definition: DestinationDefinition,
        txn: Option<Arc<dyn Transaction>>,
    ) -> Result<Arc<DestinationRealization>, Fault> {
        let id = definition.id;
        let name = definition.name.clone();
        let realization = self.build_realization(definition);

        let scope = match txn {
            Some(txn) => TxnScope::caller(txn),
            None => TxnScope::owned(self.store.begin().await?),
        };
        if let Err(fault) = self.store.add_root(id, scope.transaction().as_ref()).await {
            scope.abandon().await;
            return Err(fault);
        }

        let destinations = self.destinations.clone();
        let rollback_destinations = self.destinations.clone();
        let committed = realization.clone();
        scope
            .transaction()
            .register_hook(
                CommitHook::new("destination-create")
                    .on_commit(move || async move {
                        info!(
                            component = COMPONENT,
                            event = events::DESTINATION_CREATED,
                            destination = %id,
                            name = %name,
                        );
                        destinations
                            .lock()
                            .await
                            .insert(id, FabricEntry::Ready(committed));
                    })
                    .on_rollback(move || async move {
                        rollback_destinations.lock().await.remove(&id);
                    }),
            )
            .await;

        scope.conclude().await?;
        Ok(realization)
    }

    /// Re-registers a destination whose root stream already exists, ahead of
    /// restart recovery. No store writes happen here.
    pub async fn restore_destination(
        &self,
        definition: DestinationDefinition,
    ) -> Result<Arc<DestinationRealization>, Fault> {
        let id = definition.id;
        let realization = self.build_realization(definition);
        let mut destinations = self.destinations.lock().await;
        if destinations.contains_key(&id) {
            return Err(Fault::AlreadyExists(format!(
                "destination {id} already exists"
            )));
        }
        destinations.insert(id, FabricEntry::Ready(realization.clone()));
        Ok(realization)
    }

    /// Deletes a destination: marks its root stream, which bars any further
    /// child-stream creation, and drops the realization on commit.
    pub async fn delete_destination(
        &self,
        id: DestinationId,
        txn: Option<Arc<dyn Transaction>>,
    ) -> Result<(), Fault> {
        let realization = {
            let destinations = self.destinations.lock().await;
            match destinations.get(&id) {
                Some(FabricEntry::Ready(realization)) => realization.clone(),
                Some(FabricEntry::Creating) | None => {
                    return Err(Fault::not_found(format!("destination {id} does not exist")))
                }
            }
        };

        let scope = match txn {
            Some(txn) => TxnScope::caller(txn),
            None => TxnScope::owned(self.store.begin().await?),
        };
        if let Err(fault) = self
            .store
            .mark_root_to_be_deleted(id, scope.transaction().as_ref())
            .await
        {
            scope.abandon().await;
            return Err(fault);
        }

        let destinations = self.destinations.clone();
        let name = realization.definition().name.clone();
        scope
            .transaction()
            .register_hook(
                CommitHook::new("destination-delete").on_commit(move || async move {
                    info!(
                        component = COMPONENT,
                        event = events::DESTINATION_DELETED,
                        destination = %id,
                        name = %name,
                    );
                    destinations.lock().await.remove(&id);
                }),
            )
            .await;
        scope.conclude().await
    }

    pub async fn lookup(&self, id: DestinationId) -> Option<Arc<DestinationRealization>> {
        match self.destinations.lock().await.get(&id) {
            Some(FabricEntry::Ready(realization)) => Some(realization.clone()),
            _ => None,
        }
    }

    /// Ids of every registered destination, for admin enumeration.
    pub async fn destination_list(&self) -> Vec<DestinationId> {
        let destinations = self.destinations.lock().await;
        let mut ids: Vec<DestinationId> = destinations
            .iter()
            .filter(|(_, entry)| matches!(entry, FabricEntry::Ready(_)))
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Runs restart recovery over every registered realization. Hosts call
    /// this after re-registering definitions from configuration and before
    /// admitting traffic.
    pub async fn reconstitute_all(&self) -> Result<(), Fault> {
        let realizations: Vec<Arc<DestinationRealization>> = {
            let destinations = self.destinations.lock().await;
            destinations
                .values()
                .filter_map(|entry| match entry {
                    FabricEntry::Ready(realization) => Some(realization.clone()),
                    FabricEntry::Creating => None,
                })
                .collect()
        };
        for realization in realizations {
            realization.reconstitute().await?;
        }
        Ok(())
    }
}
