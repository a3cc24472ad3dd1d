//! Bus-to-bus link routing: best-guess fallback and queue-point migration
//! when the remote endpoint moves.

use crate::destination::DestinationDefinition;
use crate::error::Fault;
use crate::handler::{OutputHandler, TransmitHandler};
use crate::identity::NodeId;
use crate::observability::{events, fields};
use crate::realization::DestinationRealization;
use crate::store::stream::{
    AddChildError, StreamDescriptor, StreamHandle, StreamKind, StreamTag, TransactionalStore,
};
use crate::store::transaction::{Transaction, TxnScope};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const COMPONENT: &str = "link_routing";

struct LinkState {
    /// The transmit handler traffic currently flows through. Its node is
    /// absent until the remote end first resolves.
    active: Option<Arc<TransmitHandler>>,
    /// Retired queue points still draining, kept by their old node so the
    /// link moving back resurrects them instead of reordering messages.
    deleting: HashMap<NodeId, Arc<TransmitHandler>>,
}

/// Link-specific routing state carried by a realization.
pub struct LinkRouting {
    state: Mutex<LinkState>,
}

impl LinkRouting {
    pub fn new() -> Self {
        LinkRouting {
            state: Mutex::new(LinkState {
                active: None,
                deleting: HashMap::new(),
            }),
        }
    }

    /// The node the active transmit handler is bound to, if resolved.
    pub async fn active_node(&self) -> Option<NodeId> {
        let state = self.state.lock().await;
        state.active.as_ref().and_then(|handler| handler.node())
    }

    /// Whether a retired queue point for this node is still draining.
    pub async fn is_draining(&self, node: NodeId) -> bool {
        self.state.lock().await.deleting.contains_key(&node)
    }

    /// Recovers the link's transmit binding from persisted streams. The
    /// recovered node identity is unknown until the topology answers again,
    /// so the handler starts unresolved and marked as a guess.
    pub(crate) async fn reconstitute(
        &self,
        definition: &DestinationDefinition,
        store: &Arc<dyn TransactionalStore>,
    ) -> Result<(), Fault> {
        let mut live = Vec::new();
        for stream in store
            .children_of_kind(definition.id, StreamKind::Transmit)
            .await?
        {
            if stream.descriptor().tag != StreamTag::LinkRemote {
                continue;
            }
            if stream.is_to_be_deleted() {
                // Left draining by an earlier migration; node identity was
                // runtime-only, so it drains without a resurrection slot.
                warn!(
                    component = COMPONENT,
                    event = events::CLEANUP_DEFERRED,
                    destination = %definition.id,
                    stream = %stream.id(),
                    "recovered draining link stream",
                );
                continue;
            }
            live.push(stream);
        }

        if live.len() > 1 {
            return Err(Fault::invariant(format!(
                "link {} recovered {} live transmit streams",
                definition.id,
                live.len()
            )));
        }
        if let Some(stream) = live.into_iter().next() {
            info!(
                component = COMPONENT,
                event = events::RECONSTITUTE_STREAM_RECOVERED,
                destination = %definition.id,
                stream = %stream.id(),
            );
            let handler = Arc::new(TransmitHandler::new(definition, None, stream));
            handler.set_guess(true);
            self.state.lock().await.active = Some(handler);
        }
        Ok(())
    }
}

impl Default for LinkRouting {
    fn default() -> Self {
        LinkRouting::new()
    }
}

impl DestinationRealization {
    /// Chooses the output handler for a put over this bus link.
    ///
    /// Locally hosted links answer with the local queue point. Otherwise the
    /// topology service names the remote end; with no answer the last-known
    /// handler is used marked as a guess, materialising an unresolved
    /// placeholder if this is the first put. A changed answer migrates the
    /// queue point transactionally, resurrecting a same-node draining stream
    /// rather than creating a second one.
    pub async fn choose_link_output_handler(&self) -> Result<Option<OutputHandler>, Fault> {
        let Some(link) = self.as_link() else {
            return Err(Fault::invariant(format!(
                "destination {} is not a link",
                self.definition().id
            )));
        };

        if let Some(handler) = self.manager().local_handler().await {
            debug!(
                component = COMPONENT,
                event = events::ROUTING_LOCAL_CHOSEN,
                destination = %self.definition().id,
            );
            return Ok(Some(handler));
        }

        let selection = self
            .manager()
            .topology()
            .choose_link(self.definition().id)
            .await;
        let mut state = link.state.lock().await;

        let Some(selection) = selection else {
            // No answer is normal; route on the last known handler and say
            // so, creating an unresolved placeholder on first use.
            let handler = match &state.active {
                Some(handler) => handler.clone(),
                None => {
                    let handler = self.create_link_transmit(None).await?;
                    state.active = Some(handler.clone());
                    handler
                }
            };
            handler.set_guess(true);
            debug!(
                component = COMPONENT,
                event = events::LINK_SELECTION_GUESSED,
                destination = %self.definition().id,
                node = fields::format_node(handler.node()),
            );
            return Ok(Some(OutputHandler::Link(handler)));
        };
        let node = selection.node;

        let active = match state.active.clone() {
            Some(active) => active,
            None => {
                let handler = match state.deleting.get(&node).cloned() {
                    Some(draining) => {
                        self.resurrect_link_transmit(&draining).await?;
                        state.deleting.remove(&node);
                        draining
                    }
                    None => self.create_link_transmit(Some(node)).await?,
                };
                handler.set_guess(false);
                state.active = Some(handler.clone());
                return Ok(Some(OutputHandler::Link(handler)));
            }
        };

        match active.node() {
            Some(current) if current == node => {
                active.set_guess(false);
                Ok(Some(OutputHandler::Link(active)))
            }
            None => {
                // The placeholder resolves in place, keeping every message
                // already queued against it in order.
                active.set_node(Some(node));
                active.set_guess(false);
                info!(
                    component = COMPONENT,
                    event = events::LINK_QUEUE_POINT_MIGRATED,
                    destination = %self.definition().id,
                    from = "-",
                    to = %node,
                );
                Ok(Some(OutputHandler::Link(active)))
            }
            Some(old_node) => {
                let next = match state.deleting.get(&node).cloned() {
                    Some(draining) => {
                        // One transaction: resurrect the draining stream and
                        // retire the current one, or neither.
                        let txn = self.store().begin().await?;
                        let swapped: Result<(), Fault> = async {
                            draining.stream().cancel_to_be_deleted(txn.as_ref()).await?;
                            active.stream().mark_to_be_deleted(txn.as_ref()).await
                        }
                        .await;
                        if let Err(fault) = swapped {
                            TxnScope::owned(txn).abandon().await;
                            return Err(fault);
                        }
                        txn.commit().await?;
                        state.deleting.remove(&node);
                        info!(
                            component = COMPONENT,
                            event = events::LINK_QUEUE_POINT_RESURRECTED,
                            destination = %self.definition().id,
                            node = %node,
                        );
                        draining
                    }
                    None => {
                        let txn = self.store().begin().await?;
                        let created: Result<Arc<dyn StreamHandle>, Fault> = async {
                            let stream = self
                                .store()
                                .add_child_stream(
                                    self.definition().id,
                                    StreamDescriptor::new(
                                        StreamKind::Transmit,
                                        StreamTag::LinkRemote,
                                    ),
                                    txn.as_ref(),
                                )
                                .await
                                .map_err(|err| match err {
                                    AddChildError::RootDeleted => Fault::not_found(format!(
                                        "link {} is being deleted",
                                        self.definition().id
                                    )),
                                    AddChildError::Fault(fault) => fault,
                                })?;
                            active.stream().mark_to_be_deleted(txn.as_ref()).await?;
                            Ok(stream)
                        }
                        .await;
                        let stream = match created {
                            Ok(stream) => stream,
                            Err(fault) => {
                                TxnScope::owned(txn).abandon().await;
                                return Err(fault);
                            }
                        };
                        txn.commit().await?;
                        Arc::new(TransmitHandler::new(self.definition(), Some(node), stream))
                    }
                };
                next.set_guess(false);
                state.deleting.insert(old_node, active);
                state.active = Some(next.clone());
                info!(
                    component = COMPONENT,
                    event = events::LINK_QUEUE_POINT_MIGRATED,
                    destination = %self.definition().id,
                    from = %old_node,
                    to = %node,
                );
                Ok(Some(OutputHandler::Link(next)))
            }
        }
    }

    /// Creates a fresh persisted link transmit stream and its handler in its
    /// own committed transaction.
    async fn create_link_transmit(
        &self,
        node: Option<NodeId>,
    ) -> Result<Arc<TransmitHandler>, Fault> {
        let txn = self.store().begin().await?;
        let added = self
            .store()
            .add_child_stream(
                self.definition().id,
                StreamDescriptor::new(StreamKind::Transmit, StreamTag::LinkRemote),
                txn.as_ref(),
            )
            .await
            .map_err(|err| match err {
                AddChildError::RootDeleted => Fault::not_found(format!(
                    "link {} is being deleted",
                    self.definition().id
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
        txn.commit().await?;
        Ok(Arc::new(TransmitHandler::new(self.definition(), node, stream)))
    }

    async fn resurrect_link_transmit(&self, draining: &Arc<TransmitHandler>) -> Result<(), Fault> {
        let txn = self.store().begin().await?;
        if let Err(fault) = draining.stream().cancel_to_be_deleted(txn.as_ref()).await {
            TxnScope::owned(txn).abandon().await;
            return Err(fault);
        }
        txn.commit().await?;
        info!(
            component = COMPONENT,
            event = events::LINK_QUEUE_POINT_RESURRECTED,
            destination = %self.definition().id,
            node = fields::format_node(draining.node()),
        );
        Ok(())
    }
}
