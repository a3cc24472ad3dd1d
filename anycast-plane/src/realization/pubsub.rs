//! Publish/subscribe realization: neighbour fan-out and the durable
//! subscription façade.

use crate::destination::DestinationDefinition;
use crate::durable::table::DurableSubscriptionTable;
use crate::error::Fault;
use crate::handler::{NeighbourHandler, OutputHandler};
use crate::identity::NodeId;
use crate::realization::DestinationRealization;
use crate::store::stream::TransactionalStore;
use std::sync::Arc;

/// Topic-space specific state carried by a realization.
pub struct PubSubRealization {
    durable: Arc<DurableSubscriptionTable>,
}

impl PubSubRealization {
    pub fn new(durable: Arc<DurableSubscriptionTable>) -> Self {
        PubSubRealization { durable }
    }

    /// The node-local durable subscription table.
    pub fn durable(&self) -> &Arc<DurableSubscriptionTable> {
        &self.durable
    }

    pub(crate) async fn reconstitute(
        &self,
        _definition: &DestinationDefinition,
        _store: &Arc<dyn TransactionalStore>,
    ) -> Result<(), Fault> {
        self.durable.reconstitute().await
    }
}

impl DestinationRealization {
    /// Registers fan-out toward one publish/subscribe neighbour.
    pub async fn assign_neighbour(&self, node: NodeId) -> Result<(), Fault> {
        if self.as_pubsub().is_none() {
            return Err(Fault::invariant(format!(
                "destination {} is not a topic space",
                self.definition().id
            )));
        }
        let handler = OutputHandler::Neighbour(Arc::new(NeighbourHandler::new(
            self.definition().id,
            node,
        )));
        self.manager().assign(node, handler).await
    }

    pub async fn remove_neighbour(&self, node: NodeId) -> Option<OutputHandler> {
        self.manager().remove(node).await
    }

    /// Deregisters every neighbour, leaving non-neighbour handlers intact.
    /// Used when the neighbourhood is rebuilt from scratch.
    pub async fn remove_all_neighbours(&self) {
        let handlers = self.manager().snapshot_handlers().await;
        for (node, handler) in handlers {
            if matches!(handler, OutputHandler::Neighbour(_)) {
                self.manager().remove(node).await;
            }
        }
    }

    /// The local publish point, when this node hosts one.
    pub async fn publish_point(&self) -> Option<OutputHandler> {
        self.manager().local_handler().await
    }
}
