//! Point-to-point routing decision.

use crate::error::Fault;
use crate::handler::OutputHandler;
use crate::identity::NodeId;
use crate::observability::{events, fields};
use crate::realization::DestinationRealization;
use crate::topology::Capability;
use std::collections::BTreeSet;
use tracing::{debug, info};

const COMPONENT: &str = "ptp_routing";

/// Constraints on one point-to-point routing decision.
#[derive(Clone, Default, Debug)]
pub struct PtoPChoice {
    /// The only node acceptable to the caller, when set.
    pub fixed: Option<NodeId>,
    /// The node the caller would like, honoured when possible.
    pub preferred: Option<NodeId>,
    /// The message was produced on this node, which biases towards the
    /// local queue point.
    pub local_message: bool,
    /// Override a full queue (but never an administrative send disable).
    pub force_put: bool,
    /// Single-server deployments skip capacity checks entirely.
    pub single_server: bool,
    /// When set, only these nodes may be chosen.
    pub scoped: Option<BTreeSet<NodeId>>,
}

impl PtoPChoice {
    pub fn fixed(mut self, node: NodeId) -> Self {
        self.fixed = Some(node);
        self
    }

    pub fn preferred(mut self, node: NodeId) -> Self {
        self.preferred = Some(node);
        self
    }

    pub fn local_message(mut self, local: bool) -> Self {
        self.local_message = local;
        self
    }

    pub fn force_put(mut self, force: bool) -> Self {
        self.force_put = force;
        self
    }

    pub fn single_server(mut self, single: bool) -> Self {
        self.single_server = single;
        self
    }

    pub fn scoped(mut self, nodes: BTreeSet<NodeId>) -> Self {
        self.scoped = Some(nodes);
        self
    }
}

impl DestinationRealization {
    /// Chooses the output handler for one point-to-point put.
    ///
    /// Ties break local first, then the caller's preference, then the
    /// topology service's pick. `Ok(None)` means no localisation satisfies
    /// the constraints; the caller falls back to its exception destination.
    pub async fn choose_ptp_output_handler(
        &self,
        choice: PtoPChoice,
    ) -> Result<Option<OutputHandler>, Fault> {
        let manager = self.manager();
        let local_node = manager.local_node();
        let scoped = choice.scoped.as_ref();

        let check_local = manager.has_local()
            && choice.fixed.map_or(true, |fixed| fixed == local_node)
            && scoped.map_or(true, |scope| scope.contains(&local_node));

        // A fixed node makes the preference moot, and a scope that excludes
        // the preferred node discards it.
        let preferred = match choice.preferred {
            _ if choice.fixed.is_some() => None,
            Some(node) if scoped.map_or(false, |scope| !scope.contains(&node)) => None,
            preferred => preferred,
        };

        let prefer_local = choice.single_server
            || choice.fixed == Some(local_node)
            || choice.local_message
            || preferred.is_none()
            || preferred == Some(local_node);
        if check_local && prefer_local {
            if let Some(handler) = manager.local_handler().await {
                if choice.single_server || handler.put_allowed(choice.force_put) {
                    debug!(
                        component = COMPONENT,
                        event = events::ROUTING_LOCAL_CHOSEN,
                        destination = %self.definition().id,
                    );
                    return Ok(Some(handler));
                }
                debug!(
                    component = COMPONENT,
                    event = events::ROUTING_PUT_DISALLOWED,
                    destination = %self.definition().id,
                    node = %local_node,
                );
            }
        }

        if choice.fixed == Some(local_node) {
            // Fixed to this node and the local point is unusable; there is
            // nowhere else to go.
            info!(
                component = COMPONENT,
                event = events::ROUTING_NO_LOCALISATION,
                destination = %self.definition().id,
                fixed = %local_node,
            );
            return Ok(None);
        }

        let Some(node) = manager
            .choose_remote_node(choice.fixed, preferred, scoped, Capability::Put)
            .await
        else {
            info!(
                component = COMPONENT,
                event = events::ROUTING_NO_LOCALISATION,
                destination = %self.definition().id,
                preferred = fields::format_node(preferred),
            );
            return Ok(None);
        };

        if let Some(handler) = manager.lookup(node).await {
            debug!(
                component = COMPONENT,
                event = events::ROUTING_REMOTE_CHOSEN,
                destination = %self.definition().id,
                node = %node,
            );
            return Ok(Some(handler));
        }

        // First traffic towards this node; materialise its transmit pair.
        self.add_remote_localisation(node).await?;
        debug!(
            component = COMPONENT,
            event = events::ROUTING_REMOTE_CHOSEN,
            destination = %self.definition().id,
            node = %node,
        );
        Ok(manager.lookup(node).await)
    }
}
