//! Per-destination registry of hosting nodes and their output handlers.

use crate::control_plane::guess_set::GuessSet;
use crate::error::Fault;
use crate::handler::OutputHandler;
use crate::identity::{DestinationId, NodeId};
use crate::observability::{events, fields};
use crate::topology::{Capability, TopologyService};
use arc_swap::ArcSwap;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const COMPONENT: &str = "localisation_manager";

/// Node-set delta produced by one authoritative localisation update. The
/// caller owns handler teardown for removed nodes; the manager only records
/// the new truth.
#[derive(Clone, Default, Debug)]
pub struct LocalisationUpdate {
    pub added: BTreeSet<NodeId>,
    pub removed: BTreeSet<NodeId>,
}

/// Registry of hosting-node localisations for one destination.
///
/// Holds the node-to-handler map and the published guess set. The map is
/// the set-scoped exclusive lock: assignment, removal, and authoritative
/// updates serialise on it, while routing reads the guess set lock-free via
/// an [`ArcSwap`] snapshot.
pub struct LocalisationManager {
    destination: DestinationId,
    local_node: NodeId,
    topology: Arc<dyn TopologyService>,
    handlers: Mutex<HashMap<NodeId, OutputHandler>>,
    guesses: ArcSwap<GuessSet>,
}

impl LocalisationManager {
    pub fn new(
        destination: DestinationId,
        local_node: NodeId,
        topology: Arc<dyn TopologyService>,
    ) -> Self {
        LocalisationManager {
            destination,
            local_node,
            topology,
            handlers: Mutex::new(HashMap::new()),
            guesses: ArcSwap::from_pointee(GuessSet::default()),
        }
    }

    pub fn destination(&self) -> DestinationId {
        self.destination
    }

    pub fn local_node(&self) -> NodeId {
        self.local_node
    }

    pub fn topology(&self) -> &Arc<dyn TopologyService> {
        &self.topology
    }

    /// Registers the output handler for one hosting node. At most one
    /// handler may be registered per node; a second registration for an
    /// occupied slot is a corrupted-registry condition, not a race the
    /// caller is expected to retry.
    pub async fn assign(&self, node: NodeId, handler: OutputHandler) -> Result<(), Fault> {
        let mut handlers = self.handlers.lock().await;
        if handlers.contains_key(&node) {
            warn!(
                component = COMPONENT,
                event = events::INVARIANT_VIOLATED,
                destination = %self.destination,
                node = %node,
                "handler already registered for node",
            );
            return Err(Fault::invariant(format!(
                "destination {} already has a localisation on node {node}",
                self.destination
            )));
        }
        handlers.insert(node, handler);
        debug!(
            component = COMPONENT,
            event = events::LOCALISATION_ASSIGNED,
            destination = %self.destination,
            node = %node,
            local = node == self.local_node,
        );
        Ok(())
    }

    /// Deregisters the handler for one node, returning it for teardown.
    pub async fn remove(&self, node: NodeId) -> Option<OutputHandler> {
        let removed = self.handlers.lock().await.remove(&node);
        match removed {
            Some(handler) => {
                debug!(
                    component = COMPONENT,
                    event = events::LOCALISATION_REMOVED,
                    destination = %self.destination,
                    node = %node,
                );
                Some(handler)
            }
            None => {
                warn!(
                    component = COMPONENT,
                    destination = %self.destination,
                    node = %node,
                    "no handler registered for removed node",
                );
                None
            }
        }
    }

    pub async fn lookup(&self, node: NodeId) -> Option<OutputHandler> {
        self.handlers.lock().await.get(&node).cloned()
    }

    /// The local queue point's handler, when one is registered.
    pub async fn local_handler(&self) -> Option<OutputHandler> {
        self.lookup(self.local_node).await
    }

    /// Point-in-time copy of the node-to-handler map.
    pub async fn snapshot_handlers(&self) -> HashMap<NodeId, OutputHandler> {
        self.handlers.lock().await.clone()
    }

    /// Applies an authoritative localisation set from admin or topology
    /// reconciliation. Rebuilds the guess set from scratch and reports the
    /// membership delta against the previous set; the realization layer acts
    /// on the delta (creating transmit handlers, closing remote consumers).
    pub async fn update_localisation_set(&self, nodes: &BTreeSet<NodeId>) -> LocalisationUpdate {
        // Taking the handler lock orders this update against concurrent
        // assign/remove calls even though only the guess set changes here.
        let _handlers = self.handlers.lock().await;

        let previous = self.guesses.load_full();
        let next = GuessSet::rebuild(self.local_node, nodes);

        let update = LocalisationUpdate {
            added: next.nodes().difference(previous.nodes()).copied().collect(),
            removed: previous.nodes().difference(next.nodes()).copied().collect(),
        };

        info!(
            component = COMPONENT,
            event = events::LOCALISATION_SET_UPDATED,
            destination = %self.destination,
            nodes = nodes.len(),
            has_local = next.has_local(),
            added = update.added.len(),
            removed = update.removed.len(),
        );

        self.guesses.store(Arc::new(next));
        update
    }

    /// Lock-free snapshot of the current guesses.
    pub fn guesses(&self) -> Arc<GuessSet> {
        self.guesses.load_full()
    }

    /// Whether the destination is localised on this node.
    pub fn has_local(&self) -> bool {
        self.guesses.load().has_local()
    }

    /// Whether the destination is localised on at least one other node.
    pub fn has_remote(&self) -> bool {
        self.guesses.load().has_remote()
    }

    /// Chooses a remote hosting node for a get or put.
    ///
    /// A fixed node bypasses selection entirely and is honoured only if it is
    /// a known remote localisation. Otherwise the topology service picks from
    /// the (optionally scoped) remote guesses; when it has no answer the
    /// guesses themselves decide, preferring the caller's preferred node and
    /// candidates the topology still advertises over stale ones.
    pub async fn choose_remote_node(
        &self,
        fixed: Option<NodeId>,
        preferred: Option<NodeId>,
        scope: Option<&BTreeSet<NodeId>>,
        capability: Capability,
    ) -> Option<NodeId> {
        let guesses = self.guesses.load();
        let candidates: BTreeSet<NodeId> = match scope {
            Some(scope) => guesses.remote_nodes().intersection(scope).copied().collect(),
            None => guesses.remote_nodes().clone(),
        };

        if let Some(fixed) = fixed {
            return candidates.contains(&fixed).then_some(fixed);
        }
        if candidates.is_empty() {
            return None;
        }

        if let Some(selection) = self
            .topology
            .choose_hosting_node(&candidates, preferred, capability)
            .await
        {
            if candidates.contains(&selection.node) {
                return Some(selection.node);
            }
            warn!(
                component = COMPONENT,
                destination = %self.destination,
                node = %selection.node,
                "topology chose a node outside the candidate set",
            );
        }

        // The guesses decide. A candidate the topology still advertises
        // outranks one it no longer knows about; with nothing advertised a
        // stale guess is still the best lead available.
        let preferred = preferred.filter(|node| candidates.contains(node));
        let mut guessed = None;
        if let Some(node) = preferred {
            if self.topology.is_still_advertised(node).await {
                guessed = Some(node);
            }
        }
        if guessed.is_none() {
            for &candidate in &candidates {
                if self.topology.is_still_advertised(candidate).await {
                    guessed = Some(candidate);
                    break;
                }
            }
        }
        let guessed = guessed
            .or(preferred)
            .or_else(|| candidates.iter().next().copied())?;
        debug!(
            component = COMPONENT,
            event = events::LOCALISATION_GUESS_FALLBACK,
            destination = %self.destination,
            node = %guessed,
            preferred = fields::format_node(preferred),
        );
        Some(guessed)
    }
}
