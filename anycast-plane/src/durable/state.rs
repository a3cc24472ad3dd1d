//! Durable-subscription descriptive state.

use crate::identity::{NodeId, SubscriberId};
use std::fmt;
use std::fmt::{Debug, Formatter};

/// Message-selection terms a durable subscription was created with. Selector
/// evaluation itself is a collaborator concern; this layer only compares
/// criteria for equality when deciding whether an attach matches.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct SelectionCriteria {
    /// Topic discriminator the subscription listens on.
    pub discriminator: Option<String>,
    /// Selector expression filtering matched messages.
    pub selector: Option<String>,
}

impl SelectionCriteria {
    pub fn new(discriminator: Option<&str>, selector: Option<&str>) -> Self {
        SelectionCriteria {
            discriminator: discriminator.map(str::to_string),
            selector: selector.map(str::to_string),
        }
    }
}

/// Everything the control plane remembers about one durable subscription.
/// Persisted with the subscription's reference stream so the table can be
/// rebuilt by the restart scan.
#[derive(Clone, PartialEq, Eq)]
pub struct DurableSubscriptionState {
    pub subscriber_id: SubscriberId,
    pub criteria: SelectionCriteria,
    /// The node on which the subscription's persistent state resides.
    pub home_node: NodeId,
    /// Multiple consumers may share the subscription.
    pub cloned: bool,
    /// Publications from the subscribing connection are not delivered.
    pub no_local: bool,
    /// Security principal that created the subscription, when the bus is
    /// secured.
    pub user: Option<String>,
}

impl DurableSubscriptionState {
    pub fn new(subscriber_id: SubscriberId, home_node: NodeId) -> Self {
        DurableSubscriptionState {
            subscriber_id,
            criteria: SelectionCriteria::default(),
            home_node,
            cloned: false,
            no_local: false,
            user: None,
        }
    }

    pub fn criteria(mut self, criteria: SelectionCriteria) -> Self {
        self.criteria = criteria;
        self
    }

    pub fn cloned(mut self, cloned: bool) -> Self {
        self.cloned = cloned;
        self
    }

    pub fn no_local(mut self, no_local: bool) -> Self {
        self.no_local = no_local;
        self
    }

    pub fn user(mut self, user: Option<&str>) -> Self {
        self.user = user.map(str::to_string);
        self
    }

    /// Whether an attach request describes the same subscription. The ids
    /// already matched to reach this comparison; a false result is a
    /// parameter conflict, not a different subscription.
    pub fn matches(&self, requested: &DurableSubscriptionState) -> bool {
        self.criteria == requested.criteria
            && self.no_local == requested.no_local
            && self.cloned == requested.cloned
    }

    /// Whether the requesting principal is the one that created the
    /// subscription. Only consulted when the bus is secured.
    pub fn same_user(&self, requested: &DurableSubscriptionState) -> bool {
        self.user == requested.user
    }
}

impl Debug for DurableSubscriptionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DurableSubscriptionState")
            .field("subscriber_id", &self.subscriber_id)
            .field("home_node", &self.home_node)
            .field("cloned", &self.cloned)
            .field("no_local", &self.no_local)
            .finish_non_exhaustive()
    }
}
