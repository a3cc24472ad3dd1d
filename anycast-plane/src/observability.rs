//! Structured-tracing event names and field formatters.
//!
//! The crate emits `tracing` events with an `event` field drawn from
//! [`events`] and a `component` field per module. It never installs a global
//! subscriber; hosts and tests own one-time `tracing_subscriber`
//! initialization at process boundaries.

pub mod events {
    pub const LOCALISATION_ASSIGNED: &str = "localisation_assigned";
    pub const LOCALISATION_REMOVED: &str = "localisation_removed";
    pub const LOCALISATION_SET_UPDATED: &str = "localisation_set_updated";
    pub const LOCALISATION_GUESS_FALLBACK: &str = "localisation_guess_fallback";

    pub const ROUTING_LOCAL_CHOSEN: &str = "routing_local_chosen";
    pub const ROUTING_REMOTE_CHOSEN: &str = "routing_remote_chosen";
    pub const ROUTING_NO_LOCALISATION: &str = "routing_no_localisation";
    pub const ROUTING_PUT_DISALLOWED: &str = "routing_put_disallowed";

    pub const REMOTE_ACCESS_CREATED: &str = "remote_access_created";
    pub const REMOTE_ACCESS_CREATE_ABSORBED: &str = "remote_access_create_absorbed";
    pub const REMOTE_ACCESS_REMOVED: &str = "remote_access_removed";
    pub const REMOTE_ACCESS_WAIT: &str = "remote_access_wait";
    pub const REMOTE_CONSUMERS_CLOSED: &str = "remote_consumers_closed";

    pub const TRANSMIT_PAIR_CREATED: &str = "transmit_pair_created";
    pub const TRANSMIT_PAIR_WAIT: &str = "transmit_pair_wait";

    pub const RECONSTITUTE_STREAM_RECOVERED: &str = "reconstitute_stream_recovered";
    pub const RECONSTITUTE_HANDLER_BOUND: &str = "reconstitute_handler_bound";

    pub const LINK_SELECTION_GUESSED: &str = "link_selection_guessed";
    pub const LINK_QUEUE_POINT_MIGRATED: &str = "link_queue_point_migrated";
    pub const LINK_QUEUE_POINT_RESURRECTED: &str = "link_queue_point_resurrected";

    pub const DURABLE_CREATED: &str = "durable_created";
    pub const DURABLE_CREATE_ROLLED_BACK: &str = "durable_create_rolled_back";
    pub const DURABLE_ATTACHED: &str = "durable_attached";
    pub const DURABLE_DELETED: &str = "durable_deleted";
    pub const DURABLE_DELETE_REVERTED: &str = "durable_delete_reverted";
    pub const DURABLE_REMOTE_WAIT: &str = "durable_remote_wait";
    pub const DURABLE_REMOTE_RESURRECTED: &str = "durable_remote_resurrected";

    pub const DESTINATION_CREATED: &str = "destination_created";
    pub const DESTINATION_DELETED: &str = "destination_deleted";

    pub const CLEANUP_DEFERRED: &str = "cleanup_deferred";
    pub const INVARIANT_VIOLATED: &str = "invariant_violated";
}

pub mod fields {
    use crate::identity::{NodeId, RemoteAccessKey};

    /// Formats an optional node id for a tracing field.
    pub fn format_node(node: Option<NodeId>) -> String {
        match node {
            Some(node) => node.to_string(),
            None => "-".to_string(),
        }
    }

    /// Formats a remote-access key for a tracing field.
    pub fn format_access_key(key: &RemoteAccessKey) -> String {
        match key.gathering_target {
            Some(target) => format!("{}~{}", key.requesting_node, target),
            None => key.requesting_node.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fields;
    use crate::identity::{DestinationId, NodeId, RemoteAccessKey};

    #[test]
    fn absent_nodes_format_as_dash() {
        assert_eq!(fields::format_node(None), "-");
    }

    #[test]
    fn gathering_keys_include_the_target() {
        let node = NodeId::random();
        let target = DestinationId::random();
        let formatted = fields::format_access_key(&RemoteAccessKey::gathering(node, target));
        assert!(formatted.contains('~'));
        assert!(formatted.starts_with(&node.to_string()));
    }
}
