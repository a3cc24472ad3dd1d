//! Outward destination identity and definition types.

use crate::identity::DestinationId;
use std::fmt;
use std::fmt::{Debug, Formatter};
use tracing::debug;

const COMPONENT: &str = "destination";

/// What kind of destination a definition describes. The kind selects the
/// realization behavior: point-to-point for queues, publish/subscribe for
/// topic spaces, and the link specialisation for bus-to-bus links.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DestinationKind {
    Queue,
    TopicSpace,
    Link,
}

/// Administrative definition of one destination.
#[derive(Clone)]
pub struct DestinationDefinition {
    pub id: DestinationId,
    pub name: String,
    pub kind: DestinationKind,
    /// Only one consumer may hold the destination at a time.
    pub receive_exclusive: bool,
    /// Producers may put to this destination's localisations.
    pub send_allowed: bool,
    /// Queue-depth ceiling consulted by the routing capacity check.
    pub high_message_threshold: u64,
}

impl DestinationDefinition {
    pub fn new(id: DestinationId, name: &str, kind: DestinationKind) -> Self {
        debug!(
            component = COMPONENT,
            destination = %id,
            name,
            kind = ?kind,
            "creating destination definition"
        );

        DestinationDefinition {
            id,
            name: name.to_string(),
            kind,
            receive_exclusive: false,
            send_allowed: true,
            high_message_threshold: 50_000,
        }
    }

    pub fn receive_exclusive(mut self, exclusive: bool) -> Self {
        self.receive_exclusive = exclusive;
        self
    }

    pub fn send_allowed(mut self, allowed: bool) -> Self {
        self.send_allowed = allowed;
        self
    }

    pub fn high_message_threshold(mut self, threshold: u64) -> Self {
        self.high_message_threshold = threshold;
        self
    }
}

impl Debug for DestinationDefinition {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestinationDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}
