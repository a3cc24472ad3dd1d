//! Remote durable attach: carrying one durable subscription's traffic over
//! anycast through a pseudo destination.

use crate::durable::state::DurableSubscriptionState;
use crate::error::{Fault, LockedReason};
use crate::handler::{AttachKey, ConsumerDispatcher, ConsumerPointId};
use crate::identity::{DestinationId, NodeId, RemoteAccessKey, SubscriberId};
use crate::observability::{events, fields};
use crate::realization::DestinationRealization;
use crate::remote::RemoteAccess;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

const COMPONENT: &str = "durable_remote";

/// Bounded wait while a racing create or delete of the same subscription's
/// remote access resolves.
const ATTACH_ATTEMPTS: usize = 10;
const ATTACH_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Where a durable attach landed.
pub enum DurableAttachOutcome {
    /// The subscription is homed on this node; the consumer is attached to
    /// its dispatcher directly.
    Local {
        key: AttachKey,
        dispatcher: Arc<ConsumerDispatcher>,
    },
    /// The subscription is homed elsewhere; the consumer rides the anycast
    /// access bound to its pseudo destination.
    Remote { access: Arc<RemoteAccess> },
}

impl std::fmt::Debug for DurableAttachOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DurableAttachOutcome::Local { key, .. } => {
                f.debug_struct("Local").field("key", key).finish_non_exhaustive()
            }
            DurableAttachOutcome::Remote { .. } => {
                f.debug_struct("Remote").finish_non_exhaustive()
            }
        }
    }
}

impl DestinationRealization {
    /// Attaches a consumer to a durable subscription wherever it is homed.
    ///
    /// A locally homed subscription delegates to the table. Otherwise the
    /// pseudo destination for (home node, subscriber) keys an anycast access
    /// toward the home; creation races a concurrent delete of the previous
    /// incarnation, so stale accesses are torn down and retried with a
    /// bounded wait before giving up with `Locked`.
    pub async fn attach_durable(
        &self,
        requested: DurableSubscriptionState,
        point: ConsumerPointId,
    ) -> Result<DurableAttachOutcome, Fault> {
        let Some(pubsub) = self.as_pubsub() else {
            return Err(Fault::invariant(format!(
                "destination {} is not a topic space",
                self.definition().id
            )));
        };

        if requested.home_node == self.manager().local_node() {
            let (key, dispatcher) = pubsub.durable().attach_local(&requested, point).await?;
            return Ok(DurableAttachOutcome::Local { key, dispatcher });
        }

        let home = requested.home_node;
        let subscriber = requested.subscriber_id.clone();
        let pseudo = DestinationId::pseudo_for_durable(home, &subscriber);
        let key = RemoteAccessKey::gathering(home, pseudo);

        for attempt in 0..ATTACH_ATTEMPTS {
            let access = match self
                .support()
                .get_or_create_input_handler(key, true)
                .await?
            {
                Some(access) => access,
                None => {
                    return Err(Fault::not_found(format!(
                        "durable subscription {subscriber} was deleted at its home"
                    )))
                }
            };

            if access.handler().destination_deleted() {
                // Access left over from a deleted incarnation of the
                // subscription; clear it and try for a fresh one.
                if let Err(fault) = self
                    .support()
                    .remove_input_handler_and_stream(key)
                    .await
                {
                    warn!(
                        component = COMPONENT,
                        subscriber = %subscriber,
                        err = %fault,
                        "tearing down stale durable access failed",
                    );
                }
                debug!(
                    component = COMPONENT,
                    event = events::DURABLE_REMOTE_WAIT,
                    destination = %self.definition().id,
                    subscriber = %subscriber,
                    attempt,
                );
                sleep(ATTACH_RETRY_INTERVAL).await;
                continue;
            }

            // Indexed only once the consumer is actually attached, so a
            // failed attach leaves no pseudo entry pointing at an empty
            // access.
            access.handler().attach_consumer_point(point).await?;
            self.support().register_pseudo(pseudo, access.clone()).await;
            if attempt > 0 {
                info!(
                    component = COMPONENT,
                    event = events::DURABLE_REMOTE_RESURRECTED,
                    destination = %self.definition().id,
                    subscriber = %subscriber,
                    attempt,
                );
            }
            info!(
                component = COMPONENT,
                event = events::DURABLE_ATTACHED,
                destination = %self.definition().id,
                subscriber = %subscriber,
                home = %home,
                key = fields::format_access_key(&key),
            );
            return Ok(DurableAttachOutcome::Remote { access });
        }

        Err(Fault::locked(
            LockedReason::CreateOrDeleteInFlight,
            format!(
                "remote attach for {subscriber} did not settle within {ATTACH_ATTEMPTS} attempts"
            ),
        ))
    }

    /// Tears down the anycast access carrying one remote durable
    /// subscription, removing its pseudo destination from the index.
    pub async fn close_durable_access(
        &self,
        home: NodeId,
        subscriber: &SubscriberId,
    ) -> Result<(), Fault> {
        let pseudo = DestinationId::pseudo_for_durable(home, subscriber);
        let key = RemoteAccessKey::gathering(home, pseudo);
        self.support().deregister_pseudo(pseudo).await;
        self.support().remove_input_handler_and_stream(key).await
    }
}
