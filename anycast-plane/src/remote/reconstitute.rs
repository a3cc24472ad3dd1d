//! Two-phase restart recovery of remote-access state from persisted streams.
//!
//! Phase one scans the store and rebuilds the key-indexed stream pairs and
//! transmit handlers without constructing any protocol handlers. Phase two
//! constructs and binds the input handlers for everything phase one found.
//! The split exists because gathering accesses reference streams of other
//! accesses; every stream must be in the maps before any handler is wired.

use crate::error::Fault;
use crate::handler::{InputHandlerSpec, TransmitHandler};
use crate::identity::RemoteAccessKey;
use crate::observability::{events, fields};
use crate::remote::support::{AccessEntry, RemoteAccess, RemoteSupport, StartMode, TransmitEntry};
use crate::store::stream::{StreamHandle, StreamKind, StreamTag};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

const COMPONENT: &str = "reconstitute";

impl RemoteSupport {
    /// Rebuilds the in-memory remote-access maps from the store after a
    /// restart. Must run before any concurrent traffic reaches this
    /// destination; recovery mutates the maps directly rather than through
    /// commit hooks because nothing is being written.
    pub async fn reconstitute(&self) -> Result<(), Fault> {
        let recovered = self.recover_streams().await?;
        self.bind_handlers(recovered).await
    }

    /// Phase one: pair up persisted container and receive streams by key and
    /// rebuild the transmit handlers.
    async fn recover_streams(
        &self,
    ) -> Result<Vec<(RemoteAccessKey, Arc<dyn StreamHandle>, Arc<dyn StreamHandle>)>, Fault> {
        let destination = self.definition.id;

        let transmits = self
            .store
            .children_of_kind(destination, StreamKind::Transmit)
            .await?;
        {
            let mut map = self.transmits.lock().await;
            for stream in transmits {
                let node = match stream.descriptor().tag {
                    StreamTag::TransmitTo(node) => node,
                    // Link transmit streams are recovered by the link
                    // routing layer, which owns their node binding.
                    StreamTag::LinkRemote => continue,
                    _ => {
                        return Err(
                            self.corrupt_stream(&stream, "transmit stream without a node tag")
                        )
                    }
                };
                info!(
                    component = COMPONENT,
                    event = events::RECONSTITUTE_STREAM_RECOVERED,
                    destination = %destination,
                    stream = %stream.id(),
                    node = %node,
                );
                map.insert(
                    node,
                    TransmitEntry::Ready(Arc::new(TransmitHandler::new(
                        &self.definition,
                        Some(node),
                        stream,
                    ))),
                );
            }
        }

        let mut containers: HashMap<RemoteAccessKey, Arc<dyn StreamHandle>> = HashMap::new();
        for stream in self
            .store
            .children_of_kind(destination, StreamKind::AnycastContainer)
            .await?
        {
            let StreamTag::RemoteAccess(key) = stream.descriptor().tag else {
                return Err(self.corrupt_stream(&stream, "container stream without an access key"));
            };
            containers.insert(key, stream);
        }

        let mut recovered = Vec::with_capacity(containers.len());
        for receive in self
            .store
            .children_of_kind(destination, StreamKind::AnycastReceive)
            .await?
        {
            let StreamTag::RemoteAccess(key) = receive.descriptor().tag else {
                return Err(self.corrupt_stream(&receive, "receive stream without an access key"));
            };
            match containers.remove(&key) {
                Some(container) => {
                    info!(
                        component = COMPONENT,
                        event = events::RECONSTITUTE_STREAM_RECOVERED,
                        destination = %destination,
                        key = fields::format_access_key(&key),
                    );
                    recovered.push((key, container, receive));
                }
                None => self.orphan(&key, "receive stream has no container")?,
            }
        }
        for key in containers.keys() {
            self.orphan(key, "container stream has no receive")?;
        }

        Ok(recovered)
    }

    /// Phase two: construct and bind the input handlers, flushing recovered
    /// protocol state unless this is a warm start.
    async fn bind_handlers(
        &self,
        recovered: Vec<(RemoteAccessKey, Arc<dyn StreamHandle>, Arc<dyn StreamHandle>)>,
    ) -> Result<(), Fault> {
        let flush_on_bind = self.start_mode != StartMode::Normal;

        for (key, container, receive) in recovered {
            let handler = self
                .factory
                .create_input_handler(
                    InputHandlerSpec {
                        name: self.definition.name.clone(),
                        destination: self.definition.id,
                        exclusive: self.definition.receive_exclusive,
                    },
                    container.clone(),
                    receive.clone(),
                    flush_on_bind,
                )
                .await?;
            let access = Arc::new(RemoteAccess::new(key, handler, container, receive));
            self.accesses
                .lock()
                .await
                .insert(key, AccessEntry::Ready(access));
            info!(
                component = COMPONENT,
                event = events::RECONSTITUTE_HANDLER_BOUND,
                destination = %self.definition.id,
                key = fields::format_access_key(&key),
                flush_on_bind,
            );
        }
        Ok(())
    }

    /// A half-removed access left by a crash mid-teardown. A normal restart
    /// leaves it for the next cleanup pass; a stale-backup restart treats it
    /// as corruption.
    fn orphan(&self, key: &RemoteAccessKey, detail: &str) -> Result<(), Fault> {
        if self.start_mode == StartMode::StaleBackup {
            return Err(Fault::invariant(format!(
                "{detail} for key {} on destination {}",
                fields::format_access_key(key),
                self.definition.id
            )));
        }
        warn!(
            component = COMPONENT,
            event = events::CLEANUP_DEFERRED,
            destination = %self.definition.id,
            key = fields::format_access_key(key),
            detail,
        );
        Ok(())
    }

    fn corrupt_stream(&self, stream: &Arc<dyn StreamHandle>, detail: &str) -> Fault {
        Fault::invariant(format!(
            "{detail}: stream {} on destination {}",
            stream.id(),
            self.definition.id
        ))
    }
}
