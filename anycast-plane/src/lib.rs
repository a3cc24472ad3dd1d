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

//! # anycast-plane
//!
//! `anycast-plane` is the destination-localisation and remote-access control
//! plane of a clustered message broker: it decides, per destination, which
//! cluster node a produce or consume request should be routed to, and owns
//! the bookkeeping that lets a consumer on one node fetch messages from a
//! queue point hosted on another (anycast), including durable subscriptions
//! homed on a remote node.
//!
//! Typical usage is API-first and centered on [`DestinationFabric`]: the host
//! broker supplies its persistent store, topology service, and anycast
//! handler factory as trait objects, registers destination definitions, and
//! asks realizations for output handlers when routing traffic. This crate is
//! an internal control-plane library; it defines no wire format and no CLI.
//!
//! ## Internal architecture map
//!
//! - Fabric: central registry owning one realization per destination
//! - Realization: per-destination façade and kind-specific routing
//!   (point-to-point, publish/subscribe, bus link)
//! - Control plane: hosting-node registry, guess sets, remote-node choice
//! - Remote: anycast input-handler/container-stream lifecycle, transmit
//!   pairs, restart reconstitution
//! - Durable: durable-subscription table and the remote attach protocol
//! - Store: transaction, commit-hook, and stream contracts the host's
//!   persistence layer implements
//!
//! ## Transactional mutation discipline
//!
//! Every add or remove of routing state that must match persisted state
//! registers a [`store::transaction::CommitHook`] on the enclosing
//! transaction; the in-memory registries are mutated only from inside those
//! hooks (or under the same lock that was held across the commit), so a
//! rollback never leaves a registry inconsistent with the store.
//!
//! ## Observability model
//!
//! The crate uses `tracing` for logs/events. Library code emits events/spans
//! and does not unconditionally initialize a global subscriber. Hosts and
//! tests are responsible for one-time `tracing_subscriber` initialization at
//! process boundaries.

pub mod control_plane;
pub mod destination;
pub mod durable;
pub mod error;
pub mod handler;
pub mod identity;
pub mod realization;
pub mod remote;
pub mod store;
pub mod topology;

#[doc(hidden)]
pub mod observability;

mod fabric;
pub use fabric::{DestinationFabric, FabricConfig};

pub use destination::{DestinationDefinition, DestinationKind};
pub use error::{Fault, LockedReason};
pub use identity::{DestinationId, NodeId, RemoteAccessKey, SubscriberId};
pub use remote::StartMode;
