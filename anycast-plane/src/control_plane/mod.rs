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

//! Localisation control plane.
//!
//! Owns the per-destination registry of hosting nodes, their output handlers,
//! and the guess sets used for routing when the topology service cannot be
//! consulted. All guess-set and handler-map mutation happens under one
//! set-scoped exclusive lock per destination; reads go through immutable
//! snapshots so routing never blocks behind a mutation.

pub(crate) mod guess_set;
pub(crate) mod localisation_manager;

pub use guess_set::GuessSet;
pub use localisation_manager::LocalisationManager;
