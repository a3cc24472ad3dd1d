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

//! Persistent transactional store boundary.
//!
//! The store is an external collaborator: this layer never bypasses its
//! transactional boundary. Every add or remove of routing state that must
//! match persisted state registers a [`transaction::CommitHook`] on the
//! enclosing transaction, and in-memory registries are mutated only from
//! inside those hooks or under a lock held across the commit, never eagerly,
//! so a rollback cannot leave an inconsistent registry behind.

pub mod stream;
pub mod transaction;
