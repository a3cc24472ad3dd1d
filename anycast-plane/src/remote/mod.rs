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

//! Anycast bookkeeping: input-handler and container-stream lifecycle for
//! consumers on other nodes, transmit pairs toward other nodes, and the
//! two-phase restart recovery that rebuilds both from persisted streams.

pub(crate) mod reconstitute;
pub(crate) mod support;

pub use support::{RemoteAccess, RemoteSupport, StartMode};
