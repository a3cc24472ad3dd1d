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

//! Durable subscription protocol: the node-local lookup table with its
//! create/attach/delete state machine, and the remote attach path that
//! carries a subscription's traffic over anycast via a pseudo destination.

pub(crate) mod remote;
pub(crate) mod state;
pub(crate) mod table;

pub use remote::DurableAttachOutcome;
pub use state::{DurableSubscriptionState, SelectionCriteria};
pub use table::{DurableOpStatus, DurableSubscriptionTable};
