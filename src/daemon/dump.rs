// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Diagnostic state dump.
//!
//! Free-form text enumerating every client, local volume group,
//! lockspace, resource, lock, and pending action. Operational visibility
//! only; not part of the lock protocol.

use crate::lockspace::Registry;

use super::client::ClientTable;
use super::local::LocalTable;

pub(crate) fn build_dump(
    clients: &ClientTable,
    local: &LocalTable,
    registry: &Registry,
) -> String {
    let mut out = String::new();
    clients.dump_into(&mut out);
    local.dump_into(&mut out);
    registry.dump_into(&mut out);
    out
}
