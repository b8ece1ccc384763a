// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Metadata-cache collaborator interface.
//!
//! The daemon does not read or write volume-group metadata itself; it only
//! tells the metadata layer when a cached copy may be stale, and asks it
//! for the current volume-group list when reconciling the local-VG table.

use crate::action::LockType;

/// One volume group as reported by the metadata layer.
#[derive(Debug, Clone, Default)]
pub struct VgDef {
    pub name: String,
    pub uuid: String,
    pub sysid: String,
    pub lock_type: LockType,
}

/// Notification interface to the metadata cache.
pub trait MetaCache: Send + Sync {
    /// A volume group's lock version advanced; cached metadata older than
    /// `version` is stale.
    fn invalidate_vg(&self, vg_name: &str, version: u32);

    /// The global lock was released after exclusive use; any cached
    /// cross-VG state is stale.
    fn invalidate_global(&self);

    /// Returns the full volume-group list for local-VG reconciliation.
    fn vg_list(&self) -> Vec<VgDef>;
}

/// No-op metadata cache for deployments without one.
#[derive(Debug, Default)]
pub struct NullMetaCache;

impl MetaCache for NullMetaCache {
    fn invalidate_vg(&self, _vg_name: &str, _version: u32) {}

    fn invalidate_global(&self) {}

    fn vg_list(&self) -> Vec<VgDef> {
        Vec::new()
    }
}
