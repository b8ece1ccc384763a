// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Lock-manager capability interface.
//!
//! The daemon coordinates locks through an external cluster lock manager.
//! Everything it needs from one is captured by the [`LockManager`] trait:
//! joining and leaving lockspaces, non-blocking lock/convert/unlock with a
//! persisted version block, per-resource teardown, host counting, and
//! lock-argument initialization for new volume groups and logical volumes.
//!
//! A backend is selected once per lockspace at creation time from the
//! daemon's backend table, keyed by the lockspace's recorded manager type;
//! call sites never branch on the type themselves.
//!
//! # Non-blocking contract
//!
//! `lock` and `convert` must return immediately with [`LmError::Again`]
//! on conflict rather than queue internally: some backends have no queued
//! waiters, so the daemon owns all waiting and retry policy.

mod error;
mod memory;

pub use error::LmError;
pub use memory::MemoryLockManager;

use std::collections::HashMap;
use std::sync::Arc;

use crate::action::{LockError, LockType, Mode, ResKind};

/// Identity of a lockspace, as a backend sees it.
#[derive(Debug, Clone, Default)]
pub struct LsDef {
    /// Backend lockspace name, e.g. `lvm_vg0` or `lvm_global`.
    pub name: String,
    pub vg_name: String,
    pub vg_uuid: String,
    /// Opaque lock arguments recorded in volume-group metadata.
    pub vg_args: String,
    pub lock_type: LockType,
    /// This host's id within the lockspace.
    pub host_id: u64,
    /// True for the dedicated global-lock lockspace.
    pub is_gl: bool,
}

/// Identity of one resource within a lockspace.
#[derive(Debug, Clone, Copy)]
pub struct ResDef<'a> {
    pub kind: ResKind,
    pub name: &'a str,
}

/// Version block persisted with a resource by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VersionBlock {
    /// The resource's data version.
    pub r_version: u32,
    /// The global lock's names version; unused elsewhere.
    pub n_version: u32,
}

/// Result of a granted lock: the version block the backend read back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LmGrant {
    pub r_version: u32,
    pub n_version: u32,
}

/// Capability interface to one cluster lock-manager backend.
pub trait LockManager: Send + Sync {
    /// Joins the backend lockspace. May block for a long time.
    fn add_lockspace(&self, ls: &LsDef, adopt: bool) -> Result<(), LmError>;

    /// Leaves the backend lockspace. `free` also releases the backing
    /// lease storage (volume-group removal path).
    fn rem_lockspace(&self, ls: &LsDef, free: bool) -> Result<(), LmError>;

    /// Acquires a lock, non-blocking. Returns the persisted version block.
    fn lock(&self, ls: &LsDef, res: ResDef<'_>, mode: Mode, adopt: bool)
        -> Result<LmGrant, LmError>;

    /// Converts a held lock to `mode`, non-blocking. A demotion persists
    /// the supplied version block.
    fn convert(
        &self,
        ls: &LsDef,
        res: ResDef<'_>,
        mode: Mode,
        vb: Option<VersionBlock>,
    ) -> Result<(), LmError>;

    /// Releases a held lock, persisting the supplied version block.
    fn unlock(
        &self,
        ls: &LsDef,
        res: ResDef<'_>,
        vb: Option<VersionBlock>,
        force: bool,
    ) -> Result<(), LmError>;

    /// Drops manager-side state for one resource.
    fn rem_resource(&self, ls: &LsDef, res: ResDef<'_>);

    /// Releases the manager-side lease allocation for a logical volume.
    fn free_lv(&self, ls: &LsDef, res: ResDef<'_>) -> Result<(), LmError>;

    /// Counts other hosts present in the lockspace, optionally notifying
    /// them that the lockspace is going away.
    fn hosts(&self, ls: &LsDef, notify: bool) -> Result<u32, LmError>;

    /// Produces the lock arguments for a newly initialized volume group.
    fn init_vg(&self, vg_name: &str) -> Result<String, LmError>;

    /// Produces the lock arguments for a newly initialized logical volume.
    fn init_lv(&self, vg_name: &str, lv_name: &str, vg_args: &str) -> Result<String, LmError>;

    /// Toggles whether this lockspace's copy of the global lock may be
    /// used. Disabling marks the lease so other hosts see it as disabled.
    fn enable_gl(&self, ls: &LsDef, enable: bool) -> Result<(), LmError>;
}

/// Backend table keyed by lock-manager type.
pub type BackendTable = HashMap<LockType, Arc<dyn LockManager>>;

/// Selects the backend for a lock-manager type. An unregistered type is
/// an error; `None` is never dispatchable.
pub fn select_backend(
    table: &BackendTable,
    lock_type: LockType,
) -> Result<Arc<dyn LockManager>, LockError> {
    if lock_type == LockType::None {
        return Err(LockError::Invalid);
    }
    table.get(&lock_type).cloned().ok_or(LockError::Invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_backend() {
        let mut table = BackendTable::new();
        let mem: Arc<dyn LockManager> = Arc::new(MemoryLockManager::new());
        table.insert(LockType::Sanlock, mem);

        assert!(select_backend(&table, LockType::Sanlock).is_ok());
        assert_eq!(
            select_backend(&table, LockType::Dlm).err().unwrap(),
            LockError::Invalid
        );
        assert_eq!(
            select_backend(&table, LockType::None).err().unwrap(),
            LockError::Invalid
        );
    }
}
