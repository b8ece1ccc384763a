// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! In-process lock-manager backend.
//!
//! Implements the [`LockManager`] capability interface over in-memory
//! tables: suitable for single-node development and for tests, which use
//! the simulation hooks (`hold_other`, `force_gl_disable`, …) to stand in
//! for the behavior of other hosts in the cluster.
//!
//! Version blocks persist across leave/rejoin of a lockspace, the way a
//! real lease survives on shared storage; only `free` removal (volume-group
//! deletion) discards them.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use super::error::LmError;
use super::{LmGrant, LockManager, LsDef, ResDef, VersionBlock};
use crate::action::Mode;

const LM_ARGS_VERSION: &str = "1.0.0";

#[derive(Debug, Default)]
struct MemRes {
    /// Mode held by this daemon, `Unlock` when not held.
    mode: Mode,
    /// Simulated hold by another host.
    other: Option<Mode>,
    /// Global-lock disabled marker, as another host would observe it.
    disabled: bool,
    /// Conflicts report a transient retry hint when set.
    transient_hint: bool,
    r_version: u32,
    n_version: u32,
    /// Number of lock() calls against this resource, refusals included.
    attempts: u32,
}

#[derive(Debug, Default)]
struct MemLs {
    joined: bool,
    resources: HashMap<String, MemRes>,
}

#[derive(Default)]
struct MemState {
    lockspaces: HashMap<String, MemLs>,
}

/// In-memory [`LockManager`] backend.
pub struct MemoryLockManager {
    state: Mutex<MemState>,
    host_count: u32,
}

impl MemoryLockManager {
    pub fn new() -> MemoryLockManager {
        MemoryLockManager {
            state: Mutex::new(MemState::default()),
            host_count: 0,
        }
    }

    /// Sets the number of other hosts reported by `hosts()`.
    pub fn with_host_count(mut self, host_count: u32) -> MemoryLockManager {
        self.host_count = host_count;
        self
    }

    /// Simulates another host holding `mode` on a resource. Subsequent
    /// conflicting requests refuse with `Again`.
    pub fn hold_other(&self, ls_name: &str, res_name: &str, mode: Mode) {
        let mut state = self.state.lock();
        let res = Self::res_entry(&mut state, ls_name, res_name);
        res.other = Some(mode);
    }

    /// Clears a simulated foreign hold.
    pub fn release_other(&self, ls_name: &str, res_name: &str) {
        let mut state = self.state.lock();
        let res = Self::res_entry(&mut state, ls_name, res_name);
        res.other = None;
    }

    /// Sets the transient hint reported with refusals on a resource.
    pub fn set_transient_hint(&self, ls_name: &str, res_name: &str, transient: bool) {
        let mut state = self.state.lock();
        let res = Self::res_entry(&mut state, ls_name, res_name);
        res.transient_hint = transient;
    }

    /// Simulates another host force-disabling the global lock.
    pub fn force_gl_disable(&self, ls_name: &str, res_name: &str) {
        let mut state = self.state.lock();
        let res = Self::res_entry(&mut state, ls_name, res_name);
        res.disabled = true;
    }

    /// Simulates another host advancing the persisted names version.
    pub fn force_names_version(&self, ls_name: &str, res_name: &str, n_version: u32) {
        let mut state = self.state.lock();
        let res = Self::res_entry(&mut state, ls_name, res_name);
        res.n_version = n_version;
    }

    /// Number of lock() calls made against a resource, refusals included.
    pub fn lock_attempts(&self, ls_name: &str, res_name: &str) -> u32 {
        let mut state = self.state.lock();
        Self::res_entry(&mut state, ls_name, res_name).attempts
    }

    /// Persisted version block for a resource, for test assertions.
    pub fn version_block(&self, ls_name: &str, res_name: &str) -> VersionBlock {
        let mut state = self.state.lock();
        let res = Self::res_entry(&mut state, ls_name, res_name);
        VersionBlock {
            r_version: res.r_version,
            n_version: res.n_version,
        }
    }

    fn res_entry<'a>(state: &'a mut MemState, ls_name: &str, res_name: &str) -> &'a mut MemRes {
        state
            .lockspaces
            .entry(ls_name.to_string())
            .or_default()
            .resources
            .entry(res_name.to_string())
            .or_default()
    }

    fn joined_res<'a>(
        state: &'a mut MemState,
        ls: &LsDef,
        res: ResDef<'_>,
    ) -> Result<&'a mut MemRes, LmError> {
        let mls = state.lockspaces.get_mut(&ls.name).ok_or(LmError::NotFound)?;
        if !mls.joined {
            return Err(LmError::NotFound);
        }
        Ok(mls.resources.entry(res.name.to_string()).or_default())
    }
}

impl Default for MemoryLockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager for MemoryLockManager {
    fn add_lockspace(&self, ls: &LsDef, _adopt: bool) -> Result<(), LmError> {
        let mut state = self.state.lock();
        let mls = state.lockspaces.entry(ls.name.clone()).or_default();
        if mls.joined {
            return Err(LmError::Exists);
        }
        mls.joined = true;
        debug!(ls = %ls.name, "joined lockspace");
        Ok(())
    }

    fn rem_lockspace(&self, ls: &LsDef, free: bool) -> Result<(), LmError> {
        let mut state = self.state.lock();
        if free {
            state.lockspaces.remove(&ls.name);
            return Ok(());
        }
        let mls = state.lockspaces.get_mut(&ls.name).ok_or(LmError::NotFound)?;
        mls.joined = false;
        // Held modes drop with membership; version blocks survive on
        // the backing storage.
        for res in mls.resources.values_mut() {
            res.mode = Mode::Unlock;
        }
        Ok(())
    }

    fn lock(
        &self,
        ls: &LsDef,
        res: ResDef<'_>,
        mode: Mode,
        _adopt: bool,
    ) -> Result<LmGrant, LmError> {
        let mut state = self.state.lock();
        let r = Self::joined_res(&mut state, ls, res)?;
        r.attempts += 1;

        if r.disabled {
            return Err(LmError::Disabled);
        }
        if r.mode != Mode::Unlock {
            return Err(LmError::Exists);
        }
        if let Some(other) = r.other {
            let compatible = other == Mode::Shared && mode == Mode::Shared;
            if !compatible {
                return Err(LmError::Again {
                    transient: r.transient_hint,
                });
            }
        }

        r.mode = mode;
        Ok(LmGrant {
            r_version: r.r_version,
            n_version: r.n_version,
        })
    }

    fn convert(
        &self,
        ls: &LsDef,
        res: ResDef<'_>,
        mode: Mode,
        vb: Option<VersionBlock>,
    ) -> Result<(), LmError> {
        let mut state = self.state.lock();
        let r = Self::joined_res(&mut state, ls, res)?;
        if r.mode == Mode::Unlock {
            return Err(LmError::NotFound);
        }
        if mode == Mode::Exclusive && r.other.is_some() {
            return Err(LmError::Again {
                transient: r.transient_hint,
            });
        }
        if let Some(vb) = vb {
            r.r_version = vb.r_version;
            r.n_version = vb.n_version;
        }
        r.mode = mode;
        Ok(())
    }

    fn unlock(
        &self,
        ls: &LsDef,
        res: ResDef<'_>,
        vb: Option<VersionBlock>,
        _force: bool,
    ) -> Result<(), LmError> {
        let mut state = self.state.lock();
        let r = Self::joined_res(&mut state, ls, res)?;
        if let Some(vb) = vb {
            r.r_version = vb.r_version;
            r.n_version = vb.n_version;
        }
        r.mode = Mode::Unlock;
        Ok(())
    }

    fn rem_resource(&self, ls: &LsDef, res: ResDef<'_>) {
        let mut state = self.state.lock();
        if let Some(mls) = state.lockspaces.get_mut(&ls.name) {
            // The version block stays behind, like a lease on storage.
            if let Some(r) = mls.resources.get_mut(res.name) {
                r.mode = Mode::Unlock;
            }
        }
    }

    fn free_lv(&self, ls: &LsDef, res: ResDef<'_>) -> Result<(), LmError> {
        let mut state = self.state.lock();
        let mls = state.lockspaces.get_mut(&ls.name).ok_or(LmError::NotFound)?;
        mls.resources.remove(res.name);
        Ok(())
    }

    fn hosts(&self, _ls: &LsDef, _notify: bool) -> Result<u32, LmError> {
        Ok(self.host_count)
    }

    fn init_vg(&self, vg_name: &str) -> Result<String, LmError> {
        Ok(format!("{}:{}", LM_ARGS_VERSION, vg_name))
    }

    fn init_lv(&self, vg_name: &str, lv_name: &str, _vg_args: &str) -> Result<String, LmError> {
        Ok(format!("{}:{}/{}", LM_ARGS_VERSION, vg_name, lv_name))
    }

    fn enable_gl(&self, ls: &LsDef, enable: bool) -> Result<(), LmError> {
        let mut state = self.state.lock();
        let res = Self::res_entry(&mut state, &ls.name, crate::lockspace::R_NAME_GL);
        res.disabled = !enable;
        Ok(())
    }
}
