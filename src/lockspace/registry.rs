// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Lockspace registry.
//!
//! Global table of active lockspaces plus the records of stopped and
//! failed ones, kept so later requests can be answered with a more
//! specific error than "not found". The registry mutex is always taken
//! before any individual lockspace mutex.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::action::{Action, LockError, LockType, Op, ResKind};
use crate::lm::{select_backend, BackendTable, LsDef};

use super::{LsEnv, LsState, Lockspace};

/// Lockspace name prefix for volume groups.
pub const LS_NAME_PREFIX: &str = "lvm_";
/// Name of the dedicated global-lock lockspace (dlm).
pub const GL_LS_NAME: &str = "lvm_global";

/// Lockspace name for a volume group.
pub fn vg_ls_name(vg_name: &str) -> String {
    format!("{}{}", LS_NAME_PREFIX, vg_name)
}

/// Record of a lockspace that stopped or failed to start.
#[derive(Debug, Clone)]
pub struct InactiveLs {
    pub name: String,
    pub vg_name: String,
    /// Join failure code, 0 after a clean stop.
    pub fail_rv: i32,
}

struct LsEntry {
    ls: Arc<Lockspace>,
    thread: Option<thread::JoinHandle<()>>,
}

struct RegInner {
    active: HashMap<String, LsEntry>,
    inactive: Vec<InactiveLs>,
    /// More than one lockspace currently hosts an enabled global lock.
    dup_gl: bool,
}

/// Registry of active and inactive lockspaces.
pub struct Registry {
    host_id: u64,
    backends: BackendTable,
    env: Arc<LsEnv>,
    inner: Mutex<RegInner>,
}

impl Registry {
    pub(crate) fn new(host_id: u64, backends: BackendTable, env: Arc<LsEnv>) -> Registry {
        Registry {
            host_id,
            backends,
            env,
            inner: Mutex::new(RegInner {
                active: HashMap::new(),
                inactive: Vec::new(),
                dup_gl: false,
            }),
        }
    }

    /// Creates a lockspace for a start action and spawns its worker.
    ///
    /// Returns the completed action unless it blocks on join completion
    /// (wait flag), in which case the worker delivers it later. Duplicate
    /// names fail `EEXIST` while running and `EAGAIN` while stopping.
    pub(crate) fn start_lockspace(&self, mut act: Action) -> Option<Action> {
        if act.vg_name.is_empty() {
            act.fail(LockError::Invalid);
            return Some(act);
        }
        let lm = match select_backend(&self.backends, act.lm_type) {
            Ok(lm) => lm,
            Err(e) => {
                act.fail(e);
                return Some(act);
            }
        };
        let name = vg_ls_name(&act.vg_name);

        let mut inner = self.inner.lock();
        if let Some(entry) = inner.active.get(&name) {
            let err = match entry.ls.state() {
                LsState::Stopping | LsState::Done => LockError::Again,
                _ => LockError::Exists,
            };
            act.fail(err);
            return Some(act);
        }
        inner.inactive.retain(|rec| rec.name != name);

        // The first dlm volume group brings up the companion global-lock
        // lockspace; the last one to leave takes it back down.
        if act.lm_type == LockType::Dlm && !inner.active.contains_key(GL_LS_NAME) {
            let def = LsDef {
                name: GL_LS_NAME.to_string(),
                lock_type: LockType::Dlm,
                host_id: self.host_id,
                is_gl: true,
                ..LsDef::default()
            };
            let ls = Lockspace::new(def, true, false, lm.clone(), Arc::clone(&self.env), None);
            let thread = ls.spawn();
            info!(ls = GL_LS_NAME, "auto-starting global lockspace");
            inner.active.insert(
                GL_LS_NAME.to_string(),
                LsEntry {
                    ls,
                    thread: Some(thread),
                },
            );
        }

        let def = LsDef {
            name: name.clone(),
            vg_name: act.vg_name.clone(),
            vg_uuid: act.vg_uuid.clone(),
            vg_args: act.vg_args.clone(),
            lock_type: act.lm_type,
            host_id: if act.host_id != 0 {
                act.host_id
            } else {
                self.host_id
            },
            is_gl: false,
        };
        let gl_enabled = act.lm_type == LockType::Sanlock && act.flags.enable;

        let (start_act, done) = if act.flags.wait {
            (Some(act), None)
        } else {
            act.succeed();
            (None, Some(act))
        };
        let ls = Lockspace::new(def, false, gl_enabled, lm, Arc::clone(&self.env), start_act);
        let thread = ls.spawn();
        inner.active.insert(
            name,
            LsEntry {
                ls,
                thread: Some(thread),
            },
        );
        done
    }

    /// Routes an action to the lockspace named by its volume group.
    ///
    /// Returns the failed action when no lockspace can take it; routing to
    /// a stopped record attaches the inactive flags for the reply.
    pub(crate) fn route_vg(&self, mut act: Action) -> Option<Action> {
        let target = {
            let inner = self.inner.lock();
            let name = vg_ls_name(&act.vg_name);
            match inner.active.get(&name) {
                Some(entry) => Ok(Arc::clone(&entry.ls)),
                None => {
                    if let Some(rec) = inner.inactive.iter().find(|r| r.name == name) {
                        act.flags.inactive_ls = true;
                        if rec.fail_rv != 0 {
                            act.flags.add_ls_error = true;
                        }
                    }
                    Err(LockError::NoLockspace)
                }
            }
        };
        self.queue_to(target, act)
    }

    /// Routes an action to the lockspace hosting the global lock.
    pub(crate) fn route_gl(&self, act: Action) -> Option<Action> {
        let target = {
            let mut inner = self.inner.lock();
            self.find_gl_locked(&mut inner)
        };
        self.queue_to(target, act)
    }

    fn queue_to(
        &self,
        target: Result<Arc<Lockspace>, LockError>,
        mut act: Action,
    ) -> Option<Action> {
        match target {
            Ok(ls) => match ls.queue_action(act) {
                Ok(()) => None,
                Err(act) => Some(act),
            },
            Err(e) => {
                act.fail(e);
                Some(act)
            }
        }
    }

    /// Finds the lockspace hosting the global lock. Two enabled copies
    /// are ambiguous: the duplicate flag is set and the request refused.
    fn find_gl_locked(&self, inner: &mut RegInner) -> Result<Arc<Lockspace>, LockError> {
        let enabled: Vec<Arc<Lockspace>> = inner
            .active
            .values()
            .filter(|e| {
                e.ls.def.lock_type == LockType::Sanlock
                    && !e.ls.def.is_gl
                    && e.ls.gl_enabled()
                    && e.ls.state() != LsState::Done
            })
            .map(|e| Arc::clone(&e.ls))
            .collect();
        inner.dup_gl = enabled.len() > 1;

        if let Some(entry) = inner.active.get(GL_LS_NAME) {
            return Ok(Arc::clone(&entry.ls));
        }
        match enabled.len() {
            0 => Err(LockError::NoLockspace),
            1 => Ok(enabled.into_iter().next().expect("one entry")),
            _ => {
                warn!("duplicate enabled global locks");
                Err(LockError::NoLockspace)
            }
        }
    }

    /// Requests a lockspace stop; `free` also releases backing storage.
    pub(crate) fn request_stop(
        &self,
        vg_name: &str,
        force: bool,
        free: bool,
    ) -> Result<(), LockError> {
        let ls = {
            let inner = self.inner.lock();
            inner
                .active
                .get(&vg_ls_name(vg_name))
                .map(|e| Arc::clone(&e.ls))
        };
        match ls {
            Some(ls) => ls.request_stop(force, free),
            None => Err(LockError::NoLockspace),
        }
    }

    /// Requests a stop of every active lockspace. Returns how many were
    /// told to stop.
    pub(crate) fn stop_all(&self, force: bool) -> usize {
        let targets: Vec<Arc<Lockspace>> = {
            let inner = self.inner.lock();
            inner.active.values().map(|e| Arc::clone(&e.ls)).collect()
        };
        let mut stopped = 0;
        for ls in targets {
            match ls.request_stop(force, false) {
                Ok(()) => stopped += 1,
                Err(e) => warn!(ls = %ls.def.name, error = %e, "stop refused"),
            }
        }
        stopped
    }

    /// Reaps finished worker threads, migrates their records to the
    /// inactive list, recomputes the duplicate-global flag, and takes the
    /// auto-started companion down once the last dlm volume group leaves.
    pub(crate) fn remove_stopped(&self) {
        let mut inner = self.inner.lock();

        let done: Vec<String> = inner
            .active
            .iter()
            .filter(|(_, e)| e.ls.state() == LsState::Done)
            .map(|(name, _)| name.clone())
            .collect();
        for name in done {
            let mut entry = inner.active.remove(&name).expect("name is present");
            if let Some(thread) = entry.thread.take() {
                let _ = thread.join();
            }
            let fail_rv = entry.ls.fail_rv();
            info!(ls = %name, fail_rv, "reaped lockspace");
            inner.inactive.push(InactiveLs {
                name,
                vg_name: entry.ls.def.vg_name.clone(),
                fail_rv,
            });
        }

        let dup = inner
            .active
            .values()
            .filter(|e| {
                e.ls.def.lock_type == LockType::Sanlock && !e.ls.def.is_gl && e.ls.gl_enabled()
            })
            .count()
            > 1;
        inner.dup_gl = dup;

        let has_dlm_vg = inner
            .active
            .values()
            .any(|e| e.ls.def.lock_type == LockType::Dlm && !e.ls.def.is_gl);
        if !has_dlm_vg {
            if let Some(entry) = inner.active.get(GL_LS_NAME) {
                if entry.ls.auto_gl {
                    let _ = entry.ls.request_stop(true, false);
                }
            }
        }
    }

    /// Broadcasts a disconnect-cleanup action to every active lockspace.
    pub(crate) fn close_broadcast(&self, client_id: u32) {
        let targets: Vec<Arc<Lockspace>> = {
            let inner = self.inner.lock();
            inner.active.values().map(|e| Arc::clone(&e.ls)).collect()
        };
        for ls in targets {
            let id = self
                .env
                .next_id
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            ls.queue_close(Action::new(id, client_id, Op::Close, ResKind::Vg));
        }
    }

    pub fn get(&self, vg_name: &str) -> Option<Arc<Lockspace>> {
        let inner = self.inner.lock();
        inner
            .active
            .get(&vg_ls_name(vg_name))
            .map(|e| Arc::clone(&e.ls))
    }

    pub fn find_inactive(&self, vg_name: &str) -> Option<InactiveLs> {
        let name = vg_ls_name(vg_name);
        let inner = self.inner.lock();
        inner.inactive.iter().find(|r| r.name == name).cloned()
    }

    /// True when any lockspace join is still in flight.
    pub fn any_joining(&self) -> bool {
        let inner = self.inner.lock();
        inner
            .active
            .values()
            .any(|e| e.ls.state() == LsState::Joining)
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().active.is_empty()
    }

    pub fn dup_gl(&self) -> bool {
        self.inner.lock().dup_gl
    }

    /// Appends every lockspace's state to a diagnostic dump.
    pub fn dump_into(&self, out: &mut String) {
        let targets: Vec<Arc<Lockspace>> = {
            let inner = self.inner.lock();
            inner.active.values().map(|e| Arc::clone(&e.ls)).collect()
        };
        for ls in targets {
            ls.dump_into(out);
        }
        use std::fmt::Write;
        let inner = self.inner.lock();
        for rec in &inner.inactive {
            let _ = writeln!(
                out,
                "info=inactive_ls name={} vg={} fail_rv={}",
                rec.name, rec.vg_name, rec.fail_rv,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Mode, DEFAULT_MAX_RETRIES};
    use crate::daemon::dispatch::DispatchQueue;
    use crate::daemon::worker::WorkQueue;
    use crate::lm::{LockManager, MemoryLockManager};
    use crate::meta::NullMetaCache;
    use std::sync::atomic::AtomicU64;
    use std::time::{Duration, Instant};

    fn test_env() -> (Arc<LsEnv>, Arc<DispatchQueue>) {
        let results = Arc::new(DispatchQueue::new());
        let env = Arc::new(LsEnv {
            meta: Arc::new(NullMetaCache),
            results: Arc::clone(&results),
            work: Arc::new(WorkQueue::new()),
            next_id: Arc::new(AtomicU64::new(1000)),
            retry_interval: Duration::from_millis(10),
        });
        (env, results)
    }

    fn test_registry() -> (Arc<Registry>, Arc<MemoryLockManager>, Arc<DispatchQueue>) {
        let (env, results) = test_env();
        let mem = Arc::new(MemoryLockManager::new());
        let mut backends = BackendTable::new();
        backends.insert(LockType::Sanlock, mem.clone());
        backends.insert(LockType::Dlm, mem.clone());
        (Arc::new(Registry::new(1, backends, env)), mem, results)
    }

    fn start_act(id: u64, vg: &str, lock_type: LockType) -> Action {
        let mut act = Action::new(id, 1, Op::Start, ResKind::Vg);
        act.vg_name = vg.to_string();
        act.lm_type = lock_type;
        act
    }

    fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn wait_state(reg: &Registry, vg: &str, state: LsState) {
        wait_until("lockspace state", || {
            reg.get(vg).map(|ls| ls.state() == state).unwrap_or(false)
        });
    }

    #[test]
    fn test_start_and_duplicate() {
        let (reg, _mem, _results) = test_registry();

        let done = reg.start_lockspace(start_act(1, "vg0", LockType::Sanlock));
        assert_eq!(done.unwrap().result, Some(Ok(())));
        wait_state(&reg, "vg0", LsState::Active);

        let dup = reg.start_lockspace(start_act(2, "vg0", LockType::Sanlock));
        assert_eq!(dup.unwrap().result, Some(Err(LockError::Exists)));
    }

    #[test]
    fn test_start_wait_delivers_result_after_join() {
        let (reg, _mem, results) = test_registry();

        let mut act = start_act(1, "vg0", LockType::Sanlock);
        act.flags.wait = true;
        assert!(reg.start_lockspace(act).is_none());

        wait_until("start result", || {
            results.drain_results_nowait().iter().any(|a| a.id == 1)
        });
        wait_state(&reg, "vg0", LsState::Active);
    }

    #[test]
    fn test_stop_reap_and_restart() {
        let (reg, _mem, _results) = test_registry();

        reg.start_lockspace(start_act(1, "vg0", LockType::Sanlock));
        wait_state(&reg, "vg0", LsState::Active);

        reg.request_stop("vg0", false, false).unwrap();
        wait_state(&reg, "vg0", LsState::Done);
        reg.remove_stopped();
        assert!(reg.is_empty());

        let rec = reg.find_inactive("vg0").unwrap();
        assert_eq!(rec.fail_rv, 0);

        // Restarting clears the inactive record.
        reg.start_lockspace(start_act(2, "vg0", LockType::Sanlock));
        wait_state(&reg, "vg0", LsState::Active);
        assert!(reg.find_inactive("vg0").is_none());
    }

    #[test]
    fn test_failed_join_leaves_inactive_record() {
        let (reg, mem, _results) = test_registry();

        // The backend already has this lockspace joined, so the worker's
        // join fails.
        let def = LsDef {
            name: vg_ls_name("vgf"),
            vg_name: "vgf".to_string(),
            lock_type: LockType::Sanlock,
            ..LsDef::default()
        };
        mem.add_lockspace(&def, false).unwrap();

        reg.start_lockspace(start_act(1, "vgf", LockType::Sanlock));
        wait_state(&reg, "vgf", LsState::Done);
        reg.remove_stopped();

        let rec = reg.find_inactive("vgf").unwrap();
        assert_ne!(rec.fail_rv, 0);

        // Lock requests now carry the inactive flags.
        let mut act = Action::new(2, 1, Op::Lock, ResKind::Vg);
        act.vg_name = "vgf".to_string();
        act.mode = Mode::Shared;
        act.max_retries = DEFAULT_MAX_RETRIES;
        let failed = reg.route_vg(act).unwrap();
        assert_eq!(failed.result, Some(Err(LockError::NoLockspace)));
        assert!(failed.flags.inactive_ls);
        assert!(failed.flags.add_ls_error);
    }

    #[test]
    fn test_duplicate_global_lock_flag() {
        let (reg, _mem, _results) = test_registry();

        let mut a = start_act(1, "vg0", LockType::Sanlock);
        a.flags.enable = true;
        reg.start_lockspace(a);
        let mut b = start_act(2, "vg1", LockType::Sanlock);
        b.flags.enable = true;
        reg.start_lockspace(b);
        wait_state(&reg, "vg0", LsState::Active);
        wait_state(&reg, "vg1", LsState::Active);

        let mut gl = Action::new(3, 1, Op::Lock, ResKind::Global);
        gl.mode = Mode::Shared;
        let failed = reg.route_gl(gl).unwrap();
        assert_eq!(failed.result, Some(Err(LockError::NoLockspace)));
        assert!(reg.dup_gl());

        // One enabled copy remains: the flag clears and routing works.
        reg.request_stop("vg1", true, false).unwrap();
        wait_state(&reg, "vg1", LsState::Done);
        reg.remove_stopped();
        assert!(!reg.dup_gl());

        let mut gl = Action::new(4, 1, Op::Lock, ResKind::Global);
        gl.mode = Mode::Shared;
        assert!(reg.route_gl(gl).is_none());
    }

    #[test]
    fn test_dlm_companion_lifecycle() {
        let (reg, _mem, _results) = test_registry();

        reg.start_lockspace(start_act(1, "vgd", LockType::Dlm));
        wait_state(&reg, "vgd", LsState::Active);
        assert_eq!(reg.active_count(), 2, "companion global lockspace started");

        // The companion hosts the global lock.
        wait_until("companion active", || !reg.any_joining());
        let mut gl = Action::new(2, 1, Op::Lock, ResKind::Global);
        gl.mode = Mode::Shared;
        assert!(reg.route_gl(gl).is_none());

        // Stopping the last dlm volume group takes the companion down.
        reg.request_stop("vgd", true, false).unwrap();
        wait_state(&reg, "vgd", LsState::Done);
        reg.remove_stopped();
        wait_until("companion reaped", || {
            reg.remove_stopped();
            reg.is_empty()
        });
    }

    #[test]
    fn test_route_lock_while_joining_is_starting() {
        let (reg, _mem, _results) = test_registry();

        // The in-memory backend joins quickly, so the Joining window may
        // already be over; both outcomes are checked.
        reg.start_lockspace(start_act(1, "vg0", LockType::Sanlock));
        let ls = reg.get("vg0").unwrap();
        let mut act = Action::new(2, 1, Op::Lock, ResKind::Vg);
        act.vg_name = "vg0".to_string();
        act.mode = Mode::Shared;
        match ls.state() {
            LsState::Joining => {
                let failed = ls.queue_action(act).unwrap_err();
                assert_eq!(failed.result, Some(Err(LockError::Starting)));
            }
            _ => {
                // The join already completed; the queue accepts it.
                assert!(ls.queue_action(act).is_ok());
            }
        }
    }
}
