// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Lockspaces and their worker threads.
//!
//! A lockspace is one distributed lock namespace, normally one per
//! lockd-type volume group, plus a dedicated companion namespace for the
//! cluster-wide global lock on backends that need one. Each lockspace owns
//! a set of resources and runs one worker thread that drains the
//! lockspace's pending actions into per-resource queues and invokes the
//! resource processor until told to stop.
//!
//! # Lifecycle
//!
//! `Joining → {Active | Failed} → Stopping → Done`
//!
//! Joining blocks inside the backend's lockspace join, which can take a
//! long time. Active waits on the lockspace condvar for work and re-arms
//! itself on a short interval while any resource wants a retry. Stopping
//! force-releases everything still held and leaves the backend lockspace,
//! tolerating errors so shutdown always completes. Done fails leftover
//! actions and waits to be reaped by the maintenance worker.
//!
//! # Locking
//!
//! The lockspace's own mutex guards its action queue, resource table, and
//! lifecycle state. The registry mutex is always acquired before any
//! lockspace mutex, never the reverse.

mod process;
mod registry;
mod resource;

pub use registry::{InactiveLs, Registry, GL_LS_NAME, LS_NAME_PREFIX};
pub use resource::{LockSt, Resource, R_NAME_GL, R_NAME_VG};

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{info, warn};

use crate::action::{Action, LockError, Op, ResKind};
use crate::daemon::dispatch::DispatchQueue;
use crate::daemon::worker::WorkQueue;
use crate::lm::{LockManager, LsDef};
use crate::meta::MetaCache;

use process::{process_resource, PassDeps};

/// Lockspace lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LsState {
    Joining,
    Active,
    Failed,
    Stopping,
    Done,
}

impl fmt::Display for LsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LsState::Joining => "joining",
            LsState::Active => "active",
            LsState::Failed => "failed",
            LsState::Stopping => "stopping",
            LsState::Done => "done",
        };
        f.write_str(s)
    }
}

/// Per-lockspace control state shared with the resource processor.
#[derive(Debug, Default)]
pub(crate) struct LsCtl {
    /// This lockspace hosts a usable copy of the global lock (sanlock).
    pub sanlock_gl_enabled: bool,
    /// Last names version observed on a global-lock grant.
    pub names_seen: u32,
}

/// Collaborators a lockspace worker reaches out to.
pub(crate) struct LsEnv {
    pub meta: Arc<dyn MetaCache>,
    pub results: Arc<DispatchQueue>,
    pub work: Arc<WorkQueue>,
    pub next_id: Arc<AtomicU64>,
    pub retry_interval: Duration,
}

pub(crate) struct LsInner {
    pub state: LsState,
    pub actions: VecDeque<Action>,
    pub resources: HashMap<String, Resource>,
    pub ctl: LsCtl,
    pub free_vg: bool,
    /// Stop requested while the join was still in flight.
    pub stop_pending: bool,
    pub fail_rv: i32,
    /// Start action blocking on join completion (wait flag).
    pub start_act: Option<Action>,
    pub work: bool,
}

/// One distributed lock namespace and its worker.
pub struct Lockspace {
    pub def: LsDef,
    /// Companion global-lock lockspace started automatically with the
    /// first dlm volume group.
    pub auto_gl: bool,
    lm: Arc<dyn LockManager>,
    env: Arc<LsEnv>,
    inner: Mutex<LsInner>,
    cond: Condvar,
}

impl Lockspace {
    pub(crate) fn new(
        def: LsDef,
        auto_gl: bool,
        gl_enabled: bool,
        lm: Arc<dyn LockManager>,
        env: Arc<LsEnv>,
        start_act: Option<Action>,
    ) -> Arc<Lockspace> {
        Arc::new(Lockspace {
            def,
            auto_gl,
            lm,
            env,
            inner: Mutex::new(LsInner {
                state: LsState::Joining,
                actions: VecDeque::new(),
                resources: HashMap::new(),
                ctl: LsCtl {
                    sanlock_gl_enabled: gl_enabled,
                    names_seen: 0,
                },
                free_vg: false,
                stop_pending: false,
                fail_rv: 0,
                start_act,
                work: false,
            }),
            cond: Condvar::new(),
        })
    }

    /// Spawns the worker thread.
    pub(crate) fn spawn(self: &Arc<Lockspace>) -> thread::JoinHandle<()> {
        let ls = Arc::clone(self);
        thread::Builder::new()
            .name(format!("ls-{}", self.def.name))
            .spawn(move || ls.run())
            .expect("failed to spawn lockspace thread")
    }

    pub fn state(&self) -> LsState {
        self.inner.lock().state
    }

    pub fn fail_rv(&self) -> i32 {
        self.inner.lock().fail_rv
    }

    /// True when this lockspace hosts a usable global-lock copy.
    pub fn gl_enabled(&self) -> bool {
        let inner = self.inner.lock();
        self.def.is_gl || (inner.ctl.sanlock_gl_enabled && !matches!(inner.state, LsState::Done))
    }

    /// Queues an action for the worker. Refused with `ESTARTING` while the
    /// join is in flight and `ENOLS` once stopping.
    pub(crate) fn queue_action(&self, mut act: Action) -> Result<(), Action> {
        let mut inner = self.inner.lock();
        match inner.state {
            LsState::Joining => {
                act.fail(LockError::Starting);
                Err(act)
            }
            LsState::Active => {
                act.lm_type = self.def.lock_type;
                inner.actions.push_back(act);
                inner.work = true;
                self.cond.notify_all();
                Ok(())
            }
            LsState::Failed | LsState::Stopping | LsState::Done => {
                act.fail(LockError::NoLockspace);
                Err(act)
            }
        }
    }

    /// Queues a disconnect-cleanup action. Dropped silently when the
    /// lockspace holds nothing for the client yet.
    pub(crate) fn queue_close(&self, act: Action) {
        let mut inner = self.inner.lock();
        if inner.state == LsState::Active {
            inner.actions.push_back(act);
            inner.work = true;
            self.cond.notify_all();
        }
    }

    /// Requests the worker to stop. Without `force`, held logical-volume
    /// locks refuse the stop with `EBUSY`.
    pub(crate) fn request_stop(&self, force: bool, free: bool) -> Result<(), LockError> {
        let mut inner = self.inner.lock();
        match inner.state {
            LsState::Joining => {
                inner.stop_pending = true;
                inner.free_vg |= free;
                Ok(())
            }
            LsState::Active => {
                if !force {
                    let busy = inner
                        .resources
                        .values()
                        .any(|r| r.kind == ResKind::Lv && !r.locks.is_empty());
                    if busy {
                        return Err(LockError::Busy);
                    }
                }
                inner.free_vg |= free;
                inner.state = LsState::Stopping;
                self.cond.notify_all();
                Ok(())
            }
            LsState::Failed | LsState::Stopping | LsState::Done => Ok(()),
        }
    }

    fn run(self: Arc<Lockspace>) {
        let adopt = {
            let inner = self.inner.lock();
            inner
                .start_act
                .as_ref()
                .map(|a| a.flags.adopt)
                .unwrap_or(false)
        };

        info!(ls = %self.def.name, lm = %self.def.lock_type, "joining lockspace");
        let joined = self.lm.add_lockspace(&self.def, adopt);

        let mut start_done = None;
        let failed = {
            let mut inner = self.inner.lock();
            match joined {
                Ok(()) => {
                    inner.state = if inner.stop_pending {
                        LsState::Stopping
                    } else {
                        LsState::Active
                    };
                }
                Err(e) => {
                    warn!(ls = %self.def.name, error = %e, "lockspace join failed");
                    inner.fail_rv = e.code();
                    inner.state = LsState::Failed;
                }
            }
            if let Some(mut act) = inner.start_act.take() {
                match joined {
                    Ok(()) => act.succeed(),
                    Err(e) => {
                        act.lm_rv = e.code();
                        act.fail(e.into());
                    }
                }
                start_done = Some(act);
            }
            self.cond.notify_all();
            joined.is_err()
        };
        if let Some(act) = start_done {
            self.env.results.push_result(act);
        }

        if !failed {
            info!(ls = %self.def.name, "lockspace active");
            self.main_loop();
            self.stopping();
        }
        self.finish();
    }

    fn main_loop(&self) {
        let mut retry_pending = false;
        loop {
            let mut done;
            let refresh;
            {
                let mut inner = self.inner.lock();
                loop {
                    if inner.state == LsState::Stopping {
                        return;
                    }
                    if inner.work {
                        inner.work = false;
                        break;
                    }
                    if retry_pending {
                        let res = self.cond.wait_for(&mut inner, self.env.retry_interval);
                        if res.timed_out() {
                            break;
                        }
                    } else {
                        self.cond.wait(&mut inner);
                    }
                }
                if inner.state == LsState::Stopping {
                    return;
                }

                let (immediate, close_batch) = sort_actions(&mut inner);
                done = immediate;

                let deps = PassDeps {
                    ls: &self.def,
                    lm: &*self.lm,
                    meta: &*self.env.meta,
                };
                let names: Vec<String> = inner.resources.keys().cloned().collect();
                let mut any_retry = false;
                let mut any_refresh = false;
                for name in names {
                    let mut r = inner
                        .resources
                        .remove(&name)
                        .expect("resource names are current");
                    let out = process_resource(&deps, &mut r, &mut inner.ctl, &close_batch);
                    any_retry |= out.retry;
                    any_refresh |= out.refresh_local;
                    done.extend(out.done);
                    if out.drop_resource {
                        self.lm.rem_resource(&self.def, r.res_def());
                    } else {
                        inner.resources.insert(name, r);
                    }
                }
                retry_pending = any_retry;
                refresh = any_refresh;
            }

            if refresh {
                let id = self.env.next_id.fetch_add(1, Ordering::Relaxed);
                let act = Action::new(id, 0, Op::UpdateLocal, ResKind::Vg);
                self.env.work.push(act);
            }
            if !done.is_empty() {
                self.env.results.push_results(done);
            }
        }
    }

    /// Force-releases everything still held and leaves the backend
    /// lockspace. Errors are logged; shutdown always completes.
    fn stopping(&self) {
        let mut done = Vec::new();
        let free_vg;
        {
            let mut inner = self.inner.lock();
            free_vg = inner.free_vg;
            let deps = PassDeps {
                ls: &self.def,
                lm: &*self.lm,
                meta: &*self.env.meta,
            };
            let names: Vec<String> = inner.resources.keys().cloned().collect();
            for name in names {
                let mut r = inner
                    .resources
                    .remove(&name)
                    .expect("resource names are current");
                while let Some(mut act) = r.actions.pop_front() {
                    finish_action(&mut act);
                    done.push(act);
                }
                while !r.locks.is_empty() {
                    warn!(
                        ls = %self.def.name,
                        res = %r.name,
                        client = r.locks[0].client_id,
                        "clearing lock still held at stop"
                    );
                    let mut scratch = process::PassOutcome::default();
                    process::res_unlock(&deps, &mut r, &mut inner.ctl, 0, true, &mut scratch);
                }
                self.lm.rem_resource(&self.def, r.res_def());
            }
        }

        if free_vg {
            match self.lm.hosts(&self.def, true) {
                Ok(0) => {}
                Ok(n) => warn!(ls = %self.def.name, hosts = n, "other hosts still in lockspace"),
                Err(e) => warn!(ls = %self.def.name, error = %e, "host query failed"),
            }
        }
        if let Err(e) = self.lm.rem_lockspace(&self.def, free_vg) {
            warn!(ls = %self.def.name, error = %e, "backend lockspace leave failed");
        }
        info!(ls = %self.def.name, "lockspace stopped");

        if !done.is_empty() {
            self.env.results.push_results(done);
        }
    }

    /// Fails leftover actions, marks the record finished, and wakes the
    /// maintenance worker to reap the thread.
    fn finish(&self) {
        let mut done = Vec::new();
        {
            let mut inner = self.inner.lock();
            while let Some(mut act) = inner.actions.pop_front() {
                if act.op == Op::Close {
                    continue;
                }
                finish_action(&mut act);
                done.push(act);
            }
            inner.state = LsState::Done;
            self.cond.notify_all();
        }
        if !done.is_empty() {
            self.env.results.push_results(done);
        }
        self.env.work.notify();
    }

    /// Appends this lockspace's state to a diagnostic dump.
    pub fn dump_into(&self, out: &mut String) {
        use std::fmt::Write;

        let inner = self.inner.lock();
        let _ = writeln!(
            out,
            "info=ls name={} vg={} type={} state={} gl_enabled={} free_vg={}",
            self.def.name,
            self.def.vg_name,
            self.def.lock_type,
            inner.state,
            (self.def.is_gl || inner.ctl.sanlock_gl_enabled) as u8,
            inner.free_vg as u8,
        );
        for r in inner.resources.values() {
            let _ = writeln!(
                out,
                "info=r ls={} name={} kind={} mode={} sh_count={} version={}",
                self.def.name, r.name, r.kind, r.mode, r.sh_count, r.version,
            );
            for lk in &r.locks {
                let _ = writeln!(
                    out,
                    "info=lk ls={} res={} client={} mode={} persistent={} version={}",
                    self.def.name, r.name, lk.client_id, lk.mode, lk.persistent as u8, lk.version,
                );
            }
            for act in &r.actions {
                let _ = writeln!(
                    out,
                    "info=act ls={} res={} id={} client={} op={} mode={} retries={}",
                    self.def.name, r.name, act.id, act.client_id, act.op, act.mode, act.retries,
                );
            }
        }
        for act in &inner.actions {
            let _ = writeln!(
                out,
                "info=act ls={} id={} client={} op={} mode={}",
                self.def.name, act.id, act.client_id, act.op, act.mode,
            );
        }
    }
}

/// Results for actions failed by a stopping or stopped lockspace: stop and
/// free requests have what they asked for, everything else has no
/// lockspace.
fn finish_action(act: &mut Action) {
    match act.op {
        Op::Stop | Op::FreeVg | Op::FreeLv => act.succeed(),
        _ => act.fail(LockError::NoLockspace),
    }
}

/// Drains the lockspace queue into per-resource queues, separating close
/// actions and answering immediately where no resource exists.
fn sort_actions(inner: &mut LsInner) -> (Vec<Action>, Vec<Action>) {
    let mut immediate = Vec::new();
    let mut close_batch = Vec::new();

    let pending: Vec<Action> = inner.actions.drain(..).collect();
    for mut act in pending {
        if act.op == Op::Close {
            close_batch.push(act);
            continue;
        }
        let rname = Resource::name_for(act.rt, &act.lv_name);
        if act.op == Op::FreeLv && !inner.resources.contains_key(&rname) {
            // Freeing what was never referenced: answer without creating
            // the resource.
            act.fail(LockError::NotFound);
            immediate.push(act);
            continue;
        }
        let kind = act.rt;
        inner
            .resources
            .entry(rname.clone())
            .or_insert_with(|| Resource::new(kind, &rname))
            .actions
            .push_back(act);
    }
    (immediate, close_batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Mode as LkMode;

    #[test]
    fn test_sort_actions_separates_close() {
        let mut inner = LsInner {
            state: LsState::Active,
            actions: VecDeque::new(),
            resources: HashMap::new(),
            ctl: LsCtl::default(),
            free_vg: false,
            stop_pending: false,
            fail_rv: 0,
            start_act: None,
            work: false,
        };

        let mut lock = Action::new(1, 1, Op::Lock, ResKind::Vg);
        lock.mode = LkMode::Shared;
        inner.actions.push_back(lock);
        inner.actions.push_back(Action::new(2, 1, Op::Close, ResKind::Vg));

        let (immediate, close) = sort_actions(&mut inner);
        assert!(immediate.is_empty());
        assert_eq!(close.len(), 1);
        assert_eq!(inner.resources.len(), 1);
        assert_eq!(inner.resources[R_NAME_VG].actions.len(), 1);
    }

    #[test]
    fn test_sort_actions_free_without_resource() {
        let mut inner = LsInner {
            state: LsState::Active,
            actions: VecDeque::new(),
            resources: HashMap::new(),
            ctl: LsCtl::default(),
            free_vg: false,
            stop_pending: false,
            fail_rv: 0,
            start_act: None,
            work: false,
        };

        let mut free = Action::new(1, 1, Op::FreeLv, ResKind::Lv);
        free.lv_name = "lv0".to_string();
        inner.actions.push_back(free);

        let (immediate, _) = sort_actions(&mut inner);
        assert_eq!(immediate.len(), 1);
        assert_eq!(immediate[0].result, Some(Err(LockError::NotFound)));
        assert!(inner.resources.is_empty());
    }

    #[test]
    fn test_finish_action_results() {
        let mut stop = Action::new(1, 1, Op::Stop, ResKind::Vg);
        finish_action(&mut stop);
        assert_eq!(stop.result, Some(Ok(())));

        let mut lock = Action::new(2, 1, Op::Lock, ResKind::Vg);
        finish_action(&mut lock);
        assert_eq!(lock.result, Some(Err(LockError::NoLockspace)));
    }
}
