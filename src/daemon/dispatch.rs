// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Client dispatcher.
//!
//! One thread drains two queues under a single condvar: newly submitted
//! actions, routed by operation code to the lockspace registry, the
//! local-VG fast path, or the maintenance worker; and completed actions,
//! matched back to their clients and serialized into responses. Result
//! flags are computed at delivery time from the registry's current state.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::action::{Action, LockError, Op, ResKind, Response, ResultFlags};
use crate::lockspace::Registry;

use super::client::ClientTable;
use super::dump::build_dump;
use super::local::LocalTable;
use super::worker::WorkQueue;

struct DqInner {
    subs: VecDeque<Action>,
    results: VecDeque<Action>,
    stop: bool,
}

/// The dispatcher's combined submission/result queue.
pub(crate) struct DispatchQueue {
    inner: Mutex<DqInner>,
    cond: Condvar,
}

impl DispatchQueue {
    pub(crate) fn new() -> DispatchQueue {
        DispatchQueue {
            inner: Mutex::new(DqInner {
                subs: VecDeque::new(),
                results: VecDeque::new(),
                stop: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn submit(&self, act: Action) {
        let mut inner = self.inner.lock();
        inner.subs.push_back(act);
        self.cond.notify_all();
    }

    pub(crate) fn push_result(&self, act: Action) {
        let mut inner = self.inner.lock();
        inner.results.push_back(act);
        self.cond.notify_all();
    }

    pub(crate) fn push_results(&self, acts: Vec<Action>) {
        if acts.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        inner.results.extend(acts);
        self.cond.notify_all();
    }

    pub(crate) fn stop(&self) {
        let mut inner = self.inner.lock();
        inner.stop = true;
        self.cond.notify_all();
    }

    /// Blocks until there is something to do. Returns `None` on stop.
    fn wait(&self) -> Option<(Vec<Action>, Vec<Action>)> {
        let mut inner = self.inner.lock();
        loop {
            if inner.stop {
                return None;
            }
            if !inner.subs.is_empty() || !inner.results.is_empty() {
                return Some((
                    inner.subs.drain(..).collect(),
                    inner.results.drain(..).collect(),
                ));
            }
            self.cond.wait(&mut inner);
        }
    }

    /// Drains completed actions without blocking; test support.
    pub(crate) fn drain_results_nowait(&self) -> Vec<Action> {
        let mut inner = self.inner.lock();
        inner.results.drain(..).collect()
    }
}

/// Routes submissions and delivers results.
pub(crate) struct Dispatcher {
    pub queue: Arc<DispatchQueue>,
    pub registry: Arc<Registry>,
    pub local: Arc<LocalTable>,
    pub clients: Arc<ClientTable>,
    pub work: Arc<WorkQueue>,
    /// This host's system id, for foreign-VG refusal.
    pub sysid: String,
    /// Serve the global lock from the local fast path.
    pub local_only_gl: bool,
}

impl Dispatcher {
    pub(crate) fn spawn(self) -> thread::JoinHandle<()> {
        thread::Builder::new()
            .name("dispatch".to_string())
            .spawn(move || self.run())
            .expect("failed to spawn dispatch thread")
    }

    fn run(self) {
        loop {
            let (subs, results) = match self.queue.wait() {
                Some(batch) => batch,
                None => return,
            };
            for act in subs {
                if let Some(done) = self.route(act) {
                    self.deliver(done);
                }
            }
            for act in results {
                self.deliver(act);
            }
        }
    }

    /// Routes one action. Returns it when it completed immediately.
    fn route(&self, mut act: Action) -> Option<Action> {
        debug!(id = act.id, client = act.client_id, op = %act.op, "routing");
        match act.op {
            Op::Hello | Op::Quit | Op::Info | Op::Dump => {
                act.succeed();
                Some(act)
            }
            Op::Start => self.registry.start_lockspace(act),
            Op::Stop => {
                let rv = self
                    .registry
                    .request_stop(&act.vg_name, act.flags.force, false);
                act.result = Some(rv);
                Some(act)
            }
            Op::FreeVg => {
                let rv = self
                    .registry
                    .request_stop(&act.vg_name, act.flags.force, true);
                act.result = Some(rv);
                Some(act)
            }
            Op::InitVg | Op::InitLv | Op::UpdateLocal | Op::StartWait | Op::StopAll => {
                self.work.push(act);
                None
            }
            Op::AddLocal => {
                let rv = self.local.add_vg(&act);
                act.flags.local = true;
                act.result = Some(rv);
                Some(act)
            }
            Op::RemLocal => {
                let rv = self.local.rem_vg(&act.vg_name);
                act.flags.local = true;
                act.result = Some(rv);
                Some(act)
            }
            Op::Lock | Op::Update | Op::EnableGl | Op::DisableGl | Op::FreeLv => {
                self.route_lock(act)
            }
            Op::Close => None,
        }
    }

    fn route_lock(&self, mut act: Action) -> Option<Action> {
        if act.rt == ResKind::Global {
            // Enable/disable name the volume group whose global-lock copy
            // they toggle; everything else goes to whichever lockspace
            // hosts the global lock.
            let vg_directed =
                matches!(act.op, Op::EnableGl | Op::DisableGl) && !act.vg_name.is_empty();
            if vg_directed {
                return self.registry.route_vg(act);
            }
            if self.local_only_gl && act.op == Op::Lock {
                act.flags.local = true;
                self.local.queue(act);
                return None;
            }
            return self.registry.route_gl(act);
        }

        if self.registry.get(&act.vg_name).is_some() {
            return self.registry.route_vg(act);
        }

        match self.local.lookup(&act.vg_name) {
            Some(sysid) => {
                act.flags.local = true;
                if !sysid.is_empty() && !self.sysid.is_empty() && sysid != self.sysid {
                    act.fail(LockError::OtherVg);
                    return Some(act);
                }
                if act.op == Op::Lock && act.rt == ResKind::Vg {
                    self.local.queue(act);
                    None
                } else {
                    // Nothing else applies to a local volume group.
                    act.fail(LockError::LocalVg);
                    Some(act)
                }
            }
            None => self.registry.route_vg(act),
        }
    }

    /// Builds the response for a completed action and hands it to the
    /// owning client. Internal actions and dead clients drop silently.
    fn deliver(&self, act: Action) {
        if act.client_id == 0 {
            return;
        }
        let data = match act.op {
            Op::Info | Op::Dump => build_dump(&self.clients, &self.local, &self.registry),
            _ => String::new(),
        };
        let resp = Response {
            op_result: act.op_result(),
            lm_result: act.lm_rv,
            lock_type: act.lm_type,
            result_flags: self.result_flags(&act),
            vg_lock_args: act.vg_args.clone(),
            lv_lock_args: act.lv_args.clone(),
            data,
        };
        self.clients.deliver(act.client_id, act.id, resp);
    }

    fn result_flags(&self, act: &Action) -> ResultFlags {
        let mut flags = ResultFlags {
            local_ls: act.flags.local,
            inactive_ls: act.flags.inactive_ls,
            add_ls_error: act.flags.add_ls_error,
            ..ResultFlags::default()
        };
        if act.rt == ResKind::Global {
            flags.dup_gl_ls = self.registry.dup_gl();
            if act.result == Some(Err(LockError::NoLockspace)) {
                // Reported for every backend alike.
                flags.no_gl_ls = true;
                flags.no_lockspaces = self.registry.is_empty();
            }
        }
        flags
    }
}
