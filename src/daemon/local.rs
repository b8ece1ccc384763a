// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Local-VG fast path.
//!
//! Volume groups with no distributed lock type do not get a lockspace
//! thread; they share one table with a synthetic resource per volume
//! group and a single worker that grants queued requests with a
//! lightweight one-pass algorithm. No lock-manager calls happen here.
//!
//! In local-only configurations the global lock is served from the same
//! table through a synthetic global record.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::action::{Action, LockError, Mode, Op, ResKind};
use crate::lockspace::{LockSt, Resource, R_NAME_GL};
use crate::meta::VgDef;

use super::dispatch::DispatchQueue;

struct LocalVg {
    uuid: String,
    sysid: String,
    res: Resource,
}

struct LocalInner {
    vgs: HashMap<String, LocalVg>,
    /// Synthetic global-lock record for local-only configurations.
    gl: Resource,
    queue: VecDeque<Action>,
    stop: bool,
}

/// Table of local volume groups and their fast-path worker state.
pub(crate) struct LocalTable {
    inner: Mutex<LocalInner>,
    cond: Condvar,
    results: Arc<DispatchQueue>,
}

impl LocalTable {
    pub(crate) fn new(results: Arc<DispatchQueue>) -> LocalTable {
        LocalTable {
            inner: Mutex::new(LocalInner {
                vgs: HashMap::new(),
                gl: Resource::new(ResKind::Global, R_NAME_GL),
                queue: VecDeque::new(),
                stop: false,
            }),
            cond: Condvar::new(),
            results,
        }
    }

    pub(crate) fn spawn(self: &Arc<LocalTable>) -> thread::JoinHandle<()> {
        let table = Arc::clone(self);
        thread::Builder::new()
            .name("local-vg".to_string())
            .spawn(move || table.run())
            .expect("failed to spawn local-vg thread")
    }

    /// Adds a local volume-group record, synchronously.
    pub(crate) fn add_vg(&self, act: &Action) -> Result<(), LockError> {
        let mut inner = self.inner.lock();
        if inner.vgs.contains_key(&act.vg_name) {
            return Err(LockError::Exists);
        }
        info!(vg = %act.vg_name, "adding local vg");
        inner.vgs.insert(
            act.vg_name.clone(),
            LocalVg {
                uuid: act.vg_uuid.clone(),
                sysid: act.vg_sysid.clone(),
                res: Resource::new(ResKind::Vg, &act.vg_name),
            },
        );
        Ok(())
    }

    /// Removes a local volume-group record, synchronously. Queued
    /// requests against it are canceled.
    pub(crate) fn rem_vg(&self, vg_name: &str) -> Result<(), LockError> {
        let mut done = Vec::new();
        let removed = {
            let mut inner = self.inner.lock();
            match inner.vgs.remove(vg_name) {
                Some(mut vg) => {
                    while let Some(mut act) = vg.res.actions.pop_front() {
                        act.fail(LockError::Canceled);
                        done.push(act);
                    }
                    true
                }
                None => false,
            }
        };
        if !done.is_empty() {
            self.results.push_results(done);
        }
        if removed {
            info!(vg = %vg_name, "removed local vg");
            Ok(())
        } else {
            Err(LockError::NotFound)
        }
    }

    /// Looks a local volume group up, returning its system id.
    pub(crate) fn lookup(&self, vg_name: &str) -> Option<String> {
        let inner = self.inner.lock();
        inner.vgs.get(vg_name).map(|vg| vg.sysid.clone())
    }

    /// Queues a lock action for the fast-path worker.
    pub(crate) fn queue(&self, act: Action) {
        let mut inner = self.inner.lock();
        inner.queue.push_back(act);
        self.cond.notify_all();
    }

    /// Broadcasts a disconnect cleanup into the fast path.
    pub(crate) fn close_client(&self, act: Action) {
        debug_assert_eq!(act.op, Op::Close);
        self.queue(act);
    }

    /// Reconciles the table against the metadata layer's volume-group
    /// list: unknown local VGs are added, vanished ones removed.
    pub(crate) fn reconcile(&self, list: Vec<VgDef>) {
        let mut done = Vec::new();
        {
            let mut inner = self.inner.lock();
            let keep: Vec<&VgDef> = list
                .iter()
                .filter(|vg| vg.lock_type == crate::action::LockType::None)
                .collect();
            for vg in &keep {
                if !inner.vgs.contains_key(&vg.name) {
                    debug!(vg = %vg.name, "local vg discovered");
                    inner.vgs.insert(
                        vg.name.clone(),
                        LocalVg {
                            uuid: vg.uuid.clone(),
                            sysid: vg.sysid.clone(),
                            res: Resource::new(ResKind::Vg, &vg.name),
                        },
                    );
                }
            }
            let gone: Vec<String> = inner
                .vgs
                .keys()
                .filter(|name| !keep.iter().any(|vg| &vg.name == *name))
                .cloned()
                .collect();
            for name in gone {
                debug!(vg = %name, "local vg gone");
                if let Some(mut vg) = inner.vgs.remove(&name) {
                    while let Some(mut act) = vg.res.actions.pop_front() {
                        act.fail(LockError::Canceled);
                        done.push(act);
                    }
                }
            }
        }
        if !done.is_empty() {
            self.results.push_results(done);
        }
    }

    pub(crate) fn stop(&self) {
        let mut inner = self.inner.lock();
        inner.stop = true;
        self.cond.notify_all();
    }

    fn run(&self) {
        loop {
            let mut done = Vec::new();
            {
                let mut inner = self.inner.lock();
                while inner.queue.is_empty() && !inner.stop {
                    self.cond.wait(&mut inner);
                }
                if inner.stop {
                    return;
                }

                let batch: Vec<Action> = inner.queue.drain(..).collect();
                let mut touched: Vec<String> = Vec::new();
                let mut gl_touched = false;
                for mut act in batch {
                    if act.op == Op::Close {
                        purge_client(&mut inner, act.client_id, &mut done);
                        continue;
                    }
                    if act.rt == ResKind::Global {
                        inner.gl.actions.push_back(act);
                        gl_touched = true;
                        continue;
                    }
                    let name = act.vg_name.clone();
                    match inner.vgs.get_mut(&name) {
                        Some(vg) => {
                            vg.res.actions.push_back(act);
                            if !touched.contains(&name) {
                                touched.push(name);
                            }
                        }
                        None => {
                            act.fail(LockError::NotFound);
                            done.push(act);
                        }
                    }
                }

                for name in touched {
                    if let Some(vg) = inner.vgs.get_mut(&name) {
                        process_local(&mut vg.res, &mut done);
                    }
                }
                if gl_touched {
                    process_local(&mut inner.gl, &mut done);
                }
            }
            if !done.is_empty() {
                self.results.push_results(done);
            }
        }
    }

    /// Appends the local table to a diagnostic dump.
    pub(crate) fn dump_into(&self, out: &mut String) {
        use std::fmt::Write;

        let inner = self.inner.lock();
        let mut names: Vec<&String> = inner.vgs.keys().collect();
        names.sort();
        for name in names {
            let vg = &inner.vgs[name];
            let _ = writeln!(
                out,
                "info=local_vg name={} uuid={} sysid={}",
                name, vg.uuid, vg.sysid,
            );
            for lk in &vg.res.locks {
                let _ = writeln!(
                    out,
                    "info=local_lk vg={} client={} mode={} persistent={}",
                    name, lk.client_id, lk.mode, lk.persistent as u8,
                );
            }
        }
        for lk in &inner.gl.locks {
            let _ = writeln!(
                out,
                "info=local_lk vg=global client={} mode={}",
                lk.client_id, lk.mode,
            );
        }
    }
}

fn purge_client(inner: &mut LocalInner, client_id: u32, done: &mut Vec<Action>) {
    let mut purge = |res: &mut Resource| {
        res.locks
            .retain(|lk| lk.persistent || lk.client_id != client_id);
        let mut i = 0;
        while i < res.actions.len() {
            if res.actions[i].client_id == client_id {
                let mut act = res.actions.remove(i).expect("index is in bounds");
                act.fail(LockError::Canceled);
                done.push(act);
            } else {
                i += 1;
            }
        }
        refresh_mode(res);
    };
    for vg in inner.vgs.values_mut() {
        purge(&mut vg.res);
    }
    purge(&mut inner.gl);
}

fn refresh_mode(res: &mut Resource) {
    res.mode = if res.locks.is_empty() {
        Mode::Unlock
    } else if res.locks.iter().any(|lk| lk.mode == Mode::Exclusive) {
        Mode::Exclusive
    } else {
        Mode::Shared
    };
}

/// One pass over a local record: unlocks release immediately; an
/// exclusive holder blocks everything; shared requests grant in order;
/// one exclusive grants only when nothing is held.
fn process_local(res: &mut Resource, done: &mut Vec<Action>) {
    // Unlocks first.
    let mut i = 0;
    while i < res.actions.len() {
        if res.actions[i].is_unlock() {
            let mut act = res.actions.remove(i).expect("index is in bounds");
            match res.find_lock(act.client_id) {
                Some(idx) => {
                    res.locks.remove(idx);
                    act.succeed();
                }
                None => act.fail(LockError::NotFound),
            }
            done.push(act);
        } else {
            i += 1;
        }
    }
    refresh_mode(res);

    // Grants, in queue order.
    while let Some(front) = res.actions.front() {
        if res.mode == Mode::Exclusive {
            break;
        }
        match front.mode {
            Mode::Shared => {
                let mut act = res.actions.pop_front().expect("front exists");
                res.locks
                    .push(LockSt::new(act.client_id, Mode::Shared, act.flags.persistent));
                res.mode = Mode::Shared;
                act.succeed();
                done.push(act);
            }
            Mode::Exclusive => {
                if res.locks.is_empty() {
                    let mut act = res.actions.pop_front().expect("front exists");
                    res.locks.push(LockSt::new(
                        act.client_id,
                        Mode::Exclusive,
                        act.flags.persistent,
                    ));
                    res.mode = Mode::Exclusive;
                    act.succeed();
                    done.push(act);
                } else {
                    break;
                }
            }
            Mode::Unlock | Mode::Null => {
                let mut act = res.actions.pop_front().expect("front exists");
                act.fail(LockError::Invalid);
                done.push(act);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_act(id: u64, client: u32, vg: &str, mode: Mode) -> Action {
        let mut act = Action::new(id, client, Op::Lock, ResKind::Vg);
        act.vg_name = vg.to_string();
        act.mode = mode;
        act
    }

    fn result_of(done: &[Action], id: u64) -> Option<Result<(), LockError>> {
        done.iter().find(|a| a.id == id).and_then(|a| a.result)
    }

    #[test]
    fn test_local_grant_order() {
        let mut res = Resource::new(ResKind::Vg, "vg0");
        let mut done = Vec::new();

        res.actions.push_back(lock_act(1, 1, "vg0", Mode::Shared));
        res.actions.push_back(lock_act(2, 2, "vg0", Mode::Shared));
        res.actions.push_back(lock_act(3, 3, "vg0", Mode::Exclusive));
        process_local(&mut res, &mut done);

        assert_eq!(result_of(&done, 1), Some(Ok(())));
        assert_eq!(result_of(&done, 2), Some(Ok(())));
        assert_eq!(result_of(&done, 3), None, "exclusive waits for sharers");
        assert_eq!(res.mode, Mode::Shared);

        // Sharers leave; the exclusive request grants on the next pass.
        res.actions.push_front(lock_act(5, 2, "vg0", Mode::Unlock));
        res.actions.push_front(lock_act(4, 1, "vg0", Mode::Unlock));
        let mut done = Vec::new();
        process_local(&mut res, &mut done);
        assert_eq!(result_of(&done, 3), Some(Ok(())));
        assert_eq!(res.mode, Mode::Exclusive);
    }

    #[test]
    fn test_exclusive_holder_blocks_everything() {
        let mut res = Resource::new(ResKind::Vg, "vg0");
        let mut done = Vec::new();

        res.actions.push_back(lock_act(1, 1, "vg0", Mode::Exclusive));
        res.actions.push_back(lock_act(2, 2, "vg0", Mode::Shared));
        process_local(&mut res, &mut done);

        assert_eq!(result_of(&done, 1), Some(Ok(())));
        assert_eq!(result_of(&done, 2), None);
        assert_eq!(res.actions.len(), 1);
    }

    #[test]
    fn test_unlock_without_lock() {
        let mut res = Resource::new(ResKind::Vg, "vg0");
        let mut done = Vec::new();

        res.actions.push_back(lock_act(1, 1, "vg0", Mode::Unlock));
        process_local(&mut res, &mut done);
        assert_eq!(result_of(&done, 1), Some(Err(LockError::NotFound)));
    }

    #[test]
    fn test_purge_client() {
        let mut inner = LocalInner {
            vgs: HashMap::new(),
            gl: Resource::new(ResKind::Global, R_NAME_GL),
            queue: VecDeque::new(),
            stop: false,
        };
        let mut res = Resource::new(ResKind::Vg, "vg0");
        res.locks.push(LockSt::new(1, Mode::Shared, false));
        res.locks.push(LockSt::new(2, Mode::Shared, false));
        res.actions.push_back(lock_act(9, 1, "vg0", Mode::Exclusive));
        refresh_mode(&mut res);
        inner.vgs.insert(
            "vg0".to_string(),
            LocalVg {
                uuid: String::new(),
                sysid: String::new(),
                res,
            },
        );

        let mut done = Vec::new();
        purge_client(&mut inner, 1, &mut done);
        let vg = &inner.vgs["vg0"];
        assert_eq!(vg.res.locks.len(), 1);
        assert_eq!(vg.res.locks[0].client_id, 2);
        assert!(vg.res.actions.is_empty());
        assert_eq!(result_of(&done, 9), Some(Err(LockError::Canceled)));
    }
}
