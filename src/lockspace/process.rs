// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Resource processing.
//!
//! One processing pass reconciles a resource's queued actions against its
//! currently granted locks, in strict phase order: version updates, explicit
//! unlocks, disconnect cleanup, LV free, global-lock enable/disable,
//! already-satisfied requests, mode conversions, and finally new grants.
//! Each phase consumes its matching actions before the next phase runs.
//!
//! Grants preserve queue order: shared requests are granted up to the first
//! exclusive request, and a single exclusive request is granted only when
//! the resource ends the pass unlocked. A conflicting grant is retried on a
//! later pass, bounded by the action's retry budget, when the backend calls
//! the conflict transient or the resource is global/VG scoped.

use std::cmp;

use tracing::{debug, warn};

use crate::action::{Action, LockError, Mode, Op, ResKind};
use crate::lm::{LmError, LockManager, LsDef, VersionBlock};
use crate::meta::MetaCache;

use super::resource::{LockSt, Resource};
use super::LsCtl;

/// Collaborators a processing pass calls out to.
pub(crate) struct PassDeps<'a> {
    pub ls: &'a LsDef,
    pub lm: &'a dyn LockManager,
    pub meta: &'a dyn MetaCache,
}

/// What one pass produced, applied by the lockspace worker.
#[derive(Debug, Default)]
pub(crate) struct PassOutcome {
    /// Completed actions, ready for result delivery.
    pub done: Vec<Action>,
    /// At least one queued action asked to be retried.
    pub retry: bool,
    /// Tear the resource down: drop manager-side state and the struct.
    pub drop_resource: bool,
    /// The global lock was released with a pending names change; refresh
    /// the local-VG list.
    pub refresh_local: bool,
}

enum GrantFail {
    /// Leave the action queued for a later pass.
    Retry,
    /// Complete the action with this error.
    Fail(LockError),
    /// The global lock was forcibly disabled; tear the resource down.
    Fatal,
}

/// Advances one resource by exactly one processing pass.
pub(crate) fn process_resource(
    deps: &PassDeps<'_>,
    r: &mut Resource,
    ctl: &mut LsCtl,
    close_list: &[Action],
) -> PassOutcome {
    let mut out = PassOutcome::default();

    // Phase 1: stage version updates against an exclusively held resource.
    let updates = take_matching(r, |a| a.op == Op::Update);
    for mut act in updates {
        let res = stage_update(r, &act);
        act.result = Some(res);
        out.done.push(act);
    }

    // Phase 2: explicit unlocks.
    let unlocks = take_matching(r, |a| a.is_unlock());
    for mut act in unlocks {
        let disable_after = act.flags.ex_disable && r.kind == ResKind::Global;
        let idx = if act.flags.persistent {
            r.find_persistent()
        } else {
            r.find_lock(act.client_id)
        };
        match idx {
            Some(idx) => {
                res_unlock(deps, r, ctl, idx, false, &mut out);
                act.succeed();
                out.done.push(act);
                if disable_after {
                    gl_disable(deps, ctl);
                    teardown(r, &mut out);
                    return out;
                }
            }
            None if act.flags.unlock_cancel => {
                let res = cancel_queued(r, act.client_id, &mut out);
                act.result = Some(res);
                out.done.push(act);
            }
            None => {
                act.fail(LockError::NotFound);
                out.done.push(act);
            }
        }
    }

    // Phase 3: implicit unlock+cancel for disconnected clients. The close
    // list is shared across every resource in the lockspace and is not
    // consumed here.
    for close in close_list {
        let canceled = cancel_all_queued(r, close.client_id, &mut out);
        if canceled > 0 {
            debug!(
                ls = %deps.ls.name,
                res = %r.name,
                client = close.client_id,
                canceled,
                "canceled queued actions for closed client"
            );
        }
        if let Some(idx) = r.find_lock(close.client_id) {
            res_unlock(deps, r, ctl, idx, false, &mut out);
        }
    }

    // Phase 4: LV free tears the resource down and ends the pass.
    if let Some(pos) = r.actions.iter().position(|a| a.op == Op::FreeLv) {
        let mut act = r.actions.remove(pos).expect("position is in bounds");
        if r.kind != ResKind::Lv {
            act.fail(LockError::Invalid);
            out.done.push(act);
        } else if !r.locks.is_empty() {
            act.fail(LockError::Busy);
            out.done.push(act);
        } else {
            match deps.lm.free_lv(deps.ls, r.res_def()) {
                Ok(()) => act.succeed(),
                Err(e) => {
                    act.lm_rv = e.code();
                    act.fail(e.into());
                }
            }
            out.done.push(act);
            teardown(r, &mut out);
            return out;
        }
    }

    // Phase 5: sanlock global-lock enable/disable, only while unlocked.
    let toggles = take_matching(r, |a| a.op == Op::EnableGl || a.op == Op::DisableGl);
    for mut act in toggles {
        if deps.ls.lock_type != crate::action::LockType::Sanlock || r.kind != ResKind::Global {
            act.fail(LockError::Invalid);
            out.done.push(act);
        } else if r.mode != Mode::Unlock {
            act.fail(LockError::Busy);
            out.done.push(act);
        } else if act.op == Op::EnableGl {
            match deps.lm.enable_gl(deps.ls, true) {
                Ok(()) => {
                    ctl.sanlock_gl_enabled = true;
                    act.succeed();
                }
                Err(e) => {
                    act.lm_rv = e.code();
                    act.fail(e.into());
                }
            }
            out.done.push(act);
        } else {
            match deps.lm.enable_gl(deps.ls, false) {
                Ok(()) => {
                    ctl.sanlock_gl_enabled = false;
                    act.succeed();
                    out.done.push(act);
                    teardown(r, &mut out);
                    return out;
                }
                Err(e) => {
                    act.lm_rv = e.code();
                    act.fail(e.into());
                    out.done.push(act);
                }
            }
        }
    }

    // Phases 6 and 7: requests already satisfied by a held lock, and mode
    // conversions for clients holding the other mode.
    let mut i = 0;
    while i < r.actions.len() {
        let act = &r.actions[i];
        if act.op != Op::Lock {
            let mut act = r.actions.remove(i).expect("index is in bounds");
            act.fail(LockError::Invalid);
            out.done.push(act);
            continue;
        }
        if act.mode == Mode::Null {
            let mut act = r.actions.remove(i).expect("index is in bounds");
            act.fail(LockError::Invalid);
            out.done.push(act);
            continue;
        }

        match classify_held(r, act) {
            Held::Leave => i += 1,
            Held::Done(res) => {
                let mut act = r.actions.remove(i).expect("index is in bounds");
                act.result = Some(res);
                out.done.push(act);
            }
            Held::Promote(idx) => {
                let mut act = r.actions.remove(i).expect("index is in bounds");
                r.locks[idx].client_id = 0;
                r.locks[idx].persistent = true;
                act.succeed();
                out.done.push(act);
            }
            Held::Convert(idx) => {
                let mut act = r.actions.remove(i).expect("index is in bounds");
                match res_convert(deps, r, idx, &mut act) {
                    Ok(()) => {
                        act.succeed();
                        out.done.push(act);
                    }
                    Err(LockError::NoLockspace) => {
                        act.fail(LockError::NoLockspace);
                        out.done.push(act);
                        teardown(r, &mut out);
                        return out;
                    }
                    Err(e) => {
                        act.fail(e);
                        out.done.push(act);
                    }
                }
            }
        }
    }

    // Phase 8: new grants. Nothing moves while exclusively held.
    if r.mode == Mode::Exclusive {
        return out;
    }

    // Shared requests grant in queue order, up to the first exclusive
    // request; a refused grant stays queued and blocks the pass.
    let mut i = 0;
    while i < r.actions.len() {
        if r.actions[i].mode == Mode::Exclusive {
            break;
        }
        let mut act = r.actions.remove(i).expect("index is in bounds");
        match res_lock(deps, r, ctl, &mut act, &mut out) {
            Ok(()) => {
                act.succeed();
                out.done.push(act);
            }
            Err(GrantFail::Retry) => {
                r.actions.insert(i, act);
                break;
            }
            Err(GrantFail::Fail(e)) => {
                act.fail(e);
                out.done.push(act);
            }
            Err(GrantFail::Fatal) => {
                act.fail(LockError::NoLockspace);
                out.done.push(act);
                teardown(r, &mut out);
                return out;
            }
        }
    }

    // One exclusive grant, only if the resource ended the pass unlocked
    // and the exclusive request is at the head of the queue.
    if r.mode == Mode::Unlock {
        if r.actions.front().map(|a| a.mode) == Some(Mode::Exclusive) {
            let mut act = r.actions.pop_front().expect("front exists");
            match res_lock(deps, r, ctl, &mut act, &mut out) {
                Ok(()) => {
                    act.succeed();
                    out.done.push(act);
                }
                Err(GrantFail::Retry) => r.actions.push_front(act),
                Err(GrantFail::Fail(e)) => {
                    act.fail(e);
                    out.done.push(act);
                }
                Err(GrantFail::Fatal) => {
                    act.fail(LockError::NoLockspace);
                    out.done.push(act);
                    teardown(r, &mut out);
                    return out;
                }
            }
        }
    }

    out
}

/// Removes and returns the actions matching `pred`, preserving order.
fn take_matching(r: &mut Resource, pred: impl Fn(&Action) -> bool) -> Vec<Action> {
    let mut taken = Vec::new();
    let mut i = 0;
    while i < r.actions.len() {
        if pred(&r.actions[i]) {
            taken.push(r.actions.remove(i).expect("index is in bounds"));
        } else {
            i += 1;
        }
    }
    taken
}

fn stage_update(r: &mut Resource, act: &Action) -> Result<(), LockError> {
    if r.mode != Mode::Exclusive {
        return Err(LockError::Invalid);
    }
    let idx = r.find_lock(act.client_id).ok_or(LockError::NotFound)?;

    let staged = if act.flags.next_version {
        Some(r.version + 1)
    } else if act.version > 0 {
        Some(act.version)
    } else {
        None
    };
    let names = act.flags.update_names && r.kind == ResKind::Global;
    if staged.is_none() && !names {
        return Err(LockError::Invalid);
    }
    if let Some(v) = staged {
        r.locks[idx].version = v;
    }
    if names {
        r.locks[idx].update_names = true;
    }
    Ok(())
}

/// Releases the lock at `idx`, persisting versions and notifying the
/// metadata cache as required.
pub(crate) fn res_unlock(
    deps: &PassDeps<'_>,
    r: &mut Resource,
    _ctl: &mut LsCtl,
    idx: usize,
    forced: bool,
    out: &mut PassOutcome,
) {
    let lk = r.locks.remove(idx);
    match lk.mode {
        Mode::Exclusive => {
            if r.kind != ResKind::Lv {
                let new_v = cmp::max(lk.version, r.version + 1);
                r.version = new_v;
                let mut vb = VersionBlock {
                    r_version: new_v,
                    n_version: r.names_version,
                };
                if lk.update_names && r.kind == ResKind::Global {
                    r.names_version += 1;
                    vb.n_version = r.names_version;
                }
                if let Err(e) = deps.lm.unlock(deps.ls, r.res_def(), Some(vb), forced) {
                    warn!(ls = %deps.ls.name, res = %r.name, error = %e, "backend unlock failed");
                }
                match r.kind {
                    ResKind::Vg => deps.meta.invalidate_vg(&deps.ls.vg_name, new_v),
                    ResKind::Global => {
                        deps.meta.invalidate_global();
                        if r.refresh_names {
                            r.refresh_names = false;
                            out.refresh_local = true;
                        }
                    }
                    ResKind::Lv => {}
                }
            } else if let Err(e) = deps.lm.unlock(deps.ls, r.res_def(), None, forced) {
                warn!(ls = %deps.ls.name, res = %r.name, error = %e, "backend unlock failed");
            }
            r.mode = Mode::Unlock;
            r.sh_count = 0;
        }
        Mode::Shared => {
            r.sh_count = r.sh_count.saturating_sub(1);
            if r.sh_count == 0 {
                if let Err(e) = deps.lm.unlock(deps.ls, r.res_def(), None, forced) {
                    warn!(ls = %deps.ls.name, res = %r.name, error = %e, "backend unlock failed");
                }
                r.mode = Mode::Unlock;
            }
        }
        Mode::Unlock | Mode::Null => {}
    }
}

/// Cancels one queued lock request from `client_id`. Returns `Ok` when a
/// request was found and canceled.
fn cancel_queued(r: &mut Resource, client_id: u32, out: &mut PassOutcome) -> Result<(), LockError> {
    let pos = r
        .actions
        .iter()
        .position(|a| a.client_id == client_id && a.op == Op::Lock);
    match pos {
        Some(pos) => {
            let mut act = r.actions.remove(pos).expect("position is in bounds");
            act.fail(LockError::Canceled);
            out.done.push(act);
            Ok(())
        }
        None => Err(LockError::NotFound),
    }
}

/// Cancels every queued action from `client_id`. Returns the count.
fn cancel_all_queued(r: &mut Resource, client_id: u32, out: &mut PassOutcome) -> usize {
    let mut canceled = 0;
    let mut i = 0;
    while i < r.actions.len() {
        if r.actions[i].client_id == client_id {
            let mut act = r.actions.remove(i).expect("index is in bounds");
            act.fail(LockError::Canceled);
            out.done.push(act);
            canceled += 1;
        } else {
            i += 1;
        }
    }
    canceled
}

enum Held {
    /// Not satisfiable by a held lock; leave queued for granting.
    Leave,
    /// Complete immediately with this result.
    Done(Result<(), LockError>),
    /// Promote the client's transient lock at this index to persistent.
    Promote(usize),
    /// Convert the lock at this index to the requested mode.
    Convert(usize),
}

fn classify_held(r: &Resource, act: &Action) -> Held {
    let own = r.find_lock(act.client_id);
    let pers = r.find_persistent();

    if let Some(oi) = own {
        let held = r.locks[oi].mode;
        return if !act.flags.persistent {
            if held == act.mode {
                Held::Done(Err(LockError::Already))
            } else {
                Held::Convert(oi)
            }
        } else if held == act.mode {
            Held::Promote(oi)
        } else {
            Held::Done(Err(LockError::Exists))
        };
    }

    if let Some(pi) = pers {
        let held = r.locks[pi].mode;
        return if act.flags.persistent {
            if held == act.mode {
                Held::Done(Err(LockError::Already))
            } else {
                Held::Convert(pi)
            }
        } else if held == Mode::Exclusive {
            // Compatible with the persistent exclusive lock; no new
            // lock record is created.
            Held::Done(Ok(()))
        } else if act.mode == Mode::Shared {
            Held::Done(Ok(()))
        } else {
            Held::Done(Err(LockError::Exists))
        };
    }

    // A persistent request against another client's exclusive hold is
    // refused rather than converted.
    if act.flags.persistent && r.mode == Mode::Exclusive && r.held_by_other(act.client_id) {
        return Held::Done(Err(LockError::Exists));
    }

    Held::Leave
}

/// Converts the lock at `idx` to the action's mode. Never retries; any
/// failure is final for this attempt. `NoLockspace` signals a forced
/// global-lock disable and the caller tears the resource down.
fn res_convert(
    deps: &PassDeps<'_>,
    r: &mut Resource,
    idx: usize,
    act: &mut Action,
) -> Result<(), LockError> {
    let cur = r.locks[idx].mode;
    let target = act.mode;

    if cur == Mode::Shared && target == Mode::Exclusive {
        if r.sh_count > 1 {
            // Other sharers must leave before the lock can go exclusive.
            return Err(LockError::Again);
        }
        match deps.lm.convert(deps.ls, r.res_def(), Mode::Exclusive, None) {
            Ok(()) => {
                r.locks[idx].mode = Mode::Exclusive;
                r.mode = Mode::Exclusive;
                r.sh_count = 0;
                Ok(())
            }
            Err(e) => {
                act.lm_rv = e.code();
                Err(convert_err(e))
            }
        }
    } else if cur == Mode::Exclusive && target == Mode::Shared {
        // A demotion gives up exclusivity, so global/VG versions are
        // bumped and persisted just like a release.
        let mut vb = None;
        let mut new_names = r.names_version;
        let mut new_v = r.version;
        if r.kind != ResKind::Lv {
            new_v = cmp::max(r.locks[idx].version, r.version + 1);
            if r.locks[idx].update_names && r.kind == ResKind::Global {
                new_names += 1;
            }
            vb = Some(VersionBlock {
                r_version: new_v,
                n_version: new_names,
            });
        }
        match deps.lm.convert(deps.ls, r.res_def(), Mode::Shared, vb) {
            Ok(()) => {
                r.version = new_v;
                r.names_version = new_names;
                match r.kind {
                    ResKind::Vg => deps.meta.invalidate_vg(&deps.ls.vg_name, new_v),
                    ResKind::Global => deps.meta.invalidate_global(),
                    ResKind::Lv => {}
                }
                r.locks[idx].mode = Mode::Shared;
                r.locks[idx].version = 0;
                r.locks[idx].update_names = false;
                r.mode = Mode::Shared;
                r.sh_count = 1;
                Ok(())
            }
            Err(e) => {
                act.lm_rv = e.code();
                Err(convert_err(e))
            }
        }
    } else {
        Err(LockError::Invalid)
    }
}

fn convert_err(e: LmError) -> LockError {
    match e {
        LmError::Again { .. } => LockError::Again,
        LmError::Disabled => LockError::NoLockspace,
        other => other.into(),
    }
}

/// Attempts one new grant for `act`.
fn res_lock(
    deps: &PassDeps<'_>,
    r: &mut Resource,
    ctl: &mut LsCtl,
    act: &mut Action,
    out: &mut PassOutcome,
) -> Result<(), GrantFail> {
    // Additional shared holders share the single backend lock.
    if r.mode == Mode::Shared && act.mode == Mode::Shared {
        r.locks
            .push(LockSt::new(act.client_id, Mode::Shared, act.flags.persistent));
        r.sh_count += 1;
        return Ok(());
    }

    match deps.lm.lock(deps.ls, r.res_def(), act.mode, act.flags.adopt) {
        Ok(grant) => {
            if grant.r_version != r.version {
                r.version = cmp::max(r.version, grant.r_version);
                match r.kind {
                    ResKind::Vg => deps.meta.invalidate_vg(&deps.ls.vg_name, r.version),
                    ResKind::Global => deps.meta.invalidate_global(),
                    ResKind::Lv => {}
                }
            }
            if r.kind == ResKind::Global {
                r.names_version = grant.n_version;
                if grant.n_version != ctl.names_seen {
                    ctl.names_seen = grant.n_version;
                    r.refresh_names = true;
                }
            }
            r.mode = act.mode;
            if act.mode == Mode::Shared {
                r.sh_count = 1;
            }
            r.locks
                .push(LockSt::new(act.client_id, act.mode, act.flags.persistent));
            debug!(
                ls = %deps.ls.name,
                res = %r.name,
                client = act.client_id,
                mode = %act.mode,
                "granted"
            );
            Ok(())
        }
        Err(LmError::Again { transient }) => {
            act.lm_rv = LmError::Again { transient }.code();
            let retryable = transient || r.kind != ResKind::Lv;
            if retryable && act.retries < act.max_retries {
                act.retries += 1;
                out.retry = true;
                Err(GrantFail::Retry)
            } else {
                Err(GrantFail::Fail(LockError::Again))
            }
        }
        Err(LmError::Disabled) => {
            act.lm_rv = LmError::Disabled.code();
            Err(GrantFail::Fatal)
        }
        Err(e) => {
            act.lm_rv = e.code();
            Err(GrantFail::Fail(e.into()))
        }
    }
}

fn gl_disable(deps: &PassDeps<'_>, ctl: &mut LsCtl) {
    if let Err(e) = deps.lm.enable_gl(deps.ls, false) {
        warn!(ls = %deps.ls.name, error = %e, "global lock disable failed");
    }
    ctl.sanlock_gl_enabled = false;
}

/// Cancels everything still queued and marks the resource for removal.
fn teardown(r: &mut Resource, out: &mut PassOutcome) {
    while let Some(mut act) = r.actions.pop_front() {
        act.fail(LockError::Canceled);
        out.done.push(act);
    }
    out.drop_resource = true;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActFlags, LockType};
    use crate::lm::MemoryLockManager;
    use crate::lockspace::resource::{R_NAME_GL, R_NAME_VG};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingMeta {
        vg: Mutex<Vec<(String, u32)>>,
        gl: Mutex<u32>,
    }

    impl MetaCache for RecordingMeta {
        fn invalidate_vg(&self, vg_name: &str, version: u32) {
            self.vg.lock().push((vg_name.to_string(), version));
        }

        fn invalidate_global(&self) {
            *self.gl.lock() += 1;
        }

        fn vg_list(&self) -> Vec<crate::meta::VgDef> {
            Vec::new()
        }
    }

    struct Fixture {
        ls: LsDef,
        lm: MemoryLockManager,
        meta: RecordingMeta,
        ctl: LsCtl,
    }

    impl Fixture {
        fn new() -> Fixture {
            let ls = LsDef {
                name: "lvm_vg0".to_string(),
                vg_name: "vg0".to_string(),
                lock_type: LockType::Sanlock,
                ..LsDef::default()
            };
            let lm = MemoryLockManager::new();
            lm.add_lockspace(&ls, false).unwrap();
            Fixture {
                ls,
                lm,
                meta: RecordingMeta::default(),
                ctl: LsCtl::default(),
            }
        }

        fn pass(&mut self, r: &mut Resource) -> PassOutcome {
            self.pass_with_close(r, &[])
        }

        fn pass_with_close(&mut self, r: &mut Resource, close: &[Action]) -> PassOutcome {
            let deps = PassDeps {
                ls: &self.ls,
                lm: &self.lm,
                meta: &self.meta,
            };
            let out = process_resource(&deps, r, &mut self.ctl, close);
            assert!(r.modes_consistent(), "mode/lock invariant violated");
            out
        }
    }

    fn lock_act(id: u64, client: u32, mode: Mode) -> Action {
        let mut act = Action::new(id, client, Op::Lock, ResKind::Vg);
        act.mode = mode;
        act
    }

    fn unlock_act(id: u64, client: u32) -> Action {
        let mut act = Action::new(id, client, Op::Lock, ResKind::Vg);
        act.mode = Mode::Unlock;
        act
    }

    fn result_of(out: &PassOutcome, id: u64) -> Option<Result<(), LockError>> {
        out.done.iter().find(|a| a.id == id).and_then(|a| a.result)
    }

    #[test]
    fn test_fifo_fairness() {
        let mut fx = Fixture::new();
        let mut r = Resource::new(ResKind::Vg, R_NAME_VG);

        r.actions.push_back(lock_act(1, 1, Mode::Shared));
        r.actions.push_back(lock_act(2, 2, Mode::Shared));
        r.actions.push_back(lock_act(3, 3, Mode::Exclusive));
        r.actions.push_back(lock_act(4, 4, Mode::Shared));

        let out = fx.pass(&mut r);
        assert_eq!(result_of(&out, 1), Some(Ok(())));
        assert_eq!(result_of(&out, 2), Some(Ok(())));
        assert_eq!(result_of(&out, 3), None);
        assert_eq!(result_of(&out, 4), None);
        assert_eq!(r.mode, Mode::Shared);
        assert_eq!(r.sh_count, 2);
        assert_eq!(r.actions.len(), 2);

        // Releasing both sharers lets the exclusive request go first.
        r.actions.push_back(unlock_act(5, 1));
        r.actions.push_back(unlock_act(6, 2));
        let out = fx.pass(&mut r);
        assert_eq!(result_of(&out, 3), Some(Ok(())));
        assert_eq!(result_of(&out, 4), None);
        assert_eq!(r.mode, Mode::Exclusive);

        // And its release lets the blocked shared request through.
        r.actions.push_back(unlock_act(7, 3));
        let out = fx.pass(&mut r);
        assert_eq!(result_of(&out, 4), Some(Ok(())));
        assert_eq!(r.mode, Mode::Shared);
    }

    #[test]
    fn test_already_granted_is_idempotent() {
        let mut fx = Fixture::new();
        let mut r = Resource::new(ResKind::Vg, R_NAME_VG);

        r.actions.push_back(lock_act(1, 1, Mode::Shared));
        fx.pass(&mut r);
        assert_eq!(r.locks.len(), 1);

        r.actions.push_back(lock_act(2, 1, Mode::Shared));
        let out = fx.pass(&mut r);
        assert_eq!(result_of(&out, 2), Some(Err(LockError::Already)));
        assert_eq!(r.locks.len(), 1);
        assert_eq!(r.sh_count, 1);
    }

    #[test]
    fn test_persistent_promotion() {
        let mut fx = Fixture::new();
        let mut r = Resource::new(ResKind::Lv, "lv0");
        r.kind = ResKind::Lv;

        r.actions.push_back(lock_act(1, 1, Mode::Exclusive));
        fx.pass(&mut r);
        assert_eq!(r.locks[0].client_id, 1);

        let mut promote = lock_act(2, 1, Mode::Exclusive);
        promote.flags.persistent = true;
        r.actions.push_back(promote);
        let out = fx.pass(&mut r);
        assert_eq!(result_of(&out, 2), Some(Ok(())));
        assert_eq!(r.locks.len(), 1);
        assert_eq!(r.locks[0].client_id, 0);
        assert!(r.locks[0].persistent);

        // A different client's transient exclusive request is compatible
        // with the persistent exclusive lock and completes immediately.
        r.actions.push_back(lock_act(3, 2, Mode::Exclusive));
        let out = fx.pass(&mut r);
        assert_eq!(result_of(&out, 3), Some(Ok(())));
        assert_eq!(r.locks.len(), 1);
    }

    #[test]
    fn test_persistent_promotion_mode_mismatch() {
        let mut fx = Fixture::new();
        let mut r = Resource::new(ResKind::Lv, "lv0");

        r.actions.push_back(lock_act(1, 1, Mode::Exclusive));
        fx.pass(&mut r);

        let mut promote = lock_act(2, 1, Mode::Shared);
        promote.flags.persistent = true;
        r.actions.push_back(promote);
        let out = fx.pass(&mut r);
        assert_eq!(result_of(&out, 2), Some(Err(LockError::Exists)));
    }

    #[test]
    fn test_transient_against_persistent_shared() {
        let mut fx = Fixture::new();
        let mut r = Resource::new(ResKind::Lv, "lv0");

        let mut act = lock_act(1, 1, Mode::Shared);
        act.flags.persistent = true;
        r.actions.push_back(act);
        fx.pass(&mut r);
        assert!(r.locks[0].persistent);

        // Shared against persistent shared is satisfied in place.
        r.actions.push_back(lock_act(2, 2, Mode::Shared));
        let out = fx.pass(&mut r);
        assert_eq!(result_of(&out, 2), Some(Ok(())));
        assert_eq!(r.locks.len(), 1);

        // Exclusive against persistent shared is a conflict.
        r.actions.push_back(lock_act(3, 2, Mode::Exclusive));
        let out = fx.pass(&mut r);
        assert_eq!(result_of(&out, 3), Some(Err(LockError::Exists)));
    }

    #[test]
    fn test_persistent_request_against_other_exclusive() {
        let mut fx = Fixture::new();
        let mut r = Resource::new(ResKind::Lv, "lv0");

        r.actions.push_back(lock_act(1, 1, Mode::Exclusive));
        fx.pass(&mut r);

        let mut act = lock_act(2, 2, Mode::Exclusive);
        act.flags.persistent = true;
        r.actions.push_back(act);
        let out = fx.pass(&mut r);
        assert_eq!(result_of(&out, 2), Some(Err(LockError::Exists)));
    }

    #[test]
    fn test_convert_shared_to_exclusive_blocked_by_sharers() {
        let mut fx = Fixture::new();
        let mut r = Resource::new(ResKind::Vg, R_NAME_VG);

        r.actions.push_back(lock_act(1, 1, Mode::Shared));
        r.actions.push_back(lock_act(2, 2, Mode::Shared));
        fx.pass(&mut r);
        assert_eq!(r.sh_count, 2);

        r.actions.push_back(lock_act(3, 1, Mode::Exclusive));
        let out = fx.pass(&mut r);
        assert_eq!(result_of(&out, 3), Some(Err(LockError::Again)));
        assert!(!out.retry, "conversion failures are final");
        assert_eq!(r.mode, Mode::Shared);

        // Once the other sharer leaves, the conversion goes through.
        r.actions.push_back(unlock_act(4, 2));
        r.actions.push_back(lock_act(5, 1, Mode::Exclusive));
        let out = fx.pass(&mut r);
        assert_eq!(result_of(&out, 5), Some(Ok(())));
        assert_eq!(r.mode, Mode::Exclusive);
        assert_eq!(r.sh_count, 0);
    }

    #[test]
    fn test_convert_exclusive_to_shared_bumps_version() {
        let mut fx = Fixture::new();
        let mut r = Resource::new(ResKind::Vg, R_NAME_VG);

        r.actions.push_back(lock_act(1, 1, Mode::Exclusive));
        fx.pass(&mut r);

        r.actions.push_back(lock_act(2, 1, Mode::Shared));
        let out = fx.pass(&mut r);
        assert_eq!(result_of(&out, 2), Some(Ok(())));
        assert_eq!(r.mode, Mode::Shared);
        assert_eq!(r.sh_count, 1);
        assert_eq!(r.version, 1);
        assert_eq!(fx.lm.version_block("lvm_vg0", R_NAME_VG).r_version, 1);
        assert_eq!(fx.meta.vg.lock().as_slice(), &[("vg0".to_string(), 1)]);
    }

    #[test]
    fn test_update_stages_version_for_unlock() {
        let mut fx = Fixture::new();
        let mut r = Resource::new(ResKind::Vg, R_NAME_VG);

        r.actions.push_back(lock_act(1, 1, Mode::Exclusive));
        fx.pass(&mut r);

        let mut update = Action::new(2, 1, Op::Update, ResKind::Vg);
        update.version = 17;
        r.actions.push_back(update);
        let out = fx.pass(&mut r);
        assert_eq!(result_of(&out, 2), Some(Ok(())));
        assert_eq!(r.locks[0].version, 17);
        assert_eq!(r.version, 0, "update stages, it does not publish");

        r.actions.push_back(unlock_act(3, 1));
        let out = fx.pass(&mut r);
        assert_eq!(result_of(&out, 3), Some(Ok(())));
        assert_eq!(r.version, 17);
        assert_eq!(fx.lm.version_block("lvm_vg0", R_NAME_VG).r_version, 17);
        assert_eq!(fx.meta.vg.lock().as_slice(), &[("vg0".to_string(), 17)]);
    }

    #[test]
    fn test_update_requires_exclusive() {
        let mut fx = Fixture::new();
        let mut r = Resource::new(ResKind::Vg, R_NAME_VG);

        r.actions.push_back(lock_act(1, 1, Mode::Shared));
        fx.pass(&mut r);

        let mut update = Action::new(2, 1, Op::Update, ResKind::Vg);
        update.version = 5;
        r.actions.push_back(update);
        let out = fx.pass(&mut r);
        assert_eq!(result_of(&out, 2), Some(Err(LockError::Invalid)));

        // Exclusive, but held by someone else.
        r.actions.push_back(unlock_act(3, 1));
        r.actions.push_back(lock_act(4, 2, Mode::Exclusive));
        fx.pass(&mut r);
        let mut update = Action::new(5, 1, Op::Update, ResKind::Vg);
        update.version = 5;
        r.actions.push_back(update);
        let out = fx.pass(&mut r);
        assert_eq!(result_of(&out, 5), Some(Err(LockError::NotFound)));
    }

    #[test]
    fn test_exclusive_unlock_always_bumps_version() {
        let mut fx = Fixture::new();
        let mut r = Resource::new(ResKind::Vg, R_NAME_VG);

        let mut last = 0;
        for round in 0..3u64 {
            r.actions.push_back(lock_act(round * 2 + 1, 1, Mode::Exclusive));
            fx.pass(&mut r);
            r.actions.push_back(unlock_act(round * 2 + 2, 1));
            fx.pass(&mut r);
            assert!(r.version > last, "version must strictly increase");
            last = r.version;
        }
    }

    #[test]
    fn test_unlock_missing_lock() {
        let mut fx = Fixture::new();
        let mut r = Resource::new(ResKind::Vg, R_NAME_VG);

        r.actions.push_back(unlock_act(1, 1));
        let out = fx.pass(&mut r);
        assert_eq!(result_of(&out, 1), Some(Err(LockError::NotFound)));
    }

    #[test]
    fn test_unlock_cancel_falls_back_to_cancel() {
        let mut fx = Fixture::new();
        let mut r = Resource::new(ResKind::Vg, R_NAME_VG);

        // Client 2's request stays queued behind client 1's exclusive.
        r.actions.push_back(lock_act(1, 1, Mode::Exclusive));
        fx.pass(&mut r);
        r.actions.push_back(lock_act(2, 2, Mode::Exclusive));
        fx.pass(&mut r);
        assert_eq!(r.actions.len(), 1);

        let mut cancel = unlock_act(3, 2);
        cancel.flags.unlock_cancel = true;
        r.actions.push_back(cancel);
        let out = fx.pass(&mut r);
        assert_eq!(result_of(&out, 3), Some(Ok(())));
        assert_eq!(result_of(&out, 2), Some(Err(LockError::Canceled)));
        assert!(r.actions.is_empty());
    }

    #[test]
    fn test_retry_bound_on_vg_resource() {
        let mut fx = Fixture::new();
        let mut r = Resource::new(ResKind::Vg, R_NAME_VG);
        fx.lm.hold_other("lvm_vg0", R_NAME_VG, Mode::Exclusive);

        let mut act = lock_act(1, 1, Mode::Shared);
        act.max_retries = 2;
        r.actions.push_back(act);

        let mut passes = 0;
        let result = loop {
            let out = fx.pass(&mut r);
            passes += 1;
            if let Some(res) = result_of(&out, 1) {
                break res;
            }
            assert!(out.retry);
            assert!(passes < 10, "no progress");
        };
        assert_eq!(result, Err(LockError::Again));
        // max_retries + 1 attempts against the backend.
        assert_eq!(fx.lm.lock_attempts("lvm_vg0", R_NAME_VG), 3);
        assert!(r.actions.is_empty());
    }

    #[test]
    fn test_lv_conflict_not_retried() {
        let mut fx = Fixture::new();
        let mut r = Resource::new(ResKind::Lv, "lv0");
        fx.lm.hold_other("lvm_vg0", "lv0", Mode::Exclusive);

        r.actions.push_back(lock_act(1, 1, Mode::Shared));
        let out = fx.pass(&mut r);
        assert_eq!(result_of(&out, 1), Some(Err(LockError::Again)));
        assert!(!out.retry);
        assert_eq!(fx.lm.lock_attempts("lvm_vg0", "lv0"), 1);
    }

    #[test]
    fn test_lv_conflict_with_transient_hint_retries() {
        let mut fx = Fixture::new();
        let mut r = Resource::new(ResKind::Lv, "lv0");
        fx.lm.hold_other("lvm_vg0", "lv0", Mode::Exclusive);
        fx.lm.set_transient_hint("lvm_vg0", "lv0", true);

        r.actions.push_back(lock_act(1, 1, Mode::Shared));
        let out = fx.pass(&mut r);
        assert_eq!(result_of(&out, 1), None);
        assert!(out.retry);
        assert_eq!(r.actions.len(), 1);
        assert_eq!(r.actions[0].retries, 1);
    }

    #[test]
    fn test_forced_disable_tears_resource_down() {
        let mut fx = Fixture::new();
        let mut r = Resource::new(ResKind::Global, R_NAME_GL);
        fx.lm.force_gl_disable("lvm_vg0", R_NAME_GL);

        r.actions.push_back(lock_act(1, 1, Mode::Exclusive));
        r.actions.push_back(lock_act(2, 2, Mode::Shared));
        let out = fx.pass(&mut r);
        assert_eq!(result_of(&out, 1), Some(Err(LockError::NoLockspace)));
        assert_eq!(result_of(&out, 2), Some(Err(LockError::Canceled)));
        assert!(out.drop_resource);
        let failed = out.done.iter().find(|a| a.id == 1).unwrap();
        assert_eq!(failed.lm_rv, -49);
    }

    #[test]
    fn test_free_lv() {
        let mut fx = Fixture::new();
        let mut r = Resource::new(ResKind::Lv, "lv0");

        // Freeing a held LV is refused.
        r.actions.push_back(lock_act(1, 1, Mode::Exclusive));
        fx.pass(&mut r);
        r.actions.push_back(Action::new(2, 1, Op::FreeLv, ResKind::Lv));
        let out = fx.pass(&mut r);
        assert_eq!(result_of(&out, 2), Some(Err(LockError::Busy)));

        r.actions.push_back(unlock_act(3, 1));
        fx.pass(&mut r);
        r.actions.push_back(Action::new(4, 1, Op::FreeLv, ResKind::Lv));
        let out = fx.pass(&mut r);
        assert_eq!(result_of(&out, 4), Some(Ok(())));
        assert!(out.drop_resource);
    }

    #[test]
    fn test_enable_disable_gl() {
        let mut fx = Fixture::new();
        let mut r = Resource::new(ResKind::Global, R_NAME_GL);

        r.actions.push_back(Action::new(1, 1, Op::EnableGl, ResKind::Global));
        let out = fx.pass(&mut r);
        assert_eq!(result_of(&out, 1), Some(Ok(())));
        assert!(fx.ctl.sanlock_gl_enabled);
        assert!(!out.drop_resource);

        r.actions.push_back(Action::new(2, 1, Op::DisableGl, ResKind::Global));
        let out = fx.pass(&mut r);
        assert_eq!(result_of(&out, 2), Some(Ok(())));
        assert!(!fx.ctl.sanlock_gl_enabled);
        assert!(out.drop_resource);
    }

    #[test]
    fn test_disable_gl_refused_while_locked() {
        let mut fx = Fixture::new();
        let mut r = Resource::new(ResKind::Global, R_NAME_GL);

        r.actions.push_back(lock_act(1, 1, Mode::Shared));
        fx.pass(&mut r);

        r.actions.push_back(Action::new(2, 1, Op::DisableGl, ResKind::Global));
        let out = fx.pass(&mut r);
        assert_eq!(result_of(&out, 2), Some(Err(LockError::Busy)));
    }

    #[test]
    fn test_close_cleanup() {
        let mut fx = Fixture::new();
        let mut r = Resource::new(ResKind::Vg, R_NAME_VG);

        r.actions.push_back(lock_act(1, 1, Mode::Shared));
        r.actions.push_back(lock_act(2, 2, Mode::Shared));
        fx.pass(&mut r);
        // A queued request from client 1, blocked behind the sharers.
        r.actions.push_back(lock_act(3, 1, Mode::Exclusive));

        let close = Action::new(4, 1, Op::Close, ResKind::Vg);
        let out = fx.pass_with_close(&mut r, std::slice::from_ref(&close));
        assert_eq!(result_of(&out, 3), Some(Err(LockError::Canceled)));
        assert!(r.find_lock(1).is_none());
        assert!(r.actions.iter().all(|a| a.client_id != 1));
        assert_eq!(r.mode, Mode::Shared);
        assert_eq!(r.sh_count, 1);
    }

    #[test]
    fn test_close_spares_persistent_locks() {
        let mut fx = Fixture::new();
        let mut r = Resource::new(ResKind::Lv, "lv0");

        let mut act = lock_act(1, 1, Mode::Exclusive);
        act.flags.persistent = true;
        r.actions.push_back(act);
        fx.pass(&mut r);

        let close = Action::new(2, 1, Op::Close, ResKind::Lv);
        fx.pass_with_close(&mut r, std::slice::from_ref(&close));
        assert_eq!(r.locks.len(), 1);
        assert!(r.locks[0].persistent);
    }

    #[test]
    fn test_names_version_change_arms_refresh() {
        let mut fx = Fixture::new();
        let mut r = Resource::new(ResKind::Global, R_NAME_GL);

        // Another host advanced the names version to 5.
        fx.lm.force_names_version("lvm_vg0", R_NAME_GL, 5);

        r.actions.push_back(lock_act(1, 1, Mode::Exclusive));
        let out = fx.pass(&mut r);
        assert_eq!(result_of(&out, 1), Some(Ok(())));
        assert!(r.refresh_names);
        assert!(!out.refresh_local);
        assert_eq!(fx.ctl.names_seen, 5);

        r.actions.push_back(unlock_act(2, 1));
        let out = fx.pass(&mut r);
        assert!(out.refresh_local);
        assert!(!r.refresh_names);
    }

    #[test]
    fn test_update_names_staging() {
        let mut fx = Fixture::new();
        let mut r = Resource::new(ResKind::Global, R_NAME_GL);

        r.actions.push_back(lock_act(1, 1, Mode::Exclusive));
        fx.pass(&mut r);

        let mut update = Action::new(2, 1, Op::Update, ResKind::Global);
        update.flags.update_names = true;
        r.actions.push_back(update);
        let out = fx.pass(&mut r);
        assert_eq!(result_of(&out, 2), Some(Ok(())));

        r.actions.push_back(unlock_act(3, 1));
        fx.pass(&mut r);
        assert_eq!(r.names_version, 1);
        assert_eq!(fx.lm.version_block("lvm_vg0", R_NAME_GL).n_version, 1);
    }
}
