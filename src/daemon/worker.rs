// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Maintenance worker.
//!
//! A single thread handles the non-locking work: volume-group and
//! logical-volume lock-argument initialization, the debounced local-VG
//! list refresh, start-completion polling, and stop-all requests. Work
//! that cannot complete yet goes on a delayed-retry list; the worker
//! sleeps a short delay while delayed work exists and a long idle period
//! otherwise, and reaps stopped lockspaces on every wake.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::action::{Action, LockError, Op};
use crate::lm::{select_backend, BackendTable};
use crate::lockspace::Registry;
use crate::meta::MetaCache;

use super::dispatch::DispatchQueue;
use super::local::LocalTable;

struct WqInner {
    acts: VecDeque<Action>,
    /// Wake without work, to reap stopped lockspaces.
    kick: bool,
    stop: bool,
}

/// The worker's inbox.
pub(crate) struct WorkQueue {
    inner: Mutex<WqInner>,
    cond: Condvar,
}

pub(crate) struct WorkerWake {
    pub acts: Vec<Action>,
    pub stopped: bool,
}

impl WorkQueue {
    pub(crate) fn new() -> WorkQueue {
        WorkQueue {
            inner: Mutex::new(WqInner {
                acts: VecDeque::new(),
                kick: false,
                stop: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn push(&self, act: Action) {
        let mut inner = self.inner.lock();
        inner.acts.push_back(act);
        self.cond.notify_all();
    }

    /// Wakes the worker without queueing work.
    pub(crate) fn notify(&self) {
        let mut inner = self.inner.lock();
        inner.kick = true;
        self.cond.notify_all();
    }

    pub(crate) fn stop(&self) {
        let mut inner = self.inner.lock();
        inner.stop = true;
        self.cond.notify_all();
    }

    fn wait(&self, timeout: Duration) -> WorkerWake {
        let mut inner = self.inner.lock();
        loop {
            if inner.stop {
                return WorkerWake {
                    acts: inner.acts.drain(..).collect(),
                    stopped: true,
                };
            }
            if !inner.acts.is_empty() || inner.kick {
                inner.kick = false;
                return WorkerWake {
                    acts: inner.acts.drain(..).collect(),
                    stopped: false,
                };
            }
            if self.cond.wait_for(&mut inner, timeout).timed_out() {
                inner.kick = false;
                return WorkerWake {
                    acts: inner.acts.drain(..).collect(),
                    stopped: false,
                };
            }
        }
    }
}

/// The maintenance worker thread.
pub(crate) struct Worker {
    pub queue: Arc<WorkQueue>,
    pub results: Arc<DispatchQueue>,
    pub registry: Arc<Registry>,
    pub local: Arc<LocalTable>,
    pub meta: Arc<dyn MetaCache>,
    pub backends: BackendTable,
    /// Wake interval while delayed work exists.
    pub delay: Duration,
    /// Wake interval when idle.
    pub idle: Duration,
    /// Window inside which repeated local-VG refresh triggers are dropped.
    pub debounce: Duration,
}

impl Worker {
    pub(crate) fn spawn(self) -> thread::JoinHandle<()> {
        thread::Builder::new()
            .name("worker".to_string())
            .spawn(move || self.run())
            .expect("failed to spawn worker thread")
    }

    fn run(self) {
        let mut delayed: Vec<(Instant, Action)> = Vec::new();
        let mut last_refresh: Option<Instant> = None;

        loop {
            let timeout = if delayed.is_empty() {
                self.idle
            } else {
                self.delay
            };
            let wake = self.queue.wait(timeout);

            self.registry.remove_stopped();

            let now = Instant::now();
            let mut batch = wake.acts;
            let mut i = 0;
            while i < delayed.len() {
                if delayed[i].0 <= now {
                    batch.push(delayed.remove(i).1);
                } else {
                    i += 1;
                }
            }

            for mut act in batch {
                match act.op {
                    Op::InitVg => {
                        self.init_vg(&mut act);
                        self.results.push_result(act);
                    }
                    Op::InitLv => {
                        self.init_lv(&mut act);
                        self.results.push_result(act);
                    }
                    Op::UpdateLocal => {
                        let debounced = last_refresh
                            .map(|t| t.elapsed() < self.debounce)
                            .unwrap_or(false);
                        if debounced && !act.flags.force {
                            debug!("local vg refresh debounced");
                        } else {
                            self.local.reconcile(self.meta.vg_list());
                            last_refresh = Some(Instant::now());
                        }
                        act.succeed();
                        self.results.push_result(act);
                    }
                    Op::StartWait => {
                        if self.registry.any_joining() {
                            delayed.push((now + self.delay, act));
                        } else {
                            act.succeed();
                            self.results.push_result(act);
                        }
                    }
                    Op::StopAll => {
                        let stopped = self.registry.stop_all(act.flags.force);
                        if act.flags.wait && self.registry.active_count() > 0 {
                            delayed.push((now + self.delay, act));
                        } else {
                            info!(stopped, "stop_all issued");
                            act.succeed();
                            self.results.push_result(act);
                        }
                    }
                    _ => {
                        warn!(op = %act.op, "unexpected op on worker queue");
                        act.fail(LockError::Invalid);
                        self.results.push_result(act);
                    }
                }
            }

            if wake.stopped {
                return;
            }
        }
    }

    fn init_vg(&self, act: &mut Action) {
        match select_backend(&self.backends, act.lm_type) {
            Ok(lm) => match lm.init_vg(&act.vg_name) {
                Ok(args) => {
                    info!(vg = %act.vg_name, lm = %act.lm_type, "initialized vg lock args");
                    act.vg_args = args;
                    act.succeed();
                }
                Err(e) => {
                    act.lm_rv = e.code();
                    act.fail(e.into());
                }
            },
            Err(e) => act.fail(e),
        }
    }

    fn init_lv(&self, act: &mut Action) {
        match select_backend(&self.backends, act.lm_type) {
            Ok(lm) => match lm.init_lv(&act.vg_name, &act.lv_name, &act.vg_args) {
                Ok(args) => {
                    act.lv_args = args;
                    act.succeed();
                }
                Err(e) => {
                    act.lm_rv = e.code();
                    act.fail(e.into());
                }
            },
            Err(e) => act.fail(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ResKind;
    use std::thread;

    #[test]
    fn test_work_queue_delivers() {
        let queue = Arc::new(WorkQueue::new());
        let pusher = Arc::clone(&queue);
        thread::spawn(move || {
            pusher.push(Action::new(1, 1, Op::StartWait, ResKind::Vg));
        });

        let wake = queue.wait(Duration::from_secs(5));
        assert!(!wake.stopped);
        assert_eq!(wake.acts.len(), 1);
        assert_eq!(wake.acts[0].id, 1);
    }

    #[test]
    fn test_work_queue_kick_wakes_without_work() {
        let queue = Arc::new(WorkQueue::new());
        let kicker = Arc::clone(&queue);
        thread::spawn(move || kicker.notify());

        let wake = queue.wait(Duration::from_secs(5));
        assert!(!wake.stopped);
        assert!(wake.acts.is_empty());
    }

    #[test]
    fn test_work_queue_stop() {
        let queue = WorkQueue::new();
        queue.push(Action::new(1, 1, Op::StopAll, ResKind::Vg));
        queue.stop();

        let wake = queue.wait(Duration::from_millis(10));
        assert!(wake.stopped);
        assert_eq!(wake.acts.len(), 1, "queued work drains on stop");
    }

    #[test]
    fn test_work_queue_times_out_empty() {
        let queue = WorkQueue::new();
        let wake = queue.wait(Duration::from_millis(5));
        assert!(!wake.stopped);
        assert!(wake.acts.is_empty());
    }
}
