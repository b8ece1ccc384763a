// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Connected-client table and result delivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::action::Response;

struct ClientEntry {
    pid: u32,
    name: String,
    dead: bool,
    results: Vec<(u64, Response)>,
}

/// Table of connected clients.
///
/// Completed actions are matched back to their client by id; results for a
/// client that has gone away are dropped silently.
pub(crate) struct ClientTable {
    inner: Mutex<HashMap<u32, ClientEntry>>,
    cond: Condvar,
    next_id: AtomicU32,
}

impl ClientTable {
    pub(crate) fn new() -> ClientTable {
        ClientTable {
            inner: Mutex::new(HashMap::new()),
            cond: Condvar::new(),
            // Client 0 is reserved for internally synthesized actions.
            next_id: AtomicU32::new(1),
        }
    }

    pub(crate) fn add(&self, name: &str, pid: u32) -> u32 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        inner.insert(
            id,
            ClientEntry {
                pid,
                name: name.to_string(),
                dead: false,
                results: Vec::new(),
            },
        );
        id
    }

    /// Marks a client dead and drops its undelivered results. Returns
    /// false for an unknown id.
    pub(crate) fn mark_dead(&self, id: u32) -> bool {
        let mut inner = self.inner.lock();
        match inner.get_mut(&id) {
            Some(entry) => {
                entry.dead = true;
                entry.results.clear();
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove(&self, id: u32) {
        let mut inner = self.inner.lock();
        inner.remove(&id);
        self.cond.notify_all();
    }

    /// Delivers a response; dropped silently for dead or unknown clients.
    pub(crate) fn deliver(&self, client_id: u32, act_id: u64, resp: Response) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.get_mut(&client_id) {
            if !entry.dead {
                entry.results.push((act_id, resp));
                self.cond.notify_all();
            }
        }
    }

    /// Blocks until the result for `act_id` arrives or `timeout` passes.
    pub(crate) fn wait_result(
        &self,
        client_id: u32,
        act_id: u64,
        timeout: Duration,
    ) -> Option<Response> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            match inner.get_mut(&client_id) {
                Some(entry) => {
                    if let Some(pos) = entry.results.iter().position(|(id, _)| *id == act_id) {
                        return Some(entry.results.remove(pos).1);
                    }
                    if entry.dead {
                        return None;
                    }
                }
                None => return None,
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            if self.cond.wait_until(&mut inner, deadline).timed_out() {
                // Check once more before giving up.
                continue;
            }
        }
    }

    /// Appends every client's state to a diagnostic dump.
    pub(crate) fn dump_into(&self, out: &mut String) {
        use std::fmt::Write;

        let inner = self.inner.lock();
        let mut ids: Vec<&u32> = inner.keys().collect();
        ids.sort();
        for id in ids {
            let entry = &inner[id];
            let _ = writeln!(
                out,
                "info=client id={} pid={} name={} dead={} queued_results={}",
                id,
                entry.pid,
                entry.name,
                entry.dead as u8,
                entry.results.len(),
            );
        }
    }
}
