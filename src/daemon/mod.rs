// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Daemon state and public surface.
//!
//! A [`Daemon`] owns every process-scoped table: the client table, the
//! lockspace registry, the local-VG fast path, and the maintenance
//! worker. Nothing is file-scope static, so tests instantiate as many
//! independent daemons as they need.
//!
//! # Threads
//!
//! One dispatcher thread routes submissions and delivers results, one
//! maintenance worker handles non-locking work, one fast-path thread
//! serves local volume groups, and each active lockspace runs its own
//! worker. All of them coordinate through mutex-guarded queues and
//! condition variables.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vglockd::{Daemon, DaemonConfig, LockType, MemoryLockManager, Request};
//!
//! let config = DaemonConfig::default()
//!     .with_backend(LockType::Sanlock, Arc::new(MemoryLockManager::new()));
//! let daemon = Daemon::start(config);
//!
//! let client = daemon.add_client("lvm", 1234);
//! let _ = daemon.request(
//!     client,
//!     &Request::new("start_vg").with_vg("vg0").with_lock_type("sanlock"),
//! );
//! let resp = daemon
//!     .request(client, &Request::new("lock_vg").with_vg("vg0").with_mode("sh"))
//!     .expect("result");
//! assert_eq!(resp.op_result, 0);
//! daemon.shutdown();
//! ```

pub(crate) mod client;
pub(crate) mod dispatch;
mod dump;
pub(crate) mod local;
pub(crate) mod worker;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::action::{Action, LockError, LockType, Op, Request, ResKind, Response};
use crate::lm::{BackendTable, LockManager};
use crate::lockspace::{LsEnv, Registry};
use crate::meta::{MetaCache, NullMetaCache};

use client::ClientTable;
use dispatch::{DispatchQueue, Dispatcher};
use local::LocalTable;
use worker::{WorkQueue, Worker};

/// How long a synchronous request waits for its result.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Daemon configuration.
#[derive(Clone)]
pub struct DaemonConfig {
    /// This host's id within sanlock lockspaces.
    pub host_id: u64,
    /// This host's system id, used to refuse foreign local VGs.
    pub sysid: String,
    /// Serve the global lock from the local fast path; for hosts with no
    /// distributed volume groups at all.
    pub local_only_gl: bool,
    /// Delay between retry passes in a lockspace worker.
    pub retry_interval: Duration,
    /// Maintenance worker wake interval while delayed work exists.
    pub worker_delay: Duration,
    /// Maintenance worker wake interval when idle.
    pub worker_idle: Duration,
    /// Window inside which repeated local-VG refreshes are dropped.
    pub update_local_debounce: Duration,
    /// Retry budget for lock requests that do not specify one.
    pub default_max_retries: u32,
    /// Lock-manager backends by type.
    pub backends: BackendTable,
    /// Metadata-cache collaborator.
    pub meta: Arc<dyn MetaCache>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            host_id: 1,
            sysid: String::new(),
            local_only_gl: false,
            retry_interval: Duration::from_millis(100),
            worker_delay: Duration::from_secs(1),
            worker_idle: Duration::from_secs(60),
            update_local_debounce: Duration::from_secs(2),
            default_max_retries: crate::action::DEFAULT_MAX_RETRIES,
            backends: BackendTable::new(),
            meta: Arc::new(NullMetaCache),
        }
    }
}

impl DaemonConfig {
    pub fn with_host_id(mut self, host_id: u64) -> DaemonConfig {
        self.host_id = host_id;
        self
    }

    pub fn with_sysid(mut self, sysid: &str) -> DaemonConfig {
        self.sysid = sysid.to_string();
        self
    }

    pub fn with_local_only_gl(mut self, local_only_gl: bool) -> DaemonConfig {
        self.local_only_gl = local_only_gl;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> DaemonConfig {
        self.retry_interval = interval;
        self
    }

    pub fn with_worker_delay(mut self, delay: Duration) -> DaemonConfig {
        self.worker_delay = delay;
        self
    }

    pub fn with_worker_idle(mut self, idle: Duration) -> DaemonConfig {
        self.worker_idle = idle;
        self
    }

    pub fn with_update_local_debounce(mut self, debounce: Duration) -> DaemonConfig {
        self.update_local_debounce = debounce;
        self
    }

    pub fn with_default_max_retries(mut self, max_retries: u32) -> DaemonConfig {
        self.default_max_retries = max_retries;
        self
    }

    /// Registers a lock-manager backend for a type.
    pub fn with_backend(mut self, lock_type: LockType, lm: Arc<dyn LockManager>) -> DaemonConfig {
        self.backends.insert(lock_type, lm);
        self
    }

    pub fn with_meta(mut self, meta: Arc<dyn MetaCache>) -> DaemonConfig {
        self.meta = meta;
        self
    }
}

/// The running daemon.
pub struct Daemon {
    clients: Arc<ClientTable>,
    queue: Arc<DispatchQueue>,
    registry: Arc<Registry>,
    local: Arc<LocalTable>,
    work: Arc<WorkQueue>,
    next_id: Arc<AtomicU64>,
    default_max_retries: u32,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Daemon {
    /// Builds the daemon state and spawns its threads.
    pub fn start(config: DaemonConfig) -> Daemon {
        let queue = Arc::new(DispatchQueue::new());
        let work = Arc::new(WorkQueue::new());
        let next_id = Arc::new(AtomicU64::new(1));
        let clients = Arc::new(ClientTable::new());
        let local = Arc::new(LocalTable::new(Arc::clone(&queue)));

        let env = Arc::new(LsEnv {
            meta: Arc::clone(&config.meta),
            results: Arc::clone(&queue),
            work: Arc::clone(&work),
            next_id: Arc::clone(&next_id),
            retry_interval: config.retry_interval,
        });
        let registry = Arc::new(Registry::new(
            config.host_id,
            config.backends.clone(),
            env,
        ));

        let mut threads = Vec::new();
        threads.push(local.spawn());
        threads.push(
            Worker {
                queue: Arc::clone(&work),
                results: Arc::clone(&queue),
                registry: Arc::clone(&registry),
                local: Arc::clone(&local),
                meta: Arc::clone(&config.meta),
                backends: config.backends.clone(),
                delay: config.worker_delay,
                idle: config.worker_idle,
                debounce: config.update_local_debounce,
            }
            .spawn(),
        );
        threads.push(
            Dispatcher {
                queue: Arc::clone(&queue),
                registry: Arc::clone(&registry),
                local: Arc::clone(&local),
                clients: Arc::clone(&clients),
                work: Arc::clone(&work),
                sysid: config.sysid.clone(),
                local_only_gl: config.local_only_gl,
            }
            .spawn(),
        );
        info!(host_id = config.host_id, "daemon started");

        Daemon {
            clients,
            queue,
            registry,
            local,
            work,
            next_id,
            default_max_retries: config.default_max_retries,
            threads: Mutex::new(threads),
        }
    }

    /// Registers a connected client; the returned id owns its requests.
    pub fn add_client(&self, name: &str, pid: u32) -> u32 {
        let id = self.clients.add(name, pid);
        info!(client = id, name, pid, "client connected");
        id
    }

    /// Disconnects a client: its undelivered results are dropped and
    /// synthetic close actions sweep its locks out of every lockspace
    /// and the local fast path.
    pub fn close_client(&self, client_id: u32) {
        if !self.clients.mark_dead(client_id) {
            return;
        }
        info!(client = client_id, "client disconnected");
        self.registry.close_broadcast(client_id);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.local
            .close_client(Action::new(id, client_id, Op::Close, ResKind::Vg));
        self.clients.remove(client_id);
    }

    /// Submits a request; the result is delivered asynchronously under
    /// the returned action id.
    pub fn submit(&self, client_id: u32, req: &Request) -> Result<u64, LockError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut act = Action::from_request(id, client_id, req)?;
        if req.max_retries.is_none() {
            act.max_retries = self.default_max_retries;
        }
        self.queue.submit(act);
        Ok(id)
    }

    /// Blocks until the result for an earlier `submit` arrives.
    pub fn wait_result(&self, client_id: u32, act_id: u64, timeout: Duration) -> Option<Response> {
        self.clients.wait_result(client_id, act_id, timeout)
    }

    /// Submits a request and waits for its result. A malformed request
    /// completes immediately with its parse error.
    pub fn request(&self, client_id: u32, req: &Request) -> Option<Response> {
        match self.submit(client_id, req) {
            Ok(id) => self.wait_result(client_id, id, REQUEST_TIMEOUT),
            Err(e) => Some(Response {
                op_result: e.code(),
                ..Response::default()
            }),
        }
    }

    /// Free-form diagnostic dump of all daemon state.
    pub fn dump(&self) -> String {
        dump::build_dump(&self.clients, &self.local, &self.registry)
    }

    /// Access to the lockspace registry, for inspection.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Stops every lockspace, then the daemon threads. Lock-manager
    /// errors on the way down are logged and do not block shutdown.
    pub fn shutdown(self) {
        self.registry.stop_all(true);
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            self.registry.remove_stopped();
            if self.registry.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                warn!("lockspaces did not stop in time");
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        self.work.stop();
        self.local.stop();
        self.queue.stop();
        for handle in self.threads.into_inner() {
            let _ = handle.join();
        }
        info!("daemon stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lm::MemoryLockManager;

    fn test_daemon() -> Daemon {
        let config = DaemonConfig::default()
            .with_retry_interval(Duration::from_millis(5))
            .with_worker_delay(Duration::from_millis(5))
            .with_worker_idle(Duration::from_millis(50))
            .with_backend(LockType::Sanlock, Arc::new(MemoryLockManager::new()));
        Daemon::start(config)
    }

    #[test]
    fn test_hello() {
        let daemon = test_daemon();
        let client = daemon.add_client("lvm", 1);
        let resp = daemon.request(client, &Request::new("hello")).unwrap();
        assert_eq!(resp.op_result, 0);
        daemon.shutdown();
    }

    #[test]
    fn test_unknown_request_is_invalid() {
        let daemon = test_daemon();
        let client = daemon.add_client("lvm", 1);
        let resp = daemon.request(client, &Request::new("frobnicate")).unwrap();
        assert_eq!(resp.op_result, LockError::Invalid.code());
        daemon.shutdown();
    }

    #[test]
    fn test_dump_lists_clients() {
        let daemon = test_daemon();
        let client = daemon.add_client("monitor", 42);
        let resp = daemon.request(client, &Request::new("dump")).unwrap();
        assert_eq!(resp.op_result, 0);
        assert!(resp.data.contains("info=client"));
        assert!(resp.data.contains("name=monitor"));
        daemon.shutdown();
    }

    #[test]
    fn test_close_unknown_client_is_noop() {
        let daemon = test_daemon();
        daemon.close_client(9999);
        daemon.shutdown();
    }
}
