// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Benchmarks for the lock grant/release hot path.

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use vglockd::{Daemon, DaemonConfig, LockType, MemoryLockManager, Request};

fn create_test_daemon() -> (Daemon, u32) {
    let config = DaemonConfig::default()
        .with_retry_interval(Duration::from_millis(1))
        .with_backend(LockType::Sanlock, Arc::new(MemoryLockManager::new()));
    let daemon = Daemon::start(config);
    let client = daemon.add_client("bench", 1);
    let resp = daemon
        .request(
            client,
            &Request::new("start_vg")
                .with_vg("vg0")
                .with_lock_type("sanlock")
                .with_opts("wait"),
        )
        .expect("start_vg");
    assert_eq!(resp.op_result, 0);
    (daemon, client)
}

fn bench_vg_lock_cycle(c: &mut Criterion) {
    let (daemon, client) = create_test_daemon();

    let lock = Request::new("lock_vg").with_vg("vg0").with_mode("sh");
    let unlock = Request::new("lock_vg").with_vg("vg0").with_mode("un");
    c.bench_function("daemon::vg_lock_cycle", |b| {
        b.iter(|| {
            let resp = daemon.request(client, &lock).expect("lock");
            assert_eq!(resp.op_result, 0);
            let resp = daemon.request(client, &unlock).expect("unlock");
            black_box(resp.op_result)
        })
    });
}

fn bench_lv_lock_cycle(c: &mut Criterion) {
    let (daemon, client) = create_test_daemon();

    let lock = Request::new("lock_lv")
        .with_vg("vg0")
        .with_lv("lv0")
        .with_mode("ex");
    let unlock = Request::new("lock_lv")
        .with_vg("vg0")
        .with_lv("lv0")
        .with_mode("un");
    c.bench_function("daemon::lv_lock_cycle", |b| {
        b.iter(|| {
            let resp = daemon.request(client, &lock).expect("lock");
            assert_eq!(resp.op_result, 0);
            let resp = daemon.request(client, &unlock).expect("unlock");
            black_box(resp.op_result)
        })
    });
}

criterion_group!(benches, bench_vg_lock_cycle, bench_lv_lock_cycle);
criterion_main!(benches);
