// Scheduler admission under contention

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::unbounded;

use ffbatch::config::EncodersConfig;
use ffbatch::engine::process::CancelToken;
use ffbatch::engine::{Encoder, Scheduler};

fn pools(per_pool: usize) -> EncodersConfig {
    let mut cfg = EncodersConfig::default();
    cfg.nvenc.max_concurrent = per_pool;
    cfg.qsv.max_concurrent = per_pool;
    cfg.videotoolbox.max_concurrent = per_pool;
    cfg.cpu.max_concurrent = per_pool;
    cfg
}

#[test]
fn per_pool_and_global_caps_hold_under_contention() {
    let sched = Scheduler::with_pools(
        &pools(2),
        &[Encoder::Nvenc, Encoder::Qsv, Encoder::Cpu],
        4,
    );
    let cancel = CancelToken::new();
    let peak_total = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for i in 0..24 {
        let sched = Arc::clone(&sched);
        let cancel = cancel.clone();
        let peak_total = Arc::clone(&peak_total);
        let encoder = [Encoder::Nvenc, Encoder::Qsv, Encoder::Cpu][i % 3];
        handles.push(thread::spawn(move || {
            let lease = sched.acquire(encoder, &cancel).unwrap();
            let snap = sched.stats();
            peak_total.fetch_max(snap.total_in_flight, Ordering::SeqCst);
            for slot in snap.slots.values() {
                assert!(slot.in_flight <= slot.max_concurrent);
            }
            thread::sleep(Duration::from_millis(10));
            lease.finish(true);
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    assert!(peak_total.load(Ordering::SeqCst) <= 4);
    let snap = sched.stats();
    assert_eq!(snap.total_in_flight, 0);
    assert_eq!(snap.slots.values().map(|s| s.completed).sum::<u64>(), 24);
}

#[test]
fn pool_admission_is_first_come_first_served() {
    let sched = Scheduler::with_pools(&pools(1), &[Encoder::Nvenc], 1);
    let cancel = CancelToken::new();
    let holder = sched.acquire(Encoder::Nvenc, &cancel).unwrap();

    let (granted_tx, granted_rx) = unbounded();

    // Two waiters queue up in a known order.
    let mut waiters = Vec::new();
    for id in 0..2 {
        let sched = Arc::clone(&sched);
        let cancel = cancel.clone();
        let granted_tx = granted_tx.clone();
        waiters.push(thread::spawn(move || {
            let lease = sched.acquire(Encoder::Nvenc, &cancel).unwrap();
            granted_tx.send(id).unwrap();
            thread::sleep(Duration::from_millis(20));
            lease.finish(true);
        }));
        // Give waiter 0 time to take its ticket before waiter 1 arrives.
        thread::sleep(Duration::from_millis(150));
    }

    holder.finish(true);
    let first = granted_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let second = granted_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!((first, second), (0, 1), "grants must follow arrival order");

    for w in waiters {
        w.join().unwrap();
    }
}

#[test]
fn cancellation_drains_every_waiter() {
    let sched = Scheduler::with_pools(&pools(1), &[Encoder::Cpu], 1);
    let cancel = CancelToken::new();
    let _holder = sched.acquire(Encoder::Cpu, &cancel).unwrap();

    let mut waiters = Vec::new();
    for _ in 0..5 {
        let sched = Arc::clone(&sched);
        let cancel = cancel.clone();
        waiters.push(thread::spawn(move || sched.acquire(Encoder::Cpu, &cancel)));
    }

    thread::sleep(Duration::from_millis(100));
    cancel.cancel();
    for w in waiters {
        assert!(w.join().unwrap().is_err(), "cancel must unblock the waiter");
    }
}
