// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Integration tests for dispatcher and driver shutdown
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: 9 integration tests
//!
//! TEST_SCOPE:
//!   - Cancellation of every registered wait and queued callback
//!   - Exactly-once shutdown observers under concurrent requests
//!   - Shutdown while an ALLOW_SYNC_CALLS callback blocks its worker
//!   - Driver-level shutdown observers and destruction
//!
//! TEST_SCENARIOS:
//!   - shutdown_cancels_every_wait_before_observer(): Canceled reads, delayed task, observer last
//!   - concurrent_shutdown_runs_observer_once(): Many threads race shutdown_async
//!   - blocked_sync_callback_delays_observer(): Observer waits for the blocked read callback
//!   - panicking_callback_does_not_wedge_shutdown(): Observer still fires after a handler panic
//!   - registration_during_shutdown_unavailable(): Re-arming from a canceled callback fails
//!   - driver_observer_after_all_dispatchers(): Driver observer sees every dispatcher shut down
//!   - driver_shutdown_twice_is_bad_state(): Second driver shutdown while in progress
//!   - destroy_from_observer(): Dispatcher destroyed inside its own observer
//!   - wait_until_idle_rejected_on_own_dispatcher(): Self-wait is refused
//!
//! DEPENDENCIES:
//!   - nexus_driver_runtime::{Runtime, Dispatcher, Channel}
//!   - crossbeam-channel: completion signals
//!
//! ADR: docs/adr/0003-driver-runtime-architecture.md

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use nexus_driver_runtime::{
    Channel, DispatcherOptions, DispatcherState, DriverId, Runtime, RuntimeConfig, StartOptions,
    Status,
};

const WAIT: Duration = Duration::from_secs(5);

fn started_runtime() -> Runtime {
    let runtime = Runtime::new(RuntimeConfig::default());
    runtime.start(StartOptions::empty()).unwrap();
    runtime
}

#[test]
fn shutdown_cancels_every_wait_before_observer() {
    let runtime = started_runtime();
    let events = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    let log = Arc::clone(&events);
    let dispatcher = runtime
        .create_dispatcher_with_owner(DriverId::new(), DispatcherOptions::empty(), "d", "", move |_| {
            log.lock().push("observer".to_string());
            done_tx.send(()).unwrap();
        })
        .unwrap();

    let mut keep = Vec::new();
    for i in 0..3 {
        let (a, b) = Channel::pair();
        let log = Arc::clone(&events);
        b.wait_async(&dispatcher, 0, move |_, status| {
            assert_eq!(status, Err(Status::Canceled));
            log.lock().push(format!("read{i}"));
        })
        .unwrap();
        keep.push((a, b));
    }
    let log = Arc::clone(&events);
    dispatcher
        .post_delayed_task(Duration::from_secs(3600), move |_, status| {
            assert_eq!(status, Err(Status::Canceled));
            log.lock().push("timer".to_string());
        })
        .unwrap();

    dispatcher.shutdown_async();
    done_rx.recv_timeout(WAIT).unwrap();
    let events = events.lock().clone();
    assert_eq!(events, vec!["read0", "read1", "read2", "timer", "observer"]);
    assert_eq!(dispatcher.post_task(|_, _| {}).unwrap_err(), Status::BadState);
    runtime.destroy_all_dispatchers().unwrap();
}

#[test]
fn concurrent_shutdown_runs_observer_once() {
    let runtime = started_runtime();
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    let dispatcher = runtime
        .create_dispatcher_with_owner(DriverId::new(), DispatcherOptions::empty(), "d", "", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    for _ in 0..16 {
        dispatcher.post_task(|_, _| thread::sleep(Duration::from_micros(50))).unwrap();
    }
    let barrier = Arc::new(Barrier::new(8));
    let racers: Vec<_> = (0..8)
        .map(|_| {
            let dispatcher = dispatcher.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                dispatcher.shutdown_async();
            })
        })
        .collect();
    for racer in racers {
        racer.join().unwrap();
    }
    runtime.destroy_all_dispatchers().unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(dispatcher.state(), DispatcherState::Destroyed);
}

#[test]
fn blocked_sync_callback_delays_observer() {
    let runtime = started_runtime();
    let (observed_tx, observed_rx) = crossbeam_channel::bounded(1);
    let dispatcher = runtime
        .create_dispatcher_with_owner(
            DriverId::new(),
            DispatcherOptions::ALLOW_SYNC_CALLS,
            "blocking",
            "",
            move |_| observed_tx.send(()).unwrap(),
        )
        .unwrap();
    let (a, b) = Channel::pair();
    let (entered_tx, entered_rx) = crossbeam_channel::bounded(1);
    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    b.wait_async(&dispatcher, 0, move |_, status| {
        counter.fetch_add(1, Ordering::SeqCst);
        entered_tx.send(status).unwrap();
        release_rx.recv_timeout(WAIT).unwrap();
    })
    .unwrap();
    a.write_bytes(b"block").unwrap();
    assert_eq!(entered_rx.recv_timeout(WAIT).unwrap(), Ok(()));

    dispatcher.shutdown_async();
    assert!(observed_rx.recv_timeout(Duration::from_millis(50)).is_err());
    release_tx.send(()).unwrap();
    observed_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    runtime.destroy_all_dispatchers().unwrap();
}

#[test]
fn panicking_callback_does_not_wedge_shutdown() {
    let runtime = started_runtime();
    let (observed_tx, observed_rx) = crossbeam_channel::bounded(1);
    let dispatcher = runtime
        .create_dispatcher_with_owner(DriverId::new(), DispatcherOptions::empty(), "d", "", move |_| {
            observed_tx.send(()).unwrap()
        })
        .unwrap();
    dispatcher.post_task(|_, _| panic!("driver callback failed")).unwrap();
    let (after_tx, after_rx) = crossbeam_channel::bounded(1);
    dispatcher.post_task(move |_, status| after_tx.send(status).unwrap()).unwrap();
    assert_eq!(after_rx.recv_timeout(WAIT).unwrap(), Ok(()));

    dispatcher.shutdown_async();
    observed_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(dispatcher.wait_until_idle(), Ok(()));
    assert_eq!(runtime.num_threads(""), 1);
    runtime.destroy_all_dispatchers().unwrap();
}

#[test]
fn registration_during_shutdown_unavailable() {
    let runtime = Runtime::new(RuntimeConfig::default());
    let dispatcher = runtime
        .create_unmanaged_dispatcher(DriverId::new(), DispatcherOptions::empty(), "d", |_| {})
        .unwrap();
    let (_a, b) = Channel::pair();
    let (tx, rx) = crossbeam_channel::bounded(1);
    let rearm = b.clone();
    b.wait_async(&dispatcher, 0, move |d, status| {
        tx.send((status, rearm.wait_async(d, 0, |_, _| {}))).unwrap();
    })
    .unwrap();
    dispatcher.shutdown_async();
    runtime.run_until_idle();
    let (status, again) = rx.try_recv().unwrap();
    assert_eq!(status, Err(Status::Canceled));
    assert_eq!(again, Err(Status::Unavailable));
    assert_eq!(dispatcher.state(), DispatcherState::ShutDown);
}

#[test]
fn driver_observer_after_all_dispatchers() {
    let runtime = started_runtime();
    let driver = DriverId::new();
    let shut = Arc::new(AtomicUsize::new(0));
    for i in 0..3 {
        let shut = Arc::clone(&shut);
        runtime
            .create_dispatcher_with_owner(driver, DispatcherOptions::empty(), &format!("d{i}"), "", move |_| {
                shut.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }
    let (tx, rx) = crossbeam_channel::bounded(1);
    let seen = Arc::clone(&shut);
    runtime
        .shutdown_dispatchers_async(driver, move |id| {
            tx.send((id, seen.load(Ordering::SeqCst))).unwrap();
        })
        .unwrap();
    let (id, count) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(id, driver);
    assert_eq!(count, 3);
    assert_eq!(runtime.dispatchers_of(driver).len(), 3);
    runtime.destroy_all_dispatchers().unwrap();
    assert!(runtime.dispatchers_of(driver).is_empty());
    assert_eq!(runtime.shutdown_dispatchers_async(driver, |_| {}), Err(Status::InvalidArgs));
}

#[test]
fn driver_shutdown_twice_is_bad_state() {
    let runtime = started_runtime();
    let driver = DriverId::new();
    let dispatcher = runtime
        .create_dispatcher_with_owner(driver, DispatcherOptions::empty(), "d", "", |_| {})
        .unwrap();
    let (entered_tx, entered_rx) = crossbeam_channel::bounded(1);
    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);
    dispatcher
        .post_task(move |_, _| {
            entered_tx.send(()).unwrap();
            release_rx.recv_timeout(WAIT).unwrap();
        })
        .unwrap();
    entered_rx.recv_timeout(WAIT).unwrap();

    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    runtime.shutdown_dispatchers_async(driver, move |_| done_tx.send(()).unwrap()).unwrap();
    assert_eq!(runtime.shutdown_dispatchers_async(driver, |_| {}), Err(Status::BadState));
    let late = runtime.create_dispatcher_with_owner(driver, DispatcherOptions::empty(), "late", "", |_| {});
    assert_eq!(late.unwrap_err(), Status::BadState);

    release_tx.send(()).unwrap();
    done_rx.recv_timeout(WAIT).unwrap();
    runtime.destroy_all_dispatchers().unwrap();
}

#[test]
fn destroy_from_observer() {
    let runtime = started_runtime();
    let dispatcher = runtime
        .create_dispatcher_with_owner(DriverId::new(), DispatcherOptions::empty(), "d", "", |d| {
            d.clone().destroy().unwrap();
        })
        .unwrap();
    assert_eq!(dispatcher.clone().destroy(), Err(Status::BadState));
    dispatcher.shutdown_async();
    runtime.wait_until_dispatchers_destroyed();
    assert_eq!(dispatcher.state(), DispatcherState::Destroyed);
    assert!(runtime.dispatchers().is_empty());
    runtime.reset().unwrap();
}

#[test]
fn wait_until_idle_rejected_on_own_dispatcher() {
    let runtime = Runtime::new(RuntimeConfig::default());
    let dispatcher = runtime
        .create_unmanaged_dispatcher(DriverId::new(), DispatcherOptions::empty(), "d", |_| {})
        .unwrap();
    let (tx, rx) = crossbeam_channel::bounded(1);
    dispatcher
        .post_task(move |d, _| tx.send(d.wait_until_idle()).unwrap())
        .unwrap();
    runtime.run_until_idle();
    assert_eq!(rx.try_recv().unwrap(), Err(Status::BadState));
    assert_eq!(dispatcher.wait_until_idle(), Ok(()));
}
