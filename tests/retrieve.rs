//! Retrieval semantics: timeouts, interrupts, drain ordering.

#![allow(missing_docs)]
#![allow(unsafe_code)]

use kqport::{Action, EventFlags, FilterCategory, Ident, Kqueue, Udata};
use std::sync::mpsc;
use std::time::{Duration, Instant};

#[test]
fn finite_timeout_returns_empty_not_error() {
    let kq = Kqueue::new().expect("kqueue creation failed");
    let start = Instant::now();
    let events = kq
        .retrieve(4, Some(Duration::from_millis(80)))
        .expect("retrieve failed");
    assert!(events.is_empty());
    assert!(start.elapsed() >= Duration::from_millis(70), "timeout honored");
}

#[test]
fn zero_timeout_polls_without_blocking() {
    let kq = Kqueue::new().expect("kqueue creation failed");
    let start = Instant::now();
    let events = kq
        .retrieve(4, Some(Duration::ZERO))
        .expect("retrieve failed");
    assert!(events.is_empty());
    assert!(start.elapsed() < Duration::from_millis(50), "no blocking");
}

extern "C" fn noop_handler(_signo: libc::c_int) {}

/// A caught signal aborts the wait as `Interrupted`, never as a clean
/// empty timeout.
#[test]
fn interrupt_is_distinguished_from_timeout() {
    // Install a handler without SA_RESTART so the native wait is
    // genuinely interrupted.
    // SAFETY: installing a no-op handler for SIGURG in this test
    // process only.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = noop_handler as extern "C" fn(libc::c_int) as usize;
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_flags = 0;
        assert_eq!(
            libc::sigaction(libc::SIGURG, &action, std::ptr::null_mut()),
            0
        );
    }

    let kq = Kqueue::new().expect("kqueue creation failed");
    let (tid_tx, tid_rx) = mpsc::channel();
    std::thread::scope(|s| {
        let kq_ref = &kq;
        let handle = s.spawn(move || {
            // SAFETY: pthread_self in the waiting thread.
            tid_tx.send(unsafe { libc::pthread_self() }).unwrap();
            kq_ref.retrieve(4, Some(Duration::from_secs(10)))
        });

        let tid = tid_rx.recv().expect("waiter thread id");
        std::thread::sleep(Duration::from_millis(100));
        // SAFETY: directing SIGURG at the live waiter thread.
        unsafe {
            libc::pthread_kill(tid, libc::SIGURG);
        }

        let result = handle.join().expect("waiter panicked");
        let err = result.expect_err("interrupt must not look like a timeout");
        assert!(err.is_interrupted(), "got {err:?}");
    });
}

#[test]
fn software_events_drain_before_backend_wait() {
    let kq = Kqueue::new().expect("kqueue creation failed");
    kq.register(
        Ident::new(1),
        FilterCategory::User,
        Action::Add,
        EventFlags::TRIGGER,
        9,
        Udata::NONE,
    )
    .expect("add failed");

    // An already-pending software event satisfies even an indefinite
    // block immediately.
    let start = Instant::now();
    let events = kq.retrieve(4, None).expect("retrieve failed");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].data, 9);
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn pending_events_are_fifo_ordered() {
    let kq = Kqueue::new().expect("kqueue creation failed");
    for ident in [10usize, 11, 12] {
        kq.register(
            Ident::new(ident),
            FilterCategory::User,
            Action::Add,
            EventFlags::TRIGGER | EventFlags::CLEAR,
            ident as i64,
            Udata::NONE,
        )
        .expect("add failed");
    }

    let events = kq
        .retrieve(8, Some(Duration::ZERO))
        .expect("retrieve failed");
    let idents: Vec<usize> = events.iter().map(|e| e.ident.value()).collect();
    assert_eq!(idents, [10, 11, 12], "FIFO across the pending queue");
}

#[test]
fn max_events_bounds_one_retrieval() {
    let kq = Kqueue::new().expect("kqueue creation failed");
    for ident in 0..5usize {
        kq.register(
            Ident::new(ident),
            FilterCategory::User,
            Action::Add,
            EventFlags::TRIGGER | EventFlags::CLEAR,
            0,
            Udata::NONE,
        )
        .expect("add failed");
    }

    let first = kq
        .retrieve(2, Some(Duration::ZERO))
        .expect("retrieve failed");
    assert_eq!(first.len(), 2);
    let rest = kq
        .retrieve(8, Some(Duration::ZERO))
        .expect("retrieve failed");
    assert_eq!(rest.len(), 3, "remainder delivered on the next call");
}

#[test]
fn no_pending_events_after_full_drain() {
    let kq = Kqueue::new().expect("kqueue creation failed");
    kq.register(
        Ident::new(3),
        FilterCategory::User,
        Action::Add,
        EventFlags::TRIGGER | EventFlags::CLEAR,
        1,
        Udata::NONE,
    )
    .expect("add failed");

    let events = kq
        .retrieve(8, Some(Duration::ZERO))
        .expect("retrieve failed");
    assert_eq!(events.len(), 1);

    // Every condition satisfied/cleared: a zero-timeout retrieve is
    // empty.
    let events = kq
        .retrieve(8, Some(Duration::ZERO))
        .expect("retrieve failed");
    assert!(events.is_empty());
}
