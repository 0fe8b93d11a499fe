//! Signal-delivered filter.
//!
//! Signals are pure software state: no native backend registration.
//! A fixed-size, lock-free route table connects installed handlers to
//! the kqueues watching each signal; everything the handler touches is
//! an atomic or a `write(2)` to a wake pipe, keeping it
//! async-signal-safe. The data count delivered with each event is the
//! number of deliveries observed since the last report, and delivery
//! consumes the count.
//!
//! Handlers are installed with `SA_RESTART`, so a watched signal wakes
//! a blocked retrieval through the wake pipe instead of surfacing as a
//! spurious `Interrupted`. The previous disposition is restored when
//! the last knote for a signal detaches.

#![allow(unsafe_code)]

use super::{AttachCx, FilterOps};
use crate::error::{Error, ErrorKind, Result};
use crate::knote::{FilterAux, Knote, SignalAux};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

/// Size of the process-wide route table; bounds the number of live
/// signal knotes across all kqueues.
const MAX_ROUTES: usize = 64;

/// One route: a watched signal number, the wake pipe of the owning
/// kqueue's backend, and the delivery counter.
struct RouteSlot {
    /// 0 marks a free slot.
    signo: AtomicI32,
    wake_fd: AtomicI32,
    pending: AtomicU64,
}

#[allow(clippy::declare_interior_mutable_const)]
const FREE_SLOT: RouteSlot = RouteSlot {
    signo: AtomicI32::new(0),
    wake_fd: AtomicI32::new(-1),
    pending: AtomicU64::new(0),
};

static ROUTES: [RouteSlot; MAX_ROUTES] = [FREE_SLOT; MAX_ROUTES];

/// Previous disposition and live-route count per installed signal.
struct SignoState {
    prev: libc::sigaction,
    count: usize,
}

// libc::sigaction carries no thread affinity; it is plain data.
#[allow(unsafe_code)]
unsafe impl Send for SignoState {}

static REGISTRY: Mutex<Option<HashMap<libc::c_int, SignoState>>> = Mutex::new(None);

#[cfg(target_os = "linux")]
unsafe fn errno_ptr() -> *mut libc::c_int {
    libc::__errno_location()
}

#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "dragonfly"))]
unsafe fn errno_ptr() -> *mut libc::c_int {
    libc::__error()
}

#[cfg(any(target_os = "openbsd", target_os = "netbsd"))]
unsafe fn errno_ptr() -> *mut libc::c_int {
    libc::__errno()
}

/// The installed handler. Async-signal-safe: atomics and `write(2)`
/// only, with errno preserved.
extern "C" fn route_signal(signo: libc::c_int) {
    // SAFETY: reading/writing errno is async-signal-safe.
    let saved = unsafe { *errno_ptr() };
    for slot in &ROUTES {
        if slot.signo.load(Ordering::Acquire) == signo {
            slot.pending.fetch_add(1, Ordering::AcqRel);
            let fd = slot.wake_fd.load(Ordering::Acquire);
            if fd >= 0 {
                let byte = 1u8;
                // SAFETY: one-byte write to a pipe fd; write(2) is
                // async-signal-safe and failure is ignorable (a full
                // pipe still wakes the reader).
                unsafe {
                    libc::write(fd, std::ptr::addr_of!(byte).cast(), 1);
                }
            }
        }
    }
    // SAFETY: as above.
    unsafe {
        *errno_ptr() = saved;
    }
}

/// Claims a route slot for `signo`, installing the shared handler if
/// this is the first route for that signal.
pub(crate) fn claim_route(signo: libc::c_int, wake_fd: RawFd) -> Result<usize> {
    let mut registry = REGISTRY.lock();
    let registry = registry.get_or_insert_with(HashMap::new);

    let Some(slot) = ROUTES.iter().position(|s| {
        s.signo
            .compare_exchange(0, signo, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }) else {
        return Err(Error::new(ErrorKind::ResourceExhausted)
            .with_message("signal route table is full"));
    };
    ROUTES[slot].pending.store(0, Ordering::Release);
    ROUTES[slot].wake_fd.store(wake_fd, Ordering::Release);

    if let Some(state) = registry.get_mut(&signo) {
        state.count += 1;
        return Ok(slot);
    }

    // SAFETY: zeroed sigaction is a valid starting point; all fields
    // are set before use.
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = route_signal as extern "C" fn(libc::c_int) as usize;
    action.sa_flags = libc::SA_RESTART;
    // SAFETY: sa_mask is a valid sigset_t within `action`.
    unsafe {
        libc::sigemptyset(&mut action.sa_mask);
    }
    // SAFETY: prev receives the old disposition.
    let mut prev: libc::sigaction = unsafe { std::mem::zeroed() };
    // SAFETY: both structs outlive the call; an invalid signo is
    // reported as EINVAL, not undefined behavior.
    if unsafe { libc::sigaction(signo, &action, &mut prev) } < 0 {
        ROUTES[slot].wake_fd.store(-1, Ordering::Release);
        ROUTES[slot].signo.store(0, Ordering::Release);
        return Err(Error::backend("sigaction", std::io::Error::last_os_error()));
    }
    registry.insert(signo, SignoState { prev, count: 1 });
    Ok(slot)
}

/// Releases a route slot, restoring the previous disposition when the
/// last route for the signal goes away.
pub(crate) fn release_route(slot: usize) {
    let mut registry = REGISTRY.lock();
    let signo = ROUTES[slot].signo.load(Ordering::Acquire);
    ROUTES[slot].wake_fd.store(-1, Ordering::Release);
    ROUTES[slot].pending.store(0, Ordering::Release);
    ROUTES[slot].signo.store(0, Ordering::Release);
    if signo == 0 {
        return;
    }
    let Some(registry) = registry.as_mut() else {
        return;
    };
    if let Some(state) = registry.get_mut(&signo) {
        state.count -= 1;
        if state.count == 0 {
            // SAFETY: restoring the disposition captured at install.
            let rv = unsafe { libc::sigaction(signo, &state.prev, std::ptr::null_mut()) };
            if rv < 0 {
                tracing::warn!(
                    signo,
                    error = %std::io::Error::last_os_error(),
                    "failed to restore previous signal disposition"
                );
            }
            registry.remove(&signo);
        }
    }
}

/// Takes and resets the delivery count accumulated on a route.
pub(crate) fn take_pending(slot: usize) -> u64 {
    ROUTES[slot].pending.swap(0, Ordering::AcqRel)
}

/// Behavior table for [`FilterCategory::Signal`](super::FilterCategory::Signal).
pub(crate) struct SignalFilter;

impl FilterOps for SignalFilter {
    fn make_aux(&self) -> FilterAux {
        FilterAux::Signal(SignalAux { slot: usize::MAX })
    }

    fn attach(&self, cx: &AttachCx<'_>, note: &mut Knote) -> Result<()> {
        let signo = note.ident.value() as libc::c_int;
        let slot = claim_route(signo, cx.backend.wake_fd())?;
        note.signal_aux_mut().slot = slot;
        Ok(())
    }

    fn update(&self, _cx: &AttachCx<'_>, _note: &mut Knote) -> Result<()> {
        // The route is already installed; re-adding must not leak a
        // second slot.
        Ok(())
    }

    fn consumes_on_delivery(&self) -> bool {
        true
    }

    fn detach(&self, _cx: &AttachCx<'_>, note: &mut Knote) -> Result<()> {
        let slot = note.signal_aux().slot;
        if slot != usize::MAX {
            release_route(slot);
        }
        Ok(())
    }
}
