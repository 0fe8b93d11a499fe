//! Backend adapters over the host's native readiness primitive.
//!
//! Each backend wraps exactly one native mechanism and offers the same
//! three-part contract: register/unregister interest for one direction
//! of one descriptor, and wait for readiness with a timeout. Readiness
//! is surfaced as transient [`NativeEvent`] records carrying the opaque
//! token supplied at registration; the records are consumed immediately
//! by the translation layer and never stored.
//!
//! # Platform selection
//!
//! Selection is a compile-time choice behind the uniform [`Backend`]
//! trait; the knote/filter layers never branch on platform identity.
//!
//! | Platform | Backend | Edge support |
//! |----------|---------|--------------|
//! | Linux | [`EpollBackend`](epoll::EpollBackend) | emulated (level + watermark) |
//! | macOS/BSD | [`KqueueBackend`](kqueue::KqueueBackend) | native (`EV_CLEAR`) |
//! | other unix | [`PollBackend`](poll::PollBackend) | emulated (level + watermark) |
//!
//! The poll(2) backend compiles on every unix and doubles as a test
//! vehicle for the level-only emulation paths.
//!
//! # Timeout rules
//!
//! `timeout = None` blocks indefinitely, `timeout = 0` polls without
//! blocking. A timed-out wait returns an empty batch, not an error; an
//! interrupted wait returns [`ErrorKind::Interrupted`]; any other
//! native failure is a [`Backend`](ErrorKind::Backend) error fatal to
//! that wait call only.

#[cfg(target_os = "linux")]
pub mod epoll;
#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "dragonfly"))]
pub mod kqueue;
#[cfg(unix)]
pub mod poll;

use crate::error::{Error, ErrorKind, Result};
use smallvec::SmallVec;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Token value reserved for each backend's internal wake channel.
/// Never surfaced in a [`NativeEvent`].
pub(crate) const WAKE_TOKEN: usize = usize::MAX;

/// Stack-friendly batch of native readiness records for one wait call.
pub type EventBatch = SmallVec<[NativeEvent; 64]>;

/// Readiness direction for a descriptor registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Readable-data readiness.
    Read,
    /// Writable-data readiness.
    Write,
}

/// Requested (or applied) delivery mode for a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    /// Report while the condition holds.
    Level,
    /// Report once per condition change.
    Edge,
}

/// One native readiness record.
///
/// Transient: produced by [`Backend::wait`], consumed immediately by
/// the translation protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeEvent {
    /// The token supplied when the source was registered.
    pub token: usize,
    /// The descriptor the readiness was observed on. Lets the
    /// translation layer reject a record whose token now names a
    /// different knote (slab-slot reuse during an in-flight wait).
    pub fd: RawFd,
    /// The source is readable.
    pub readable: bool,
    /// The source is writable.
    pub writable: bool,
    /// An error condition was reported.
    pub error: bool,
    /// The source reported hangup (peer closed).
    pub hangup: bool,
}

/// Adapter over one native readiness-notification mechanism.
pub trait Backend: Send + Sync {
    /// Registers interest in one direction of `fd` under `token`.
    ///
    /// Returns the trigger mode actually applied: backends without
    /// native edge support downgrade `Edge` requests to `Level`, and
    /// the knote layer emulates clear semantics in software.
    ///
    /// # Errors
    ///
    /// Any native registration failure, including `EBADF` for a stale
    /// descriptor.
    fn register(&self, fd: RawFd, dir: Direction, token: usize, trigger: Trigger)
        -> io::Result<Trigger>;

    /// Re-applies a registration (idempotent; must not duplicate
    /// native entries).
    ///
    /// # Errors
    ///
    /// Any native modification failure.
    fn modify(&self, fd: RawFd, dir: Direction, token: usize, trigger: Trigger)
        -> io::Result<Trigger>;

    /// Removes the registration for one direction of `fd`.
    ///
    /// # Errors
    ///
    /// Any native removal failure, including `EBADF`/`ENOENT` for a
    /// descriptor closed behind our back. Callers decide whether that
    /// is fatal (explicit delete) or merely logged (close sweep).
    fn unregister(&self, fd: RawFd, dir: Direction) -> io::Result<()>;

    /// Blocks until readiness or timeout and appends up to `max`
    /// records to `out`.
    ///
    /// A timed-out wait leaves `out` empty and returns `Ok`.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::Interrupted`] when a caught signal aborted the
    /// wait; [`ErrorKind::Backend`] for any other native failure.
    fn wait(&self, out: &mut EventBatch, max: usize, timeout: Option<Duration>) -> Result<()>;

    /// Interrupts a concurrent [`wait`](Backend::wait) from another
    /// thread.
    ///
    /// # Errors
    ///
    /// Propagates a wake-channel write failure.
    fn wake(&self) -> io::Result<()>;

    /// Raw write end of the wake channel, for async-signal-safe wakeups
    /// (the signal filter's handler writes here directly).
    fn wake_fd(&self) -> RawFd;
}

/// The backend selected for this platform.
#[cfg(target_os = "linux")]
pub type NativeBackend = epoll::EpollBackend;
/// The backend selected for this platform.
#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "dragonfly"))]
pub type NativeBackend = kqueue::KqueueBackend;
/// The backend selected for this platform.
#[cfg(all(
    unix,
    not(any(
        target_os = "linux",
        target_os = "macos",
        target_os = "freebsd",
        target_os = "dragonfly"
    ))
))]
pub type NativeBackend = poll::PollBackend;

/// Creates the platform backend, mapping creation failure to
/// [`ErrorKind::ResourceExhausted`].
pub(crate) fn create_native() -> Result<NativeBackend> {
    NativeBackend::new().map_err(|e| Error::resource_exhausted("backend creation", e))
}

/// Maps a native wait failure to the crate error taxonomy.
pub(crate) fn map_wait_error(op: &'static str, err: io::Error) -> Error {
    if err.raw_os_error() == Some(libc::EINTR) {
        Error::interrupted()
    } else {
        Error::new(ErrorKind::Backend)
            .with_message(format!("{op} failed"))
            .with_source(err)
    }
}

/// Converts an optional timeout to the millisecond form the native
/// wait primitives take (`-1` blocks indefinitely). Sub-millisecond
/// remainders round up so a short finite timeout never busy-spins.
#[cfg(unix)]
pub(crate) fn timeout_millis(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(t) => {
            let ms = t.as_millis();
            if ms == 0 && !t.is_zero() {
                1
            } else {
                libc::c_int::try_from(ms).unwrap_or(libc::c_int::MAX)
            }
        }
    }
}

/// Self-pipe used by every backend for cross-thread (and
/// signal-handler) wakeups of a blocked wait.
///
/// Multiple wakes coalesce through `pending`; the read end is drained
/// when the wait observes it.
#[cfg(unix)]
pub(crate) struct WakePipe {
    read_fd: RawFd,
    write_fd: RawFd,
    pending: std::sync::atomic::AtomicBool,
}

#[cfg(unix)]
#[allow(unsafe_code)]
impl WakePipe {
    /// Creates the pipe with both ends non-blocking.
    pub(crate) fn new() -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        // SAFETY: fds is a valid two-element buffer for pipe(2).
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        for &fd in &fds {
            // SAFETY: fd was just returned by pipe(2).
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
            let ok = flags >= 0
                // SAFETY: same fd, setting flags obtained above.
                && unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } >= 0;
            if !ok {
                let err = io::Error::last_os_error();
                // SAFETY: both fds belong to this half-built pipe.
                unsafe {
                    libc::close(fds[0]);
                    libc::close(fds[1]);
                }
                return Err(err);
            }
        }
        Ok(Self {
            read_fd: fds[0],
            write_fd: fds[1],
            pending: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    pub(crate) fn write_fd(&self) -> RawFd {
        self.write_fd
    }

    /// Writes one byte unless a wake is already pending.
    pub(crate) fn wake(&self) -> io::Result<()> {
        use std::sync::atomic::Ordering;
        if self.pending.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let buf = [1u8];
        // SAFETY: write_fd is owned by this pipe; one-byte buffer.
        let n = unsafe { libc::write(self.write_fd, buf.as_ptr().cast(), 1) };
        if n < 0 {
            let err = io::Error::last_os_error();
            // A full pipe still wakes the reader; only real failures count.
            if err.raw_os_error() != Some(libc::EAGAIN) {
                self.pending.store(false, Ordering::Release);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Drains the read end after a wakeup.
    pub(crate) fn drain(&self) {
        use std::sync::atomic::Ordering;
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: read_fd is owned by this pipe; buffer is valid.
            let n = unsafe { libc::read(self.read_fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n <= 0 {
                break;
            }
        }
        self.pending.store(false, Ordering::Release);
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
impl Drop for WakePipe {
    fn drop(&mut self) {
        // SAFETY: both fds are exclusively owned by this pipe.
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}
