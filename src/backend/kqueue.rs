//! macOS/BSD kqueue passthrough backend.
//!
//! On hosts that already speak kqueue the adapter is a thin
//! translation: one kevent per (descriptor, direction), with native
//! `EV_CLEAR` honoring edge requests, so [`Trigger::Edge`] is applied
//! as asked. `EV_EOF` maps to hangup and `EV_ERROR` to the error
//! outcome.

#![allow(unsafe_code)]

use super::{
    map_wait_error, Backend, Direction, EventBatch, NativeEvent, Trigger, WakePipe, WAKE_TOKEN,
};
use crate::error::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::ptr;
use std::time::Duration;

fn direction_filter(dir: Direction) -> i16 {
    match dir {
        Direction::Read => libc::EVFILT_READ as i16,
        Direction::Write => libc::EVFILT_WRITE as i16,
    }
}

fn timespec(timeout: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: libc::c_long::from(timeout.subsec_nanos() as i32),
    }
}

/// BSD kqueue backend.
pub struct KqueueBackend {
    /// The kqueue descriptor.
    kq_fd: RawFd,
    /// Self-pipe for cross-thread and signal-handler wakeups.
    wake: WakePipe,
    /// Bookkeeping mirror of the native registration set.
    entries: Mutex<HashMap<(RawFd, Direction), usize>>,
}

impl KqueueBackend {
    /// Creates a new kqueue backend with its wake pipe registered.
    ///
    /// # Errors
    ///
    /// Returns an error if `kqueue()` or the wake pipe setup fails.
    pub fn new() -> io::Result<Self> {
        // SAFETY: plain syscall, no pointers.
        let kq_fd = unsafe { libc::kqueue() };
        if kq_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let wake = match WakePipe::new() {
            Ok(w) => w,
            Err(e) => {
                // SAFETY: kq_fd was just created and is owned here.
                unsafe {
                    libc::close(kq_fd);
                }
                return Err(e);
            }
        };

        let backend = Self {
            kq_fd,
            wake,
            entries: Mutex::new(HashMap::new()),
        };
        backend.change(
            backend.wake.read_fd(),
            libc::EVFILT_READ as i16,
            libc::EV_ADD | libc::EV_CLEAR,
            WAKE_TOKEN,
        )?;
        Ok(backend)
    }

    /// Submits one change-list entry.
    fn change(&self, ident: RawFd, filter: i16, flags: u16, token: usize) -> io::Result<()> {
        let kev = libc::kevent {
            ident: ident as usize,
            filter,
            flags,
            fflags: 0,
            data: 0,
            udata: token as _,
        };
        // SAFETY: kev outlives the call; no event list is requested.
        let rv = unsafe { libc::kevent(self.kq_fd, &kev, 1, ptr::null_mut(), 0, ptr::null()) };
        if rv < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn apply(&self, fd: RawFd, dir: Direction, token: usize, trigger: Trigger) -> io::Result<Trigger> {
        let mut flags = libc::EV_ADD;
        if trigger == Trigger::Edge {
            flags |= libc::EV_CLEAR;
        }
        self.change(fd, direction_filter(dir), flags, token)?;
        self.entries.lock().insert((fd, dir), token);
        Ok(trigger)
    }
}

impl Backend for KqueueBackend {
    fn register(
        &self,
        fd: RawFd,
        dir: Direction,
        token: usize,
        trigger: Trigger,
    ) -> io::Result<Trigger> {
        self.apply(fd, dir, token, trigger)
    }

    fn modify(
        &self,
        fd: RawFd,
        dir: Direction,
        token: usize,
        trigger: Trigger,
    ) -> io::Result<Trigger> {
        // EV_ADD on an existing knote updates it in place; the kernel
        // does not duplicate registrations.
        self.apply(fd, dir, token, trigger)
    }

    fn unregister(&self, fd: RawFd, dir: Direction) -> io::Result<()> {
        if self.entries.lock().remove(&(fd, dir)).is_none() {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        self.change(fd, direction_filter(dir), libc::EV_DELETE, 0)
    }

    fn wait(&self, out: &mut EventBatch, max: usize, timeout: Option<Duration>) -> Result<()> {
        let cap = max.clamp(1, 1024) + 1;
        let mut buf: Vec<libc::kevent> = Vec::with_capacity(cap);
        let ts = timeout.map(timespec);
        let ts_ptr = ts.as_ref().map_or(ptr::null(), |t| t as *const _);

        // SAFETY: buf has capacity for `cap` entries; the kernel writes
        // at most that many and returns the count.
        let n = unsafe {
            libc::kevent(
                self.kq_fd,
                ptr::null(),
                0,
                buf.as_mut_ptr(),
                cap as libc::c_int,
                ts_ptr,
            )
        };
        if n < 0 {
            return Err(map_wait_error("kevent", io::Error::last_os_error()));
        }
        // SAFETY: the kernel initialized the first n entries.
        unsafe {
            buf.set_len(n as usize);
        }

        for ev in &buf {
            let token = ev.udata as usize;
            if token == WAKE_TOKEN {
                self.wake.drain();
                continue;
            }
            if out.len() >= max {
                break;
            }
            out.push(NativeEvent {
                token,
                fd: ev.ident as RawFd,
                readable: ev.filter == libc::EVFILT_READ as i16,
                writable: ev.filter == libc::EVFILT_WRITE as i16,
                error: ev.flags & libc::EV_ERROR != 0,
                hangup: ev.flags & libc::EV_EOF != 0,
            });
        }
        Ok(())
    }

    fn wake(&self) -> io::Result<()> {
        self.wake.wake()
    }

    fn wake_fd(&self) -> RawFd {
        self.wake.write_fd()
    }
}

impl Drop for KqueueBackend {
    fn drop(&mut self) {
        // SAFETY: kq_fd is exclusively owned by this backend.
        unsafe {
            libc::close(self.kq_fd);
        }
    }
}

impl std::fmt::Debug for KqueueBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KqueueBackend")
            .field("registered", &self.entries.lock().len())
            .finish_non_exhaustive()
    }
}
