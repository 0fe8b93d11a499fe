//! Linux epoll-based backend.
//!
//! epoll keys registrations by descriptor, not by (descriptor,
//! direction) the way kqueue filters do, so this adapter keeps one
//! epoll entry per descriptor and merges the read/write direction
//! registrations into a combined interest mask. Each direction carries
//! its own token; one native readiness record is re-emitted per ready
//! direction so the translation layer never has to split them.
//!
//! Edge mode is not passed down to epoll: the adapter always registers
//! level-triggered and reports [`Trigger::Level`] back, and the knote
//! layer emulates clear semantics with its data watermark. This keeps
//! mixed level/edge interest on one descriptor well-defined.
//!
//! # Thread Safety
//!
//! Registration changes made while another thread is blocked in
//! [`wait`](super::Backend::wait) are picked up by the kernel
//! immediately; no wake is needed for them.

#![allow(unsafe_code)]

use super::{
    map_wait_error, timeout_millis, Backend, Direction, EventBatch, NativeEvent, Trigger,
    WakePipe, WAKE_TOKEN,
};
use crate::error::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Per-descriptor registration state: the token for each direction
/// that currently holds an interest.
#[derive(Debug, Default, Clone, Copy)]
struct FdEntry {
    read: Option<usize>,
    write: Option<usize>,
}

impl FdEntry {
    fn is_empty(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }

    fn mask(&self) -> u32 {
        let mut events = 0u32;
        if self.read.is_some() {
            events |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
        }
        if self.write.is_some() {
            events |= libc::EPOLLOUT as u32;
        }
        events
    }
}

/// Linux epoll backend.
pub struct EpollBackend {
    /// The epoll instance descriptor.
    ep_fd: RawFd,
    /// Self-pipe for cross-thread and signal-handler wakeups.
    wake: WakePipe,
    /// Maps descriptors to their merged direction registrations.
    entries: Mutex<HashMap<RawFd, FdEntry>>,
}

impl EpollBackend {
    /// Creates a new epoll backend with its wake pipe registered.
    ///
    /// # Errors
    ///
    /// Returns an error if `epoll_create1` or the wake pipe setup
    /// fails (e.g. out of file descriptors).
    pub fn new() -> io::Result<Self> {
        // SAFETY: plain syscall, no pointers.
        let ep_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if ep_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let wake = match WakePipe::new() {
            Ok(w) => w,
            Err(e) => {
                // SAFETY: ep_fd was just created and is owned here.
                unsafe {
                    libc::close(ep_fd);
                }
                return Err(e);
            }
        };

        let backend = Self {
            ep_fd,
            wake,
            entries: Mutex::new(HashMap::new()),
        };
        backend.ctl(
            libc::EPOLL_CTL_ADD,
            backend.wake.read_fd(),
            libc::EPOLLIN as u32,
            WAKE_TOKEN as u64,
        )?;
        Ok(backend)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, data: u64) -> io::Result<()> {
        let mut ev = libc::epoll_event { events, u64: data };
        // SAFETY: ev outlives the call; fd validity is the caller's
        // contract (a stale fd surfaces as EBADF, reported upward).
        let rv = unsafe { libc::epoll_ctl(self.ep_fd, op, fd, &mut ev) };
        if rv < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Applies the merged mask for `fd`, adding, modifying, or
    /// deleting the native entry as the merge dictates.
    fn apply(&self, fd: RawFd, entry: FdEntry, existed: bool) -> io::Result<()> {
        if entry.is_empty() {
            return self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0);
        }
        let op = if existed {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        self.ctl(op, fd, entry.mask(), fd as u64)
    }

    fn upsert(&self, fd: RawFd, dir: Direction, token: usize) -> io::Result<Trigger> {
        let mut entries = self.entries.lock();
        let existed = entries.contains_key(&fd);
        let mut entry = entries.get(&fd).copied().unwrap_or_default();
        match dir {
            Direction::Read => entry.read = Some(token),
            Direction::Write => entry.write = Some(token),
        }
        self.apply(fd, entry, existed)?;
        entries.insert(fd, entry);
        Ok(Trigger::Level)
    }
}

impl Backend for EpollBackend {
    fn register(
        &self,
        fd: RawFd,
        dir: Direction,
        token: usize,
        _trigger: Trigger,
    ) -> io::Result<Trigger> {
        self.upsert(fd, dir, token)
    }

    fn modify(
        &self,
        fd: RawFd,
        dir: Direction,
        token: usize,
        _trigger: Trigger,
    ) -> io::Result<Trigger> {
        self.upsert(fd, dir, token)
    }

    fn unregister(&self, fd: RawFd, dir: Direction) -> io::Result<()> {
        let mut entries = self.entries.lock();
        let Some(mut entry) = entries.get(&fd).copied() else {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        };
        match dir {
            Direction::Read => entry.read = None,
            Direction::Write => entry.write = None,
        }
        let result = self.apply(fd, entry, true);
        if entry.is_empty() {
            entries.remove(&fd);
        } else {
            entries.insert(fd, entry);
        }
        // Bookkeeping is updated even when the native call failed: a
        // descriptor closed behind our back (EBADF) was already
        // dropped from the epoll set by the kernel.
        result
    }

    fn wait(&self, out: &mut EventBatch, max: usize, timeout: Option<Duration>) -> Result<()> {
        let cap = max.clamp(1, 1024) + 1;
        let mut buf: Vec<libc::epoll_event> = Vec::with_capacity(cap);

        // SAFETY: buf has capacity for `cap` entries; epoll_wait writes
        // at most that many and returns the count.
        let n = unsafe {
            libc::epoll_wait(
                self.ep_fd,
                buf.as_mut_ptr(),
                cap as libc::c_int,
                timeout_millis(timeout),
            )
        };
        if n < 0 {
            return Err(map_wait_error("epoll_wait", io::Error::last_os_error()));
        }
        // SAFETY: the kernel initialized the first n entries.
        unsafe {
            buf.set_len(n as usize);
        }

        let entries = self.entries.lock();
        for ev in &buf {
            if ev.u64 == WAKE_TOKEN as u64 {
                self.wake.drain();
                continue;
            }
            let fd = ev.u64 as RawFd;
            // A concurrently deleted registration can still surface
            // one last time; skip it rather than invent a token.
            let Some(entry) = entries.get(&fd) else {
                continue;
            };
            let events = ev.events;
            let error = events & libc::EPOLLERR as u32 != 0;
            let hangup = events & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0;
            let readable = events & libc::EPOLLIN as u32 != 0;
            let writable = events & libc::EPOLLOUT as u32 != 0;

            if let Some(token) = entry.read {
                if (readable || hangup || error) && out.len() < max {
                    out.push(NativeEvent {
                        token,
                        fd,
                        readable: true,
                        writable: false,
                        error,
                        hangup,
                    });
                }
            }
            if let Some(token) = entry.write {
                if (writable || error) && out.len() < max {
                    out.push(NativeEvent {
                        token,
                        fd,
                        readable: false,
                        writable: true,
                        error,
                        hangup,
                    });
                }
            }
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

impl Drop for EpollBackend {
    fn drop(&mut self) {
        // SAFETY: ep_fd is exclusively owned by this backend.
        unsafe {
            libc::close(self.ep_fd);
        }
    }
}

impl std::fmt::Debug for EpollBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpollBackend")
            .field("registered_fds", &self.entries.lock().len())
            .finish_non_exhaustive()
    }
}
