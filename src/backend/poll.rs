//! Portable poll(2) fallback backend.
//!
//! poll(2) has no persistent registration set, so each wait call
//! snapshots the current registrations into a pollfd array. A
//! registration change made while another thread is blocked in the
//! wait cannot alter that snapshot; the change therefore wakes the
//! waiter through the wake pipe so the next pass polls the updated
//! set.
//!
//! The backend is level-only: every edge request is downgraded and
//! reported as [`Trigger::Level`], and the knote layer's data
//! watermark provides the clear semantics.

#![allow(unsafe_code)]

use super::{
    map_wait_error, timeout_millis, Backend, Direction, EventBatch, NativeEvent, Trigger,
    WakePipe,
};
use crate::error::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Per-descriptor registration state, merged across directions.
#[derive(Debug, Default, Clone, Copy)]
struct FdEntry {
    read: Option<usize>,
    write: Option<usize>,
}

impl FdEntry {
    fn is_empty(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }

    fn mask(&self) -> libc::c_short {
        let mut events: libc::c_short = 0;
        if self.read.is_some() {
            events |= libc::POLLIN;
        }
        if self.write.is_some() {
            events |= libc::POLLOUT;
        }
        events
    }
}

/// poll(2) backend.
pub struct PollBackend {
    /// Self-pipe; doubles as the snapshot-refresh kick.
    wake: WakePipe,
    /// Maps descriptors to their merged direction registrations.
    entries: Mutex<HashMap<RawFd, FdEntry>>,
}

impl PollBackend {
    /// Creates a new poll backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the wake pipe cannot be created.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            wake: WakePipe::new()?,
            entries: Mutex::new(HashMap::new()),
        })
    }

    fn upsert(&self, fd: RawFd, dir: Direction, token: usize) -> io::Result<Trigger> {
        {
            let mut entries = self.entries.lock();
            let entry = entries.entry(fd).or_default();
            match dir {
                Direction::Read => entry.read = Some(token),
                Direction::Write => entry.write = Some(token),
            }
        }
        // Refresh any in-flight snapshot.
        self.wake.wake()?;
        Ok(Trigger::Level)
    }
}

impl Backend for PollBackend {
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
        {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(&fd) else {
                return Err(io::Error::from_raw_os_error(libc::ENOENT));
            };
            match dir {
                Direction::Read => entry.read = None,
                Direction::Write => entry.write = None,
            }
            if entry.is_empty() {
                entries.remove(&fd);
            }
        }
        self.wake.wake()
    }

    fn wait(&self, out: &mut EventBatch, max: usize, timeout: Option<Duration>) -> Result<()> {
        // Snapshot the registration set; slot 0 is the wake pipe.
        let mut pollfds: Vec<libc::pollfd> = vec![libc::pollfd {
            fd: self.wake.read_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        {
            let entries = self.entries.lock();
            pollfds.reserve(entries.len());
            for (&fd, entry) in entries.iter() {
                pollfds.push(libc::pollfd {
                    fd,
                    events: entry.mask(),
                    revents: 0,
                });
            }
        }

        // SAFETY: pollfds is a valid array of initialized pollfd.
        let n = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                timeout_millis(timeout),
            )
        };
        if n < 0 {
            return Err(map_wait_error("poll", io::Error::last_os_error()));
        }
        if n == 0 {
            return Ok(());
        }

        if pollfds[0].revents != 0 {
            self.wake.drain();
        }

        let entries = self.entries.lock();
        for pfd in &pollfds[1..] {
            if pfd.revents == 0 {
                continue;
            }
            // The registration may have changed since the snapshot.
            let Some(entry) = entries.get(&pfd.fd) else {
                continue;
            };
            let revents = pfd.revents;
            let error = revents & (libc::POLLERR | libc::POLLNVAL) != 0;
            let hangup = revents & libc::POLLHUP != 0;
            let readable = revents & libc::POLLIN != 0;
            let writable = revents & libc::POLLOUT != 0;

            if let Some(token) = entry.read {
                if (readable || hangup || error) && out.len() < max {
                    out.push(NativeEvent {
                        token,
                        fd: pfd.fd,
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
                        fd: pfd.fd,
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

impl std::fmt::Debug for PollBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollBackend")
            .field("registered_fds", &self.entries.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    fn init_test(name: &str) {
        crate::test_utils::init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn edge_request_is_downgraded() {
        init_test("poll_edge_request_is_downgraded");
        let backend = PollBackend::new().expect("failed to create backend");
        let (sock1, _sock2) = UnixStream::pair().expect("socketpair failed");
        let applied = backend
            .register(sock1.as_raw_fd(), Direction::Read, 1, Trigger::Edge)
            .expect("register failed");
        crate::assert_with_log!(
            applied == Trigger::Level,
            "downgraded to level",
            Trigger::Level,
            applied
        );
        crate::test_complete!("poll_edge_request_is_downgraded");
    }

    #[test]
    fn readable_event_round_trips_token() {
        init_test("poll_readable_event_round_trips_token");
        let backend = PollBackend::new().expect("failed to create backend");
        let (sock1, mut sock2) = UnixStream::pair().expect("socketpair failed");

        backend
            .register(sock1.as_raw_fd(), Direction::Read, 9, Trigger::Level)
            .expect("register failed");
        sock2.write_all(b"x").expect("write failed");

        let mut out = EventBatch::new();
        backend
            .wait(&mut out, 8, Some(Duration::from_millis(200)))
            .expect("wait failed");
        crate::assert_with_log!(out.len() == 1, "one event", 1usize, out.len());
        crate::assert_with_log!(out[0].token == 9, "token", 9usize, out[0].token);
        crate::test_complete!("poll_readable_event_round_trips_token");
    }

    #[test]
    fn wait_timeout_returns_empty() {
        init_test("poll_wait_timeout_returns_empty");
        let backend = PollBackend::new().expect("failed to create backend");
        let mut out = EventBatch::new();
        backend
            .wait(&mut out, 8, Some(Duration::from_millis(20)))
            .expect("wait failed");
        crate::assert_with_log!(out.is_empty(), "no events", true, out.is_empty());
        crate::test_complete!("poll_wait_timeout_returns_empty");
    }

    #[test]
    fn register_kicks_inflight_snapshot() {
        init_test("poll_register_kicks_inflight_snapshot");
        let backend = PollBackend::new().expect("failed to create backend");
        let (sock1, mut sock2) = UnixStream::pair().expect("socketpair failed");
        sock2.write_all(b"x").expect("write failed");

        std::thread::scope(|s| {
            let backend_ref = &backend;
            let fd = sock1.as_raw_fd();
            s.spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                backend_ref
                    .register(fd, Direction::Read, 5, Trigger::Level)
                    .expect("register failed");
            });

            // First wait is kicked by the registration; a second pass
            // over the refreshed snapshot sees the readable socket.
            let mut out = EventBatch::new();
            let start = std::time::Instant::now();
            backend
                .wait(&mut out, 8, Some(Duration::from_secs(5)))
                .expect("first wait failed");
            assert!(start.elapsed() < Duration::from_secs(1));
            if out.is_empty() {
                backend
                    .wait(&mut out, 8, Some(Duration::from_millis(200)))
                    .expect("second wait failed");
            }
            crate::assert_with_log!(out.len() == 1, "one event", 1usize, out.len());
            crate::assert_with_log!(out[0].token == 5, "token", 5usize, out[0].token);
        });
        crate::test_complete!("poll_register_kicks_inflight_snapshot");
    }
}
