//! Filesystem-path-change filter.
//!
//! The ident is an open descriptor of the watched path, matching the
//! native kqueue contract. On Linux the attach resolves the
//! descriptor's path through `/proc/self/fd`, opens a dedicated
//! inotify instance for the knote, and registers it readable, edge
//! mode, with the backend. The delivered data count is the number of
//! change notifications observed since the last delivery (consumed by
//! delivery); removal of the watched path sets the EOF outcome flag.
//!
//! Platforms without inotify report `Unsupported` at attach time.

#![allow(unsafe_code)]

use super::{AttachCx, FilterOps};
use crate::error::Result;
use crate::knote::{FilterAux, Knote, VnodeAux};

/// Behavior table for [`FilterCategory::Vnode`](super::FilterCategory::Vnode).
pub(crate) struct VnodeFilter;

#[cfg(target_os = "linux")]
const WATCH_MASK: u32 = libc::IN_ATTRIB
    | libc::IN_MODIFY
    | libc::IN_CREATE
    | libc::IN_DELETE
    | libc::IN_MOVED_FROM
    | libc::IN_MOVED_TO
    | libc::IN_MOVE_SELF
    | libc::IN_DELETE_SELF;

impl FilterOps for VnodeFilter {
    fn make_aux(&self) -> FilterAux {
        FilterAux::Vnode(VnodeAux {
            inotify_fd: -1,
            gone: false,
        })
    }

    #[cfg(target_os = "linux")]
    fn attach(&self, cx: &AttachCx<'_>, note: &mut Knote) -> Result<()> {
        use crate::backend::{Direction, Trigger};
        use crate::error::Error;
        use std::os::unix::ffi::OsStrExt;

        // The ident is an open fd of the watched path; recover the
        // path through /proc/self/fd.
        let link = format!("/proc/self/fd/{}", note.ident.value());
        let path = std::fs::read_link(&link)
            .map_err(|e| Error::backend("watched descriptor path resolution", e))?;
        let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
            .map_err(|_| Error::unsupported("watched path contains an interior NUL"))?;

        // SAFETY: plain syscall.
        let ifd = unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) };
        if ifd < 0 {
            return Err(Error::backend("inotify_init1", std::io::Error::last_os_error()));
        }
        // SAFETY: c_path is a valid NUL-terminated string.
        let wd = unsafe { libc::inotify_add_watch(ifd, c_path.as_ptr(), WATCH_MASK) };
        if wd < 0 {
            let err = std::io::Error::last_os_error();
            // SAFETY: ifd was opened above and is owned here.
            unsafe {
                libc::close(ifd);
            }
            return Err(Error::backend("inotify_add_watch", err));
        }
        if let Err(e) = cx
            .backend
            .register(ifd, Direction::Read, cx.token, Trigger::Edge)
        {
            // SAFETY: as above.
            unsafe {
                libc::close(ifd);
            }
            return Err(Error::backend("inotify registration", e));
        }
        note.vnode_aux_mut().inotify_fd = ifd;
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn attach(&self, _cx: &AttachCx<'_>, _note: &mut Knote) -> Result<()> {
        Err(crate::error::Error::unsupported(
            "vnode filter requires inotify support (Linux)",
        ))
    }

    fn update(&self, _cx: &AttachCx<'_>, _note: &mut Knote) -> Result<()> {
        // The watch is already installed; flags and udata are
        // refreshed generically.
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn translate(&self, note: &mut Knote, _native: &crate::backend::NativeEvent) -> bool {
        let ifd = note.vnode_aux().inotify_fd;
        let mut count: i64 = 0;
        let mut gone = false;
        let mut buf = [0u8; 4096];
        loop {
            // SAFETY: buf is a valid buffer; the fd is non-blocking,
            // so an empty queue returns EAGAIN.
            let n = unsafe { libc::read(ifd, buf.as_mut_ptr().cast(), buf.len()) };
            if n <= 0 {
                break;
            }
            let mut offset = 0usize;
            let header = std::mem::size_of::<libc::inotify_event>();
            while offset + header <= n as usize {
                // SAFETY: the kernel writes whole inotify_event
                // records; read_unaligned tolerates the packed layout.
                let event: libc::inotify_event = unsafe {
                    std::ptr::read_unaligned(buf.as_ptr().add(offset).cast())
                };
                if event.mask & (libc::IN_DELETE_SELF | libc::IN_MOVE_SELF | libc::IN_UNMOUNT) != 0
                {
                    gone = true;
                }
                // IN_IGNORED is watch bookkeeping, not a path change.
                if event.mask & libc::IN_IGNORED == 0 {
                    count += 1;
                }
                offset += header + event.len as usize;
            }
        }
        if gone {
            note.vnode_aux_mut().gone = true;
            note.eof = true;
        }
        note.data = note.data.saturating_add(count);
        note.data > 0 || note.eof
    }

    fn consumes_on_delivery(&self) -> bool {
        true
    }

    fn detach(&self, cx: &AttachCx<'_>, note: &mut Knote) -> Result<()> {
        #[cfg(target_os = "linux")]
        {
            use crate::backend::Direction;
            use crate::error::Error;

            let ifd = note.vnode_aux().inotify_fd;
            if ifd >= 0 {
                let result = cx
                    .backend
                    .unregister(ifd, Direction::Read)
                    .map_err(|e| Error::backend("inotify removal", e));
                // SAFETY: the inotify fd is exclusively owned by this
                // knote; closing it drops the watch.
                unsafe {
                    libc::close(ifd);
                }
                note.vnode_aux_mut().inotify_fd = -1;
                return result;
            }
        }
        let _ = (cx, note);
        Ok(())
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use crate::backend::poll::PollBackend;
    use crate::backend::NativeEvent;
    use crate::event::{EventFlags, Ident, Udata};
    use crate::filter::FilterCategory;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::time::{Duration, Instant};

    fn init_test(name: &str) {
        crate::test_utils::init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn modifications_are_counted_and_consumed() {
        init_test("vnode_modifications_are_counted_and_consumed");
        let dir = tempfile::tempdir().expect("tempdir failed");
        let path = dir.path().join("watched.txt");
        let mut file = std::fs::File::create(&path).expect("create failed");
        file.write_all(b"seed").expect("seed write failed");

        let backend = PollBackend::new().expect("failed to create backend");
        let mut note = Knote::new(
            Ident::new(file.as_raw_fd() as usize),
            FilterCategory::Vnode,
            EventFlags::NONE,
            Udata::new(0),
            VnodeFilter.make_aux(),
        );
        let cx = AttachCx {
            backend: &backend,
            token: 0,
            data_hint: 0,
            now: Instant::now(),
            timer_floor: Duration::from_millis(1),
        };
        VnodeFilter.attach(&cx, &mut note).expect("attach failed");
        note.arm();

        file.write_all(b"change").expect("change write failed");
        file.sync_all().expect("sync failed");

        let native = NativeEvent {
            token: 0,
            fd: 0,
            readable: true,
            writable: false,
            error: false,
            hangup: false,
        };
        let mut active = false;
        for _ in 0..200 {
            active = VnodeFilter.translate(&mut note, &native);
            if active {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        crate::assert_with_log!(active, "change observed", true, active);
        crate::assert_with_log!(note.data >= 1, "counted", true, note.data >= 1);

        VnodeFilter.detach(&cx, &mut note).expect("detach failed");
        crate::test_complete!("vnode_modifications_are_counted_and_consumed");
    }

    #[test]
    fn deleting_the_watched_path_sets_eof() {
        init_test("vnode_deleting_the_watched_path_sets_eof");
        let dir = tempfile::tempdir().expect("tempdir failed");
        let path = dir.path().join("doomed.txt");
        let file = std::fs::File::create(&path).expect("create failed");

        let backend = PollBackend::new().expect("failed to create backend");
        let mut note = Knote::new(
            Ident::new(file.as_raw_fd() as usize),
            FilterCategory::Vnode,
            EventFlags::NONE,
            Udata::new(0),
            VnodeFilter.make_aux(),
        );
        let cx = AttachCx {
            backend: &backend,
            token: 0,
            data_hint: 0,
            now: Instant::now(),
            timer_floor: Duration::from_millis(1),
        };
        VnodeFilter.attach(&cx, &mut note).expect("attach failed");
        note.arm();

        std::fs::remove_file(&path).expect("remove failed");

        let native = NativeEvent {
            token: 0,
            fd: 0,
            readable: true,
            writable: false,
            error: false,
            hangup: false,
        };
        let mut eof = false;
        for _ in 0..200 {
            let _ = VnodeFilter.translate(&mut note, &native);
            if note.eof {
                eof = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        crate::assert_with_log!(eof, "eof on delete", true, eof);

        VnodeFilter.detach(&cx, &mut note).expect("detach failed");
        crate::test_complete!("vnode_deleting_the_watched_path_sets_eof");
    }
}
