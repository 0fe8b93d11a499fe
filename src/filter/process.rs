//! Process-state-change filter.
//!
//! Watches a process id for exit. On Linux the attach opens a pidfd
//! (`pidfd_open`) and registers it readable, edge mode, with the
//! backend; translation captures the exit status with
//! `waitid(WNOWAIT)` so the caller's own child reaping is
//! undisturbed. The delivered data count is the exit status and the
//! EOF outcome flag marks the exit.
//!
//! Platforms without pidfd report `Unsupported` at attach time.

#![allow(unsafe_code)]

use super::{AttachCx, FilterOps};
use crate::error::Result;
use crate::knote::{FilterAux, Knote, ProcAux};

/// Behavior table for [`FilterCategory::Proc`](super::FilterCategory::Proc).
pub(crate) struct ProcFilter;

impl FilterOps for ProcFilter {
    fn make_aux(&self) -> FilterAux {
        FilterAux::Proc(ProcAux {
            pidfd: -1,
            exited: false,
            status: 0,
        })
    }

    #[cfg(target_os = "linux")]
    fn attach(&self, cx: &AttachCx<'_>, note: &mut Knote) -> Result<()> {
        use crate::backend::{Direction, Trigger};
        use crate::error::Error;
        use std::os::fd::RawFd;

        let pid = note.ident.value() as libc::pid_t;
        // SAFETY: plain syscall; an unknown pid is reported as ESRCH.
        let pidfd =
            unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0 as libc::c_uint) } as RawFd;
        if pidfd < 0 {
            return Err(Error::backend("pidfd_open", std::io::Error::last_os_error()));
        }
        // Exit is a one-time edge; never re-reported as level state.
        if let Err(e) = cx
            .backend
            .register(pidfd, Direction::Read, cx.token, Trigger::Edge)
        {
            // SAFETY: pidfd was opened above and is owned here.
            unsafe {
                libc::close(pidfd);
            }
            return Err(Error::backend("pidfd registration", e));
        }
        note.proc_aux_mut().pidfd = pidfd;
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn attach(&self, _cx: &AttachCx<'_>, _note: &mut Knote) -> Result<()> {
        Err(crate::error::Error::unsupported(
            "process filter requires pidfd support (Linux)",
        ))
    }

    fn update(&self, _cx: &AttachCx<'_>, _note: &mut Knote) -> Result<()> {
        // The pidfd registration is already in place; flags and udata
        // are refreshed generically.
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn translate(&self, note: &mut Knote, _native: &crate::backend::NativeEvent) -> bool {
        let aux = note.proc_aux_mut();
        if aux.exited {
            // The exit was already delivered; a level backend keeps
            // re-reporting the readable pidfd.
            return false;
        }
        // SAFETY: zeroed siginfo is the documented input; WNOWAIT
        // leaves the zombie for the caller to reap.
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let rv = unsafe {
            libc::waitid(
                libc::P_PIDFD,
                aux.pidfd as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOHANG | libc::WNOWAIT,
            )
        };
        // With WNOHANG a zero return and a zeroed si_pid means no
        // state change yet.
        // SAFETY: si_pid/si_status are valid for CLD_* results.
        if rv != 0 || unsafe { info.si_pid() } == 0 {
            return false;
        }
        aux.status = i64::from(unsafe { info.si_status() });
        aux.exited = true;
        note.data = aux.status;
        note.eof = true;
        true
    }

    fn event_data(&self, note: &mut Knote) -> (i64, crate::event::EventFlags) {
        use crate::event::EventFlags;
        let mut flags = EventFlags::NONE;
        if note.eof {
            flags |= EventFlags::EOF;
        }
        if note.error {
            flags |= EventFlags::ERROR;
        }
        (note.proc_aux().status, flags)
    }

    fn detach(&self, cx: &AttachCx<'_>, note: &mut Knote) -> Result<()> {
        #[cfg(target_os = "linux")]
        {
            use crate::backend::Direction;
            use crate::error::Error;

            let pidfd = note.proc_aux().pidfd;
            if pidfd >= 0 {
                let result = cx
                    .backend
                    .unregister(pidfd, Direction::Read)
                    .map_err(|e| Error::backend("pidfd removal", e));
                // SAFETY: pidfd is exclusively owned by this knote.
                unsafe {
                    libc::close(pidfd);
                }
                note.proc_aux_mut().pidfd = -1;
                return result;
            }
        }
        let _ = (cx, note);
        Ok(())
    }
}
