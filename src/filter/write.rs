//! Writable-data filter.
//!
//! The data count is the free space in the source's send buffer where
//! the host exposes it (Linux: `SO_SNDBUF` minus the `SIOCOUTQ` queued
//! byte count); elsewhere it is reported as 1, meaning "writable,
//! amount unknown". A hangup on the peer's read side sets the EOF
//! outcome flag.

#![allow(unsafe_code)]

use super::read::{clear_gate, requested_trigger};
use super::{AttachCx, FilterOps};
use crate::backend::{Direction, NativeEvent, Trigger};
use crate::error::{Error, Result};
use crate::knote::{FilterAux, IoAux, Knote};
use std::os::fd::RawFd;

/// Free send-buffer space on `fd`, at least 1 (the native layer
/// already observed writability).
#[cfg(target_os = "linux")]
pub(crate) fn send_buffer_space(fd: RawFd) -> i64 {
    let mut queued: libc::c_int = 0;
    // SAFETY: TIOCOUTQ reads into a c_int; failure falls back to 1.
    if unsafe { libc::ioctl(fd, libc::TIOCOUTQ, &mut queued) } < 0 {
        return 1;
    }
    let mut sndbuf: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: buffer and length match; failure falls back to 1.
    let rv = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            std::ptr::addr_of_mut!(sndbuf).cast(),
            &mut len,
        )
    };
    if rv < 0 {
        return 1;
    }
    i64::from(sndbuf - queued).max(1)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn send_buffer_space(_fd: RawFd) -> i64 {
    1
}

/// Behavior table for [`FilterCategory::Write`](super::FilterCategory::Write).
pub(crate) struct WriteFilter;

impl FilterOps for WriteFilter {
    fn make_aux(&self) -> FilterAux {
        FilterAux::Io(IoAux {
            trigger: Trigger::Level,
            watermark: 0,
        })
    }

    fn attach(&self, cx: &AttachCx<'_>, note: &mut Knote) -> Result<()> {
        let fd = note.ident.value() as RawFd;
        let applied = cx
            .backend
            .register(fd, Direction::Write, cx.token, requested_trigger(note))
            .map_err(|e| Error::backend("write interest registration", e))?;
        note.io_aux_mut().trigger = applied;
        Ok(())
    }

    fn update(&self, cx: &AttachCx<'_>, note: &mut Knote) -> Result<()> {
        let fd = note.ident.value() as RawFd;
        let applied = cx
            .backend
            .modify(fd, Direction::Write, cx.token, requested_trigger(note))
            .map_err(|e| Error::backend("write interest update", e))?;
        note.io_aux_mut().trigger = applied;
        Ok(())
    }

    fn translate(&self, note: &mut Knote, native: &NativeEvent) -> bool {
        if native.error {
            note.error = true;
        }
        if native.hangup {
            note.eof = true;
        }
        let space = send_buffer_space(note.ident.value() as RawFd);
        note.data = space;
        if !clear_gate(note, space) {
            return false;
        }
        native.writable || note.eof || note.error
    }

    fn clear_after_delivery(&self, note: &mut Knote) {
        let delivered = note.data;
        let io = note.io_aux_mut();
        if io.trigger == Trigger::Level {
            io.watermark = delivered;
        }
    }

    fn detach(&self, cx: &AttachCx<'_>, note: &mut Knote) -> Result<()> {
        let fd = note.ident.value() as RawFd;
        cx.backend
            .unregister(fd, Direction::Write)
            .map_err(|e| Error::backend("write interest removal", e))
    }
}
