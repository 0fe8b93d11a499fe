//! Readable-data filter.
//!
//! The data count is the number of bytes currently available to read,
//! probed with `FIONREAD` at translation time. An end-of-file
//! condition on the peer is reported through the EOF outcome flag
//! rather than as an error: the knote stays readable with no further
//! bytes to come.

#![allow(unsafe_code)]

use super::{AttachCx, FilterOps};
use crate::backend::{Direction, NativeEvent, Trigger};
use crate::error::{Error, Result};
use crate::event::EventFlags;
use crate::knote::{FilterAux, IoAux, Knote};
use std::os::fd::RawFd;

/// Bytes available to read on `fd`; zero when the probe fails (the
/// readiness itself was already observed natively).
pub(crate) fn readable_bytes(fd: RawFd) -> i64 {
    let mut available: libc::c_int = 0;
    // SAFETY: FIONREAD reads into a c_int; fd validity is probed, not
    // assumed (a failure just yields 0).
    let rv = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut available) };
    if rv < 0 {
        0
    } else {
        i64::from(available)
    }
}

/// Requested trigger mode for an I/O knote: hardware edge when the
/// clear flag asks for it, level otherwise.
pub(crate) fn requested_trigger(note: &Knote) -> Trigger {
    if note.flags.contains(EventFlags::CLEAR) {
        Trigger::Edge
    } else {
        Trigger::Level
    }
}

/// Shared clear-emulation gate for I/O knotes on level backends.
///
/// Returns false (suppress) when the observed count does not exceed
/// the watermark left by the previous delivery; a drained count lowers
/// the watermark so later growth fires again.
pub(crate) fn clear_gate(note: &mut Knote, observed: i64) -> bool {
    if !note.flags.contains(EventFlags::CLEAR) || note.eof || note.error {
        return true;
    }
    let io = note.io_aux_mut();
    if io.trigger == Trigger::Edge {
        return true;
    }
    if observed <= io.watermark {
        io.watermark = observed;
        return false;
    }
    true
}

/// Behavior table for [`FilterCategory::Read`](super::FilterCategory::Read).
pub(crate) struct ReadFilter;

impl FilterOps for ReadFilter {
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
            .register(fd, Direction::Read, cx.token, requested_trigger(note))
            .map_err(|e| Error::backend("read interest registration", e))?;
        note.io_aux_mut().trigger = applied;
        Ok(())
    }

    fn update(&self, cx: &AttachCx<'_>, note: &mut Knote) -> Result<()> {
        let fd = note.ident.value() as RawFd;
        let applied = cx
            .backend
            .modify(fd, Direction::Read, cx.token, requested_trigger(note))
            .map_err(|e| Error::backend("read interest update", e))?;
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
        let available = readable_bytes(note.ident.value() as RawFd);
        note.data = available;
        if !clear_gate(note, available) {
            return false;
        }
        available > 0 || note.eof || note.error
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
            .unregister(fd, Direction::Read)
            .map_err(|e| Error::backend("read interest removal", e))
    }
}
