//! The knote: one registered interest and its state machine.
//!
//! A knote is exclusively owned by its kqueue; at most one exists per
//! `(ident, filter)` pair. Its filter category is immutable after
//! creation — re-registration on the same key updates flags and data
//! but never the category.
//!
//! # State machine
//!
//! `Unregistered → Armed(enabled) ⇄ Armed(disabled) → Retired`
//!
//! Retired is terminal; the knote is removed from storage on entry.
//! One-shot delivery auto-retires; dispatch delivery auto-disables.

use crate::backend::Trigger;
use crate::error::internal_defect;
use crate::event::{EventFlags, Ident, Udata};
use crate::filter::FilterCategory;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

/// Lifecycle state of a knote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KnoteState {
    /// Created but not yet attached.
    Unregistered,
    /// Attached; produces events only while enabled.
    Armed {
        /// Disabled knotes never produce events.
        enabled: bool,
    },
    /// Terminal; the knote is deallocated on entry.
    Retired,
}

/// Category-specific auxiliary state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FilterAux {
    /// Read/write interests.
    Io(IoAux),
    /// Software countdown timer.
    Timer(TimerAux),
    /// User-posted events.
    User(UserAux),
    /// Signal deliveries.
    Signal(SignalAux),
    /// Process state change.
    Proc(ProcAux),
    /// Filesystem path change.
    Vnode(VnodeAux),
}

/// Aux state for read/write knotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IoAux {
    /// Trigger mode the backend actually applied. `Level` means clear
    /// semantics are emulated through `watermark`.
    pub trigger: Trigger,
    /// Highest data count already delivered for a clear knote on a
    /// level backend; readiness at or below it is suppressed, and a
    /// drain lowers it.
    pub watermark: i64,
}

/// Aux state for timer knotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimerAux {
    /// Firing period.
    pub period: Duration,
    /// Next deadline on the monotonic clock.
    pub deadline: Instant,
    /// Guards the timer heap against stale entries after delete/re-add.
    pub generation: u64,
    /// Expirations accumulated since the last delivery.
    pub fires: u64,
}

/// Aux state for user knotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct UserAux {
    /// Set by a TRIGGER registration; the knote reports until cleared.
    pub triggered: bool,
}

/// Aux state for signal knotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SignalAux {
    /// Index of the claimed route slot in the global signal table.
    pub slot: usize,
}

/// Aux state for process knotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ProcAux {
    /// The pidfd registered with the backend.
    pub pidfd: RawFd,
    /// The watched process has exited.
    pub exited: bool,
    /// Exit status captured at translation time.
    pub status: i64,
}

/// Aux state for vnode knotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct VnodeAux {
    /// The inotify instance registered with the backend.
    pub inotify_fd: RawFd,
    /// The watched path was removed.
    pub gone: bool,
}

/// One registered interest.
#[derive(Debug)]
pub(crate) struct Knote {
    /// Source identifier (fd, signal number, pid, or caller-chosen id).
    pub ident: Ident,
    /// Filter category. Immutable after creation.
    pub filter: FilterCategory,
    /// Behavior flags from the most recent registration.
    pub flags: EventFlags,
    /// Accumulated data count; category-specific meaning.
    pub data: i64,
    /// Opaque user token, round-tripped into delivered events.
    pub udata: Udata,
    /// Lifecycle state.
    pub state: KnoteState,
    /// Kqueue-unique serial, distinguishing this knote from a later
    /// occupant of a reused slab slot.
    pub serial: u64,
    /// The knote is currently queued on the pending FIFO.
    pub queued: bool,
    /// End-of-file condition observed on the source.
    pub eof: bool,
    /// Error condition observed on the source.
    pub error: bool,
    /// Category-specific state.
    pub aux: FilterAux,
}

impl Knote {
    /// Creates a knote in the `Unregistered` state.
    pub(crate) fn new(
        ident: Ident,
        filter: FilterCategory,
        flags: EventFlags,
        udata: Udata,
        aux: FilterAux,
    ) -> Self {
        Self {
            ident,
            filter,
            flags,
            data: 0,
            udata,
            state: KnoteState::Unregistered,
            serial: 0,
            queued: false,
            eof: false,
            error: false,
            aux,
        }
    }

    /// Arms the knote after a successful attach.
    pub(crate) fn arm(&mut self) {
        match self.state {
            KnoteState::Unregistered => self.state = KnoteState::Armed { enabled: true },
            _ => internal_defect("arm on a knote that is not Unregistered"),
        }
    }

    /// Returns true if the knote is armed and enabled.
    pub(crate) fn is_enabled(&self) -> bool {
        matches!(self.state, KnoteState::Armed { enabled: true })
    }

    /// Returns true if the knote has been retired.
    pub(crate) fn is_retired(&self) -> bool {
        matches!(self.state, KnoteState::Retired)
    }

    /// Enables a disabled knote. Idempotent on an enabled knote.
    pub(crate) fn enable(&mut self) {
        match self.state {
            KnoteState::Armed { .. } => self.state = KnoteState::Armed { enabled: true },
            _ => internal_defect("enable on a knote that is not armed"),
        }
    }

    /// Disables an armed knote. Idempotent on a disabled knote.
    pub(crate) fn disable(&mut self) {
        match self.state {
            KnoteState::Armed { .. } => self.state = KnoteState::Armed { enabled: false },
            _ => internal_defect("disable on a knote that is not armed"),
        }
    }

    /// Moves the knote to the terminal `Retired` state.
    pub(crate) fn retire(&mut self) {
        match self.state {
            KnoteState::Armed { .. } | KnoteState::Unregistered => {
                self.state = KnoteState::Retired;
            }
            KnoteState::Retired => internal_defect("retire on an already retired knote"),
        }
    }

    /// Returns true if the knote holds a condition that would produce
    /// an event were it enabled (used by enable to report accumulated
    /// readiness).
    pub(crate) fn has_pending_condition(&self) -> bool {
        if self.eof || self.error || self.data > 0 {
            return true;
        }
        match &self.aux {
            FilterAux::User(user) => user.triggered,
            FilterAux::Timer(timer) => timer.fires > 0,
            FilterAux::Proc(proc_aux) => proc_aux.exited,
            FilterAux::Vnode(vnode) => vnode.gone,
            FilterAux::Io(_) | FilterAux::Signal(_) => false,
        }
    }

    /// Mutable access to the I/O aux state.
    pub(crate) fn io_aux_mut(&mut self) -> &mut IoAux {
        match &mut self.aux {
            FilterAux::Io(io) => io,
            _ => internal_defect("I/O aux requested for a non-I/O knote"),
        }
    }

    /// Mutable access to the timer aux state.
    pub(crate) fn timer_aux_mut(&mut self) -> &mut TimerAux {
        match &mut self.aux {
            FilterAux::Timer(timer) => timer,
            _ => internal_defect("timer aux requested for a non-timer knote"),
        }
    }

    /// Shared access to the timer aux state.
    pub(crate) fn timer_aux(&self) -> &TimerAux {
        match &self.aux {
            FilterAux::Timer(timer) => timer,
            _ => internal_defect("timer aux requested for a non-timer knote"),
        }
    }

    /// Mutable access to the user aux state.
    pub(crate) fn user_aux_mut(&mut self) -> &mut UserAux {
        match &mut self.aux {
            FilterAux::User(user) => user,
            _ => internal_defect("user aux requested for a non-user knote"),
        }
    }

    /// Shared access to the signal aux state.
    pub(crate) fn signal_aux(&self) -> &SignalAux {
        match &self.aux {
            FilterAux::Signal(sig) => sig,
            _ => internal_defect("signal aux requested for a non-signal knote"),
        }
    }

    /// Mutable access to the signal aux state.
    pub(crate) fn signal_aux_mut(&mut self) -> &mut SignalAux {
        match &mut self.aux {
            FilterAux::Signal(sig) => sig,
            _ => internal_defect("signal aux requested for a non-signal knote"),
        }
    }

    /// Mutable access to the process aux state.
    pub(crate) fn proc_aux_mut(&mut self) -> &mut ProcAux {
        match &mut self.aux {
            FilterAux::Proc(p) => p,
            _ => internal_defect("proc aux requested for a non-proc knote"),
        }
    }

    /// Shared access to the process aux state.
    pub(crate) fn proc_aux(&self) -> &ProcAux {
        match &self.aux {
            FilterAux::Proc(p) => p,
            _ => internal_defect("proc aux requested for a non-proc knote"),
        }
    }

    /// Mutable access to the vnode aux state.
    pub(crate) fn vnode_aux_mut(&mut self) -> &mut VnodeAux {
        match &mut self.aux {
            FilterAux::Vnode(v) => v,
            _ => internal_defect("vnode aux requested for a non-vnode knote"),
        }
    }

    /// Shared access to the vnode aux state.
    pub(crate) fn vnode_aux(&self) -> &VnodeAux {
        match &self.aux {
            FilterAux::Vnode(v) => v,
            _ => internal_defect("vnode aux requested for a non-vnode knote"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_test(name: &str) {
        crate::test_utils::init_test_logging();
        crate::test_phase!(name);
    }

    fn io_knote() -> Knote {
        Knote::new(
            Ident::new(4),
            FilterCategory::Read,
            EventFlags::NONE,
            Udata::new(0),
            FilterAux::Io(IoAux {
                trigger: Trigger::Level,
                watermark: 0,
            }),
        )
    }

    #[test]
    fn lifecycle_transitions() {
        init_test("knote_lifecycle_transitions");
        let mut note = io_knote();
        assert_eq!(note.state, KnoteState::Unregistered);
        assert!(!note.is_enabled());

        note.arm();
        assert!(note.is_enabled());

        note.disable();
        assert!(!note.is_enabled());
        assert!(!note.is_retired());

        note.enable();
        assert!(note.is_enabled());

        note.retire();
        assert!(note.is_retired());
        crate::test_complete!("knote_lifecycle_transitions");
    }

    #[test]
    fn retire_from_disabled_state() {
        init_test("knote_retire_from_disabled_state");
        let mut note = io_knote();
        note.arm();
        note.disable();
        note.retire();
        assert!(note.is_retired());
        crate::test_complete!("knote_retire_from_disabled_state");
    }

    #[test]
    #[should_panic(expected = "kqport internal defect")]
    fn double_retire_is_a_defect() {
        let mut note = io_knote();
        note.arm();
        note.retire();
        note.retire();
    }

    #[test]
    #[should_panic(expected = "kqport internal defect")]
    fn enable_before_arm_is_a_defect() {
        let mut note = io_knote();
        note.enable();
    }

    #[test]
    #[should_panic(expected = "kqport internal defect")]
    fn wrong_category_aux_is_a_defect() {
        let mut note = io_knote();
        let _ = note.timer_aux_mut();
    }

    #[test]
    fn pending_condition_reflects_aux() {
        init_test("knote_pending_condition_reflects_aux");
        let mut note = io_knote();
        assert!(!note.has_pending_condition());
        note.data = 3;
        assert!(note.has_pending_condition());

        let mut user = Knote::new(
            Ident::new(1),
            FilterCategory::User,
            EventFlags::NONE,
            Udata::new(0),
            FilterAux::User(UserAux { triggered: false }),
        );
        assert!(!user.has_pending_condition());
        user.user_aux_mut().triggered = true;
        assert!(user.has_pending_condition());
        crate::test_complete!("knote_pending_condition_reflects_aux");
    }
}
