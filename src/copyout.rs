//! The translation/copyout protocol.
//!
//! One procedure converts an active knote into a caller-visible event
//! record and applies the re-arming rules, uniformly for
//! native-translated and software-originated events. Policy by flag,
//! evaluated in this precedence:
//!
//! 1. disabled — no event is produced (the condition keeps
//!    accumulating for a later enable)
//! 2. one-shot — deliver, then retire (the caller detaches and
//!    deallocates)
//! 3. dispatch-once — deliver, then disable until an explicit enable
//! 4. clear — deliver, then reset the accumulated count so an
//!    unchanged condition does not re-fire
//! 5. level (default) — deliver and stay armed; the knote re-fires on
//!    every retrieval while the condition holds
//!
//! Counts that are defined as "since last delivery" (timer fires,
//! signal deliveries, vnode notifications) are consumed by delivery
//! even without the clear flag.

use crate::event::{Event, EventFlags};
use crate::filter;
use crate::knote::Knote;

/// Produces the event record for an active knote and applies the
/// re-arming rules. Returns `None` for a disabled knote.
///
/// The caller owns the aftermath of retirement: a knote left in the
/// retired state must be detached and removed from storage.
pub(crate) fn deliver(note: &mut Knote) -> Option<Event> {
    if !note.is_enabled() {
        return None;
    }
    let ops = filter::ops(note.filter);
    let (data, flags) = ops.event_data(note);
    let event = Event {
        ident: note.ident,
        filter: note.filter,
        flags,
        data,
        udata: note.udata,
    };

    if ops.consumes_on_delivery() || note.flags.contains(EventFlags::CLEAR) {
        ops.clear_after_delivery(note);
        note.data = 0;
    }
    if note.flags.contains(EventFlags::ONESHOT) {
        note.retire();
    } else if note.flags.contains(EventFlags::DISPATCH) {
        note.disable();
    }
    Some(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Trigger;
    use crate::event::{Ident, Udata};
    use crate::filter::FilterCategory;
    use crate::knote::{FilterAux, IoAux, TimerAux, UserAux};
    use std::time::{Duration, Instant};

    fn init_test(name: &str) {
        crate::test_utils::init_test_logging();
        crate::test_phase!(name);
    }

    fn armed_note(filter: FilterCategory, flags: EventFlags, aux: FilterAux) -> Knote {
        let mut note = Knote::new(Ident::new(9), filter, flags, Udata::new(77), aux);
        note.arm();
        note
    }

    fn io_aux() -> FilterAux {
        FilterAux::Io(IoAux {
            trigger: Trigger::Level,
            watermark: 0,
        })
    }

    #[test]
    fn disabled_knote_produces_nothing() {
        init_test("copyout_disabled_knote_produces_nothing");
        let mut note = armed_note(FilterCategory::Read, EventFlags::NONE, io_aux());
        note.data = 4;
        note.disable();
        assert!(deliver(&mut note).is_none());
        // The condition is preserved for a later enable.
        assert_eq!(note.data, 4);
        crate::test_complete!("copyout_disabled_knote_produces_nothing");
    }

    #[test]
    fn level_delivery_keeps_state() {
        init_test("copyout_level_delivery_keeps_state");
        let mut note = armed_note(FilterCategory::Read, EventFlags::NONE, io_aux());
        note.data = 10;
        let event = deliver(&mut note).expect("event expected");
        assert_eq!(event.data, 10);
        assert_eq!(event.udata.value(), 77);
        assert!(note.is_enabled());
        assert_eq!(note.data, 10);
        crate::test_complete!("copyout_level_delivery_keeps_state");
    }

    #[test]
    fn oneshot_delivery_retires() {
        init_test("copyout_oneshot_delivery_retires");
        let mut note = armed_note(FilterCategory::Read, EventFlags::ONESHOT, io_aux());
        note.data = 1;
        let event = deliver(&mut note).expect("event expected");
        assert_eq!(event.data, 1);
        assert!(note.is_retired());
        crate::test_complete!("copyout_oneshot_delivery_retires");
    }

    #[test]
    fn dispatch_delivery_disables() {
        init_test("copyout_dispatch_delivery_disables");
        let mut note = armed_note(FilterCategory::Read, EventFlags::DISPATCH, io_aux());
        note.data = 2;
        let _ = deliver(&mut note).expect("event expected");
        assert!(!note.is_enabled());
        assert!(!note.is_retired());
        crate::test_complete!("copyout_dispatch_delivery_disables");
    }

    #[test]
    fn clear_delivery_resets_data() {
        init_test("copyout_clear_delivery_resets_data");
        let mut note = armed_note(FilterCategory::Read, EventFlags::CLEAR, io_aux());
        note.data = 3;
        let event = deliver(&mut note).expect("event expected");
        assert_eq!(event.data, 3);
        assert_eq!(note.data, 0);
        assert!(note.is_enabled());
        crate::test_complete!("copyout_clear_delivery_resets_data");
    }

    #[test]
    fn oneshot_takes_precedence_over_dispatch() {
        init_test("copyout_oneshot_takes_precedence_over_dispatch");
        let mut note = armed_note(
            FilterCategory::Read,
            EventFlags::ONESHOT | EventFlags::DISPATCH,
            io_aux(),
        );
        note.data = 1;
        let _ = deliver(&mut note).expect("event expected");
        assert!(note.is_retired());
        crate::test_complete!("copyout_oneshot_takes_precedence_over_dispatch");
    }

    #[test]
    fn timer_counts_are_consumed_without_clear() {
        init_test("copyout_timer_counts_are_consumed_without_clear");
        let mut note = armed_note(
            FilterCategory::Timer,
            EventFlags::NONE,
            FilterAux::Timer(TimerAux {
                period: Duration::from_millis(5),
                deadline: Instant::now(),
                generation: 0,
                fires: 3,
            }),
        );
        note.data = 3;
        let event = deliver(&mut note).expect("event expected");
        assert_eq!(event.data, 3);
        assert_eq!(note.data, 0);
        assert_eq!(note.timer_aux().fires, 0);
        crate::test_complete!("copyout_timer_counts_are_consumed_without_clear");
    }

    #[test]
    fn eof_and_error_surface_in_outcome_flags() {
        init_test("copyout_eof_and_error_surface_in_outcome_flags");
        let mut note = armed_note(FilterCategory::Read, EventFlags::NONE, io_aux());
        note.eof = true;
        note.error = true;
        let event = deliver(&mut note).expect("event expected");
        assert!(event.is_eof());
        assert!(event.is_error());
        crate::test_complete!("copyout_eof_and_error_surface_in_outcome_flags");
    }

    #[test]
    fn triggered_user_note_persists_without_clear() {
        init_test("copyout_triggered_user_note_persists_without_clear");
        let mut note = armed_note(
            FilterCategory::User,
            EventFlags::NONE,
            FilterAux::User(UserAux { triggered: true }),
        );
        note.data = 5;
        let _ = deliver(&mut note).expect("event expected");
        // Still triggered: the knote re-fires on the next retrieval.
        assert!(note.has_pending_condition());
        crate::test_complete!("copyout_triggered_user_note_persists_without_clear");
    }
}
