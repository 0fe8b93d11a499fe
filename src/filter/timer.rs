//! Timer filter.
//!
//! Timers are pure software state: no native registration is
//! installed. The registration data-hint is the period in
//! milliseconds; deadlines run on the monotonic clock. The data count
//! delivered with each event is the number of expirations since the
//! last delivery (a timer that fell behind catches up in one burst
//! rather than queueing separate events), and delivery consumes the
//! count.
//!
//! Re-adding an existing timer restarts it: the period is re-read
//! from the data-hint and the countdown begins anew.

use super::{AttachCx, FilterOps};
use crate::error::Result;
use crate::knote::{FilterAux, Knote, TimerAux};
use std::time::{Duration, Instant};

/// Behavior table for [`FilterCategory::Timer`](super::FilterCategory::Timer).
pub(crate) struct TimerFilter;

fn restart(cx: &AttachCx<'_>, note: &mut Knote) {
    let hint_ms = u64::try_from(cx.data_hint).unwrap_or(0);
    let period = Duration::from_millis(hint_ms).max(cx.timer_floor);
    let timer = note.timer_aux_mut();
    timer.period = period;
    timer.deadline = cx.now + period;
    timer.fires = 0;
    note.data = 0;
}

impl FilterOps for TimerFilter {
    fn make_aux(&self) -> FilterAux {
        FilterAux::Timer(TimerAux {
            period: Duration::ZERO,
            deadline: Instant::now(),
            generation: 0,
            fires: 0,
        })
    }

    fn attach(&self, cx: &AttachCx<'_>, note: &mut Knote) -> Result<()> {
        restart(cx, note);
        Ok(())
    }

    fn update(&self, cx: &AttachCx<'_>, note: &mut Knote) -> Result<()> {
        restart(cx, note);
        Ok(())
    }

    fn consumes_on_delivery(&self) -> bool {
        true
    }

    fn clear_after_delivery(&self, note: &mut Knote) {
        note.timer_aux_mut().fires = 0;
    }

    fn detach(&self, _cx: &AttachCx<'_>, note: &mut Knote) -> Result<()> {
        // The heap entry is invalidated by the generation guard; only
        // the counters need discarding.
        note.timer_aux_mut().fires = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::poll::PollBackend;
    use crate::event::{EventFlags, Ident, Udata};
    use crate::filter::FilterCategory;

    fn init_test(name: &str) {
        crate::test_utils::init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn attach_arms_the_countdown() {
        init_test("timer_attach_arms_the_countdown");
        let backend = PollBackend::new().expect("failed to create backend");
        let mut note = Knote::new(
            Ident::new(1),
            FilterCategory::Timer,
            EventFlags::NONE,
            Udata::new(0),
            TimerFilter.make_aux(),
        );
        let now = Instant::now();
        let cx = AttachCx {
            backend: &backend,
            token: 0,
            data_hint: 25,
            now,
            timer_floor: Duration::from_millis(1),
        };
        TimerFilter.attach(&cx, &mut note).expect("attach failed");
        note.arm();

        let timer = note.timer_aux();
        crate::assert_with_log!(
            timer.period == Duration::from_millis(25),
            "period",
            Duration::from_millis(25),
            timer.period
        );
        crate::assert_with_log!(
            timer.deadline == now + Duration::from_millis(25),
            "deadline",
            now + Duration::from_millis(25),
            timer.deadline
        );
        crate::test_complete!("timer_attach_arms_the_countdown");
    }

    #[test]
    fn zero_hint_is_floored() {
        init_test("timer_zero_hint_is_floored");
        let backend = PollBackend::new().expect("failed to create backend");
        let mut note = Knote::new(
            Ident::new(1),
            FilterCategory::Timer,
            EventFlags::NONE,
            Udata::new(0),
            TimerFilter.make_aux(),
        );
        let cx = AttachCx {
            backend: &backend,
            token: 0,
            data_hint: 0,
            now: Instant::now(),
            timer_floor: Duration::from_millis(1),
        };
        TimerFilter.attach(&cx, &mut note).expect("attach failed");
        crate::assert_with_log!(
            note.timer_aux().period == Duration::from_millis(1),
            "floored period",
            Duration::from_millis(1),
            note.timer_aux().period
        );
        crate::test_complete!("timer_zero_hint_is_floored");
    }

    #[test]
    fn update_restarts_and_discards_accumulated_fires() {
        init_test("timer_update_restarts_and_discards_accumulated_fires");
        let backend = PollBackend::new().expect("failed to create backend");
        let mut note = Knote::new(
            Ident::new(1),
            FilterCategory::Timer,
            EventFlags::NONE,
            Udata::new(0),
            TimerFilter.make_aux(),
        );
        let cx = AttachCx {
            backend: &backend,
            token: 0,
            data_hint: 10,
            now: Instant::now(),
            timer_floor: Duration::from_millis(1),
        };
        TimerFilter.attach(&cx, &mut note).expect("attach failed");
        note.arm();
        note.timer_aux_mut().fires = 3;
        note.data = 3;

        let cx = AttachCx {
            backend: &backend,
            token: 0,
            data_hint: 50,
            now: Instant::now(),
            timer_floor: Duration::from_millis(1),
        };
        TimerFilter.update(&cx, &mut note).expect("update failed");
        crate::assert_with_log!(
            note.timer_aux().period == Duration::from_millis(50),
            "new period",
            Duration::from_millis(50),
            note.timer_aux().period
        );
        crate::assert_with_log!(note.data == 0, "count discarded", 0i64, note.data);
        crate::test_complete!("timer_update_restarts_and_discards_accumulated_fires");
    }
}
