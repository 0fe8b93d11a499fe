//! User-posted event filter.
//!
//! Pure software state. A registration carrying
//! [`EventFlags::TRIGGER`] posts the event; the data-hint supplied at
//! trigger time becomes the delivered data count. A triggered knote
//! keeps reporting on every retrieval (level behavior) until a
//! delivery under the clear flag resets it, matching the native
//! `EVFILT_USER`/`NOTE_TRIGGER` contract.

use super::{AttachCx, FilterOps};
use crate::error::Result;
use crate::event::EventFlags;
use crate::knote::{FilterAux, Knote, UserAux};

/// Behavior table for [`FilterCategory::User`](super::FilterCategory::User).
pub(crate) struct UserFilter;

fn apply_trigger(cx: &AttachCx<'_>, note: &mut Knote) {
    if note.flags.contains(EventFlags::TRIGGER) {
        note.user_aux_mut().triggered = true;
        note.data = cx.data_hint;
    }
}

impl FilterOps for UserFilter {
    fn make_aux(&self) -> FilterAux {
        FilterAux::User(UserAux { triggered: false })
    }

    fn attach(&self, cx: &AttachCx<'_>, note: &mut Knote) -> Result<()> {
        apply_trigger(cx, note);
        Ok(())
    }

    fn update(&self, cx: &AttachCx<'_>, note: &mut Knote) -> Result<()> {
        apply_trigger(cx, note);
        Ok(())
    }

    fn clear_after_delivery(&self, note: &mut Knote) {
        note.user_aux_mut().triggered = false;
    }

    fn detach(&self, _cx: &AttachCx<'_>, note: &mut Knote) -> Result<()> {
        note.user_aux_mut().triggered = false;
        Ok(())
    }
}
