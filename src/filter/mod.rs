//! Per-category filter behavior tables.
//!
//! A filter is a behavior table, not a per-instance object: one fixed
//! unit-struct per category, shared read-only across all kqueues, with
//! no per-call mutable state. Dispatch is a closed match over
//! [`FilterCategory`] — categories are a known, bounded set, so there
//! is no open-ended registration.
//!
//! # Data-count semantics
//!
//! | Category | `data` means | Source of truth |
//! |----------|--------------|-----------------|
//! | `Read` | bytes available to read | `FIONREAD` at translation |
//! | `Write` | free send-buffer space (≥1 when writable) | `SIOCOUTQ`/`SO_SNDBUF` where available |
//! | `Timer` | expirations since last delivery | monotonic countdown |
//! | `User` | data-hint captured at trigger time | caller |
//! | `Signal` | deliveries since last delivery | async-signal-safe counters |
//! | `Proc` | exit status | `waitid(WNOWAIT)` |
//! | `Vnode` | path-change notifications since last delivery | inotify |
//!
//! Timer, signal, and vnode counts are consumed by delivery; the rest
//! follow the generic level/clear re-arming rules.

pub(crate) mod process;
pub(crate) mod read;
pub(crate) mod signal;
pub(crate) mod timer;
pub(crate) mod user;
pub(crate) mod vnode;
pub(crate) mod write;

use crate::backend::{Backend, NativeEvent};
use crate::error::{internal_defect, Result};
use crate::event::EventFlags;
use crate::knote::{FilterAux, Knote};
use std::fmt;
use std::time::{Duration, Instant};

/// Event category of a registered interest.
///
/// Each category has its own data-count semantics (see the module
/// docs) but a uniform event-record shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterCategory {
    /// Readable-data readiness on a descriptor.
    Read,
    /// Writable-data readiness on a descriptor.
    Write,
    /// Software countdown timer; the registration data-hint is the
    /// period in milliseconds.
    Timer,
    /// User-posted events, fired by registering with
    /// [`EventFlags::TRIGGER`].
    User,
    /// Signal deliveries; the ident is the signal number.
    Signal,
    /// Process state change (exit); the ident is the process id.
    Proc,
    /// Filesystem path change; the ident is an open descriptor of the
    /// watched path.
    Vnode,
}

impl FilterCategory {
    /// All supported categories, in dispatch-table order.
    pub const ALL: [Self; 7] = [
        Self::Read,
        Self::Write,
        Self::Timer,
        Self::User,
        Self::Signal,
        Self::Proc,
        Self::Vnode,
    ];

    /// Returns true if the category needs a native backend
    /// registration (as opposed to purely software state).
    #[must_use]
    pub const fn is_native(&self) -> bool {
        matches!(self, Self::Read | Self::Write | Self::Proc | Self::Vnode)
    }
}

impl fmt::Display for FilterCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Timer => "timer",
            Self::User => "user",
            Self::Signal => "signal",
            Self::Proc => "proc",
            Self::Vnode => "vnode",
        };
        write!(f, "{name}")
    }
}

/// Context handed to attach/update/detach: the owning kqueue's backend
/// plus the registration parameters that are not knote fields.
pub(crate) struct AttachCx<'a> {
    /// The owning kqueue's native backend.
    pub backend: &'a dyn Backend,
    /// Slab key of the knote; round-tripped as the native token.
    pub token: usize,
    /// Registration data-hint (category-specific; timer period in
    /// milliseconds, user payload).
    pub data_hint: i64,
    /// Monotonic now, sampled once per registration call.
    pub now: Instant,
    /// Configured timer granularity floor.
    pub timer_floor: Duration,
}

/// Category-specific behavior table.
///
/// One fixed instance per category; all methods take the knote they
/// operate on, so the table itself is stateless.
pub(crate) trait FilterOps: Send + Sync {
    /// Initial aux state for a fresh knote of this category.
    fn make_aux(&self) -> FilterAux;

    /// Installs any native registration the category needs.
    ///
    /// Fails with `Unsupported` if the host platform cannot support
    /// the category at all (permanent, non-retriable).
    fn attach(&self, cx: &AttachCx<'_>, note: &mut Knote) -> Result<()>;

    /// Re-applies attach semantics on re-registration. Idempotent:
    /// attaching twice must not leak native registrations.
    fn update(&self, cx: &AttachCx<'_>, note: &mut Knote) -> Result<()>;

    /// Interprets one native readiness record against the knote.
    /// Returns true if the knote becomes active (has an event to
    /// deliver).
    ///
    /// The default is the fatal path: native readiness must never be
    /// dispatched to a software-only category.
    fn translate(&self, _note: &mut Knote, _native: &NativeEvent) -> bool {
        internal_defect("native readiness dispatched to a software-only filter");
    }

    /// Snapshot of `(data, outcome flags)` for the event record.
    fn event_data(&self, note: &mut Knote) -> (i64, EventFlags) {
        let mut flags = EventFlags::NONE;
        if note.eof {
            flags |= EventFlags::EOF;
        }
        if note.error {
            flags |= EventFlags::ERROR;
        }
        (note.data, flags)
    }

    /// True if delivery consumes the accumulated count even without
    /// the clear flag (timer fires, signal counts, vnode counts).
    fn consumes_on_delivery(&self) -> bool {
        false
    }

    /// Category hook run when a clear-flagged knote delivers, before
    /// the generic data reset.
    fn clear_after_delivery(&self, _note: &mut Knote) {}

    /// Reverses attach: removes native registrations, releases
    /// category resources, discards counters.
    fn detach(&self, cx: &AttachCx<'_>, note: &mut Knote) -> Result<()>;
}

/// Fixed lookup from category tag to its behavior table.
pub(crate) fn ops(category: FilterCategory) -> &'static dyn FilterOps {
    match category {
        FilterCategory::Read => &read::ReadFilter,
        FilterCategory::Write => &write::WriteFilter,
        FilterCategory::Timer => &timer::TimerFilter,
        FilterCategory::User => &user::UserFilter,
        FilterCategory::Signal => &signal::SignalFilter,
        FilterCategory::Proc => &process::ProcFilter,
        FilterCategory::Vnode => &vnode::VnodeFilter,
    }
}
