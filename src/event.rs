//! Public event vocabulary: identifiers, actions, flags, and the event
//! record returned by retrieval.
//!
//! # Flag Mapping
//!
//! | Flag | BSD kqueue | Direction |
//! |------|-----------|-----------|
//! | ONESHOT | EV_ONESHOT | registration |
//! | DISPATCH | EV_DISPATCH | registration |
//! | CLEAR | EV_CLEAR | registration |
//! | TRIGGER | NOTE_TRIGGER | registration (user filter) |
//! | EOF | EV_EOF | outcome |
//! | ERROR | EV_ERROR | outcome |

use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign};

use crate::filter::FilterCategory;

/// Source identifier for a registered interest.
///
/// The meaning is category-specific: a file descriptor for read/write
/// and vnode interests, a signal number for signal interests, a process
/// id for process interests, and a caller-chosen id for timer and user
/// interests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ident(usize);

impl Ident {
    /// Creates a new identifier.
    #[must_use]
    pub const fn new(val: usize) -> Self {
        Self(val)
    }

    /// Returns the raw identifier value.
    #[must_use]
    pub const fn value(&self) -> usize {
        self.0
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque user token, round-tripped unchanged from registration to the
/// delivered event record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Udata(i64);

impl Udata {
    /// A zero token.
    pub const NONE: Self = Self(0);

    /// Creates a new token.
    #[must_use]
    pub const fn new(val: i64) -> Self {
        Self(val)
    }

    /// Returns the raw token value.
    #[must_use]
    pub const fn value(&self) -> i64 {
        self.0
    }
}

/// Registration action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Create the knote if absent, or update flags/data-hint if present.
    Add,
    /// Detach and remove the knote. Fails with `NotFound` if absent.
    Delete,
    /// Re-enable a disabled knote without altering registration.
    Enable,
    /// Disable the knote; disabled knotes never produce events.
    Disable,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Delete => write!(f, "delete"),
            Self::Enable => write!(f, "enable"),
            Self::Disable => write!(f, "disable"),
        }
    }
}

/// Per-knote behavior and outcome flags.
///
/// Combines with the `|` operator.
///
/// # Example
///
/// ```
/// use kqport::EventFlags;
///
/// let flags = EventFlags::ONESHOT | EventFlags::CLEAR;
/// assert!(flags.contains(EventFlags::ONESHOT));
/// assert!(!flags.contains(EventFlags::DISPATCH));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct EventFlags(u16);

impl EventFlags {
    /// No flags (level-triggered default behavior).
    pub const NONE: Self = Self(0);

    /// Retire the knote after its single delivered event.
    pub const ONESHOT: Self = Self(1 << 0);

    /// Disable (not retire) the knote after each delivered event; an
    /// explicit enable is required before it fires again.
    pub const DISPATCH: Self = Self(1 << 1);

    /// Edge-triggered delivery: the accumulated data count resets after
    /// each delivered event, so an unchanged condition does not re-fire.
    pub const CLEAR: Self = Self(1 << 2);

    /// Post a user-filter event (meaningful only for
    /// [`FilterCategory::User`] registrations).
    pub const TRIGGER: Self = Self(1 << 3);

    /// Outcome: end-of-file observed on the source (peer closed,
    /// process exited, watched path deleted).
    pub const EOF: Self = Self(1 << 8);

    /// Outcome: an error condition was observed on the source.
    pub const ERROR: Self = Self(1 << 9);

    /// Create an empty flag set.
    #[must_use]
    pub const fn empty() -> Self {
        Self::NONE
    }

    /// Create a flag set from raw bits.
    #[must_use]
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// Get the raw bits.
    #[must_use]
    pub const fn bits(&self) -> u16 {
        self.0
    }

    /// Check whether all flags in `other` are set.
    #[must_use]
    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Check whether no flags are set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Returns the set with the flags in `other` added.
    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns the set with the flags in `other` removed.
    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for EventFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for EventFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl BitAndAssign for EventFlags {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}

/// One delivered event record.
///
/// Owned by the caller; carries no aliasing with internal knote state
/// after return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    /// Source identifier the event pertains to.
    pub ident: Ident,
    /// Filter category that produced the event.
    pub filter: FilterCategory,
    /// Outcome flags; only [`EventFlags::EOF`] and [`EventFlags::ERROR`]
    /// are ever set here.
    pub flags: EventFlags,
    /// Category-specific data count (bytes available, timer fires,
    /// signal deliveries, exit status; see [`FilterCategory`]).
    pub data: i64,
    /// The opaque token supplied at registration, unchanged.
    pub udata: Udata,
}

impl Event {
    /// Returns true if the end-of-file outcome flag is set.
    #[must_use]
    pub const fn is_eof(&self) -> bool {
        self.flags.contains(EventFlags::EOF)
    }

    /// Returns true if the error outcome flag is set.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.flags.contains(EventFlags::ERROR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_combine_and_query() {
        let flags = EventFlags::ONESHOT | EventFlags::CLEAR;
        assert!(flags.contains(EventFlags::ONESHOT));
        assert!(flags.contains(EventFlags::CLEAR));
        assert!(!flags.contains(EventFlags::DISPATCH));
        assert!(!flags.is_empty());
        assert!(EventFlags::NONE.is_empty());
    }

    #[test]
    fn flags_with_without() {
        let flags = EventFlags::NONE.with(EventFlags::EOF);
        assert!(flags.contains(EventFlags::EOF));
        let flags = flags.without(EventFlags::EOF);
        assert!(flags.is_empty());
    }

    #[test]
    fn flags_bit_assign_ops() {
        let mut flags = EventFlags::ONESHOT;
        flags |= EventFlags::EOF;
        assert!(flags.contains(EventFlags::ONESHOT | EventFlags::EOF));
        flags &= EventFlags::EOF;
        assert!(!flags.contains(EventFlags::ONESHOT));
        assert!(flags.contains(EventFlags::EOF));
    }

    #[test]
    fn event_outcome_predicates() {
        let ev = Event {
            ident: Ident::new(3),
            filter: FilterCategory::Read,
            flags: EventFlags::EOF,
            data: 12,
            udata: Udata::new(-1),
        };
        assert!(ev.is_eof());
        assert!(!ev.is_error());
        assert_eq!(ev.udata.value(), -1);
        assert_eq!(ev.ident.value(), 3);
    }

    #[test]
    fn ident_display() {
        assert_eq!(Ident::new(42).to_string(), "42");
    }

    #[test]
    fn action_display() {
        assert_eq!(Action::Add.to_string(), "add");
        assert_eq!(Action::Delete.to_string(), "delete");
        assert_eq!(Action::Enable.to_string(), "enable");
        assert_eq!(Action::Disable.to_string(), "disable");
    }
}
