//! Error types and error handling strategy for kqport.
//!
//! Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - Every operation-level failure is returned to the caller; nothing
//!   is silently dropped
//! - A timed-out wait is *not* an error (it is an empty event batch);
//!   an interrupted wait *is*, and the two are always distinguishable
//! - Internal invariant violations are fatal and panic through
//!   [`internal_defect`], never limp along on corrupted state
//!
//! # Recovery Classification
//!
//! All errors can be classified by [`Recoverability`]:
//! - `Transient`: safe to retry (e.g. an interrupted wait)
//! - `Permanent`: do not retry (e.g. an unsupported filter category)
//! - `Unknown`: recoverability depends on context

use core::fmt;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A delete/enable/disable targeted an `(ident, filter)` pair with
    /// no existing knote.
    NotFound,
    /// The filter category is unavailable on this platform. Permanent
    /// for that category; never retried automatically.
    Unsupported,
    /// A caught signal aborted a blocking wait. Distinct from a clean
    /// timeout, which is reported as an empty event batch.
    Interrupted,
    /// A native backend call failed for a reason other than timeout or
    /// interrupt. Fatal to the current operation only; the kqueue
    /// instance remains usable.
    Backend,
    /// The native backend instance could not be created (descriptor
    /// limits, kernel resource exhaustion).
    ResourceExhausted,
    /// The kqueue has been closed.
    Closed,
    /// Configuration error (invalid limit, bad env override).
    Config,
    /// Internal invariant violation (a bug in kqport).
    Internal,
}

impl ErrorKind {
    /// Returns the recoverability classification for this error kind.
    #[must_use]
    pub const fn recoverability(&self) -> Recoverability {
        match self {
            Self::Interrupted => Recoverability::Transient,
            Self::Unsupported | Self::Closed | Self::Config | Self::Internal => {
                Recoverability::Permanent
            }
            Self::NotFound | Self::Backend | Self::ResourceExhausted => Recoverability::Unknown,
        }
    }

    /// Returns true if this error is typically retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.recoverability(), Recoverability::Transient)
    }
}

/// Classification of error recoverability for retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Recoverability {
    /// Temporary failure that may succeed on retry.
    Transient,
    /// Permanent failure that will not succeed on retry.
    Permanent,
    /// Recoverability depends on context.
    Unknown,
}

impl Recoverability {
    /// Returns true if this error is safe to retry.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// The main error type for kqport operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if this error reports an interrupted wait.
    #[must_use]
    pub const fn is_interrupted(&self) -> bool {
        matches!(self.kind, ErrorKind::Interrupted)
    }

    /// Adds a message description to the error.
    #[must_use]
    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Returns the error message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Returns the recoverability classification.
    #[must_use]
    pub const fn recoverability(&self) -> Recoverability {
        self.kind.recoverability()
    }

    /// Creates a `NotFound` error for a missing knote.
    #[must_use]
    pub fn not_found(ident: usize, filter: impl fmt::Display) -> Self {
        Self::new(ErrorKind::NotFound)
            .with_message(format!("no knote for ident {ident}, filter {filter}"))
    }

    /// Creates an `Unsupported` error for a filter category.
    #[must_use]
    pub fn unsupported(what: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unsupported).with_message(what)
    }

    /// Creates a `Backend` error wrapping a native I/O failure.
    #[must_use]
    pub fn backend(op: &'static str, source: std::io::Error) -> Self {
        Self::new(ErrorKind::Backend)
            .with_message(format!("{op} failed"))
            .with_source(source)
    }

    /// Creates an `Interrupted` error.
    #[must_use]
    pub fn interrupted() -> Self {
        Self::new(ErrorKind::Interrupted)
    }

    /// Creates a `ResourceExhausted` error wrapping a native failure.
    #[must_use]
    pub fn resource_exhausted(op: &'static str, source: std::io::Error) -> Self {
        Self::new(ErrorKind::ResourceExhausted)
            .with_message(format!("{op} failed"))
            .with_source(source)
    }

    /// Creates a `Closed` error.
    #[must_use]
    pub fn closed() -> Self {
        Self::new(ErrorKind::Closed).with_message("kqueue is closed")
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// A specialized Result type for kqport operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Reports an internal invariant violation and aborts the current
/// operation tree by panicking.
///
/// Conditions routed here (an unrecognized native readiness token, a
/// category dispatched to the wrong filter) must never occur in a
/// correct implementation; recovery would operate on corrupted state.
/// Expressed as a panic rather than `abort()` so tests can assert on
/// the failure mode.
#[cold]
pub(crate) fn internal_defect(detail: &str) -> ! {
    panic!("kqport internal defect: {detail}");
}
