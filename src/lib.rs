//! Portable kqueue-semantics event notification.
//!
//! kqport reproduces the BSD kqueue registration/retrieval model —
//! knotes, filters, level- and edge-triggered delivery, one-shot and
//! dispatch-once re-arming — on hosts whose native readiness primitive
//! is something else (epoll on Linux, poll(2) as a portable fallback,
//! or kqueue itself passed through on the BSDs).
//!
//! # Model
//!
//! - A [`Kqueue`] owns a set of knotes keyed by `(ident, filter)` and a
//!   native backend handle.
//! - [`Kqueue::register`] adds, deletes, enables, or disables one
//!   registered interest.
//! - [`Kqueue::retrieve`] blocks until at least one event or the
//!   timeout elapses, and returns caller-owned [`Event`] records.
//!
//! Software-originated events (timers, user posts, signal deliveries)
//! are always drained before the native backend is consulted, so they
//! are never starved by backend latency.
//!
//! # Filters
//!
//! Seven categories are supported: [`FilterCategory::Read`],
//! [`FilterCategory::Write`], [`FilterCategory::Timer`],
//! [`FilterCategory::User`], [`FilterCategory::Signal`],
//! [`FilterCategory::Proc`], and [`FilterCategory::Vnode`]. The
//! per-category data-count semantics are documented on
//! [`FilterCategory`].
//!
//! # Example
//!
//! ```no_run
//! use kqport::{Action, EventFlags, FilterCategory, Ident, Kqueue, Udata};
//! use std::time::Duration;
//!
//! # fn main() -> kqport::Result<()> {
//! let kq = Kqueue::new()?;
//! // Watch fd 5 for readable data, edge-triggered.
//! kq.register(
//!     Ident::new(5),
//!     FilterCategory::Read,
//!     Action::Add,
//!     EventFlags::CLEAR,
//!     0,
//!     Udata::new(42),
//! )?;
//! let events = kq.retrieve(16, Some(Duration::from_millis(100)))?;
//! for ev in &events {
//!     println!("fd {} has {} bytes", ev.ident.value(), ev.data);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Threading
//!
//! A `Kqueue` may be shared across threads (`&self` API, `Arc` it if
//! needed). `register` is never blocked behind an in-flight `retrieve`:
//! the backend wait runs outside the internal lock.

#![warn(missing_docs)]
#![warn(unsafe_code)]

pub mod backend;
pub mod config;
mod copyout;
mod diag;
pub mod error;
pub mod event;
pub mod filter;
mod knote;
mod kqueue;
#[doc(hidden)]
pub mod test_utils;

pub use config::KqueueConfig;
pub use error::{Error, ErrorKind, Result};
pub use event::{Action, Event, EventFlags, Ident, Udata};
pub use filter::FilterCategory;
pub use kqueue::Kqueue;
