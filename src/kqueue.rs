//! The kqueue multiplexer: registration, retrieval, and the wait loop.
//!
//! A [`Kqueue`] owns a set of knotes keyed by `(ident, filter)`, a
//! pending-events FIFO, a timer heap, and one native backend handle.
//! A single lock serializes the knote map and the pending queue;
//! the backend's blocking wait is never entered under that lock, so
//! registrations from other threads are never blocked behind an
//! in-flight wait.
//!
//! # Wait algorithm
//!
//! `retrieve` first drains already-pending software events (timer
//! fires, signal deliveries, user posts, previously-translated
//! readiness) so they are never starved by backend latency. Only with
//! an empty pending queue does it call the backend wait, bounded by
//! the caller's timeout and the next timer deadline. A backend that
//! returns "no events, no error, no elapsed timeout" (a documented
//! quirk of some native primitives) is re-waited rather than allowed
//! to surface a false empty result, except when the caller's finite
//! timeout budget is already consumed.

use crate::backend::{self, Backend, EventBatch, NativeBackend, NativeEvent};
use crate::config::KqueueConfig;
use crate::copyout;
use crate::diag;
use crate::error::{Error, Result};
use crate::event::{Action, Event, EventFlags, Ident, Udata};
use crate::filter::{self, signal, AttachCx, FilterCategory};
use crate::knote::{FilterAux, Knote};
use parking_lot::Mutex;
use slab::Slab;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::os::fd::RawFd;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Eq, PartialEq)]
struct TimerEntry {
    deadline: Instant,
    slot: usize,
    generation: u64,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse ordering for min-heap (earliest deadline first).
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of timer deadlines. Entries are invalidated lazily: a
/// popped entry whose generation no longer matches its knote is a
/// leftover from a delete or restart and is skipped.
#[derive(Debug, Default)]
struct TimerHeap {
    heap: BinaryHeap<TimerEntry>,
    next_generation: u64,
}

impl TimerHeap {
    fn alloc_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn push(&mut self, deadline: Instant, slot: usize, generation: u64) {
        self.heap.push(TimerEntry {
            deadline,
            slot,
            generation,
        });
    }

    fn peek_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.deadline)
    }

    fn pop_due(&mut self, now: Instant) -> Option<TimerEntry> {
        if self.heap.peek().is_some_and(|e| e.deadline <= now) {
            self.heap.pop()
        } else {
            None
        }
    }

    fn clear(&mut self) {
        self.heap.clear();
    }
}

/// Lock-protected multiplexer state.
#[derive(Default)]
struct Inner {
    knotes: Slab<Knote>,
    index: HashMap<(Ident, FilterCategory), usize>,
    pending: VecDeque<(usize, u64)>,
    timers: TimerHeap,
    next_serial: u64,
    closed: bool,
}

/// One multiplexer instance: a set of knotes and a native backend.
///
/// Shareable across threads by reference (`Arc` as needed); all
/// operations take `&self`. See the crate docs for an overview and
/// [`FilterCategory`] for per-category data semantics.
pub struct Kqueue {
    backend: NativeBackend,
    config: KqueueConfig,
    inner: Mutex<Inner>,
}

impl Kqueue {
    /// Creates a multiplexer with the default configuration.
    ///
    /// # Errors
    ///
    /// [`ResourceExhausted`](crate::ErrorKind::ResourceExhausted) if
    /// the native backend cannot be created.
    pub fn new() -> Result<Self> {
        Self::with_config(KqueueConfig::default())
    }

    /// Creates a multiplexer with an explicit configuration.
    ///
    /// # Errors
    ///
    /// [`Config`](crate::ErrorKind::Config) if the configuration is
    /// invalid; [`ResourceExhausted`](crate::ErrorKind::ResourceExhausted)
    /// if the native backend cannot be created.
    pub fn with_config(config: KqueueConfig) -> Result<Self> {
        config.validate()?;
        let backend = backend::create_native()?;
        Ok(Self {
            backend,
            config,
            inner: Mutex::new(Inner::default()),
        })
    }

    /// Registers, updates, enables, disables, or deletes one interest.
    ///
    /// `Add` creates the knote if absent (performing any native
    /// registration its category needs) or updates flags and data-hint
    /// if present; the category of an existing knote never changes.
    /// `Delete` detaches and removes. `Enable`/`Disable` toggle
    /// delivery without altering the registration; enabling a knote
    /// with an accumulated condition reports it on the next retrieval.
    ///
    /// Safe to call while another thread is blocked in
    /// [`retrieve`](Self::retrieve).
    ///
    /// # Errors
    ///
    /// [`NotFound`](crate::ErrorKind::NotFound) for delete/enable/
    /// disable on an absent knote;
    /// [`Unsupported`](crate::ErrorKind::Unsupported) when the
    /// category is unavailable on this platform;
    /// [`Backend`](crate::ErrorKind::Backend) when a native
    /// registration fails (including a stale descriptor);
    /// [`Closed`](crate::ErrorKind::Closed) after [`close`](Self::close).
    pub fn register(
        &self,
        ident: Ident,
        filter: FilterCategory,
        action: Action,
        flags: EventFlags,
        data_hint: i64,
        udata: Udata,
    ) -> Result<()> {
        let mut guard = self.inner.lock();
        if guard.closed {
            return Err(Error::closed());
        }
        debug!(
            %ident,
            %filter,
            %action,
            flags = %diag::describe_flags(flags),
            data_hint,
            "register"
        );
        match action {
            Action::Add => self.add(&mut guard, ident, filter, flags, data_hint, udata),
            Action::Delete => self.delete(&mut guard, ident, filter),
            Action::Enable => self.set_enabled(&mut guard, ident, filter, true),
            Action::Disable => self.set_enabled(&mut guard, ident, filter, false),
        }
    }

    /// Blocks until at least one event is available or the timeout
    /// elapses, and returns up to `max_events` event records.
    ///
    /// `timeout = None` blocks indefinitely; `timeout = 0` polls
    /// without blocking. A timed-out wait returns an empty sequence,
    /// not an error. Pending software events are always drained before
    /// the native backend is consulted.
    ///
    /// # Errors
    ///
    /// [`Interrupted`](crate::ErrorKind::Interrupted) when a caught
    /// signal aborted the wait (always distinguishable from a clean
    /// timeout); [`Backend`](crate::ErrorKind::Backend) for other
    /// native wait failures (the kqueue remains usable);
    /// [`Closed`](crate::ErrorKind::Closed) after [`close`](Self::close).
    pub fn retrieve(&self, max_events: usize, timeout: Option<Duration>) -> Result<Vec<Event>> {
        if max_events == 0 {
            return Ok(Vec::new());
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut polled_backend = false;
        let mut spurious: u32 = 0;

        loop {
            let next_timer;
            {
                let mut guard = self.inner.lock();
                if guard.closed {
                    return Err(Error::closed());
                }
                let now = Instant::now();
                self.expire_timers(&mut guard, now);
                self.collect_signals(&mut guard);
                let events = self.drain_pending(&mut guard, max_events);
                next_timer = guard.timers.peek_deadline();
                drop(guard);
                if !events.is_empty() {
                    trace!(count = events.len(), "retrieve delivering");
                    return Ok(events);
                }
            }

            let now = Instant::now();
            let remaining = deadline.map(|d| d.saturating_duration_since(now));
            if polled_backend && remaining == Some(Duration::ZERO) {
                // The caller's finite budget is consumed; a clean
                // timeout is an empty sequence, never an error.
                return Ok(Vec::new());
            }

            let timer_delta = next_timer.map(|t| t.saturating_duration_since(now));
            let wait_timeout = match (remaining, timer_delta) {
                (None, None) => None,
                (Some(r), None) => Some(r),
                (None, Some(t)) => Some(t),
                (Some(r), Some(t)) => Some(r.min(t)),
            };

            let mut batch = EventBatch::new();
            let batch_max = max_events.min(self.config.wait_capacity);
            self.backend.wait(&mut batch, batch_max, wait_timeout)?;
            polled_backend = true;

            if batch.is_empty() {
                if wait_timeout.is_none() {
                    // No events, no error, and no timeout that could
                    // have elapsed: the documented spurious-return
                    // quirk. Re-issue the wait.
                    spurious += 1;
                    if spurious >= self.config.spurious_warn_after {
                        warn!(spurious, "native wait returned empty without timeout; retrying");
                    } else {
                        trace!(spurious, "spurious empty wait; retrying");
                    }
                }
                continue;
            }
            spurious = 0;

            let mut guard = self.inner.lock();
            if guard.closed {
                return Err(Error::closed());
            }
            self.merge_native(&mut guard, &batch);
        }
    }

    /// Detaches every knote and releases the native backend.
    ///
    /// Detach failures are logged, never fatal: partial cleanup still
    /// releases everything it can. Idempotent; subsequent `register`
    /// and `retrieve` calls report `Closed`. Also invoked on drop.
    ///
    /// # Errors
    ///
    /// Currently infallible; the signature leaves room for reporting
    /// aggregate cleanup failures.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.inner.lock();
        if guard.closed {
            return Ok(());
        }
        guard.closed = true;
        let slots: Vec<usize> = guard.knotes.iter().map(|(slot, _)| slot).collect();
        for slot in slots {
            let mut note = guard.knotes.remove(slot);
            note.retire();
            let cx = self.attach_cx(slot, 0, Instant::now());
            if let Err(err) = filter::ops(note.filter).detach(&cx, &mut note) {
                warn!(
                    ident = %note.ident,
                    filter = %note.filter,
                    error = %err,
                    "detach during close failed"
                );
            }
        }
        guard.index.clear();
        guard.pending.clear();
        guard.timers.clear();
        drop(guard);
        // Release any retrieval blocked in the backend; it observes
        // the closed flag on wakeup.
        let _ = self.backend.wake();
        Ok(())
    }

    fn attach_cx(&self, token: usize, data_hint: i64, now: Instant) -> AttachCx<'_> {
        AttachCx {
            backend: &self.backend,
            token,
            data_hint,
            now,
            timer_floor: self.config.timer_floor,
        }
    }

    fn wake_waiter(&self) {
        if let Err(err) = self.backend.wake() {
            warn!(error = %err, "backend wake failed");
        }
    }

    /// Queues the knote on the pending FIFO if it is enabled, not yet
    /// queued, and holds a deliverable condition; wakes any blocked
    /// retrieval.
    fn activate_if_ready(&self, inner: &mut Inner, slot: usize) {
        let note = &mut inner.knotes[slot];
        if note.is_enabled() && !note.queued && note.has_pending_condition() {
            note.queued = true;
            let serial = note.serial;
            inner.pending.push_back((slot, serial));
            self.wake_waiter();
        }
    }

    fn add(
        &self,
        inner: &mut Inner,
        ident: Ident,
        filter: FilterCategory,
        flags: EventFlags,
        data_hint: i64,
        udata: Udata,
    ) -> Result<()> {
        let ops = filter::ops(filter);
        let now = Instant::now();

        if let Some(&slot) = inner.index.get(&(ident, filter)) {
            let cx = self.attach_cx(slot, data_hint, now);
            let note = &mut inner.knotes[slot];
            note.flags = flags;
            note.udata = udata;
            ops.update(&cx, note)?;
            if filter == FilterCategory::Timer {
                let deadline = inner.knotes[slot].timer_aux().deadline;
                let generation = inner.timers.alloc_generation();
                inner.knotes[slot].timer_aux_mut().generation = generation;
                inner.timers.push(deadline, slot, generation);
                self.wake_waiter();
            }
            self.activate_if_ready(inner, slot);
            return Ok(());
        }

        let serial = inner.next_serial;
        inner.next_serial += 1;
        let mut note = Knote::new(ident, filter, flags, udata, ops.make_aux());
        note.serial = serial;
        let slot = inner.knotes.insert(note);
        let cx = self.attach_cx(slot, data_hint, now);
        if let Err(err) = ops.attach(&cx, &mut inner.knotes[slot]) {
            inner.knotes.remove(slot);
            return Err(err);
        }
        inner.knotes[slot].arm();
        inner.index.insert((ident, filter), slot);
        if filter == FilterCategory::Timer {
            let deadline = inner.knotes[slot].timer_aux().deadline;
            let generation = inner.timers.alloc_generation();
            inner.knotes[slot].timer_aux_mut().generation = generation;
            inner.timers.push(deadline, slot, generation);
            // A new deadline may be earlier than whatever a blocked
            // retrieval is currently waiting for.
            self.wake_waiter();
        }
        self.activate_if_ready(inner, slot);
        Ok(())
    }

    fn delete(&self, inner: &mut Inner, ident: Ident, filter: FilterCategory) -> Result<()> {
        let Some(slot) = inner.index.remove(&(ident, filter)) else {
            return Err(Error::not_found(ident.value(), filter));
        };
        let mut note = inner.knotes.remove(slot);
        note.retire();
        // Stale pending entries for this slot are skipped by the
        // serial check during drain.
        let cx = self.attach_cx(slot, 0, Instant::now());
        filter::ops(filter).detach(&cx, &mut note)
    }

    fn set_enabled(
        &self,
        inner: &mut Inner,
        ident: Ident,
        filter: FilterCategory,
        enabled: bool,
    ) -> Result<()> {
        let Some(&slot) = inner.index.get(&(ident, filter)) else {
            return Err(Error::not_found(ident.value(), filter));
        };
        if enabled {
            inner.knotes[slot].enable();
            // Report any condition that accumulated while disabled.
            self.activate_if_ready(inner, slot);
        } else {
            inner.knotes[slot].disable();
        }
        Ok(())
    }

    /// Pops due timers, accumulating burst fire counts and re-arming
    /// each period.
    fn expire_timers(&self, inner: &mut Inner, now: Instant) {
        while let Some(entry) = inner.timers.pop_due(now) {
            let Some(note) = inner.knotes.get_mut(entry.slot) else {
                continue;
            };
            if note.filter != FilterCategory::Timer {
                continue;
            }
            let (deadline, serial, queue) = {
                let serial = note.serial;
                let enabled = note.is_enabled();
                let queued = note.queued;
                let aux = note.timer_aux_mut();
                if aux.generation != entry.generation {
                    // Leftover entry from a delete or restart.
                    continue;
                }
                let late = now.saturating_duration_since(entry.deadline);
                let catch_up = (late.as_nanos() / aux.period.as_nanos().max(1)) as u64;
                let fires = 1 + catch_up;
                aux.fires += fires;
                let step = u32::try_from(fires).unwrap_or(u32::MAX);
                aux.deadline = entry.deadline + aux.period * step;
                let total = aux.fires;
                let deadline = aux.deadline;
                note.data = i64::try_from(total).unwrap_or(i64::MAX);
                (deadline, serial, enabled && !queued)
            };
            inner.timers.push(deadline, entry.slot, entry.generation);
            if queue {
                inner.knotes[entry.slot].queued = true;
                inner.pending.push_back((entry.slot, serial));
            }
        }
    }

    /// Transfers pending counts from the signal route table onto the
    /// owning knotes.
    fn collect_signals(&self, inner: &mut Inner) {
        let signal_slots: Vec<usize> = inner
            .knotes
            .iter()
            .filter(|(_, note)| note.filter == FilterCategory::Signal)
            .map(|(slot, _)| slot)
            .collect();
        for slot in signal_slots {
            let note = &mut inner.knotes[slot];
            let delivered = signal::take_pending(note.signal_aux().slot);
            if delivered > 0 {
                note.data = note
                    .data
                    .saturating_add(i64::try_from(delivered).unwrap_or(i64::MAX));
                trace!(ident = %note.ident, count = delivered, "signal deliveries collected");
            }
            self.activate_if_ready(inner, slot);
        }
    }

    /// True when a native record plausibly belongs to the knote its
    /// token names: the direction fits the category and the descriptor
    /// matches the one the knote registered. A mismatch is a stale
    /// record from a registration deleted during the wait.
    fn native_event_matches(note: &Knote, native: &NativeEvent) -> bool {
        match note.filter {
            FilterCategory::Read => {
                native.readable && native.fd == note.ident.value() as RawFd
            }
            FilterCategory::Write => {
                native.writable && native.fd == note.ident.value() as RawFd
            }
            FilterCategory::Proc => native.readable && native.fd == note.proc_aux().pidfd,
            FilterCategory::Vnode => {
                native.readable && native.fd == note.vnode_aux().inotify_fd
            }
            FilterCategory::Timer | FilterCategory::User | FilterCategory::Signal => false,
        }
    }

    /// Converts native readiness records into queued knote activations.
    fn merge_native(&self, inner: &mut Inner, batch: &EventBatch) {
        for native in batch {
            trace!(event = %diag::describe_native(native), "native readiness");
            let Some(note) = inner.knotes.get_mut(native.token) else {
                trace!(token = native.token, "stale native token; dropped");
                continue;
            };
            if !Self::native_event_matches(note, native) {
                trace!(token = native.token, "native record no longer matches; dropped");
                continue;
            }
            let ops = filter::ops(note.filter);
            if ops.translate(note, native) {
                self.activate_if_ready(inner, native.token);
            }
        }
    }

    /// Pops up to `max_events` active knotes off the FIFO, copying
    /// each out through the re-arming protocol.
    fn drain_pending(&self, inner: &mut Inner, max_events: usize) -> Vec<Event> {
        let mut events = Vec::new();
        let mut requeue: Vec<(usize, u64)> = Vec::new();

        while events.len() < max_events {
            let Some((slot, serial)) = inner.pending.pop_front() else {
                break;
            };
            let Some(note) = inner.knotes.get_mut(slot) else {
                continue;
            };
            if note.serial != serial {
                continue;
            }
            note.queued = false;
            let Some(event) = copyout::deliver(note) else {
                // Disabled while queued; the condition accumulates for
                // a later enable.
                continue;
            };
            let retired = note.is_retired();
            let refires = !retired && Self::refires_immediately(note);
            trace!(
                ident = %event.ident,
                filter = %event.filter,
                data = event.data,
                flags = %diag::describe_flags(event.flags),
                "copyout"
            );
            events.push(event);

            if retired {
                // One-shot auto-retirement.
                let mut removed = inner.knotes.remove(slot);
                inner.index.remove(&(removed.ident, removed.filter));
                let cx = self.attach_cx(slot, 0, Instant::now());
                if let Err(err) = filter::ops(removed.filter).detach(&cx, &mut removed) {
                    warn!(error = %err, "detach after one-shot delivery failed");
                }
            } else if refires {
                requeue.push((slot, serial));
            }
        }

        // Software level conditions (a still-triggered user knote)
        // re-fire on the next retrieval; appending after the drain
        // keeps one retrieval from looping on them.
        for (slot, serial) in requeue {
            if let Some(note) = inner.knotes.get_mut(slot) {
                if note.serial == serial && note.is_enabled() && !note.queued {
                    note.queued = true;
                    inner.pending.push_back((slot, serial));
                }
            }
        }
        events
    }

    /// Software conditions that persist across deliveries: a user
    /// knote stays active until a clear-flagged delivery resets it.
    /// (Native level conditions re-fire through the backend instead.)
    fn refires_immediately(note: &Knote) -> bool {
        matches!(&note.aux, FilterAux::User(user) if user.triggered)
    }
}

impl Drop for Kqueue {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for Kqueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Kqueue")
            .field("knotes", &inner.knotes.len())
            .field("pending", &inner.pending.len())
            .field("closed", &inner.closed)
            .finish_non_exhaustive()
    }
}
