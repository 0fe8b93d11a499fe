//! Diagnostic formatting helpers.
//!
//! Value-returning formatters for the readiness plumbing, used in
//! tracing call sites. No retained or process-wide mutable state.

use crate::backend::NativeEvent;
use crate::event::EventFlags;

/// Renders a native readiness record for a trace line.
pub(crate) fn describe_native(ev: &NativeEvent) -> String {
    let mut parts = Vec::with_capacity(4);
    if ev.readable {
        parts.push("readable");
    }
    if ev.writable {
        parts.push("writable");
    }
    if ev.error {
        parts.push("error");
    }
    if ev.hangup {
        parts.push("hangup");
    }
    format!("token={} [{}]", ev.token, parts.join(","))
}

/// Renders a flag set for a trace line.
pub(crate) fn describe_flags(flags: EventFlags) -> String {
    if flags.is_empty() {
        return "none".to_string();
    }
    let mut parts = Vec::with_capacity(4);
    if flags.contains(EventFlags::ONESHOT) {
        parts.push("oneshot");
    }
    if flags.contains(EventFlags::DISPATCH) {
        parts.push("dispatch");
    }
    if flags.contains(EventFlags::CLEAR) {
        parts.push("clear");
    }
    if flags.contains(EventFlags::TRIGGER) {
        parts.push("trigger");
    }
    if flags.contains(EventFlags::EOF) {
        parts.push("eof");
    }
    if flags.contains(EventFlags::ERROR) {
        parts.push("error");
    }
    parts.join("|")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_event_rendering() {
        let ev = NativeEvent {
            token: 3,
            fd: 0,
            readable: true,
            writable: false,
            error: false,
            hangup: true,
        };
        assert_eq!(describe_native(&ev), "token=3 [readable,hangup]");
    }

    #[test]
    fn flags_rendering() {
        assert_eq!(describe_flags(EventFlags::NONE), "none");
        assert_eq!(
            describe_flags(EventFlags::ONESHOT | EventFlags::CLEAR),
            "oneshot|clear"
        );
        assert_eq!(
            describe_flags(EventFlags::EOF | EventFlags::ERROR),
            "eof|error"
        );
    }
}
