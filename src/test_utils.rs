//! Test logging helpers shared by unit and integration tests.
//!
//! Progress lines are printed only when `KQPORT_TEST_LOG` is set, so
//! the default test run stays quiet while a failing run can be
//! replayed with full phase/section tracing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;

static INIT: Once = Once::new();
static ENABLED: AtomicBool = AtomicBool::new(false);

/// Initializes test logging once per process.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let enabled = std::env::var_os("KQPORT_TEST_LOG").is_some();
        ENABLED.store(enabled, Ordering::Release);
    });
}

/// Returns true when test progress lines should be printed.
#[must_use]
pub fn log_enabled() -> bool {
    ENABLED.load(Ordering::Acquire)
}

#[doc(hidden)]
pub fn emit(kind: &str, name: &str) {
    if log_enabled() {
        eprintln!("[{kind:>8}] {name}");
    }
}

/// Marks the start of a test.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        $crate::test_utils::emit("phase", $name);
    };
}

/// Marks a section within a test.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        $crate::test_utils::emit("section", $name);
    };
}

/// Marks a test as complete.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        $crate::test_utils::emit("complete", $name);
    };
}

/// Asserts a condition, printing the labelled expected/actual pair on
/// failure (and on success when logging is enabled).
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $label:expr, $expected:expr, $actual:expr) => {
        if $cond {
            if $crate::test_utils::log_enabled() {
                eprintln!("[      ok] {}: {:?}", $label, $actual);
            }
        } else {
            panic!(
                "check '{}' failed: expected {:?}, got {:?}",
                $label, $expected, $actual
            );
        }
    };
}
