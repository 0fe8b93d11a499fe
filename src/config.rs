//! Configuration and tuning for a kqueue instance.
//!
//! This module provides:
//! - [`KqueueConfig`] with sensible defaults
//! - Validation for guardrail invariants
//! - Layered loading (defaults + env overrides)
//!
//! Note: parsing is intentionally minimal and deterministic.

use crate::error::{Error, ErrorKind};
use std::time::Duration;

/// Tuning knobs for one [`Kqueue`](crate::Kqueue) instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KqueueConfig {
    /// Capacity of the native-event batch passed to one backend wait.
    /// Bounds how many readiness records a single wait can surface.
    pub wait_capacity: usize,
    /// Number of consecutive spurious empty waits (no events, no error,
    /// timeout not elapsed) tolerated before each retry is logged at
    /// warn level instead of trace.
    pub spurious_warn_after: u32,
    /// Granularity floor for timer deadlines. Periods below this are
    /// rounded up; 1ms matches the native kqueue timer default unit.
    pub timer_floor: Duration,
}

impl Default for KqueueConfig {
    fn default() -> Self {
        Self {
            wait_capacity: 64,
            spurious_warn_after: 3,
            timer_floor: Duration::from_millis(1),
        }
    }
}

impl KqueueConfig {
    /// Validates the configuration for basic sanity.
    ///
    /// # Errors
    ///
    /// Returns a [`Config`](ErrorKind::Config) error naming the invalid
    /// field.
    pub fn validate(&self) -> crate::Result<()> {
        if self.wait_capacity == 0 {
            return Err(Error::new(ErrorKind::Config)
                .with_message("wait_capacity must be at least 1"));
        }
        if self.timer_floor.is_zero() {
            return Err(
                Error::new(ErrorKind::Config).with_message("timer_floor must be non-zero")
            );
        }
        Ok(())
    }

    /// Builds a configuration from defaults layered with `KQPORT_*`
    /// environment overrides.
    ///
    /// Recognized variables: `KQPORT_WAIT_CAPACITY`,
    /// `KQPORT_SPURIOUS_WARN_AFTER`, `KQPORT_TIMER_FLOOR_MS`.
    /// Unparseable values are ignored; the result is validated.
    ///
    /// # Errors
    ///
    /// Returns a [`Config`](ErrorKind::Config) error if the layered
    /// result fails validation.
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Self::default();
        if let Some(v) = env_usize("KQPORT_WAIT_CAPACITY") {
            config.wait_capacity = v;
        }
        if let Some(v) = env_usize("KQPORT_SPURIOUS_WARN_AFTER") {
            config.spurious_warn_after = v as u32;
        }
        if let Some(v) = env_usize("KQPORT_TIMER_FLOOR_MS") {
            config.timer_floor = Duration::from_millis(v as u64);
        }
        config.validate()?;
        Ok(config)
    }
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let config = KqueueConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.wait_capacity, 64);
    }

    #[test]
    fn zero_wait_capacity_is_rejected() {
        let config = KqueueConfig {
            wait_capacity: 0,
            ..KqueueConfig::default()
        };
        let err = config.validate().expect_err("expected Config error");
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn zero_timer_floor_is_rejected() {
        let config = KqueueConfig {
            timer_floor: Duration::ZERO,
            ..KqueueConfig::default()
        };
        let err = config.validate().expect_err("expected Config error");
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}
