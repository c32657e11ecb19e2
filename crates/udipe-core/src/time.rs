//! Nanosecond durations with reserved sentinel values
//!
//! Timeouts are lower bounds: the OS rounds waits up to its scheduler
//! clock granularity, and command processing itself takes on the order of
//! microseconds. Three values are reserved:
//!
//! - [`DURATION_DEFAULT`] (0) means "use the default for this API" and must
//!   be translated at the public boundary before reaching the runtime.
//! - [`DURATION_NONBLOCKING`] (1) means "check and return immediately".
//! - [`DURATION_INFINITE`] (`u64::MAX`) means "block until the event".

use std::time::Instant;

/// Duration in nanoseconds (0, 1 and the maximum value are special)
pub type DurationNs = u64;

/// Placeholder asking for the default duration of the API at hand.
///
/// For timeouts the default is [`DURATION_INFINITE`]. Only valid as a user
/// parameter; public entry points translate it before the value reaches
/// the wait primitives.
pub const DURATION_DEFAULT: DurationNs = 0;

/// Infinitely small duration: check, then give up immediately.
pub const DURATION_NONBLOCKING: DurationNs = 1;

/// Infinitely long duration: wait until the event of interest happens.
pub const DURATION_INFINITE: DurationNs = u64::MAX;

/// Translate [`DURATION_DEFAULT`] into the default timeout (infinite)
#[inline]
pub fn resolve_timeout(timeout_ns: DurationNs) -> DurationNs {
    if timeout_ns == DURATION_DEFAULT {
        DURATION_INFINITE
    } else {
        timeout_ns
    }
}

/// Split a finite duration into whole seconds and leftover nanoseconds
#[inline]
pub fn split_ns(ns: DurationNs) -> (u64, u32) {
    (ns / 1_000_000_000, (ns % 1_000_000_000) as u32)
}

/// Remaining-budget tracker for wait loops
///
/// Wraps a start instant and a total budget so that loops which wait, wake
/// and wait again always pass the leftover budget to the next wait.
#[derive(Clone, Copy)]
pub struct Deadline {
    start: Instant,
    budget_ns: DurationNs,
}

impl Deadline {
    /// Start counting `budget_ns` from now
    ///
    /// `budget_ns` must not be [`DURATION_DEFAULT`]; translate it first.
    pub fn after(budget_ns: DurationNs) -> Self {
        debug_assert_ne!(budget_ns, DURATION_DEFAULT, "translate defaults first");
        Self {
            start: Instant::now(),
            budget_ns,
        }
    }

    /// Remaining budget, or `None` once the deadline has passed
    ///
    /// An infinite budget always has [`DURATION_INFINITE`] left. A finite
    /// leftover is clamped up to [`DURATION_NONBLOCKING`] so it never
    /// degenerates into the reserved default value.
    pub fn remaining(&self) -> Option<DurationNs> {
        if self.budget_ns == DURATION_INFINITE {
            return Some(DURATION_INFINITE);
        }
        let elapsed = self.start.elapsed().as_nanos();
        if elapsed >= self.budget_ns as u128 {
            None
        } else {
            Some((self.budget_ns - elapsed as u64).max(DURATION_NONBLOCKING))
        }
    }

    /// Truth that the budget is exhausted
    #[inline]
    pub fn expired(&self) -> bool {
        self.remaining().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_default() {
        assert_eq!(resolve_timeout(DURATION_DEFAULT), DURATION_INFINITE);
        assert_eq!(resolve_timeout(5), 5);
        assert_eq!(resolve_timeout(DURATION_NONBLOCKING), DURATION_NONBLOCKING);
    }

    #[test]
    fn test_split() {
        assert_eq!(split_ns(1_500_000_000), (1, 500_000_000));
        assert_eq!(split_ns(999), (0, 999));
    }

    #[test]
    fn test_deadline_infinite() {
        let deadline = Deadline::after(DURATION_INFINITE);
        assert_eq!(deadline.remaining(), Some(DURATION_INFINITE));
        assert!(!deadline.expired());
    }

    #[test]
    fn test_deadline_expires() {
        let deadline = Deadline::after(DURATION_NONBLOCKING);
        std::thread::sleep(std::time::Duration::from_millis(1));
        assert!(deadline.expired());
    }

    #[test]
    fn test_deadline_counts_down() {
        let deadline = Deadline::after(10_000_000_000);
        let first = deadline.remaining().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = deadline.remaining().unwrap();
        assert!(second < first);
    }
}
