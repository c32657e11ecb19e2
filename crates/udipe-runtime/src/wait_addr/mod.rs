//! Wait-on-address: 32-bit wait/wake primitive with timeout
//!
//! Where lock-free code needs to interact with blocking code, it is useful
//! to have a "compare-and-wait" primitive: check that a 32-bit word still
//! holds an expected value and, if so, sleep until another thread wakes
//! the address. The value check and the registration to wait form a single
//! atomic transaction, so a concurrent value change can never result in a
//! lost wakeup.
//!
//! [`wake_all`] is the default notification choice. [`wake_one`] is only
//! appropriate to avoid a thundering herd on a serialised downstream
//! resource, and its "wake one" semantics must never be relied upon for
//! correctness: some platforms alias it to [`wake_all`].

use std::sync::atomic::AtomicU32;

use udipe_core::time::{DurationNs, DURATION_DEFAULT, DURATION_NONBLOCKING};

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod futex_linux;
        use futex_linux as platform;
    } else {
        mod fallback;
        use fallback as platform;
    }
}

/// Wait for a 32-bit word to change, a wakeup, or the timeout
///
/// Checks whether `atom` currently holds `expected`; if not, returns
/// `true` immediately. Otherwise the calling thread sleeps until another
/// thread wakes the address, the timeout elapses, or a spurious wakeup
/// occurs (e.g. a Unix signal).
///
/// Timeout semantics: [`DURATION_NONBLOCKING`] checks and returns without
/// sleeping; [`udipe_core::time::DURATION_INFINITE`] sleeps until a
/// wakeup. The reserved default value must be translated before reaching
/// this primitive.
///
/// Returns `true` if the thread **could** have been awakened by a value
/// change or a wake call, `false` if it is known to have woken up for
/// another reason (timeout, signal). Callers must re-check their predicate
/// either way.
pub fn wait_on_address(atom: &AtomicU32, expected: u32, timeout_ns: DurationNs) -> bool {
    debug_assert_ne!(timeout_ns, DURATION_DEFAULT, "translate defaults first");
    if timeout_ns == DURATION_NONBLOCKING {
        return atom.load(std::sync::atomic::Ordering::Acquire) != expected;
    }
    platform::wait(atom, expected, timeout_ns)
}

/// Wait until any of several 32-bit words changes away from `expected`
///
/// Used by collective waits to block on many completion notifiers at
/// once. Same return convention as [`wait_on_address`]; callers rescan all
/// words after every return.
pub fn wait_on_addresses(atoms: &[&AtomicU32], expected: u32, timeout_ns: DurationNs) -> bool {
    debug_assert_ne!(timeout_ns, DURATION_DEFAULT, "translate defaults first");
    if atoms.is_empty() {
        return false;
    }
    if timeout_ns == DURATION_NONBLOCKING {
        return atoms
            .iter()
            .any(|atom| atom.load(std::sync::atomic::Ordering::Acquire) != expected);
    }
    platform::wait_many(atoms, expected, timeout_ns)
}

/// Release every thread currently parked on `atom`
///
/// Call after changing the value of `atom`, typically with release
/// ordering.
#[inline]
pub fn wake_all(atom: &AtomicU32) {
    platform::wake(atom, i32::MAX);
}

/// Release at least one thread parked on `atom`
///
/// Optimisation over [`wake_all`] for serialised downstream resources; may
/// degrade to waking every waiter.
#[inline]
pub fn wake_one(atom: &AtomicU32) {
    platform::wake(atom, 1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};
    use udipe_core::time::DURATION_INFINITE;

    #[test]
    fn test_value_mismatch_returns_immediately() {
        let atom = AtomicU32::new(7);
        assert!(wait_on_address(&atom, 3, DURATION_INFINITE));
    }

    #[test]
    fn test_nonblocking_never_sleeps() {
        let atom = AtomicU32::new(0);
        let start = Instant::now();
        assert!(!wait_on_address(&atom, 0, DURATION_NONBLOCKING));
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_timeout_elapses() {
        let atom = AtomicU32::new(0);
        let start = Instant::now();
        wait_on_address(&atom, 0, 20_000_000);
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_no_lost_wakeup() {
        let atom = Arc::new(AtomicU32::new(0));
        let waiter = {
            let atom = Arc::clone(&atom);
            thread::spawn(move || {
                while atom.load(Ordering::Acquire) == 0 {
                    wait_on_address(&atom, 0, DURATION_INFINITE);
                }
            })
        };
        thread::sleep(Duration::from_millis(20));
        atom.store(1, Ordering::Release);
        wake_all(&atom);
        waiter.join().unwrap();
    }

    #[test]
    fn test_wake_one_releases_a_waiter() {
        let atom = Arc::new(AtomicU32::new(0));
        let waiter = {
            let atom = Arc::clone(&atom);
            thread::spawn(move || {
                while atom.load(Ordering::Acquire) == 0 {
                    wait_on_address(&atom, 0, DURATION_INFINITE);
                }
            })
        };
        thread::sleep(Duration::from_millis(20));
        atom.store(1, Ordering::Release);
        wake_one(&atom);
        waiter.join().unwrap();
    }

    #[test]
    fn test_wait_many_wakes_on_any() {
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));
        let notifier = {
            let second = Arc::clone(&second);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                second.store(9, Ordering::Release);
                wake_all(&second);
            })
        };
        let start = Instant::now();
        loop {
            if first.load(Ordering::Acquire) != 0 || second.load(Ordering::Acquire) != 0 {
                break;
            }
            wait_on_addresses(&[&first, &second], 0, 1_000_000_000);
            assert!(start.elapsed() < Duration::from_secs(5));
        }
        notifier.join().unwrap();
        assert_eq!(second.load(Ordering::Acquire), 9);
    }
}
