//! Portable fallback for wait-on-address
//!
//! Polls the word with short bounded sleeps. Wake calls are no-ops: the
//! value change itself is what waiters detect, which satisfies the
//! wait-on-address contract (wakeups may always be spurious, and callers
//! re-check their predicate after every return).

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use udipe_core::time::{DurationNs, DURATION_INFINITE};

/// Poll interval; coarse, but this path only exists for unsupported hosts
const POLL_INTERVAL: Duration = Duration::from_millis(1);

pub fn wait(atom: &AtomicU32, expected: u32, timeout_ns: DurationNs) -> bool {
    let start = Instant::now();
    loop {
        if atom.load(Ordering::Acquire) != expected {
            return true;
        }
        if timeout_ns != DURATION_INFINITE
            && start.elapsed().as_nanos() >= timeout_ns as u128
        {
            return false;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

pub fn wait_many(atoms: &[&AtomicU32], expected: u32, timeout_ns: DurationNs) -> bool {
    let start = Instant::now();
    loop {
        if atoms
            .iter()
            .any(|atom| atom.load(Ordering::Acquire) != expected)
        {
            return true;
        }
        if timeout_ns != DURATION_INFINITE
            && start.elapsed().as_nanos() >= timeout_ns as u128
        {
            return false;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

pub fn wake(_atom: &AtomicU32, _count: i32) {}
