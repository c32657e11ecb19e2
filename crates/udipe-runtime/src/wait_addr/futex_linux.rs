//! Linux futex backend for wait-on-address
//!
//! Single-word waits use the classic `futex(2)` syscall with a relative
//! timeout. Multi-word waits use `futex_waitv(2)` (Linux 5.16+), which
//! blocks on up to 128 words at once, and degrade to time-sliced
//! single-word waits on older kernels.
//!
//! Transient wakeups (EINTR, spurious) need no special handling from
//! callers; any other futex failure violates the syscall contract and
//! terminates the process.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use udipe_core::time::{split_ns, DurationNs, DURATION_INFINITE};
use udipe_core::{fatal, fatal_os, utrace};

/// `futex_waitv(2)` syscall number (not yet in libc)
const SYS_FUTEX_WAITV: libc::c_long = 449;

/// Per-waiter flag: the futex word is 32 bits
const FUTEX2_SIZE_U32: u32 = 0x02;

/// Per-waiter flag: the futex is process-private
const FUTEX2_PRIVATE: u32 = 0x80;

/// Maximum words accepted by one `futex_waitv(2)` call
pub const MAX_WAITV_WORDS: usize = 128;

/// Waiter descriptor of `futex_waitv(2)` (not yet in libc)
#[repr(C)]
struct FutexWaitv {
    val: u64,
    uaddr: u64,
    flags: u32,
    __reserved: u32,
}

pub fn wait(atom: &AtomicU32, expected: u32, timeout_ns: DurationNs) -> bool {
    let timespec;
    let timeout_ptr = if timeout_ns == DURATION_INFINITE {
        std::ptr::null::<libc::timespec>()
    } else {
        let (secs, nanos) = split_ns(timeout_ns);
        timespec = libc::timespec {
            tv_sec: secs as libc::time_t,
            tv_nsec: nanos as libc::c_long,
        };
        &timespec as *const libc::timespec
    };

    let result = unsafe {
        libc::syscall(
            libc::SYS_futex,
            atom.as_ptr(),
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            timeout_ptr,
            std::ptr::null::<u32>(),
            0u32,
        )
    };
    if result == 0 {
        return true;
    }

    match std::io::Error::last_os_error().raw_os_error() {
        // Value already differed from expectation: no wait happened.
        Some(libc::EAGAIN) => true,
        // Signals and timeouts are definitely not notifications.
        Some(libc::EINTR) | Some(libc::ETIMEDOUT) => false,
        _ => fatal_os!("FUTEX_WAIT failed in a way the manpage rules out"),
    }
}

pub fn wake(atom: &AtomicU32, count: i32) {
    let result = unsafe {
        libc::syscall(
            libc::SYS_futex,
            atom.as_ptr(),
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            count,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        )
    };
    if result < 0 {
        fatal_os!("FUTEX_WAKE failed in a way the manpage rules out");
    }
}

/// Truth that `futex_waitv(2)` is known to be unavailable on this kernel
static WAITV_UNAVAILABLE: AtomicBool = AtomicBool::new(false);

pub fn wait_many(atoms: &[&AtomicU32], expected: u32, timeout_ns: DurationNs) -> bool {
    if atoms.len() == 1 {
        return wait(atoms[0], expected, timeout_ns);
    }
    if atoms.len() <= MAX_WAITV_WORDS && !WAITV_UNAVAILABLE.load(Ordering::Relaxed) {
        match waitv(atoms, expected, timeout_ns) {
            Some(notified) => return notified,
            None => WAITV_UNAVAILABLE.store(true, Ordering::Relaxed),
        }
    }

    // Sliced fallback: bounded waits on the first word, so that changes to
    // any other word are picked up by the caller's rescan within a slice.
    const SLICE_NS: DurationNs = 1_000_000;
    wait(atoms[0], expected, timeout_ns.min(SLICE_NS))
}

/// One `futex_waitv(2)` call; `None` when the kernel lacks the syscall
fn waitv(atoms: &[&AtomicU32], expected: u32, timeout_ns: DurationNs) -> Option<bool> {
    let waiters: Vec<FutexWaitv> = atoms
        .iter()
        .map(|atom| FutexWaitv {
            val: expected as u64,
            uaddr: atom.as_ptr() as u64,
            flags: FUTEX2_SIZE_U32 | FUTEX2_PRIVATE,
            __reserved: 0,
        })
        .collect();

    // futex_waitv takes an absolute CLOCK_MONOTONIC deadline.
    let timespec;
    let timeout_ptr = if timeout_ns == DURATION_INFINITE {
        std::ptr::null::<libc::timespec>()
    } else {
        let mut now = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut now) } != 0 {
            fatal_os!("clock_gettime(CLOCK_MONOTONIC) failed");
        }
        let (secs, nanos) = split_ns(timeout_ns);
        let mut deadline_sec = now.tv_sec.saturating_add(secs as libc::time_t);
        let mut deadline_nsec = now.tv_nsec + nanos as libc::c_long;
        if deadline_nsec >= 1_000_000_000 {
            deadline_sec = deadline_sec.saturating_add(1);
            deadline_nsec -= 1_000_000_000;
        }
        timespec = libc::timespec {
            tv_sec: deadline_sec,
            tv_nsec: deadline_nsec,
        };
        &timespec as *const libc::timespec
    };

    let result = unsafe {
        libc::syscall(
            SYS_FUTEX_WAITV,
            waiters.as_ptr(),
            waiters.len() as libc::c_uint,
            0u32,
            timeout_ptr,
            libc::CLOCK_MONOTONIC,
        )
    };
    if result >= 0 {
        return Some(true);
    }

    match std::io::Error::last_os_error().raw_os_error() {
        Some(libc::EAGAIN) => Some(true),
        Some(libc::EINTR) | Some(libc::ETIMEDOUT) => Some(false),
        Some(libc::ENOSYS) | Some(libc::EINVAL) => {
            utrace!("futex_waitv unavailable, falling back to sliced waits");
            None
        }
        _ => fatal!("futex_waitv failed in a way its contract rules out"),
    }
}
