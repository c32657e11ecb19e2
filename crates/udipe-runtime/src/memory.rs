//! Memory allocations optimised for timing-sensitive network threads
//!
//! Compared to the global allocator, [`RealtimeRegion::allocate`] takes a
//! few extra precautions that benefit soft real-time networking:
//!
//! - page-aligned storage whose size is rounded up to a page multiple,
//! - best-effort `mlock` so the kernel cannot swap the buffers out, with
//!   the `RLIMIT_MEMLOCK` soft limit raised on demand,
//! - pre-faulting when locking is not permitted, so first-touch page
//!   faults do not eat into the first packets of a burst,
//! - exit-on-failure semantics, because overcommitting kernels make
//!   recovery from allocation failure illusory anyway.

use std::ptr::NonNull;
use std::sync::{Mutex, OnceLock};

use udipe_core::{fatal_os, udebug, utrace, uwarn};

/// System page size in bytes
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size < 1 {
            fatal_os!("failed to query the system page size");
        }
        size as usize
    })
}

/// Round `size` up to the next multiple of the page size
pub fn round_up_to_page(size: usize) -> usize {
    let page = page_size();
    size.div_ceil(page) * page
}

/// Mutex guarding the process-wide memory locking budget
///
/// The kernel API only exposes read/write limit transactions, not
/// increments, so concurrent adjustments from udipe threads must be
/// serialised. Races with non-udipe threads adjusting the limit remain
/// possible; nothing can be done about those from here.
static MLOCK_BUDGET: Mutex<()> = Mutex::new(());

/// Raise `RLIMIT_MEMLOCK` to accommodate `size` more locked bytes
///
/// Doubles the soft limit until it fits, saturating at the hard limit
/// when that is high enough and otherwise attempting to raise the hard
/// limit too (which requires privilege). Returns whether the limit now
/// accommodates the request.
#[cfg(target_os = "linux")]
fn try_raise_mlock_budget(size: usize) -> bool {
    let _guard = MLOCK_BUDGET
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);

    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_MEMLOCK, &mut limit) } != 0 {
        fatal_os!("failed to query the memory locking limit");
    }
    utrace!(
        "memory locking limit is {}/{} bytes",
        limit.rlim_cur,
        limit.rlim_max
    );

    let initial_cur = limit.rlim_cur;
    let wanted = initial_cur.saturating_add(size as libc::rlim_t);
    while limit.rlim_cur < wanted {
        limit.rlim_cur = limit.rlim_cur.saturating_mul(2).max(page_size() as libc::rlim_t);
    }
    if limit.rlim_cur > limit.rlim_max {
        if limit.rlim_max >= wanted {
            limit.rlim_cur = limit.rlim_max;
        } else {
            limit.rlim_max = limit.rlim_cur;
        }
    }

    if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &limit) } == 0 {
        utrace!("raised the memory locking limit to {} bytes", limit.rlim_cur);
        return true;
    }
    match std::io::Error::last_os_error().raw_os_error() {
        Some(libc::EPERM) => {
            uwarn!(
                "cannot raise the hard memory locking limit; grant this \
                 process CAP_SYS_RESOURCE or raise the limit for its user"
            );
        }
        _ => {
            uwarn!(
                "failed to raise the memory locking limit: {}",
                std::io::Error::last_os_error()
            );
        }
    }
    false
}

#[cfg(not(target_os = "linux"))]
fn try_raise_mlock_budget(_size: usize) -> bool {
    let _guard = MLOCK_BUDGET
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    false
}

/// Touch every page so the kernel backs the range with physical memory
fn prefault(ptr: *mut u8, size: usize) {
    let page = page_size();
    let mut offset = 0;
    while offset < size {
        unsafe { std::ptr::write_volatile(ptr.add(offset), 0) };
        offset += page;
    }
}

/// Lock a page-aligned range into RAM, degrading to pre-faulting
///
/// Locking failure is a performance hazard (the kernel may swap idle
/// buffers out), not a correctness problem, so it warns and continues.
pub fn lock_best_effort(ptr: *mut u8, size: usize) {
    if unsafe { libc::mlock(ptr as *const libc::c_void, size) } == 0 {
        return;
    }
    let retry = match std::io::Error::last_os_error().raw_os_error() {
        // Possibly just the RLIMIT_MEMLOCK soft limit; try raising it.
        Some(libc::ENOMEM) => try_raise_mlock_budget(size),
        _ => false,
    };
    if retry && unsafe { libc::mlock(ptr as *const libc::c_void, size) } == 0 {
        utrace!("mlock succeeded after raising the limit");
        return;
    }
    uwarn!(
        "failed to lock {} bytes into RAM; the kernel may make bad \
         swapping decisions for these buffers",
        size
    );
    prefault(ptr, size);
}

/// Page-aligned, pre-faulted, best-effort locked memory region
pub struct RealtimeRegion {
    ptr: NonNull<u8>,
    size: usize,
}

// Safety: the region is plain memory; access discipline is the caller's.
unsafe impl Send for RealtimeRegion {}

impl RealtimeRegion {
    /// Allocate at least `size` bytes; failure exits the process
    pub fn allocate(size: usize) -> RealtimeRegion {
        assert!(size > 0);
        let size = round_up_to_page(size);

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            fatal_os!("failed to allocate {} bytes of worker memory", size);
        }
        debug_assert_eq!(ptr as usize % page_size(), 0);
        lock_best_effort(ptr as *mut u8, size);
        udebug!("allocated {} realtime bytes at {:p}", size, ptr);

        RealtimeRegion {
            ptr: NonNull::new(ptr as *mut u8).expect("mmap returned null"),
            size,
        }
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl Drop for RealtimeRegion {
    fn drop(&mut self) {
        // Zero on liberation in debug builds to flush out use-after-free
        #[cfg(debug_assertions)]
        unsafe {
            std::ptr::write_bytes(self.ptr.as_ptr(), 0, self.size);
        }
        if unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size) } != 0 {
            fatal_os!("failed to liberate a realtime memory region");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_sane() {
        let page = page_size();
        assert!(page >= 4096);
        assert!(page.is_power_of_two());
    }

    #[test]
    fn test_round_up() {
        let page = page_size();
        assert_eq!(round_up_to_page(1), page);
        assert_eq!(round_up_to_page(page), page);
        assert_eq!(round_up_to_page(page + 1), 2 * page);
    }

    #[test]
    fn test_allocation_is_usable() {
        let page = page_size();
        for request in [1, page - 1, page, page + 1, 2 * page] {
            let region = RealtimeRegion::allocate(request);
            assert!(region.len() >= request);
            assert_eq!(region.as_ptr() as usize % page, 0);
            // Write and read back every expected byte
            unsafe {
                for offset in 0..region.len() {
                    let value = (offset % 255 + 1) as u8;
                    region.as_ptr().add(offset).write(value);
                    assert_eq!(region.as_ptr().add(offset).read(), value);
                }
            }
        }
    }
}
