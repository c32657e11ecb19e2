//! Bounded pool of oversized connect options
//!
//! Connect options are large (IPv6 addresses, an interface string) and
//! would bloat the command record that every other command enjoys keeping
//! within one cache line. Connecting is rare, so oversized options go
//! through a small pool of preallocated slots instead: a client takes a
//! slot (blocking if all 32 are in use), hands its index to the
//! participating workers, and the slot returns to the pool when the last
//! worker drops its reference.
//!
//! A single `u32` availability bitmap (bit i set = slot i free) doubles as
//! the futex clients sleep on when the pool is empty, which is what caps
//! the pool at 32 slots.
//!
//! The slot also carries the fan-in state of a collective connect: a
//! release-stored abort flag raised by the first failing worker, and a
//! staging area where each worker parks its opened socket until the last
//! reference decides to commit or roll back the whole set.

use std::cell::UnsafeCell;
use std::sync::atomic::{fence, AtomicU32, Ordering};

use udipe_core::command::ConnectOptions;
use udipe_core::constants::NUM_SHARED_OPTIONS;
use udipe_core::error::UdipeError;
use udipe_core::time::DURATION_INFINITE;
use udipe_core::{fatal, utrace, SpinLock};

use crate::socket::UdpSock;
use crate::wait_addr;

/// A socket opened by one worker, parked until the connect commits
pub struct StagedSocket {
    pub worker: usize,
    pub sock: UdpSock,
}

/// Fan-in state of a collective connect
#[derive(Default)]
pub struct ConnectStaging {
    /// Sockets opened so far, one per successful worker
    pub sockets: Vec<StagedSocket>,
    /// First failure, recorded by the worker that raised the abort flag
    pub error: Option<UdipeError>,
}

/// One pool slot
///
/// The options cell is written by exactly one client (while the slot's
/// availability bit is clear) and read by the participating workers, so
/// it lives on its own false-sharing granule ahead of the control fields.
#[repr(C, align(128))]
struct OptionsSlot {
    options: UnsafeCell<Option<ConnectOptions>>,
    /// Workers still holding a reference to this slot
    refcount: AtomicU32,
    /// Nonzero once a participating worker failed; stored with release
    /// ordering so late workers observe the failure before fan-in
    abort: AtomicU32,
    staging: SpinLock<ConnectStaging>,
}

// Safety: the options cell is guarded by the allocation protocol above.
unsafe impl Sync for OptionsSlot {}

impl OptionsSlot {
    fn new() -> Self {
        OptionsSlot {
            options: UnsafeCell::new(None),
            refcount: AtomicU32::new(0),
            abort: AtomicU32::new(0),
            staging: SpinLock::new(ConnectStaging::default()),
        }
    }
}

/// Initial bitmap: every slot available
const ALL_AVAILABLE: u32 = u32::MAX;
const _: () = assert!(NUM_SHARED_OPTIONS == 32, "bitmap is a single u32");

/// Pool of [`NUM_SHARED_OPTIONS`] connect-option slots
pub struct SharedOptionsPool {
    /// Bit i set = slot i is free; also the futex empty clients sleep on
    availability: AtomicU32,
    slots: [OptionsSlot; NUM_SHARED_OPTIONS],
}

impl SharedOptionsPool {
    pub fn new() -> Self {
        SharedOptionsPool {
            availability: AtomicU32::new(ALL_AVAILABLE),
            slots: std::array::from_fn(|_| OptionsSlot::new()),
        }
    }

    /// Take a slot for a connect involving `refs` workers
    ///
    /// Blocks until a slot frees up when all are in use. The slot is
    /// picked uniformly at random among the free ones so that concurrent
    /// clients do not all fight over the lowest bit.
    pub fn allocate(&self, refs: u32, options: ConnectOptions) -> usize {
        debug_assert!(refs >= 1);
        let mut availability = self.availability.load(Ordering::Relaxed);
        let idx = loop {
            while availability == 0 {
                utrace!("all connect-option slots in use, waiting");
                wait_addr::wait_on_address(&self.availability, 0, DURATION_INFINITE);
                availability = self.availability.load(Ordering::Relaxed);
            }

            let candidate = nth_set_bit(availability, random_below(availability.count_ones()));
            let bit = 1u32 << candidate;
            let previous = self.availability.fetch_and(!bit, Ordering::Relaxed);
            if previous & bit != 0 {
                break candidate as usize;
            }
            // Another client claimed that slot first, try again
            availability = previous & !bit;
        };
        // Synchronizes with the release in deallocate(), and transitively
        // with every worker that released a reference to this slot.
        fence(Ordering::Acquire);

        let slot = &self.slots[idx];
        debug_assert_eq!(
            slot.refcount.load(Ordering::Relaxed),
            0,
            "slot reused while still referenced"
        );
        unsafe {
            *slot.options.get() = Some(options);
        }
        slot.abort.store(0, Ordering::Relaxed);
        slot.refcount.store(refs, Ordering::Relaxed);
        utrace!("allocated connect-option slot {} for {} worker(s)", idx, refs);
        idx
    }

    /// Read the options of an allocated slot
    ///
    /// Valid from allocation until the last reference is released; the
    /// command-queue hand-off orders the client's write before any worker
    /// read.
    pub fn options(&self, idx: usize) -> &ConnectOptions {
        unsafe {
            (*self.slots[idx].options.get())
                .as_ref()
                .unwrap_or_else(|| fatal!("read of an unallocated connect-option slot"))
        }
    }

    /// Record a worker-side connect failure
    ///
    /// The first error wins; later failures are dropped. The abort flag is
    /// release-stored so that workers observing it also observe the error.
    pub fn record_failure(&self, idx: usize, error: UdipeError) {
        let slot = &self.slots[idx];
        slot.staging.lock().error.get_or_insert(error);
        slot.abort.store(1, Ordering::Release);
    }

    /// Truth that a participating worker has already failed
    pub fn aborted(&self, idx: usize) -> bool {
        self.slots[idx].abort.load(Ordering::Acquire) != 0
    }

    /// Park a successfully opened socket until fan-in
    pub fn stage_socket(&self, idx: usize, staged: StagedSocket) {
        self.slots[idx].staging.lock().sockets.push(staged);
    }

    /// Take the whole fan-in state (last reference only)
    pub fn take_staging(&self, idx: usize) -> ConnectStaging {
        std::mem::take(&mut *self.slots[idx].staging.lock())
    }

    /// Drop one worker reference; true when the caller held the last one
    ///
    /// The last releaser performs the connect fan-in and must then call
    /// [`SharedOptionsPool::deallocate`].
    pub fn release(&self, idx: usize) -> bool {
        let slot = &self.slots[idx];
        let initial = slot.refcount.load(Ordering::Relaxed);
        debug_assert!(initial > 0, "slot released too many times");

        // Single-owner fast path, always taken for sequential connects
        if initial == 1 {
            // Synchronizes with every prior release-ordered decrement so
            // the upcoming deallocation publishes all of them.
            fence(Ordering::Acquire);
            slot.refcount.store(0, Ordering::Relaxed);
            return true;
        }

        let previous = slot.refcount.fetch_sub(1, Ordering::Release);
        if previous == 1 {
            fence(Ordering::Acquire);
            return true;
        }
        false
    }

    /// Return a slot to the pool, waking one waiting client if the pool
    /// was empty
    pub fn deallocate(&self, idx: usize) {
        let slot = &self.slots[idx];
        debug_assert_eq!(slot.refcount.load(Ordering::Relaxed), 0);
        unsafe {
            *slot.options.get() = None;
        }

        let bit = 1u32 << idx;
        // Release so that the next allocator's acquire fence observes all
        // prior liberations of this slot.
        let previous = self.availability.fetch_or(bit, Ordering::Release);
        debug_assert_eq!(previous & bit, 0, "slot deallocated twice");
        if previous == 0 {
            // The pool was empty, so clients may be parked on the bitmap.
            // One slot frees one client; waking all of them would only
            // stampede the allocation path.
            wait_addr::wake_one(&self.availability);
        }
    }

    /// Number of currently free slots
    pub fn available_slots(&self) -> usize {
        self.availability.load(Ordering::Relaxed).count_ones() as usize
    }
}

impl Default for SharedOptionsPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SharedOptionsPool {
    fn drop(&mut self) {
        if self.availability.load(Ordering::Relaxed) != ALL_AVAILABLE {
            fatal!("connect-option pool finalised with slots still in use");
        }
    }
}

/// Index of the `nth` set bit of `word` (nth < popcount)
fn nth_set_bit(word: u32, nth: u32) -> u32 {
    let mut idx = 0;
    let mut bits = word;
    for _ in 0..nth {
        let skip = bits.trailing_zeros() + 1;
        idx += skip;
        bits >>= skip;
    }
    idx + bits.trailing_zeros()
}

/// Uniform-ish pick in `0..bound` from a per-thread xorshift state
fn random_below(bound: u32) -> u32 {
    use std::cell::Cell;
    use std::hash::{BuildHasher, Hasher};
    thread_local! {
        static RNG: Cell<u64> = Cell::new({
            let seed = udipe_core::env::env_get_opt::<u64>("UDIPE_TEST_SEED")
                .unwrap_or_else(|| {
                    std::collections::hash_map::RandomState::new()
                        .build_hasher()
                        .finish()
                });
            seed | 1
        });
    }
    RNG.with(|rng| {
        let mut x = rng.get();
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        rng.set(x);
        (x % bound as u64) as u32
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_nth_set_bit() {
        assert_eq!(nth_set_bit(0b1010, 0), 1);
        assert_eq!(nth_set_bit(0b1010, 1), 3);
        assert_eq!(nth_set_bit(u32::MAX, 31), 31);
        assert_eq!(nth_set_bit(1 << 17, 0), 17);
    }

    #[test]
    fn test_allocate_release_round_trip() {
        let pool = SharedOptionsPool::new();
        assert_eq!(pool.available_slots(), NUM_SHARED_OPTIONS);

        let idx = pool.allocate(1, ConnectOptions::default());
        assert_eq!(pool.available_slots(), NUM_SHARED_OPTIONS - 1);
        assert!(pool.options(idx).local_address.is_none());

        assert!(pool.release(idx));
        let _ = pool.take_staging(idx);
        pool.deallocate(idx);
        assert_eq!(pool.available_slots(), NUM_SHARED_OPTIONS);
    }

    #[test]
    fn test_refcount_fan_in() {
        let pool = SharedOptionsPool::new();
        let idx = pool.allocate(3, ConnectOptions::default());
        assert!(!pool.release(idx));
        assert!(!pool.release(idx));
        assert!(pool.release(idx));
        pool.deallocate(idx);
        assert_eq!(pool.available_slots(), NUM_SHARED_OPTIONS);
    }

    #[test]
    fn test_abort_flag() {
        let pool = SharedOptionsPool::new();
        let idx = pool.allocate(2, ConnectOptions::default());
        assert!(!pool.aborted(idx));
        pool.record_failure(idx, UdipeError::SocketError(19));
        pool.record_failure(idx, UdipeError::SocketError(13));
        assert!(pool.aborted(idx));
        // First error wins
        let staging = pool.take_staging(idx);
        assert_eq!(staging.error, Some(UdipeError::SocketError(19)));
        assert!(!pool.release(idx));
        assert!(pool.release(idx));
        pool.deallocate(idx);
    }

    #[test]
    fn test_exhaustion_blocks_until_release() {
        let pool = Arc::new(SharedOptionsPool::new());
        let mut taken: Vec<usize> = (0..NUM_SHARED_OPTIONS)
            .map(|_| pool.allocate(1, ConnectOptions::default()))
            .collect();
        assert_eq!(pool.available_slots(), 0);

        let blocked = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.allocate(1, ConnectOptions::default()))
        };
        thread::sleep(std::time::Duration::from_millis(20));

        let idx = taken.pop().unwrap();
        assert!(pool.release(idx));
        pool.deallocate(idx);

        let reclaimed = blocked.join().unwrap();
        assert!(reclaimed < NUM_SHARED_OPTIONS);

        for idx in taken.into_iter().chain([reclaimed]) {
            assert!(pool.release(idx));
            pool.deallocate(idx);
        }
        assert_eq!(pool.available_slots(), NUM_SHARED_OPTIONS);
    }

    #[test]
    fn test_concurrent_allocators_get_distinct_slots() {
        let pool = Arc::new(SharedOptionsPool::new());
        let mut handles = vec![];
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            handles.push(thread::spawn(move || {
                (0..4)
                    .map(|_| pool.allocate(1, ConnectOptions::default()))
                    .collect::<Vec<_>>()
            }));
        }
        let mut all: Vec<usize> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        let before = all.len();
        all.dedup();
        assert_eq!(all.len(), before, "two clients claimed the same slot");
        for idx in all {
            assert!(pool.release(idx));
            pool.deallocate(idx);
        }
    }
}
