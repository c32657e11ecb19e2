//! Per-worker datagram buffer pool
//!
//! Each worker thread owns a pool of identically sized, page-aligned
//! buffers that hold incoming and outgoing datagrams (or GRO/GSO batches
//! thereof). In the default configuration individual buffers fit the
//! worker CPU's L1 cache and the whole pool fits an even share of its L2.
//!
//! Allocation never blocks: once the pool is exhausted, `allocate`
//! returns `None` as a back-pressure signal and the caller must wait for
//! outstanding operations to liberate their buffers.

use std::ptr::NonNull;
use std::sync::Arc;

use udipe_core::constants::MAX_BUFFERS;
use udipe_core::{fatal, udebug, uinfo, uwarn, BitArray};

use crate::memory::{round_up_to_page, RealtimeRegion};
use crate::topology::CacheSizes;

/// Cache-share guesses for hosts without topology information
const FALLBACK_L1_SHARE: usize = 32 * 1024;
const FALLBACK_L2_SHARE: usize = 1024 * 1024;

/// Tunable buffer parameters for one worker thread (0 = auto)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferConfig {
    /// Size of an individual buffer in bytes, rounded up to a page
    /// multiple; 0 picks 80 % of the worker CPU's L1 share
    pub buffer_size: usize,

    /// Number of buffers in the pool, at most [`MAX_BUFFERS`]; 0 sizes the
    /// pool to an even share of the worker CPU's L2
    pub buffer_count: usize,
}

/// Per-worker configuration callback
///
/// Invoked by each worker thread on startup with its worker index, so it
/// must be thread-safe. Useful on systems with heterogeneous cores.
pub type BufferConfigurator = Arc<dyn Fn(usize) -> BufferConfig + Send + Sync>;

/// Fixed pool of page-aligned datagram buffers
pub struct BufferPool {
    pool: RealtimeRegion,
    config: BufferConfig,
    /// Bit i set = buffer i is available
    availability: BitArray,
}

impl BufferPool {
    /// Build the pool for one worker thread
    ///
    /// `cpu` is the CPU the worker runs on, used for cache-aware default
    /// sizing through the `cache` capability.
    pub fn new(
        worker: usize,
        cpu: usize,
        configurator: Option<&BufferConfigurator>,
        cache: &dyn CacheSizes,
    ) -> BufferPool {
        let mut config = match configurator {
            Some(callback) => callback(worker),
            None => BufferConfig::default(),
        };
        finish_configuration(&mut config, cpu, cache);

        let pool = RealtimeRegion::allocate(config.buffer_size * config.buffer_count);
        let mut availability = BitArray::new(config.buffer_count);
        availability.range_set(0, config.buffer_count, true);

        BufferPool {
            pool,
            config,
            availability,
        }
    }

    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.config.buffer_size
    }

    #[inline]
    pub fn buffer_count(&self) -> usize {
        self.config.buffer_count
    }

    /// Number of currently available buffers
    pub fn available(&self) -> usize {
        self.availability.count(true)
    }

    /// Take a free buffer, or `None` when the pool is exhausted
    ///
    /// `None` is the back-pressure signal: the caller should complete
    /// outstanding operations before retrying. Never blocks.
    pub fn allocate(&mut self) -> Option<NonNull<u8>> {
        let idx = self.availability.find_first(true)?;
        self.availability.set(idx, false);
        let ptr = unsafe { self.pool.as_ptr().add(idx * self.config.buffer_size) };
        NonNull::new(ptr)
    }

    /// Return a buffer previously obtained from [`BufferPool::allocate`]
    pub fn liberate(&mut self, buffer: NonNull<u8>) {
        let base = self.pool.as_ptr() as usize;
        let addr = buffer.as_ptr() as usize;
        assert!(addr >= base && addr < base + self.pool.len());
        let offset = addr - base;
        assert_eq!(offset % self.config.buffer_size, 0);
        let idx = offset / self.config.buffer_size;
        assert!(!self.availability.get(idx), "buffer liberated twice");

        // Zero on liberation in debug builds to flush out stale reads
        #[cfg(debug_assertions)]
        unsafe {
            std::ptr::write_bytes(buffer.as_ptr(), 0, self.config.buffer_size);
        }

        self.availability.set(idx, true);
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        let live = self.config.buffer_count - self.availability.count(true);
        if live != 0 {
            fatal!(
                "buffer pool finalised with {} buffer(s) still allocated",
                live
            );
        }
    }
}

/// Replace placeholder zeroes with cache-derived defaults and round the
/// buffer size up to a page multiple
fn finish_configuration(config: &mut BufferConfig, cpu: usize, cache: &dyn CacheSizes) {
    if config.buffer_size == 0 {
        let l1 = cache.l1_data_share(cpu).unwrap_or(FALLBACK_L1_SHARE);
        // 80% safety factor keeps one buffer plus worker state inside L1
        config.buffer_size = l1 * 8 / 10;
        udebug!("auto buffer size from L1 share {}: {}", l1, config.buffer_size);
    }
    config.buffer_size = round_up_to_page(config.buffer_size);
    uinfo!("selected a buffer size of {} bytes", config.buffer_size);

    if config.buffer_count == 0 {
        let l2 = cache.l2_share(cpu).unwrap_or(FALLBACK_L2_SHARE);
        config.buffer_count = l2.div_ceil(config.buffer_size).max(1);
        if config.buffer_count > MAX_BUFFERS {
            uwarn!(
                "auto-configuration suggests {} buffers but only {} are \
                 supported, sticking with the maximum",
                config.buffer_count,
                MAX_BUFFERS
            );
            config.buffer_count = MAX_BUFFERS;
        } else {
            uinfo!("will allocate a pool of {} buffers", config.buffer_count);
        }
    } else if config.buffer_count > MAX_BUFFERS {
        fatal!(
            "buffer_count {} exceeds the supported maximum of {}",
            config.buffer_count,
            MAX_BUFFERS
        );
    }
}
