//! # udipe-core
//!
//! Core types for the udipe UDP I/O engine.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! All platform-specific implementations (futex waits, sockets, memory
//! locking, worker threads) live in `udipe-runtime`.
//!
//! ## Modules
//!
//! - `bit_array` - Dense bit array with scan, count and range operations
//! - `command` - Command identifiers, options and result payloads
//! - `time` - Nanosecond durations with reserved sentinel values
//! - `error` - Error types and fatal-exit helpers
//! - `spinlock` - Internal spinlock primitive
//! - `uprint` - Leveled debug printing macros
//! - `env` - Environment variable utilities

pub mod bit_array;
pub mod command;
pub mod env;
pub mod error;
pub mod spinlock;
pub mod time;
pub mod uprint;

// Re-exports for convenience
pub use bit_array::BitArray;
pub use command::{
    CommandId, CommandResult, ConnectOptions, ConnectOutcome, ConnectionId, Direction,
    DisconnectOptions, RecvOptions, RecvOutcome, RecvStreamOptions, ReplyStreamOptions,
    SendOptions, SendOutcome, SendStreamOptions, StreamControl, StreamOutcome, Toggle,
    NOTIFIER_INVALID, NOTIFIER_PENDING,
};
pub use env::{env_get, env_get_bool, env_get_opt};
pub use error::{OpResult, UdipeError};
pub use spinlock::SpinLock;
pub use time::{Deadline, DurationNs, DURATION_DEFAULT, DURATION_INFINITE, DURATION_NONBLOCKING};

/// Constants for memory layout
pub mod constants {
    /// Upper bound on the cache-coherence fetch unit.
    ///
    /// Struct fields written by different threads must not share a granule.
    /// 128 rather than 64 because recent x86_64 parts prefetch cache lines
    /// in adjacent pairs.
    pub const FALSE_SHARING_GRANULE: usize = 128;

    /// Lower bound on the CPU cache line size.
    pub const CACHE_LINE_SIZE: usize = 64;

    /// Expected size of the smallest memory page.
    ///
    /// Used to size structures meant to fill exactly one page. If the
    /// estimate is low on some platform we only waste a little space.
    pub const EXPECTED_MIN_PAGE_SIZE: usize = 4096;

    /// Maximum number of datagram buffers per worker thread.
    ///
    /// One bit-array word tracks availability, hence the limit.
    pub const MAX_BUFFERS: usize = 64;

    /// Number of shared connect-option slots per context.
    ///
    /// Bounded at 32 by the single `u32` availability bitmap that doubles
    /// as the futex clients wait on when every slot is taken.
    pub const NUM_SHARED_OPTIONS: usize = 32;

    /// Command slots in a worker's one-page command queue.
    ///
    /// Two granules are reserved for the control blocks, the rest is ring
    /// storage.
    pub const COMMAND_QUEUE_LEN: usize =
        EXPECTED_MIN_PAGE_SIZE / FALSE_SHARING_GRANULE - 2;

    /// Maximum worker threads per context.
    pub const MAX_WORKERS: usize = 64;
}
