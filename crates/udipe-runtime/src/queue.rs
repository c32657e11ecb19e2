//! One-page MPSC command queue
//!
//! Each worker thread owns one of these queues. Clients are plain
//! application threads and may block, but the worker side is a soft
//! real-time packet loop, so the queue is blocking for producers and
//! lock-free for the single consumer.
//!
//! The whole queue fills exactly one small memory page, laid out as three
//! cache-aligned regions:
//!
//! - a worker block holding the read/write indices and the condition
//!   variable producers sleep on when the ring is full,
//! - a producer block holding the mutex that serialises producers (kept on
//!   its own granule so producer cache ping-pong does not bounce the
//!   worker's lines),
//! - ring storage for the remaining `page/granule - 2` command slots.
//!
//! Indices live in `[0, 2*capacity)`: the queue is empty when they are
//! equal and full when they are `capacity` apart (mod `2*capacity`).

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use udipe_core::command::{
    DisconnectOptions, RecvOptions, RecvStreamOptions, ReplyStreamOptions, SendOptions,
    SendStreamOptions,
};
use udipe_core::constants::{COMMAND_QUEUE_LEN, EXPECTED_MIN_PAGE_SIZE, FALSE_SHARING_GRANULE};
use udipe_core::time::DURATION_INFINITE;

use crate::future::FutureCell;
use crate::wait_addr;

/// Ring capacity of one queue
pub const CAPACITY: usize = COMMAND_QUEUE_LEN;

/// Index arithmetic domain (twice the capacity disambiguates full/empty)
const INDEX_RANGE: u32 = 2 * CAPACITY as u32;

/// Per-command option payloads
///
/// `Absent` is the poison value of uninitialised and consumed ring slots;
/// it never appears in an enqueued command. Connect options are too large
/// to ride inline and are referenced by their pool slot index instead.
pub enum CommandPayload {
    Absent,
    Connect { slot: u32 },
    Disconnect(DisconnectOptions),
    Send(SendOptions),
    Recv(RecvOptions),
    SendStream(SendStreamOptions),
    RecvStream(RecvStreamOptions),
    ReplyStream(ReplyStreamOptions),
}

impl CommandPayload {
    #[inline]
    pub fn is_absent(&self) -> bool {
        matches!(self, CommandPayload::Absent)
    }
}

/// A complete worker command
///
/// Commands from different client threads land in adjacent ring slots, so
/// each one gets a full false-sharing granule.
#[repr(align(128))]
pub struct Command {
    /// Completion future, filled and signalled when the command finishes
    pub completion: *mut FutureCell,
    pub payload: CommandPayload,
}

// Safety: payloads are Send (callbacks are boxed Send closures) and the
// completion pointer targets a cell both sides access through atomics.
unsafe impl Send for Command {}

const _: () = assert!(
    std::mem::size_of::<Command>() <= FALSE_SHARING_GRANULE,
    "a command must not outgrow its false-sharing granule"
);

/// Worker/client control block
#[repr(C, align(128))]
struct WorkerBlock {
    /// Next slot the worker reads; written by the worker only
    read_idx: AtomicU32,
    /// Next slot producers write; also the futex the worker parks on
    write_idx: AtomicU32,
    /// Producers sleep here while the ring is full
    space: Condvar,
}

/// Client/client control block
#[repr(C, align(128))]
struct ProducerBlock {
    /// Serialises producers; commands are rare, contention is cheap
    lock: Mutex<()>,
}

const _: () = assert!(std::mem::size_of::<WorkerBlock>() <= FALSE_SHARING_GRANULE);
const _: () = assert!(std::mem::size_of::<ProducerBlock>() <= FALSE_SHARING_GRANULE);

/// Multi-producer single-consumer command queue of one worker thread
#[repr(C, align(4096))]
pub struct CommandQueue {
    worker: WorkerBlock,
    producer: ProducerBlock,
    slots: [UnsafeCell<MaybeUninit<Command>>; CAPACITY],
}

const _: () = assert!(std::mem::size_of::<CommandQueue>() == EXPECTED_MIN_PAGE_SIZE);
const _: () = assert!(std::mem::size_of::<CommandQueue>() > EXPECTED_MIN_PAGE_SIZE / 2);

// Safety: slots are published through the index protocol; control blocks
// are atomics plus std sync primitives.
unsafe impl Send for CommandQueue {}
unsafe impl Sync for CommandQueue {}

impl CommandQueue {
    pub fn new() -> CommandQueue {
        CommandQueue {
            worker: WorkerBlock {
                read_idx: AtomicU32::new(0),
                write_idx: AtomicU32::new(0),
                space: Condvar::new(),
            },
            producer: ProducerBlock {
                lock: Mutex::new(()),
            },
            slots: std::array::from_fn(|_| {
                UnsafeCell::new(MaybeUninit::new(Command {
                    completion: std::ptr::null_mut(),
                    payload: CommandPayload::Absent,
                }))
            }),
        }
    }

    pub fn new_boxed() -> Box<CommandQueue> {
        Box::new(Self::new())
    }

    #[inline]
    fn next(idx: u32) -> u32 {
        (idx + 1) % INDEX_RANGE
    }

    #[inline]
    fn distance(read: u32, write: u32) -> u32 {
        (write + INDEX_RANGE - read) % INDEX_RANGE
    }

    /// Enqueue a command, blocking while the ring is full
    ///
    /// Producers publish in strict mutex-acquisition order; the single
    /// consumer preserves it.
    pub fn push(&self, command: Command) {
        debug_assert!(!command.payload.is_absent(), "absent commands cannot be enqueued");
        debug_assert!(!command.completion.is_null());

        let mut guard = self
            .producer
            .lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let write = loop {
            let read = self.worker.read_idx.load(Ordering::Acquire);
            let write = self.worker.write_idx.load(Ordering::Relaxed);
            if Self::distance(read, write) < CAPACITY as u32 {
                break write;
            }
            // Bounded waits cover the race where the worker signals
            // between our fullness check and the sleep
            let (g, _) = self
                .worker
                .space
                .wait_timeout(guard, Duration::from_millis(1))
                .unwrap_or_else(PoisonError::into_inner);
            guard = g;
        };

        unsafe {
            (*self.slots[write as usize % CAPACITY].get()).write(command);
        }
        // Publishes the slot write to the consumer
        self.worker.write_idx.store(Self::next(write), Ordering::Release);
        drop(guard);

        // The worker can only be parked with its read index equal to the
        // slot just filled (it never sleeps with commands published ahead
        // of it, thanks to the futex value check). Reading the index
        // after the store above therefore catches every parked state.
        if self.worker.read_idx.load(Ordering::Acquire) == write {
            wait_addr::wake_all(&self.worker.write_idx);
        }
    }

    /// Dequeue the next command; parks while empty, returns `None` once
    /// `shutdown` is set and the ring has drained
    ///
    /// Worker side only: no lock is ever taken here.
    pub fn pop(&self, shutdown: &AtomicBool) -> Option<Command> {
        let read = self.worker.read_idx.load(Ordering::Relaxed);
        loop {
            let write = self.worker.write_idx.load(Ordering::Acquire);
            if write == read {
                if shutdown.load(Ordering::Acquire) {
                    return None;
                }
                wait_addr::wait_on_address(&self.worker.write_idx, read, DURATION_INFINITE);
                continue;
            }

            let was_full = Self::distance(read, write) == CAPACITY as u32;
            let command = unsafe {
                let slot = self.slots[read as usize % CAPACITY].get();
                let command = (*slot).assume_init_read();
                // Poison consumed slots so double-reads trip the absent
                // check in debug builds
                #[cfg(debug_assertions)]
                (*slot).write(Command {
                    completion: std::ptr::null_mut(),
                    payload: CommandPayload::Absent,
                });
                command
            };
            self.worker.read_idx.store(Self::next(read), Ordering::Release);
            if was_full {
                // One free slot releases exactly one blocked producer
                self.worker.space.notify_one();
            }
            return Some(command);
        }
    }

    /// Number of commands currently queued (approximate, for diagnostics)
    pub fn len(&self) -> usize {
        let read = self.worker.read_idx.load(Ordering::Acquire);
        let write = self.worker.write_idx.load(Ordering::Acquire);
        Self::distance(read, write) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wake the parked consumer (used to broadcast shutdown)
    pub fn wake_consumer(&self) {
        wait_addr::wake_all(&self.worker.write_idx);
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        // Run destructors of any commands never consumed
        let mut read = *self.worker.read_idx.get_mut();
        let write = *self.worker.write_idx.get_mut();
        while read != write {
            unsafe {
                drop((*self.slots[read as usize % CAPACITY].get()).assume_init_read());
            }
            read = Self::next(read);
        }
    }
}
