//! Completion futures
//!
//! Every asynchronous command returns a [`FutureHandle`]. Under the hood a
//! future is a single false-sharing granule holding the result payload and
//! a 32-bit atomic notifier, which doubles as the word client threads park
//! on. The notifier starts at [`NOTIFIER_PENDING`]; the worker writes the
//! payload, release-stores the command id into the notifier and wakes all
//! waiters. Readers pair an acquire load of the notifier with the payload
//! read, which is what makes the payload write visible.
//!
//! Successfully awaited futures are recycled: the notifier is poisoned
//! with [`NOTIFIER_INVALID`] and the cell goes back to a thread-local
//! cache, spilling into a bounded global queue so that threads which only
//! await (and never submit) do not hoard every cell.

use std::cell::RefCell;
use std::mem::MaybeUninit;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use crossbeam_queue::ArrayQueue;
use udipe_core::command::{CommandResult, NOTIFIER_INVALID, NOTIFIER_PENDING};
use udipe_core::constants::FALSE_SHARING_GRANULE;
use udipe_core::time::{resolve_timeout, Deadline, DurationNs, DURATION_INFINITE, DURATION_NONBLOCKING};

use crate::wait_addr;

/// Storage of one future: result payload plus completion notifier
///
/// Shared between the submitting client and one worker, so it occupies a
/// full false-sharing granule of its own.
#[repr(align(128))]
pub(crate) struct FutureCell {
    /// Written by the worker before the notifier store publishes it
    payload: std::cell::UnsafeCell<MaybeUninit<CommandResult>>,

    /// [`NOTIFIER_PENDING`] until completion, then the command id;
    /// [`NOTIFIER_INVALID`] while recycled
    notifier: AtomicU32,
}

const _: () = assert!(std::mem::size_of::<FutureCell>() == FALSE_SHARING_GRANULE);

// Safety: the payload is only touched on the worker side before the
// release store and on the client side after the acquire load.
unsafe impl Sync for FutureCell {}
unsafe impl Send for FutureCell {}

impl FutureCell {
    fn new_invalid() -> Self {
        FutureCell {
            payload: std::cell::UnsafeCell::new(MaybeUninit::uninit()),
            notifier: AtomicU32::new(NOTIFIER_INVALID),
        }
    }
}

/// Cells kept per thread before spilling to the global pool
const LOCAL_CACHE_MAX: usize = 32;

/// Bound of the global recycling pool; overflow falls back to the heap
const GLOBAL_CACHE_CAP: usize = 256;

thread_local! {
    static LOCAL_CACHE: RefCell<Vec<Box<FutureCell>>> = const { RefCell::new(Vec::new()) };
}

fn global_cache() -> &'static ArrayQueue<Box<FutureCell>> {
    static GLOBAL_CACHE: OnceLock<ArrayQueue<Box<FutureCell>>> = OnceLock::new();
    GLOBAL_CACHE.get_or_init(|| ArrayQueue::new(GLOBAL_CACHE_CAP))
}

/// Take a fresh pending future cell
pub(crate) fn allocate() -> FutureHandle {
    let cell = LOCAL_CACHE
        .with(|cache| cache.borrow_mut().pop())
        .or_else(|| global_cache().pop())
        .unwrap_or_else(|| Box::new(FutureCell::new_invalid()));
    debug_assert_eq!(cell.notifier.load(Ordering::Relaxed), NOTIFIER_INVALID);
    cell.notifier.store(NOTIFIER_PENDING, Ordering::Relaxed);
    FutureHandle {
        cell: NonNull::new(Box::into_raw(cell)).expect("box cannot be null"),
    }
}

/// Return a poisoned cell to the caches
fn recycle(cell: Box<FutureCell>) {
    debug_assert_eq!(cell.notifier.load(Ordering::Relaxed), NOTIFIER_INVALID);
    let overflow = LOCAL_CACHE.with(|cache| {
        let mut cache = cache.borrow_mut();
        if cache.len() < LOCAL_CACHE_MAX {
            cache.push(cell);
            None
        } else {
            Some(cell)
        }
    });
    if let Some(cell) = overflow {
        // Queue full: let the heap have it back
        let _ = global_cache().push(cell);
    }
}

/// Worker side: publish a command result into a future cell
///
/// # Safety
///
/// `cell` must come from a live [`FutureHandle`] whose command this worker
/// owns, and must be completed exactly once.
pub(crate) unsafe fn complete(cell: *mut FutureCell, result: CommandResult) {
    let id = result
        .command_id()
        .expect("workers never publish a pending result");
    (*(*cell).payload.get()).write(result);
    // The release store is what publishes the payload write above
    (*cell).notifier.store(id as u32, Ordering::Release);
    wait_addr::wake_all(&(*cell).notifier);
}

/// Owned handle to an asynchronous operation
///
/// Returned by every `start_*` entry point. Consumed by a successful
/// [`FutureHandle::wait`]; handed back when the wait times out, leaving
/// the future usable. Dropping a still-pending handle blocks until the
/// worker publishes, because the worker owns a pointer into the cell until
/// then.
#[derive(Debug)]
pub struct FutureHandle {
    cell: NonNull<FutureCell>,
}

// Safety: the cell is heap-allocated and the notifier protocol guards all
// payload access.
unsafe impl Send for FutureHandle {}

impl FutureHandle {
    /// Raw cell pointer for embedding in a command record
    pub(crate) fn cell_ptr(&self) -> *mut FutureCell {
        self.cell.as_ptr()
    }

    pub(crate) fn notifier(&self) -> &AtomicU32 {
        unsafe { &(*self.cell.as_ptr()).notifier }
    }

    /// Truth that the operation has completed
    ///
    /// When this returns true, a wait is guaranteed to return the result
    /// without blocking.
    pub fn done(&self) -> bool {
        let notifier = self.notifier().load(Ordering::Acquire);
        debug_assert_ne!(notifier, NOTIFIER_INVALID, "future used after await");
        notifier != NOTIFIER_PENDING
    }

    /// Wait for the result, up to `timeout_ns`
    ///
    /// On completion the handle is consumed and the result returned. On
    /// timeout the handle comes back unchanged and can be awaited again;
    /// the underlying command keeps running either way. The reserved
    /// duration values apply: 0 waits forever (the default for waits),
    /// 1 polls without blocking, `u64::MAX` waits forever.
    pub fn wait(self, timeout_ns: DurationNs) -> Result<CommandResult, FutureHandle> {
        let deadline = Deadline::after(resolve_timeout(timeout_ns));
        loop {
            let notifier = self.notifier().load(Ordering::Acquire);
            debug_assert_ne!(notifier, NOTIFIER_INVALID, "future awaited twice");
            if notifier != NOTIFIER_PENDING {
                return Ok(self.consume());
            }
            match deadline.remaining() {
                None => return Err(self),
                Some(remaining) => {
                    wait_addr::wait_on_address(self.notifier(), NOTIFIER_PENDING, remaining);
                }
            }
        }
    }

    /// Read the published payload and recycle the cell
    ///
    /// Callers must have observed a non-pending notifier with acquire
    /// ordering.
    fn consume(self) -> CommandResult {
        let cell = self.cell.as_ptr();
        std::mem::forget(self);
        unsafe {
            let result = (*(*cell).payload.get()).assume_init_read();
            (*cell).notifier.store(NOTIFIER_INVALID, Ordering::Relaxed);
            recycle(Box::from_raw(cell));
            result
        }
    }
}

impl Drop for FutureHandle {
    fn drop(&mut self) {
        let cell = self.cell.as_ptr();
        unsafe {
            // The worker still writes through its pointer until the
            // notifier leaves pending; wait that out before freeing.
            loop {
                let notifier = (*cell).notifier.load(Ordering::Acquire);
                if notifier != NOTIFIER_PENDING {
                    break;
                }
                wait_addr::wait_on_address(&(*cell).notifier, NOTIFIER_PENDING, DURATION_INFINITE);
            }
            drop((*(*cell).payload.get()).assume_init_read());
            (*cell).notifier.store(NOTIFIER_INVALID, Ordering::Relaxed);
            recycle(Box::from_raw(cell));
        }
    }
}

/// Outcome of [`wait_all`]
pub struct WaitAllOutcome {
    /// Truth that every future completed before the timeout
    pub complete: bool,
    /// One entry per input future; stragglers report `Pending`
    pub results: Vec<CommandResult>,
    /// Handles of the futures that did not complete, at their input
    /// positions; all still usable
    pub pending: Vec<Option<FutureHandle>>,
}

/// Wait for every future to complete, or for the timeout to elapse
///
/// When the return reports completion, every result is valid and every
/// handle has been consumed. Otherwise each straggler reports `Pending`
/// in `results` and its handle comes back in `pending`.
pub fn wait_all(futures: Vec<FutureHandle>, timeout_ns: DurationNs) -> WaitAllOutcome {
    let deadline = Deadline::after(resolve_timeout(timeout_ns));
    let mut outcome = WaitAllOutcome {
        complete: true,
        results: Vec::with_capacity(futures.len()),
        pending: Vec::with_capacity(futures.len()),
    };
    for future in futures {
        // Once the deadline passes, later futures get a nonblocking check
        let budget = deadline.remaining().unwrap_or(DURATION_NONBLOCKING);
        match future.wait(budget) {
            Ok(result) => {
                outcome.results.push(result);
                outcome.pending.push(None);
            }
            Err(handle) => {
                outcome.complete = false;
                outcome.results.push(CommandResult::Pending);
                outcome.pending.push(Some(handle));
            }
        }
    }
    outcome
}

/// Outcome of [`wait_any`]
pub struct WaitAnyOutcome {
    /// One entry per input future; non-completed entries report `Pending`
    pub results: Vec<CommandResult>,
    /// Handles of the futures that did not complete, at their input
    /// positions; all still usable
    pub pending: Vec<Option<FutureHandle>>,
    /// Input positions of the completed futures, in completion order
    pub positions: Vec<usize>,
}

/// Wait for at least one future to complete, or for the timeout
///
/// First scans every notifier without blocking; when none has completed,
/// blocks on all of them at once and rescans on every wakeup. Returns as
/// soon as one scan finds completions; `positions.len()` is the completion
/// count, zero meaning the wait timed out.
pub fn wait_any(futures: Vec<FutureHandle>, timeout_ns: DurationNs) -> WaitAnyOutcome {
    let deadline = Deadline::after(resolve_timeout(timeout_ns));
    let mut pending: Vec<Option<FutureHandle>> = futures.into_iter().map(Some).collect();
    let mut results: Vec<CommandResult> =
        pending.iter().map(|_| CommandResult::Pending).collect();
    let mut positions = Vec::new();

    if pending.is_empty() {
        return WaitAnyOutcome {
            results,
            pending,
            positions,
        };
    }

    loop {
        // Completion scan, no blocking
        for idx in 0..pending.len() {
            let completed = matches!(&pending[idx], Some(handle) if handle.done());
            if completed {
                let handle = pending[idx].take().expect("checked above");
                match handle.wait(DURATION_NONBLOCKING) {
                    Ok(result) => {
                        results[idx] = result;
                        positions.push(idx);
                    }
                    Err(handle) => {
                        // done() cannot regress; keep the handle anyway
                        pending[idx] = Some(handle);
                    }
                }
            }
        }
        if !positions.is_empty() {
            return WaitAnyOutcome {
                results,
                pending,
                positions,
            };
        }

        let Some(budget) = deadline.remaining() else {
            return WaitAnyOutcome {
                results,
                pending,
                positions,
            };
        };

        // Block until any notifier leaves the pending state
        let notifiers: Vec<&AtomicU32> = pending
            .iter()
            .flatten()
            .map(|handle| handle.notifier())
            .collect();
        wait_addr::wait_on_addresses(&notifiers, NOTIFIER_PENDING, budget);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;
    use udipe_core::command::{CommandId, SendOutcome};

    fn completed_send(bytes: usize) -> FutureHandle {
        let handle = allocate();
        unsafe {
            complete(
                handle.cell_ptr(),
                CommandResult::Send(Ok(SendOutcome { bytes_sent: bytes })),
            );
        }
        handle
    }

    /// Publish `result` into `handle` from another thread after a delay
    fn complete_later(handle: &FutureHandle, delay: Duration, bytes: usize) -> thread::JoinHandle<()> {
        struct CellPtr(*mut FutureCell);
        unsafe impl Send for CellPtr {}
        let cell = CellPtr(handle.cell_ptr());
        thread::spawn(move || {
            thread::sleep(delay);
            let cell = cell;
            unsafe {
                complete(
                    cell.0,
                    CommandResult::Send(Ok(SendOutcome { bytes_sent: bytes })),
                );
            }
        })
    }

    #[test]
    fn test_immediate_completion() {
        let handle = completed_send(3);
        assert!(handle.done());
        match handle.wait(DURATION_NONBLOCKING) {
            Ok(CommandResult::Send(Ok(outcome))) => assert_eq!(outcome.bytes_sent, 3),
            _ => panic!("expected a completed send"),
        }
    }

    #[test]
    fn test_nonblocking_wait_on_pending() {
        let handle = allocate();
        assert!(!handle.done());
        let handle = match handle.wait(DURATION_NONBLOCKING) {
            Err(handle) => handle,
            Ok(_) => panic!("nothing published this future"),
        };
        // Future remains usable after the timeout
        let worker = complete_later(&handle, Duration::from_millis(10), 1);
        let result = handle.wait(DURATION_INFINITE).expect("must complete");
        assert_eq!(result.command_id(), Some(CommandId::Send));
        worker.join().unwrap();
    }

    #[test]
    fn test_wait_blocks_until_completion() {
        let handle = allocate();
        let worker = complete_later(&handle, Duration::from_millis(20), 7);
        match handle.wait(DURATION_INFINITE) {
            Ok(CommandResult::Send(Ok(outcome))) => assert_eq!(outcome.bytes_sent, 7),
            _ => panic!("expected a completed send"),
        }
        worker.join().unwrap();
    }

    #[test]
    fn test_recycling_reuses_cells() {
        let handle = completed_send(1);
        let first_cell = handle.cell_ptr();
        let _ = handle.wait(DURATION_NONBLOCKING);
        // Same thread allocates again: the cache hands the cell back
        let handle = allocate();
        assert_eq!(handle.cell_ptr(), first_cell);
        assert!(!handle.done());
        unsafe { complete(handle.cell_ptr(), CommandResult::Disconnect(Ok(()))) };
        let _ = handle.wait(DURATION_NONBLOCKING);
    }

    #[test]
    fn test_drop_pending_waits_for_worker() {
        let handle = allocate();
        let worker = complete_later(&handle, Duration::from_millis(20), 1);
        drop(handle);
        worker.join().unwrap();
    }

    #[test]
    fn test_wait_all_complete() {
        let futures = vec![completed_send(1), completed_send(2)];
        let outcome = wait_all(futures, 1_000_000_000);
        assert!(outcome.complete);
        assert_eq!(outcome.results.len(), 2);
        assert!(outcome.pending.iter().all(Option::is_none));
    }

    #[test]
    fn test_wait_all_timeout_reports_stragglers() {
        let futures = vec![completed_send(1), allocate(), completed_send(3)];
        let outcome = wait_all(futures, 10_000_000);
        assert!(!outcome.complete);
        assert!(!outcome.results[0].is_pending());
        assert!(outcome.results[1].is_pending());
        assert!(!outcome.results[2].is_pending());
        assert!(outcome.pending[0].is_none());
        assert!(outcome.pending[2].is_none());

        // The straggler handle remains usable
        let straggler = outcome.pending.into_iter().nth(1).unwrap().unwrap();
        let worker = complete_later(&straggler, Duration::from_millis(10), 9);
        assert!(straggler.wait(DURATION_INFINITE).is_ok());
        worker.join().unwrap();
    }

    #[test]
    fn test_wait_any_prefers_completed() {
        let futures = vec![allocate(), completed_send(2)];
        let outcome = wait_any(futures, DURATION_INFINITE);
        assert_eq!(outcome.positions, vec![1]);
        assert!(outcome.results[0].is_pending());
        assert!(!outcome.results[1].is_pending());
        // Clean up the still-pending future
        let leftover = outcome.pending.into_iter().next().unwrap().unwrap();
        let worker = complete_later(&leftover, Duration::from_millis(5), 1);
        assert!(leftover.wait(DURATION_INFINITE).is_ok());
        worker.join().unwrap();
    }

    #[test]
    fn test_wait_any_timeout() {
        let futures = vec![allocate()];
        let outcome = wait_any(futures, 10_000_000);
        assert!(outcome.positions.is_empty());
        let leftover = outcome.pending.into_iter().next().unwrap().unwrap();
        let worker = complete_later(&leftover, Duration::from_millis(5), 1);
        assert!(leftover.wait(DURATION_INFINITE).is_ok());
        worker.join().unwrap();
    }

    #[test]
    fn test_wait_any_wakes_on_late_completion() {
        let futures = vec![allocate(), allocate()];
        let worker = complete_later(&futures[1], Duration::from_millis(30), 5);
        let outcome = wait_any(futures, DURATION_INFINITE);
        assert_eq!(outcome.positions, vec![1]);
        worker.join().unwrap();
        let leftover = outcome.pending.into_iter().next().unwrap().unwrap();
        let cleanup = complete_later(&leftover, Duration::from_millis(5), 1);
        assert!(leftover.wait(DURATION_INFINITE).is_ok());
        cleanup.join().unwrap();
    }
}
