//! Worker threads
//!
//! Workers are OS threads that own sockets and execute commands. Each
//! worker parks on its queue's write index while idle, executes one
//! command at a time, publishes the result into the command's future,
//! and, once shutdown is broadcast, drains the queue before stopping so
//! every outstanding future still resolves.
//!
//! Recoverable command failures flow through result payloads and never
//! abort the worker.

use std::sync::Arc;
use std::thread::JoinHandle;

use udipe_core::command::{
    CommandResult, RecvOptions, RecvOutcome, RecvStreamOptions, ReplyStreamOptions, SendOptions,
    SendOutcome, SendStreamOptions, StreamControl, StreamOutcome,
};
use udipe_core::error::{OpResult, UdipeError};
use udipe_core::time::DURATION_DEFAULT;
use udipe_core::{fatal, udebug, uprint, utrace, uwarn};

use crate::buffer::{BufferConfigurator, BufferPool};
use crate::config::UdipeConfig;
use crate::context::{ConnectionState, ContextShared};
use crate::future::{self, FutureCell};
use crate::options_pool::StagedSocket;
use crate::queue::{Command, CommandPayload};
use crate::socket::UdpSock;
use crate::topology::{online_cpus, SysfsTopology};

/// Spawn all worker threads of a context
pub(crate) fn spawn_workers(
    shared: &Arc<ContextShared>,
    config: &UdipeConfig,
) -> Vec<JoinHandle<()>> {
    (0..shared.num_workers)
        .map(|worker_id| {
            let shared = Arc::clone(shared);
            let configurator = config.buffer_config.clone();
            let pin = config.pin_workers;
            std::thread::Builder::new()
                .name(format!("udipe-worker-{}", worker_id))
                .spawn(move || worker_main(worker_id, shared, configurator, pin))
                .unwrap_or_else(|e| fatal!("failed to spawn worker thread: {}", e))
        })
        .collect()
}

#[cfg(target_os = "linux")]
fn pin_to_cpu(cpu: usize) {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let mut set = CpuSet::new();
    if set.set(cpu).is_err() {
        uwarn!("cpu {} does not fit in a cpuset, not pinning", cpu);
        return;
    }
    if let Err(e) = sched_setaffinity(Pid::from_raw(0), &set) {
        uwarn!("failed to pin worker to cpu {}: {}", cpu, e);
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_cpu(_cpu: usize) {}

/// Worker thread entry point
fn worker_main(
    worker_id: usize,
    shared: Arc<ContextShared>,
    configurator: Option<BufferConfigurator>,
    pin: bool,
) {
    uprint::set_worker_id(worker_id as u32);
    let cpu = worker_id % online_cpus();
    if pin {
        pin_to_cpu(cpu);
    }
    let mut pool = BufferPool::new(worker_id, cpu, configurator.as_ref(), &SysfsTopology);
    let queue = Arc::clone(&shared.queues[worker_id]);
    udebug!("worker ready, {} buffer(s) of {} bytes", pool.buffer_count(), pool.buffer_size());

    while let Some(command) = queue.pop(&shared.shutdown) {
        execute(&shared, worker_id, &mut pool, command);
    }

    udebug!("worker stopped");
    uprint::clear_worker_id();
}

/// Execute one command and publish its future
fn execute(shared: &ContextShared, worker_id: usize, pool: &mut BufferPool, command: Command) {
    let completion = command.completion;
    match command.payload {
        CommandPayload::Absent => fatal!("uninitialized command reached a worker"),
        CommandPayload::Connect { slot } => {
            connect_step(shared, worker_id, slot as usize, completion);
        }
        CommandPayload::Disconnect(options) => {
            let result = shared.remove_connection(options.connection);
            publish(completion, CommandResult::Disconnect(result));
        }
        CommandPayload::Send(options) => {
            let result = send_one(shared, worker_id, pool, options);
            publish(completion, CommandResult::Send(result));
        }
        CommandPayload::Recv(options) => {
            let result = recv_one(shared, worker_id, pool, options);
            publish(completion, CommandResult::Recv(result));
        }
        CommandPayload::SendStream(options) => {
            let result = send_stream(shared, worker_id, pool, options);
            publish(completion, CommandResult::SendStream(result));
        }
        CommandPayload::RecvStream(options) => {
            let result = recv_stream(shared, worker_id, pool, options);
            publish(completion, CommandResult::RecvStream(result));
        }
        CommandPayload::ReplyStream(options) => {
            let result = reply_stream(shared, worker_id, pool, options);
            publish(completion, CommandResult::ReplyStream(result));
        }
    }
}

fn publish(completion: *mut FutureCell, result: CommandResult) {
    // Safety: the completion cell stays alive until this store; the
    // client only frees it after observing a non-pending notifier.
    unsafe { future::complete(completion, result) };
}

/// One worker's share of a (possibly collective) connect
///
/// Every participating worker opens its socket and parks it in the
/// options slot, or raises the release-stored abort flag on failure. The
/// worker that drops the last slot reference performs the fan-in: commit
/// the whole socket set into the registry, or close everything and report
/// the first failure. Only the fan-in worker publishes the future.
fn connect_step(shared: &ContextShared, worker_id: usize, slot: usize, completion: *mut FutureCell) {
    let pool = &shared.options_pool;

    // A peer worker may already have failed; opening more sockets would
    // only create more rollback work.
    if !pool.aborted(slot) {
        let options = pool.options(slot);
        match UdpSock::open(options) {
            Ok(sock) => pool.stage_socket(
                slot,
                StagedSocket {
                    worker: worker_id,
                    sock,
                },
            ),
            Err(error) => {
                udebug!("connect failed on this worker: {}", error);
                pool.record_failure(slot, error);
            }
        }
    }

    let last_reference = pool.release(slot);
    if !last_reference {
        return;
    }

    let multithreading = pool.options(slot).allow_multithreading;
    let staging = pool.take_staging(slot);
    let result = match staging.error {
        None => shared.commit_connection(staging.sockets, multithreading),
        Some(error) => {
            // Partial sockets close here, before the future resolves
            drop(staging.sockets);
            Err(error)
        }
    };
    pool.deallocate(slot);
    publish(completion, CommandResult::Connect(result));
}

/// Connection and socket serving a command on this worker
fn socket_of<'a>(
    state: &'a ConnectionState,
    worker_id: usize,
) -> OpResult<&'a UdpSock> {
    state
        .socket_for(worker_id)
        .ok_or(UdipeError::SocketError(libc::ENOTCONN))
}

fn lookup(shared: &ContextShared, connection: udipe_core::command::ConnectionId) -> OpResult<Arc<ConnectionState>> {
    shared
        .lookup(connection)
        .ok_or(UdipeError::SocketError(libc::ENOTCONN))
}

fn send_one(
    shared: &ContextShared,
    worker_id: usize,
    pool: &mut BufferPool,
    options: SendOptions,
) -> OpResult<SendOutcome> {
    let state = lookup(shared, options.connection)?;
    let sock = socket_of(&state, worker_id)?;
    let Some(buffer) = pool.allocate() else {
        return Err(UdipeError::ResourceExhausted);
    };
    let buffer_size = pool.buffer_size();

    let result = (|| {
        if options.data.len() > buffer_size {
            return Err(UdipeError::BufferTooSmall);
        }
        if options.timeout_ns != DURATION_DEFAULT {
            sock.set_send_timeout(options.timeout_ns)?;
        }
        // Stage the datagram through the worker's cache-resident buffer
        let staged = unsafe {
            std::ptr::copy_nonoverlapping(options.data.as_ptr(), buffer.as_ptr(), options.data.len());
            std::slice::from_raw_parts(buffer.as_ptr(), options.data.len())
        };
        let bytes_sent = sock.send(staged)?;
        utrace!("sent {} byte(s)", bytes_sent);
        Ok(SendOutcome { bytes_sent })
    })();

    pool.liberate(buffer);
    result
}

fn recv_one(
    shared: &ContextShared,
    worker_id: usize,
    pool: &mut BufferPool,
    options: RecvOptions,
) -> OpResult<RecvOutcome> {
    let state = lookup(shared, options.connection)?;
    let sock = socket_of(&state, worker_id)?;
    let Some(buffer) = pool.allocate() else {
        return Err(UdipeError::ResourceExhausted);
    };
    let capacity = match options.max_len {
        0 => pool.buffer_size(),
        limit => limit.min(pool.buffer_size()),
    };

    let result = (|| {
        if options.timeout_ns != DURATION_DEFAULT {
            sock.set_recv_timeout(options.timeout_ns)?;
        }
        let staged = unsafe { std::slice::from_raw_parts_mut(buffer.as_ptr(), capacity) };
        let meta = sock.recv(staged)?;
        utrace!("received {} byte(s)", meta.len);
        Ok(RecvOutcome {
            data: staged[..meta.len].to_vec(),
            gro_segment: meta.gro_segment,
            timestamp_ns: meta.timestamp_ns,
        })
    })();

    pool.liberate(buffer);
    result
}

fn send_stream(
    shared: &ContextShared,
    worker_id: usize,
    pool: &mut BufferPool,
    mut options: SendStreamOptions,
) -> OpResult<StreamOutcome> {
    let state = lookup(shared, options.connection)?;
    let sock = socket_of(&state, worker_id)?;
    let Some(buffer) = pool.allocate() else {
        return Err(UdipeError::ResourceExhausted);
    };
    let buffer_size = pool.buffer_size();

    let result = (|| {
        let mut outcome = StreamOutcome::default();
        let staged = unsafe { std::slice::from_raw_parts_mut(buffer.as_ptr(), buffer_size) };
        // One datagram (or GSO batch) per callback invocation
        while let Some(len) = (options.producer)(staged) {
            if len > buffer_size {
                return Err(UdipeError::BufferTooSmall);
            }
            let sent = sock.send(&staged[..len])?;
            outcome.datagrams += 1;
            outcome.bytes += sent as u64;
        }
        Ok(outcome)
    })();

    pool.liberate(buffer);
    result
}

fn recv_stream(
    shared: &ContextShared,
    worker_id: usize,
    pool: &mut BufferPool,
    mut options: RecvStreamOptions,
) -> OpResult<StreamOutcome> {
    let state = lookup(shared, options.connection)?;
    let sock = socket_of(&state, worker_id)?;
    let Some(buffer) = pool.allocate() else {
        return Err(UdipeError::ResourceExhausted);
    };
    let buffer_size = pool.buffer_size();

    let result = (|| {
        let mut outcome = StreamOutcome::default();
        let staged = unsafe { std::slice::from_raw_parts_mut(buffer.as_ptr(), buffer_size) };
        loop {
            // One datagram (or GRO batch) per callback invocation
            let meta = sock.recv(staged)?;
            outcome.datagrams += 1;
            outcome.bytes += meta.len as u64;
            if (options.consumer)(&staged[..meta.len]) == StreamControl::Stop {
                return Ok(outcome);
            }
        }
    })();

    pool.liberate(buffer);
    result
}

fn reply_stream(
    shared: &ContextShared,
    worker_id: usize,
    pool: &mut BufferPool,
    mut options: ReplyStreamOptions,
) -> OpResult<StreamOutcome> {
    let in_state = lookup(shared, options.in_connection)?;
    let in_sock = socket_of(&in_state, worker_id)?;
    let out_state = lookup(shared, options.out_connection)?;
    let out_sock = out_state
        .socket_for_or_any(worker_id)
        .ok_or(UdipeError::SocketError(libc::ENOTCONN))?;

    let Some(in_buffer) = pool.allocate() else {
        return Err(UdipeError::ResourceExhausted);
    };
    let Some(out_buffer) = pool.allocate() else {
        pool.liberate(in_buffer);
        return Err(UdipeError::ResourceExhausted);
    };
    let buffer_size = pool.buffer_size();

    let result = (|| {
        let mut outcome = StreamOutcome::default();
        let incoming = unsafe { std::slice::from_raw_parts_mut(in_buffer.as_ptr(), buffer_size) };
        let outgoing = unsafe { std::slice::from_raw_parts_mut(out_buffer.as_ptr(), buffer_size) };
        loop {
            let meta = in_sock.recv(incoming)?;
            match (options.replier)(&incoming[..meta.len], outgoing) {
                Some(len) => {
                    if len > buffer_size {
                        return Err(UdipeError::BufferTooSmall);
                    }
                    let sent = out_sock.send(&outgoing[..len])?;
                    outcome.datagrams += 1;
                    outcome.bytes += sent as u64;
                }
                None => return Ok(outcome),
            }
        }
    })();

    pool.liberate(out_buffer);
    pool.liberate(in_buffer);
    result
}
