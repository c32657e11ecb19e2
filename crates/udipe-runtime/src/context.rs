//! Context and command dispatch
//!
//! The context aggregates everything a udipe session needs: one command
//! queue per worker, the shared connect-options pool, the connection
//! registry and the worker threads themselves. It is created by
//! [`initialize`] and torn down by [`Context::finalize`] (or drop), after
//! which no call may be made with it.
//!
//! Dispatch policy: connect commands pick an owning worker round-robin
//! (or fan out to every worker when multithreading is allowed); commands
//! addressed to a connection go to its owning worker, or round-robin
//! across the connection's worker set for multithreaded connections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::JoinHandle;

use udipe_core::command::{
    CommandResult, ConnectOptions, ConnectOutcome, ConnectionId, DisconnectOptions, RecvOptions,
    RecvOutcome, RecvStreamOptions, ReplyStreamOptions, SendOptions, SendOutcome,
    SendStreamOptions, StreamOutcome,
};
use udipe_core::constants::EXPECTED_MIN_PAGE_SIZE;
use udipe_core::error::{OpResult, UdipeError};
use udipe_core::time::DURATION_INFINITE;
use udipe_core::{fatal, udebug, uinfo, uprint};

use crate::config::UdipeConfig;
use crate::future::{self, FutureHandle};
use crate::memory;
use crate::options_pool::{SharedOptionsPool, StagedSocket};
use crate::queue::{Command, CommandPayload, CommandQueue};
use crate::socket::UdpSock;
use crate::worker;

/// An established connection and the sockets serving it
pub(crate) struct ConnectionState {
    pub id: u32,
    pub multithreading: bool,
    /// One socket per participating worker
    pub sockets: Vec<StagedSocket>,
    /// Round-robin cursor for multithreaded dispatch
    pub rr: AtomicUsize,
}

impl ConnectionState {
    /// Socket owned by `worker` on this connection
    pub fn socket_for(&self, worker: usize) -> Option<&UdpSock> {
        self.sockets
            .iter()
            .find(|staged| staged.worker == worker)
            .map(|staged| &staged.sock)
    }

    /// Like [`ConnectionState::socket_for`], falling back to any socket
    ///
    /// Reply streams may pair an input connection with an output
    /// connection owned by a different worker; datagram sends on a
    /// foreign fd are kernel-safe.
    pub fn socket_for_or_any(&self, worker: usize) -> Option<&UdpSock> {
        self.socket_for(worker)
            .or_else(|| self.sockets.first().map(|staged| &staged.sock))
    }

    /// Worker that should execute the next command on this connection
    fn route(&self) -> usize {
        if self.multithreading {
            let cursor = self.rr.fetch_add(1, Ordering::Relaxed);
            self.sockets[cursor % self.sockets.len()].worker
        } else {
            self.sockets[0].worker
        }
    }
}

/// State shared between the context handle and the worker threads
pub(crate) struct ContextShared {
    pub queues: Vec<Arc<CommandQueue>>,
    pub options_pool: SharedOptionsPool,
    pub registry: RwLock<HashMap<u32, Arc<ConnectionState>>>,
    pub next_connection: AtomicU32,
    pub shutdown: AtomicBool,
    pub num_workers: usize,
    /// Round-robin cursor for connect dispatch
    rr: AtomicUsize,
}

impl ContextShared {
    pub(crate) fn lookup(&self, connection: ConnectionId) -> Option<Arc<ConnectionState>> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&connection.0)
            .cloned()
    }

    /// Publish a fully set up connection into the registry
    pub(crate) fn commit_connection(
        &self,
        sockets: Vec<StagedSocket>,
        multithreading: bool,
    ) -> OpResult<ConnectOutcome> {
        let local_port = match sockets.first() {
            Some(staged) => staged.sock.local_port()?,
            None => 0,
        };
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(ConnectionState {
            id,
            multithreading,
            sockets,
            rr: AtomicUsize::new(0),
        });
        udebug!("connection {} established on port {}", state.id, local_port);
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, state);
        Ok(ConnectOutcome {
            connection: ConnectionId(id),
            local_port,
        })
    }

    /// Remove a connection; its sockets close once the last user drops
    pub(crate) fn remove_connection(&self, connection: ConnectionId) -> OpResult<()> {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&connection.0)
            .map(|_| ())
            .ok_or(UdipeError::SocketError(libc::ENOTCONN))
    }
}

/// A live udipe session
///
/// Obtained from [`initialize`]. All command entry points live here; each
/// command kind `K` has an asynchronous `start_K` returning a
/// [`FutureHandle`] and a synchronous `K` that is exactly
/// `start_K(..).wait(forever)`.
pub struct Context {
    shared: Arc<ContextShared>,
    workers: Vec<JoinHandle<()>>,
}

/// Create a udipe context
///
/// Spawns the worker threads, their queues and buffer pools, and the
/// shared connect-options pool. Configuration problems and resource
/// exhaustion at this stage are fatal.
pub fn initialize(config: UdipeConfig) -> Context {
    uprint::init();
    if let Err(e) = config.validate() {
        fatal!("refusing to initialize: {}", e);
    }

    let queues: Vec<Arc<CommandQueue>> = (0..config.num_workers)
        .map(|_| {
            let queue = Arc::new(CommandQueue::new());
            // The queue page stays hot and must never swap out mid-burst
            memory::lock_best_effort(Arc::as_ptr(&queue) as *mut u8, EXPECTED_MIN_PAGE_SIZE);
            queue
        })
        .collect();

    let shared = Arc::new(ContextShared {
        queues,
        options_pool: SharedOptionsPool::new(),
        registry: RwLock::new(HashMap::new()),
        next_connection: AtomicU32::new(1),
        shutdown: AtomicBool::new(false),
        num_workers: config.num_workers,
        rr: AtomicUsize::new(0),
    });
    let workers = worker::spawn_workers(&shared, &config);
    uinfo!("udipe context ready with {} worker(s)", config.num_workers);

    Context { shared, workers }
}

impl Context {
    /// Ring capacity of each worker's command queue
    pub fn queue_capacity() -> usize {
        crate::queue::CAPACITY
    }

    pub fn num_workers(&self) -> usize {
        self.shared.num_workers
    }

    /// Free slots in the connect-options pool (diagnostic)
    pub fn available_option_slots(&self) -> usize {
        self.shared.options_pool.available_slots()
    }

    fn next_worker(&self) -> usize {
        self.shared.rr.fetch_add(1, Ordering::Relaxed) % self.shared.num_workers
    }

    fn submit(&self, worker: usize, payload: CommandPayload) -> FutureHandle {
        let handle = future::allocate();
        self.shared.queues[worker].push(Command {
            completion: handle.cell_ptr(),
            payload,
        });
        handle
    }

    /// Future that is already resolved (boundary validation errors)
    fn completed(result: CommandResult) -> FutureHandle {
        let handle = future::allocate();
        unsafe { future::complete(handle.cell_ptr(), result) };
        handle
    }

    /// Owning worker for the next command on `connection`
    fn route(&self, connection: ConnectionId) -> Option<usize> {
        self.shared.lookup(connection).map(|state| state.route())
    }

    /// Start establishing a connection
    ///
    /// With `allow_multithreading` the connect fans out to every worker;
    /// all must succeed or the whole connection is rolled back and the
    /// first failure reported.
    pub fn start_connect(&self, options: ConnectOptions) -> FutureHandle {
        if let Err(e) = options.validate() {
            return Self::completed(CommandResult::Connect(Err(e)));
        }
        let workers: Vec<usize> = if options.allow_multithreading {
            (0..self.shared.num_workers).collect()
        } else {
            vec![self.next_worker()]
        };
        let slot = self
            .shared
            .options_pool
            .allocate(workers.len() as u32, options);

        let handle = future::allocate();
        for worker in workers {
            self.shared.queues[worker].push(Command {
                completion: handle.cell_ptr(),
                payload: CommandPayload::Connect { slot: slot as u32 },
            });
        }
        handle
    }

    pub fn connect(&self, options: ConnectOptions) -> OpResult<ConnectOutcome> {
        match self.start_connect(options).wait(DURATION_INFINITE) {
            Ok(CommandResult::Connect(result)) => result,
            _ => fatal!("connect future carried a mismatched payload"),
        }
    }

    pub fn start_disconnect(&self, options: DisconnectOptions) -> FutureHandle {
        match self.route(options.connection) {
            Some(worker) => self.submit(worker, CommandPayload::Disconnect(options)),
            None => Self::completed(CommandResult::Disconnect(Err(UdipeError::SocketError(
                libc::ENOTCONN,
            )))),
        }
    }

    pub fn disconnect(&self, options: DisconnectOptions) -> OpResult<()> {
        match self.start_disconnect(options).wait(DURATION_INFINITE) {
            Ok(CommandResult::Disconnect(result)) => result,
            _ => fatal!("disconnect future carried a mismatched payload"),
        }
    }

    pub fn start_send(&self, options: SendOptions) -> FutureHandle {
        match self.route(options.connection) {
            Some(worker) => self.submit(worker, CommandPayload::Send(options)),
            None => Self::completed(CommandResult::Send(Err(UdipeError::SocketError(
                libc::ENOTCONN,
            )))),
        }
    }

    pub fn send(&self, options: SendOptions) -> OpResult<SendOutcome> {
        match self.start_send(options).wait(DURATION_INFINITE) {
            Ok(CommandResult::Send(result)) => result,
            _ => fatal!("send future carried a mismatched payload"),
        }
    }

    pub fn start_recv(&self, options: RecvOptions) -> FutureHandle {
        match self.route(options.connection) {
            Some(worker) => self.submit(worker, CommandPayload::Recv(options)),
            None => Self::completed(CommandResult::Recv(Err(UdipeError::SocketError(
                libc::ENOTCONN,
            )))),
        }
    }

    pub fn recv(&self, options: RecvOptions) -> OpResult<RecvOutcome> {
        match self.start_recv(options).wait(DURATION_INFINITE) {
            Ok(CommandResult::Recv(result)) => result,
            _ => fatal!("recv future carried a mismatched payload"),
        }
    }

    pub fn start_send_stream(&self, options: SendStreamOptions) -> FutureHandle {
        match self.route(options.connection) {
            Some(worker) => self.submit(worker, CommandPayload::SendStream(options)),
            None => Self::completed(CommandResult::SendStream(Err(UdipeError::SocketError(
                libc::ENOTCONN,
            )))),
        }
    }

    pub fn send_stream(&self, options: SendStreamOptions) -> OpResult<StreamOutcome> {
        match self.start_send_stream(options).wait(DURATION_INFINITE) {
            Ok(CommandResult::SendStream(result)) => result,
            _ => fatal!("send-stream future carried a mismatched payload"),
        }
    }

    pub fn start_recv_stream(&self, options: RecvStreamOptions) -> FutureHandle {
        match self.route(options.connection) {
            Some(worker) => self.submit(worker, CommandPayload::RecvStream(options)),
            None => Self::completed(CommandResult::RecvStream(Err(UdipeError::SocketError(
                libc::ENOTCONN,
            )))),
        }
    }

    pub fn recv_stream(&self, options: RecvStreamOptions) -> OpResult<StreamOutcome> {
        match self.start_recv_stream(options).wait(DURATION_INFINITE) {
            Ok(CommandResult::RecvStream(result)) => result,
            _ => fatal!("recv-stream future carried a mismatched payload"),
        }
    }

    /// Reply streams execute on the input connection's worker
    pub fn start_reply_stream(&self, options: ReplyStreamOptions) -> FutureHandle {
        match self.route(options.in_connection) {
            Some(worker) => self.submit(worker, CommandPayload::ReplyStream(options)),
            None => Self::completed(CommandResult::ReplyStream(Err(UdipeError::SocketError(
                libc::ENOTCONN,
            )))),
        }
    }

    pub fn reply_stream(&self, options: ReplyStreamOptions) -> OpResult<StreamOutcome> {
        match self.start_reply_stream(options).wait(DURATION_INFINITE) {
            Ok(CommandResult::ReplyStream(result)) => result,
            _ => fatal!("reply-stream future carried a mismatched payload"),
        }
    }

    /// Tear the context down
    ///
    /// Broadcasts shutdown, waits for the workers to drain their queues
    /// and publish every outstanding future, then joins them and
    /// liberates the pools. From the moment this starts, no other call
    /// may be made with this context from any thread.
    pub fn finalize(self) {
        drop(self);
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        udebug!("finalizing udipe context");
        self.shared.shutdown.store(true, Ordering::Release);
        for queue in &self.shared.queues {
            queue.wake_consumer();
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        // Close every remaining connection; sockets drop with the last
        // reference
        self.shared
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        udebug!("udipe context finalized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_finalize() {
        let context = initialize(UdipeConfig::new().num_workers(2).pin_workers(false));
        assert_eq!(context.num_workers(), 2);
        context.finalize();
    }

    #[test]
    fn test_unknown_connection_errors_immediately() {
        let context = initialize(UdipeConfig::new().num_workers(1).pin_workers(false));
        let result = context.recv(RecvOptions {
            connection: ConnectionId(777),
            max_len: 0,
            timeout_ns: 0,
        });
        assert_eq!(result, Err(UdipeError::SocketError(libc::ENOTCONN)));
        context.finalize();
    }

    #[test]
    fn test_invalid_options_resolve_future_immediately() {
        let context = initialize(UdipeConfig::new().num_workers(1).pin_workers(false));
        let options = ConnectOptions {
            direction: udipe_core::command::Direction::Out,
            ..Default::default()
        };
        let handle = context.start_connect(options);
        assert!(handle.done());
        match handle.wait(udipe_core::time::DURATION_NONBLOCKING) {
            Ok(CommandResult::Connect(Err(UdipeError::InvalidDirection))) => {}
            _ => panic!("expected an invalid-direction error"),
        }
        context.finalize();
    }
}
