//! # udipe
//!
//! A high-performance UDP I/O engine.
//!
//! Client threads obtain a [`Context`], then issue connection-oriented
//! and streaming datagram commands: connect, disconnect, send, recv,
//! send_stream, recv_stream and reply_stream. Every command exists in two
//! forms: a synchronous one that blocks until the result is available,
//! and a `start_*` form returning a [`FutureHandle`] that can be awaited
//! later, individually or through the collective [`wait_all`] /
//! [`wait_any`] primitives.
//!
//! Internally, commands are dispatched to a pool of worker threads that
//! own the sockets, manage per-thread packet buffers sized from the CPU
//! cache hierarchy, and use the GSO/GRO kernel offloads where available.
//! Single-datagram commands pay one inter-thread hand-off each; the
//! streaming variants amortise that cost by running a caller-provided
//! callback directly on the worker thread, one datagram (or offload
//! batch) per invocation.
//!
//! ## Example
//!
//! ```no_run
//! use udipe::{initialize, ConnectOptions, Direction, RecvOptions, SendOptions, UdipeConfig};
//!
//! let context = initialize(UdipeConfig::from_env());
//!
//! // A receive-only connection on an auto-assigned port
//! let receiver = context.connect(ConnectOptions::default()).unwrap();
//!
//! // A send-only connection towards it
//! let sender = context
//!     .connect(ConnectOptions {
//!         direction: Direction::Out,
//!         remote_address: Some(([127, 0, 0, 1], receiver.local_port).into()),
//!         ..Default::default()
//!     })
//!     .unwrap();
//!
//! context
//!     .send(SendOptions {
//!         connection: sender.connection,
//!         data: vec![1, 2, 3],
//!         timeout_ns: 0,
//!     })
//!     .unwrap();
//! let received = context
//!     .recv(RecvOptions {
//!         connection: receiver.connection,
//!         max_len: 0,
//!         timeout_ns: 0,
//!     })
//!     .unwrap();
//! assert_eq!(received.data, vec![1, 2, 3]);
//!
//! context.finalize();
//! ```
//!
//! ## Timeouts
//!
//! Durations are nanoseconds with three reserved values: `0` asks for the
//! API's default (infinite for waits), `1` means nonblocking, `u64::MAX`
//! means wait forever. Timeouts are lower bounds, rounded up to the OS
//! scheduler granularity, and timing out a wait never cancels the
//! underlying command.

pub use udipe_core::command::{
    CommandId, CommandResult, ConnectOptions, ConnectOutcome, ConnectionId, Direction,
    DisconnectOptions, RecvOptions, RecvOutcome, RecvStreamOptions, ReplyStreamOptions,
    SendOptions, SendOutcome, SendStreamOptions, StreamControl, StreamOutcome, Toggle,
};
pub use udipe_core::error::{OpResult, UdipeError};
pub use udipe_core::time::{
    DurationNs, DURATION_DEFAULT, DURATION_INFINITE, DURATION_NONBLOCKING,
};
pub use udipe_core::BitArray;

pub use udipe_runtime::{
    initialize, wait_all, wait_any, BufferConfig, BufferConfigurator, Context, FutureHandle,
    UdipeConfig, WaitAllOutcome, WaitAnyOutcome,
};
