//! Command identifiers, options and result payloads
//!
//! UDP communication happens by sending commands to worker threads, which
//! process them asynchronously. Every command kind `K` comes with an
//! asynchronous `start_K` entry point returning a future, and a
//! synchronous `K` entry point that is exactly `wait(start_K(..), forever)`.
//!
//! Commands that move one datagram (send, recv) have streaming variants
//! (send_stream, recv_stream, reply_stream) that amortise the inter-thread
//! hand-off over arbitrarily many datagrams by running a caller-provided
//! callback directly on the worker thread.

use std::net::SocketAddr;

use crate::error::{OpResult, UdipeError};
use crate::time::{DurationNs, DURATION_DEFAULT};

/// Notifier value of a freed or not-yet-initialized future.
///
/// Freshly recycled futures are poisoned with this value so that
/// use-after-wait and double-wait bugs trip debug assertions.
pub const NOTIFIER_INVALID: u32 = 0;

/// Notifier value of a future whose result has not been written yet.
pub const NOTIFIER_PENDING: u32 = u32::MAX;

/// Command identifier
///
/// One positive value per command kind. The discriminant is what a worker
/// publishes into the future notifier on completion, so it must never
/// collide with [`NOTIFIER_INVALID`] or [`NOTIFIER_PENDING`].
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandId {
    Connect = 1,
    Disconnect = 2,
    Send = 3,
    Recv = 4,
    SendStream = 5,
    RecvStream = 6,
    ReplyStream = 7,
}

impl CommandId {
    /// Decode a notifier value back into a command id
    pub fn from_u32(value: u32) -> Option<CommandId> {
        match value {
            1 => Some(CommandId::Connect),
            2 => Some(CommandId::Disconnect),
            3 => Some(CommandId::Send),
            4 => Some(CommandId::Recv),
            5 => Some(CommandId::SendStream),
            6 => Some(CommandId::RecvStream),
            7 => Some(CommandId::ReplyStream),
            _ => None,
        }
    }
}

/// Handle to an established connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u32);

/// Communication direction(s) of a connection
///
/// Single-direction configurations clarify intent, need fewer parameters
/// and reject inconsistent options at validation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    /// Receive datagrams from the remote peer
    #[default]
    In,
    /// Send datagrams to the remote peer
    Out,
    /// Exchange datagrams in either direction
    InOut,
}

/// Boolean option with a nontrivial default
///
/// `Default` means "enabled if the host supports it"; `Enabled` makes
/// connection setup fail when the host does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Toggle {
    #[default]
    Default,
    Enabled,
    Disabled,
}

/// Parameters of a connect command
///
/// Designed so that `Default::default()` yields a receive-only connection
/// on an auto-assigned local port. Sending traffic requires at least a
/// `remote_address`.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Local address to bind; `None` binds the family's catch-all address
    /// with an auto-assigned port
    pub local_address: Option<SocketAddr>,

    /// Remote peer address; required for sending, `None` when receiving
    /// accepts traffic from any source
    pub remote_address: Option<SocketAddr>,

    /// Restrict traffic to one network interface (SO_BINDTODEVICE)
    pub local_interface: Option<String>,

    /// Communication direction(s)
    pub direction: Direction,

    /// Default send timeout, 0 = block forever
    ///
    /// Must not be set when `direction` is `In`.
    pub send_timeout_ns: DurationNs,

    /// Default receive timeout, 0 = block forever
    ///
    /// Must not be set when `direction` is `Out`.
    pub recv_timeout_ns: DurationNs,

    /// Socket send buffer bytes, 0 = OS default, at most `i32::MAX`
    ///
    /// Must not be set when `direction` is `In`.
    pub send_buffer: u32,

    /// Socket receive buffer bytes, 0 = OS default, at most `i32::MAX`
    ///
    /// Must not be set when `direction` is `Out`.
    pub recv_buffer: u32,

    /// Traffic priority (SO_PRIORITY, per socket)
    ///
    /// Priorities of 7 and above require CAP_NET_ADMIN on Linux.
    pub priority: u8,

    /// Generic Segmentation Offload: split oversized sends into datagrams
    pub enable_gso: Toggle,

    /// Generic Receive Offload: coalesce incoming datagrams into batches
    pub enable_gro: Toggle,

    /// Request kernel receive timestamps (SCM_TIMESTAMPNS)
    ///
    /// Off unless explicitly enabled.
    pub enable_timestamps: Toggle,

    /// Granularity at which a GSO send is split into datagrams
    ///
    /// Can only be nonzero when `enable_gso` is `Enabled`; 0 lets the
    /// implementation pick an MTU-safe default.
    pub gso_segment_size: u16,

    /// Let datagrams be handled by multiple worker threads
    ///
    /// Only appropriate when datagram ordering does not matter. Streaming
    /// callbacks used with such a connection must be thread-safe.
    pub allow_multithreading: bool,
}

impl ConnectOptions {
    /// Check cross-field consistency
    pub fn validate(&self) -> OpResult<()> {
        if let (Some(local), Some(remote)) = (self.local_address, self.remote_address) {
            if local.is_ipv4() != remote.is_ipv4() {
                return Err(UdipeError::AddressFamilyMismatch);
            }
        }
        match self.direction {
            Direction::In => {
                if self.send_timeout_ns != DURATION_DEFAULT || self.send_buffer != 0 {
                    return Err(UdipeError::InvalidDirection);
                }
            }
            Direction::Out => {
                if self.recv_timeout_ns != DURATION_DEFAULT || self.recv_buffer != 0 {
                    return Err(UdipeError::InvalidDirection);
                }
                if self.remote_address.is_none() {
                    return Err(UdipeError::InvalidDirection);
                }
            }
            Direction::InOut => {}
        }
        if self.send_buffer > i32::MAX as u32 || self.recv_buffer > i32::MAX as u32 {
            return Err(UdipeError::BufferTooSmall);
        }
        if self.gso_segment_size != 0 && self.enable_gso != Toggle::Enabled {
            return Err(UdipeError::FeatureUnsupported(
                "gso_segment_size requires enable_gso",
            ));
        }
        Ok(())
    }

    /// Truth that the connection can send datagrams
    #[inline]
    pub fn can_send(&self) -> bool {
        matches!(self.direction, Direction::Out | Direction::InOut)
    }

    /// Truth that the connection can receive datagrams
    #[inline]
    pub fn can_recv(&self) -> bool {
        matches!(self.direction, Direction::In | Direction::InOut)
    }
}

/// Parameters of a disconnect command
#[derive(Debug, Clone, Copy)]
pub struct DisconnectOptions {
    pub connection: ConnectionId,
}

/// Parameters of a send command
#[derive(Debug)]
pub struct SendOptions {
    pub connection: ConnectionId,
    /// Datagram payload, staged through a worker buffer before the send
    pub data: Vec<u8>,
    /// Per-command override of the connection send timeout, 0 = inherit
    pub timeout_ns: DurationNs,
}

/// Parameters of a recv command
#[derive(Debug, Clone, Copy)]
pub struct RecvOptions {
    pub connection: ConnectionId,
    /// Upper bound on the returned payload size, 0 = one worker buffer
    pub max_len: usize,
    /// Per-command override of the connection receive timeout, 0 = inherit
    pub timeout_ns: DurationNs,
}

/// Verdict returned by a consuming stream callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamControl {
    /// Process the next datagram
    Continue,
    /// End the stream
    Stop,
}

/// Callback consuming incoming datagram bytes on the worker thread
///
/// Runs under the worker's scheduling constraints (possibly pinned,
/// possibly elevated priority) and must not block.
pub type RecvStreamFn = Box<dyn FnMut(&[u8]) -> StreamControl + Send>;

/// Callback producing outgoing datagram bytes on the worker thread
///
/// Writes the next payload into the provided buffer and returns its
/// length, or `None` to end the stream. Must not block.
pub type SendStreamFn = Box<dyn FnMut(&mut [u8]) -> Option<usize> + Send>;

/// Callback deriving a reply datagram from each incoming datagram
///
/// Receives the incoming payload and a buffer for the reply; returns the
/// reply length, or `None` to end the stream. Must not block.
pub type ReplyStreamFn = Box<dyn FnMut(&[u8], &mut [u8]) -> Option<usize> + Send>;

/// Parameters of a send-stream command
pub struct SendStreamOptions {
    pub connection: ConnectionId,
    pub producer: SendStreamFn,
}

/// Parameters of a recv-stream command
pub struct RecvStreamOptions {
    pub connection: ConnectionId,
    pub consumer: RecvStreamFn,
}

/// Parameters of a reply-stream command
///
/// For each datagram received on `in_connection`, the callback derives a
/// reply that is sent on `out_connection` (which may be the same
/// connection).
pub struct ReplyStreamOptions {
    pub in_connection: ConnectionId,
    pub out_connection: ConnectionId,
    pub replier: ReplyStreamFn,
}

/// Result of a successful connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOutcome {
    pub connection: ConnectionId,
    /// Locally bound UDP port (useful with auto-assigned ports)
    pub local_port: u16,
}

/// Result of a successful send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOutcome {
    pub bytes_sent: usize,
}

/// Result of a successful recv
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecvOutcome {
    /// Received payload; with GRO this may concatenate several datagrams
    pub data: Vec<u8>,
    /// Size of each coalesced datagram when GRO kicked in, 0 otherwise
    pub gro_segment: u16,
    /// Kernel receive timestamp when timestamping was enabled
    pub timestamp_ns: Option<u64>,
}

/// Result of a completed stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamOutcome {
    pub datagrams: u64,
    pub bytes: u64,
}

/// Generic command result
///
/// `Pending` denotes an absence of result: wait operations that time out
/// return it, and the associated future stays valid.
#[derive(Debug)]
pub enum CommandResult {
    Pending,
    Connect(OpResult<ConnectOutcome>),
    Disconnect(OpResult<()>),
    Send(OpResult<SendOutcome>),
    Recv(OpResult<RecvOutcome>),
    SendStream(OpResult<StreamOutcome>),
    RecvStream(OpResult<StreamOutcome>),
    ReplyStream(OpResult<StreamOutcome>),
}

impl CommandResult {
    /// Command that produced this result, or `None` for `Pending`
    pub fn command_id(&self) -> Option<CommandId> {
        match self {
            CommandResult::Pending => None,
            CommandResult::Connect(_) => Some(CommandId::Connect),
            CommandResult::Disconnect(_) => Some(CommandId::Disconnect),
            CommandResult::Send(_) => Some(CommandId::Send),
            CommandResult::Recv(_) => Some(CommandId::Recv),
            CommandResult::SendStream(_) => Some(CommandId::SendStream),
            CommandResult::RecvStream(_) => Some(CommandId::RecvStream),
            CommandResult::ReplyStream(_) => Some(CommandId::ReplyStream),
        }
    }

    /// Truth that this is the absent-result placeholder
    #[inline]
    pub fn is_pending(&self) -> bool {
        matches!(self, CommandResult::Pending)
    }
}

// The future cell must fit one false-sharing granule: payload plus the
// 32-bit notifier.
const _: () = assert!(
    std::mem::size_of::<CommandResult>() <= crate::constants::FALSE_SHARING_GRANULE - 8,
    "result payload too large for a single-granule future"
);
