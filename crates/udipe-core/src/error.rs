//! Error types for udipe operations
//!
//! Recoverable errors travel through command result payloads and never
//! abort a worker thread. Unrecoverable conditions (allocation failure,
//! thread spawn failure, futex contract violations, allocator finalisation
//! with live buffers) terminate the process through [`fatal!`].

use core::fmt;

/// Result type for udipe command operations
pub type OpResult<T> = Result<T, UdipeError>;

/// Errors surfaced through command result payloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdipeError {
    /// The operation did not complete before its timeout
    Timeout,

    /// Local and remote addresses belong to different address families
    AddressFamilyMismatch,

    /// An option was set that the connection direction forbids
    InvalidDirection,

    /// The datagram does not fit in a worker buffer
    BufferTooSmall,

    /// A requested feature is not supported by the host OS
    FeatureUnsupported(&'static str),

    /// A socket operation failed with the carried OS error code
    SocketError(i32),

    /// No worker buffer was available for the operation
    ResourceExhausted,
}

impl fmt::Display for UdipeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UdipeError::Timeout => write!(f, "operation timed out"),
            UdipeError::AddressFamilyMismatch => {
                write!(f, "local and remote address families differ")
            }
            UdipeError::InvalidDirection => {
                write!(f, "option conflicts with connection direction")
            }
            UdipeError::BufferTooSmall => write!(f, "datagram exceeds worker buffer size"),
            UdipeError::FeatureUnsupported(what) => {
                write!(f, "feature not supported by this host: {}", what)
            }
            UdipeError::SocketError(code) => write!(f, "socket error: os error {}", code),
            UdipeError::ResourceExhausted => write!(f, "no worker buffer available"),
        }
    }
}

impl std::error::Error for UdipeError {}

impl From<std::io::Error> for UdipeError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => UdipeError::Timeout,
            _ => UdipeError::SocketError(e.raw_os_error().unwrap_or(0)),
        }
    }
}

/// Log an error message and exit the process with a non-zero status.
///
/// Reserved for conditions no caller can recover from. Accepts `format!`
/// syntax.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        $crate::uerror!($($arg)*);
        ::std::process::exit(1)
    }};
}

/// Like [`fatal!`], but logs the current OS error first.
#[macro_export]
macro_rules! fatal_os {
    ($($arg:tt)*) => {{
        $crate::uerror!("os error: {}", ::std::io::Error::last_os_error());
        $crate::fatal!($($arg)*)
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", UdipeError::Timeout), "operation timed out");
        assert_eq!(
            format!("{}", UdipeError::SocketError(111)),
            "socket error: os error 111"
        );
        assert_eq!(
            format!("{}", UdipeError::FeatureUnsupported("gro")),
            "feature not supported by this host: gro"
        );
    }

    #[test]
    fn test_from_io_error() {
        let e = std::io::Error::from_raw_os_error(libc_eagain());
        assert_eq!(UdipeError::from(e), UdipeError::Timeout);

        let e = std::io::Error::from_raw_os_error(13);
        assert_eq!(UdipeError::from(e), UdipeError::SocketError(13));
    }

    fn libc_eagain() -> i32 {
        11 // EAGAIN on Linux
    }
}
