//! UDP socket plumbing
//!
//! One `UdpSock` per (connection, worker) pair, fully configured from the
//! connect options: timeouts, kernel buffer sizes (with the privileged
//! FORCE fallback), device binding, traffic priority, `SO_REUSEPORT` for
//! multithreaded connections, receive timestamps, and the GSO/GRO kernel
//! offloads that let one syscall carry many datagrams.
//!
//! Tri-state toggles map as follows: `Enabled` must take effect or the
//! connection fails with `FeatureUnsupported`; `Default` is applied on a
//! best-effort basis for the offloads but leaves timestamping off;
//! `Disabled` is skipped.

use std::ffi::CString;
use std::net::SocketAddr;
use std::os::fd::RawFd;

use udipe_core::command::{ConnectOptions, Toggle};
use udipe_core::error::{OpResult, UdipeError};
use udipe_core::time::{DurationNs, DURATION_DEFAULT, DURATION_INFINITE};
use udipe_core::{udebug, utrace, uwarn};

// UDP offload socket options, not yet exported by the libc crate
const SOL_UDP: libc::c_int = 17;
const UDP_SEGMENT: libc::c_int = 103;
const UDP_GRO: libc::c_int = 104;

/// MTU-safe GSO segment defaults (1500 minus IP + UDP headers)
const DEFAULT_GSO_SEGMENT_V4: u16 = 1472;
const DEFAULT_GSO_SEGMENT_V6: u16 = 1452;

/// Metadata attached to one received datagram (or GRO batch)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecvMeta {
    /// Payload bytes written into the buffer
    pub len: usize,
    /// Size of each coalesced datagram when GRO kicked in, 0 otherwise
    pub gro_segment: u16,
    /// Kernel receive timestamp when timestamping is active
    pub timestamp_ns: Option<u64>,
}

/// A configured UDP socket owned by one worker
pub struct UdpSock {
    fd: RawFd,
}

// Safety: the fd is a plain kernel handle; the owning worker serialises use.
unsafe impl Send for UdpSock {}
unsafe impl Sync for UdpSock {}

impl UdpSock {
    /// Open and configure a socket according to the connect options
    pub fn open(options: &ConnectOptions) -> OpResult<UdpSock> {
        let ipv6 = match (options.local_address, options.remote_address) {
            (Some(addr), _) | (None, Some(addr)) => addr.is_ipv6(),
            (None, None) => false,
        };
        let family = if ipv6 { libc::AF_INET6 } else { libc::AF_INET };

        let fd = unsafe { libc::socket(family, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            return Err(UdipeError::SocketError(errno()));
        }
        // From here on, drop of `sock` closes the fd on any setup failure.
        let sock = UdpSock { fd };

        if options.can_send() && options.send_timeout_ns != DURATION_DEFAULT {
            sock.set_send_timeout(options.send_timeout_ns)?;
        }
        if options.can_recv() && options.recv_timeout_ns != DURATION_DEFAULT {
            sock.set_recv_timeout(options.recv_timeout_ns)?;
        }
        if options.send_buffer != 0 {
            sock.set_kernel_buffer(
                libc::SO_SNDBUF,
                libc::SO_SNDBUFFORCE,
                options.send_buffer as libc::c_int,
            )?;
        }
        if options.recv_buffer != 0 {
            sock.set_kernel_buffer(
                libc::SO_RCVBUF,
                libc::SO_RCVBUFFORCE,
                options.recv_buffer as libc::c_int,
            )?;
        }
        if let Some(interface) = &options.local_interface {
            sock.bind_to_device(interface)?;
        }
        if options.priority != 0 {
            sock.setsockopt_int(
                libc::SOL_SOCKET,
                libc::SO_PRIORITY,
                options.priority as libc::c_int,
            )?;
        }
        if options.allow_multithreading {
            sock.setsockopt_int(libc::SOL_SOCKET, libc::SO_REUSEPORT, 1)?;
        }

        // Unlike the offloads, timestamping defaults to off
        if options.enable_timestamps == Toggle::Enabled {
            sock.apply_toggle(
                Toggle::Enabled,
                "timestamps",
                libc::SOL_SOCKET,
                libc::SO_TIMESTAMPNS,
                1,
            )?;
        }
        if options.can_recv() {
            sock.apply_toggle(options.enable_gro, "gro", SOL_UDP, UDP_GRO, 1)?;
        }
        if options.can_send() {
            let segment = match options.gso_segment_size {
                0 if ipv6 => DEFAULT_GSO_SEGMENT_V6,
                0 => DEFAULT_GSO_SEGMENT_V4,
                explicit => explicit,
            };
            sock.apply_toggle(
                options.enable_gso,
                "gso",
                SOL_UDP,
                UDP_SEGMENT,
                segment as libc::c_int,
            )?;
        }

        let local = options.local_address.unwrap_or_else(|| wildcard(ipv6));
        sock.bind(&local)?;
        if let Some(remote) = options.remote_address {
            sock.connect(&remote)?;
        }

        udebug!("opened udp socket fd {}", sock.fd);
        Ok(sock)
    }

    /// Locally bound UDP port (useful with auto-assigned ports)
    pub fn local_port(&self) -> OpResult<u16> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockname(
                self.fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if ret != 0 {
            return Err(UdipeError::SocketError(errno()));
        }
        let port_be = match storage.ss_family as libc::c_int {
            libc::AF_INET => {
                let addr = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in) };
                addr.sin_port
            }
            libc::AF_INET6 => {
                let addr = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in6) };
                addr.sin6_port
            }
            _ => return Err(UdipeError::SocketError(libc::EAFNOSUPPORT)),
        };
        Ok(u16::from_be(port_be))
    }

    /// Send one datagram (or GSO batch); EAGAIN maps to `Timeout`
    pub fn send(&self, payload: &[u8]) -> OpResult<usize> {
        loop {
            let sent = unsafe {
                libc::send(
                    self.fd,
                    payload.as_ptr() as *const libc::c_void,
                    payload.len(),
                    0,
                )
            };
            if sent >= 0 {
                return Ok(sent as usize);
            }
            match errno() {
                libc::EINTR => continue,
                libc::EAGAIN => return Err(UdipeError::Timeout),
                code => return Err(UdipeError::SocketError(code)),
            }
        }
    }

    /// Receive one datagram (or GRO batch) with its metadata
    pub fn recv(&self, buffer: &mut [u8]) -> OpResult<RecvMeta> {
        // Control space for the GRO segment size and a timestamp
        #[repr(align(8))]
        struct ControlBuf([u8; 128]);
        let mut control = ControlBuf([0u8; 128]);

        let mut iov = libc::iovec {
            iov_base: buffer.as_mut_ptr() as *mut libc::c_void,
            iov_len: buffer.len(),
        };
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.0.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = control.0.len();

        let received = loop {
            let received = unsafe { libc::recvmsg(self.fd, &mut msg, 0) };
            if received >= 0 {
                break received as usize;
            }
            match errno() {
                libc::EINTR => continue,
                libc::EAGAIN => return Err(UdipeError::Timeout),
                code => return Err(UdipeError::SocketError(code)),
            }
        };

        let mut meta = RecvMeta {
            len: received,
            ..Default::default()
        };
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                let header = &*cmsg;
                if header.cmsg_level == SOL_UDP && header.cmsg_type == UDP_GRO {
                    let mut segment: libc::c_int = 0;
                    std::ptr::copy_nonoverlapping(
                        libc::CMSG_DATA(cmsg),
                        &mut segment as *mut _ as *mut u8,
                        std::mem::size_of::<libc::c_int>(),
                    );
                    meta.gro_segment = segment as u16;
                } else if header.cmsg_level == libc::SOL_SOCKET
                    && header.cmsg_type == libc::SCM_TIMESTAMPNS
                {
                    let mut stamp: libc::timespec = std::mem::zeroed();
                    std::ptr::copy_nonoverlapping(
                        libc::CMSG_DATA(cmsg),
                        &mut stamp as *mut _ as *mut u8,
                        std::mem::size_of::<libc::timespec>(),
                    );
                    meta.timestamp_ns =
                        Some(stamp.tv_sec as u64 * 1_000_000_000 + stamp.tv_nsec as u64);
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }
        utrace!(
            "received {} byte(s), gro segment {}",
            meta.len,
            meta.gro_segment
        );
        Ok(meta)
    }

    /// Adjust the receive timeout (SO_RCVTIMEO)
    pub fn set_recv_timeout(&self, timeout_ns: DurationNs) -> OpResult<()> {
        self.set_timeout(libc::SO_RCVTIMEO, timeout_ns)
    }

    /// Adjust the send timeout (SO_SNDTIMEO)
    pub fn set_send_timeout(&self, timeout_ns: DurationNs) -> OpResult<()> {
        self.set_timeout(libc::SO_SNDTIMEO, timeout_ns)
    }

    fn set_timeout(&self, option: libc::c_int, timeout_ns: DurationNs) -> OpResult<()> {
        // Infinite means "block forever", which the kernel spells as zero
        let timeval = if timeout_ns == DURATION_INFINITE {
            libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            }
        } else {
            libc::timeval {
                tv_sec: (timeout_ns / 1_000_000_000) as libc::time_t,
                // Round sub-microsecond requests up so they stay nonzero
                tv_usec: ((timeout_ns % 1_000_000_000).div_ceil(1_000).max(1)) as libc::suseconds_t,
            }
        };
        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                option,
                &timeval as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(UdipeError::SocketError(errno()));
        }
        Ok(())
    }

    /// Set a kernel buffer size, falling back to the privileged FORCE
    /// variant when the kernel clamps the request
    fn set_kernel_buffer(
        &self,
        option: libc::c_int,
        force_option: libc::c_int,
        bytes: libc::c_int,
    ) -> OpResult<()> {
        self.setsockopt_int(libc::SOL_SOCKET, option, bytes)?;
        // The kernel reports double the configured value
        let effective = self.getsockopt_int(libc::SOL_SOCKET, option)? / 2;
        if effective >= bytes {
            return Ok(());
        }
        match self.setsockopt_int(libc::SOL_SOCKET, force_option, bytes) {
            Ok(()) => Ok(()),
            Err(UdipeError::SocketError(libc::EPERM)) => {
                uwarn!(
                    "kernel clamped a socket buffer to {} of {} requested \
                     bytes; raise net.core.{{r,w}}mem_max or grant \
                     CAP_NET_ADMIN",
                    effective,
                    bytes
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn bind_to_device(&self, interface: &str) -> OpResult<()> {
        let name = CString::new(interface).map_err(|_| UdipeError::SocketError(libc::EINVAL))?;
        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_BINDTODEVICE,
                name.as_ptr() as *const libc::c_void,
                name.as_bytes_with_nul().len() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(UdipeError::SocketError(errno()));
        }
        Ok(())
    }

    /// Apply a tri-state toggle; returns whether the option took effect
    fn apply_toggle(
        &self,
        toggle: Toggle,
        feature: &'static str,
        level: libc::c_int,
        option: libc::c_int,
        value: libc::c_int,
    ) -> OpResult<bool> {
        match toggle {
            Toggle::Disabled => Ok(false),
            Toggle::Enabled => match self.setsockopt_int(level, option, value) {
                Ok(()) => Ok(true),
                Err(_) => Err(UdipeError::FeatureUnsupported(feature)),
            },
            Toggle::Default => match self.setsockopt_int(level, option, value) {
                Ok(()) => Ok(true),
                Err(_) => {
                    udebug!("host does not support {}, continuing without it", feature);
                    Ok(false)
                }
            },
        }
    }

    fn bind(&self, addr: &SocketAddr) -> OpResult<()> {
        let (storage, len) = sockaddr_from(addr);
        let ret = unsafe {
            libc::bind(self.fd, &storage as *const _ as *const libc::sockaddr, len)
        };
        if ret != 0 {
            return Err(UdipeError::SocketError(errno()));
        }
        Ok(())
    }

    fn connect(&self, addr: &SocketAddr) -> OpResult<()> {
        let (storage, len) = sockaddr_from(addr);
        let ret = unsafe {
            libc::connect(self.fd, &storage as *const _ as *const libc::sockaddr, len)
        };
        if ret != 0 {
            return Err(UdipeError::SocketError(errno()));
        }
        Ok(())
    }

    fn setsockopt_int(
        &self,
        level: libc::c_int,
        option: libc::c_int,
        value: libc::c_int,
    ) -> OpResult<()> {
        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                level,
                option,
                &value as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(UdipeError::SocketError(errno()));
        }
        Ok(())
    }

    fn getsockopt_int(&self, level: libc::c_int, option: libc::c_int) -> OpResult<libc::c_int> {
        let mut value: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                self.fd,
                level,
                option,
                &mut value as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if ret != 0 {
            return Err(UdipeError::SocketError(errno()));
        }
        Ok(value)
    }
}

impl Drop for UdpSock {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(-1)
}

fn wildcard(ipv6: bool) -> SocketAddr {
    if ipv6 {
        SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((std::net::Ipv4Addr::UNSPECIFIED, 0))
    }
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
            (
                storage,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
        SocketAddr::V6(v6) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            sin6.sin6_scope_id = v6.scope_id();
            (
                storage,
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use udipe_core::command::Direction;

    #[test]
    fn test_open_default_and_port() {
        let sock = UdpSock::open(&ConnectOptions::default()).unwrap();
        let port = sock.local_port().unwrap();
        assert_ne!(port, 0);
    }

    #[test]
    fn test_invalid_interface_fails() {
        let options = ConnectOptions {
            local_interface: Some("udipe-no-such-if0".into()),
            ..Default::default()
        };
        match UdpSock::open(&options) {
            Err(UdipeError::SocketError(code)) => {
                // ENODEV, or EPERM without CAP_NET_RAW
                assert!(code == libc::ENODEV || code == libc::EPERM);
            }
            other => panic!("expected a socket error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_loopback_round_trip() {
        let receiver = UdpSock::open(&ConnectOptions::default()).unwrap();
        let port = receiver.local_port().unwrap();
        let sender = UdpSock::open(&ConnectOptions {
            direction: Direction::Out,
            remote_address: Some(SocketAddr::from((std::net::Ipv4Addr::LOCALHOST, port))),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(sender.send(&[1, 2, 3]).unwrap(), 3);
        let mut buffer = [0u8; 64];
        let meta = receiver.recv(&mut buffer).unwrap();
        assert_eq!(meta.len, 3);
        assert_eq!(&buffer[..3], &[1, 2, 3]);
    }

    #[test]
    fn test_recv_timeout() {
        let sock = UdpSock::open(&ConnectOptions::default()).unwrap();
        sock.set_recv_timeout(10_000_000).unwrap();
        let mut buffer = [0u8; 64];
        assert_eq!(sock.recv(&mut buffer), Err(UdipeError::Timeout));
    }

    #[test]
    fn test_sockaddr_round_trip() {
        let addr: SocketAddr = "127.0.0.1:4567".parse().unwrap();
        let (storage, len) = sockaddr_from(&addr);
        assert_eq!(len as usize, std::mem::size_of::<libc::sockaddr_in>());
        let sin = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in) };
        assert_eq!(u16::from_be(sin.sin_port), 4567);
    }
}
