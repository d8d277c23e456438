//! Socket plumbing shared by the protocol handlers.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{SocketAddr, SocketAddrV4};

pub(super) fn open_tcp() -> io::Result<Socket> {
    Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
}

pub(super) fn open_udp() -> io::Result<Socket> {
    Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
}

/// The shared raw ICMP socket. Creation usually needs elevated privileges
/// or CAP_NET_RAW; failure is fatal to engine initialisation.
pub(super) fn open_raw_icmp() -> io::Result<Socket> {
    Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))
}

pub(super) fn to_sockaddr(addr: SocketAddrV4) -> SockAddr {
    SockAddr::from(SocketAddr::V4(addr))
}

/// Outcome of starting a non-blocking connect.
pub(super) enum ConnectStart {
    Established,
    InProgress,
}

/// Put `sock` into non-blocking mode and start connecting to `addr`.
/// `EINPROGRESS` is the expected outcome; completion is signalled by the
/// socket turning writable, at which point [`connect_result`] must be
/// consulted (a second `connect` call is not a reliable signal).
pub(super) fn connect_nonblocking(sock: &Socket, addr: SocketAddrV4) -> io::Result<ConnectStart> {
    sock.set_nonblocking(true)?;
    match sock.connect(&to_sockaddr(addr)) {
        Ok(()) => Ok(ConnectStart::Established),
        Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => Ok(ConnectStart::InProgress),
        Err(err) => Err(err),
    }
}

/// Read the deferred connect result (`SO_ERROR`) once the socket reports
/// writable.
pub(super) fn connect_result(sock: &Socket) -> io::Result<()> {
    match sock.take_error()? {
        None => Ok(()),
        Some(err) => Err(err),
    }
}

/// Whether a receive error means the server ended the conversation, as
/// opposed to a genuine I/O failure.
pub(super) fn is_remote_close(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}
