#![deny(unsafe_op_in_unsafe_fn)]

//! Userspace IP-to-sockets NAT engine.
//!
//! The engine consumes raw IPv4 datagrams (typically read from a TUN-style
//! interface), translates them into ordinary host socket operations, and
//! synthesises IPv4 reply datagrams back toward the originator. TCP is
//! terminated locally and re-originated, UDP is forwarded with flow
//! tracking, and ICMP echo is multiplexed over one shared raw socket.
//!
//! The engine itself never blocks: it exposes its descriptor sets through
//! [`NatEngine::fds`] and expects the host to run `select` (or an
//! equivalent) and hand readiness back via [`NatEngine::handle_fd`]. All
//! interaction with the client side of the tunnel goes through the
//! [`HostCallbacks`] trait.

mod engine;
mod host;
pub mod logger;
pub mod packet;

pub use engine::{
    select, Conn, ConnStatus, EngineConfig, EngineStats, FdSet, ForwardError, InitError, NatEngine,
};
pub use host::{HostCallbacks, PacketDirection};
pub use packet::{FiveTuple, ParseError, Pkt, Proto, TcpFlags};
