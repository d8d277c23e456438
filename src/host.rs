//! Host-facing callback surface.

use crate::engine::Conn;
use std::io;
use std::os::unix::io::RawFd;

/// Direction of a frame relative to the engine.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PacketDirection {
    /// A client frame entering the engine.
    ClientToNetwork,
    /// A synthesised frame leaving the engine toward the client.
    NetworkToClient,
}

/// Callbacks installed by the host so the engine can reach the client side
/// of the tunnel. Only [`HostCallbacks::send_client`] is mandatory; the
/// remaining hooks default to no-ops.
pub trait HostCallbacks {
    /// Deliver an IPv4 frame to the client. Returning an error closes the
    /// flow the frame belongs to.
    fn send_client(&mut self, frame: &[u8], conn: &Conn) -> io::Result<()>;

    /// Invoked for every frame successfully moved in either direction.
    fn account_packet(&mut self, _frame: &[u8], _direction: PacketDirection, _conn: &Conn) {}

    /// Invoked right after a flow is created, before it is inserted into
    /// the table. Returning `false` rejects the flow; no state is retained.
    /// This is the place to apply a DNAT override or attach user data.
    fn on_connection_open(&mut self, _conn: &mut Conn) -> bool {
        true
    }

    /// Invoked while a flow is being closed, before its status flips to
    /// [`crate::ConnStatus::Closed`].
    fn on_connection_close(&mut self, _conn: &mut Conn) {}

    fn on_socket_open(&mut self, _fd: RawFd) {}

    fn on_socket_close(&mut self, _fd: RawFd) {}
}
