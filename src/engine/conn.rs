use crate::packet::{FiveTuple, Proto};
use socket2::Socket;
use std::any::Any;
use std::net::SocketAddrV4;

pub(super) const REPLY_BUF_SIZE: usize = 65535;
pub(super) const TCP_WINDOW_SIZE: u16 = 64240;

/// The fixed ISN the engine announces toward the client.
pub(super) const TUNNEL_ISN: u32 = 0x77EB_77EB;

pub(super) const TCP_TIMEOUT_SECS: u64 = 30;
pub(super) const UDP_TIMEOUT_SECS: u64 = 15;
pub(super) const ICMP_TIMEOUT_SECS: u64 = 5;

// Winsock caps fd sets at 64 per thread; leave room for host-owned sockets.
#[cfg(windows)]
pub(super) const MAX_NUM_SOCKETS: usize = 55;
#[cfg(windows)]
pub(super) const NUM_SOCKETS_AFTER_PURGE: usize = 40;

// On POSIX the default open-files limit is 1024.
#[cfg(not(windows))]
pub(super) const MAX_NUM_SOCKETS: usize = 128;
#[cfg(not(windows))]
pub(super) const NUM_SOCKETS_AFTER_PURGE: usize = 96;

pub(super) fn idle_timeout_secs(proto: Proto) -> u64 {
    match proto {
        Proto::Tcp => TCP_TIMEOUT_SECS,
        Proto::Udp => UDP_TIMEOUT_SECS,
        Proto::Icmp => ICMP_TIMEOUT_SECS,
    }
}

/// Lifecycle of a flow.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConnStatus {
    New,
    /// TCP only: a non-blocking connect is in flight.
    Connecting,
    Connected,
    /// Terminal. The flow lingers until the next purge pass so host
    /// callbacks can still reference it.
    Closed,
}

/// Server-sourced bytes waiting for client window space.
pub(crate) struct PendingData {
    pub(crate) data: Vec<u8>,
    /// Bytes already pushed toward the client.
    pub(crate) sofar: usize,
}

#[derive(Default)]
pub(crate) struct TcpState {
    /// Next byte number we expect from the client (host order).
    pub(crate) client_seq: u32,
    /// Next byte number the engine will emit toward the client.
    pub(crate) tunnel_seq: u32,
    /// Client-advertised window minus in-flight bytes.
    pub(crate) window_size: u32,
    pub(crate) fin_ack_sent: bool,
    pub(crate) pending: Option<PendingData>,
}

#[derive(Default, Clone, Copy)]
pub(crate) struct IcmpState {
    pub(crate) echo_id: u16,
    pub(crate) echo_seq: u16,
}

/// One tracked flow: the NAT state between a client conversation and the
/// host socket that re-originates it.
pub struct Conn {
    pub(crate) tuple: FiveTuple,
    /// Last-activity epoch seconds.
    pub(crate) tstamp: u64,
    pub(crate) sock: Option<Socket>,
    pub(crate) status: ConnStatus,
    pub(crate) dnat: Option<SocketAddrV4>,
    pub(crate) tcp: TcpState,
    pub(crate) icmp: IcmpState,
    pub(crate) user_data: Option<Box<dyn Any + Send>>,
}

impl Conn {
    pub(super) fn new(tuple: FiveTuple, now: u64) -> Self {
        Self {
            tuple,
            tstamp: now,
            sock: None,
            status: ConnStatus::New,
            dnat: None,
            tcp: TcpState::default(),
            icmp: IcmpState::default(),
            user_data: None,
        }
    }

    pub fn tuple(&self) -> &FiveTuple {
        &self.tuple
    }

    pub fn status(&self) -> ConnStatus {
        self.status
    }

    /// Seconds-since-epoch timestamp of the last successful forward or
    /// reply on this flow.
    pub fn last_activity(&self) -> u64 {
        self.tstamp
    }

    /// Override the destination the flow connects to. Must be applied
    /// before the first packet is forwarded (typically from
    /// `on_connection_open`).
    pub fn set_dnat(&mut self, addr: SocketAddrV4) {
        self.dnat = Some(addr);
    }

    pub fn dnat(&self) -> Option<SocketAddrV4> {
        self.dnat
    }

    pub fn set_user_data(&mut self, data: Box<dyn Any + Send>) {
        self.user_data = Some(data);
    }

    pub fn user_data(&self) -> Option<&(dyn Any + Send)> {
        self.user_data.as_deref()
    }

    pub fn user_data_mut(&mut self) -> Option<&mut (dyn Any + Send)> {
        self.user_data.as_deref_mut()
    }

    /// The endpoint server-bound traffic is sent to: the DNAT override if
    /// present, the tuple destination otherwise.
    pub(super) fn server_addr(&self) -> SocketAddrV4 {
        self.dnat
            .unwrap_or_else(|| SocketAddrV4::new(self.tuple.dst_ip, self.tuple.dst_port))
    }
}
