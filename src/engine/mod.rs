//! The NAT engine: flow table, flow lifecycle, and the forwarding entry
//! points that translate client datagrams into host socket operations.

mod checksum;
mod conn;
mod icmp;
mod poll;
mod purge;
mod reply;
mod sock;
mod tcp;
mod udp;

#[cfg(test)]
mod tests;

pub use conn::{Conn, ConnStatus};
pub use poll::{select, FdSet};

use crate::host::{HostCallbacks, PacketDirection};
use crate::logger::{self, BreadcrumbFlags};
use crate::packet::{self, FiveTuple, Pkt, Proto, TcpFlags, Transport};
use conn::{MAX_NUM_SOCKETS, NUM_SOCKETS_AFTER_PURGE, REPLY_BUF_SIZE, TCP_WINDOW_SIZE};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use socket2::Socket;
use std::io;
use std::ops::ControlFlow;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InitError {
    #[error("cannot create raw ICMP socket: {0}")]
    IcmpSocket(#[source] io::Error),
}

/// Transient failure while forwarding one client packet. The caller is
/// expected to destroy the flow (see [`NatEngine::easy_forward`]).
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("socket error: {0}")]
    Socket(#[from] io::Error),
    #[error("ICMP forwarding is disabled")]
    IcmpDisabled,
}

/// Engine construction knobs. The defaults mirror the platform constants;
/// tests and embedders with unusual fd budgets can lower the socket caps.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Open the shared raw ICMP socket at init. Requires privileges; when
    /// disabled, ICMP flows are refused.
    pub enable_icmp: bool,
    /// Upper bound for the window advertised toward the client.
    pub max_window_size: u16,
    /// Socket budget that triggers a purge pass on admission.
    pub max_open_sockets: usize,
    /// Open-socket target a pressure-driven purge shrinks down to.
    pub purge_target: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enable_icmp: true,
            max_window_size: TCP_WINDOW_SIZE,
            max_open_sockets: MAX_NUM_SOCKETS,
            purge_target: NUM_SOCKETS_AFTER_PURGE,
        }
    }
}

/// Aggregate counters. Active counts and oldest timestamps are computed
/// over the live table; the `opened` totals are lifetime-monotonic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub num_tcp_conn: u32,
    pub num_udp_conn: u32,
    pub num_icmp_conn: u32,
    /// Oldest last-activity timestamp per protocol; zero when no flow.
    pub oldest_tcp_conn: u64,
    pub oldest_udp_conn: u64,
    pub oldest_icmp_conn: u64,
    pub num_tcp_opened: u32,
    pub num_udp_opened: u32,
    pub num_icmp_opened: u32,
    pub num_open_sockets: usize,
}

/// The engine proper. Strictly single-threaded: every method must be
/// called from one thread, and nothing here blocks beyond a send on an
/// established TCP socket.
pub struct NatEngine<H: HostCallbacks> {
    host: H,
    table: FxHashMap<FiveTuple, Conn>,
    all_fds: FdSet,
    tcp_connecting: FdSet,
    max_fd: RawFd,
    max_window_size: u16,
    max_open_sockets: usize,
    purge_target: usize,
    num_open_socks: usize,
    num_active_connections: usize,
    num_tcp_opened: u32,
    num_udp_opened: u32,
    num_icmp_opened: u32,
    icmp_socket: Option<Socket>,
    reply_buf: Box<[u8; REPLY_BUF_SIZE]>,
}

impl<H: HostCallbacks> NatEngine<H> {
    pub fn new(host: H, config: EngineConfig) -> Result<Self, InitError> {
        let mut engine = Self {
            host,
            table: FxHashMap::default(),
            all_fds: FdSet::new(),
            tcp_connecting: FdSet::new(),
            max_fd: 0,
            max_window_size: config.max_window_size,
            max_open_sockets: config.max_open_sockets,
            purge_target: config.purge_target,
            num_open_socks: 0,
            num_active_connections: 0,
            num_tcp_opened: 0,
            num_udp_opened: 0,
            num_icmp_opened: 0,
            icmp_socket: None,
            reply_buf: Box::new([0u8; REPLY_BUF_SIZE]),
        };

        if config.enable_icmp {
            let icmp = sock::open_raw_icmp().map_err(InitError::IcmpSocket)?;
            let fd = icmp.as_raw_fd();
            engine.host.on_socket_open(fd);
            engine.all_fds.insert(fd);
            engine.max_fd = engine.max_fd.max(fd);
            engine.num_open_socks += 1;
            engine.icmp_socket = Some(icmp);
        }

        logger::breadcrumb(
            BreadcrumbFlags::SOCKET,
            format!(
                "engine initialised (icmp={}, socket budget {}/{})",
                engine.icmp_socket.is_some(),
                engine.purge_target,
                engine.max_open_sockets
            ),
        );
        Ok(engine)
    }

    /// Tear down every flow, emitting the usual close notifications, and
    /// release the shared raw ICMP socket.
    pub fn finalize(mut self) {
        let tuples: Vec<FiveTuple> = self.table.keys().copied().collect();
        for tuple in tuples {
            self.destroy_conn(&tuple);
        }
        if let Some(icmp) = self.icmp_socket.take() {
            let fd = icmp.as_raw_fd();
            drop(icmp);
            self.host.on_socket_close(fd);
            self.num_open_socks -= 1;
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn set_max_window_size(&mut self, size: u16) {
        self.max_window_size = size;
    }

    pub fn conn(&self, tuple: &FiveTuple) -> Option<&Conn> {
        self.table.get(tuple)
    }

    pub fn conn_mut(&mut self, tuple: &FiveTuple) -> Option<&mut Conn> {
        self.table.get_mut(tuple)
    }

    pub fn num_connections(&self) -> usize {
        self.num_active_connections
    }

    /// Find the flow for `tuple`, creating it when `create` is set and the
    /// host accepts it. Admission under socket pressure triggers a purge
    /// pass first.
    pub fn lookup(&mut self, tuple: &FiveTuple, create: bool) -> Option<&mut Conn> {
        if !self.table.contains_key(tuple) {
            if !create {
                return None;
            }
            if self.num_open_socks >= self.max_open_sockets {
                logger::breadcrumb(
                    BreadcrumbFlags::PURGE,
                    "socket budget exhausted, purging before admission",
                );
                self.purge_expired(unix_now());
            }
            let mut conn = Conn::new(*tuple, unix_now());
            if !self.host.on_connection_open(&mut conn) {
                logger::debug(format!("{tuple} rejected by host"));
                return None;
            }
            logger::breadcrumb(BreadcrumbFlags::FLOW, format!("{tuple} admitted"));
            self.num_active_connections += 1;
            self.table.insert(*tuple, conn);
        }
        self.table.get_mut(tuple)
    }

    /// Forward one parsed client packet on its flow, synthesising whatever
    /// client-bound segments the protocol calls for.
    pub fn forward(&mut self, pkt: &Pkt<'_>, tuple: &FiveTuple) -> Result<(), ForwardError> {
        self.forward_full(pkt, tuple, false)
    }

    /// Like [`NatEngine::forward`], but suppresses the client-bound ACK for
    /// TCP payload and leaves `client_seq` untouched (out-of-band data).
    pub fn send_oob(&mut self, pkt: &Pkt<'_>, tuple: &FiveTuple) -> Result<(), ForwardError> {
        self.forward_full(pkt, tuple, true)
    }

    fn forward_full(
        &mut self,
        pkt: &Pkt<'_>,
        tuple: &FiveTuple,
        no_ack: bool,
    ) -> Result<(), ForwardError> {
        match self.table.get(tuple).map(|conn| conn.status) {
            None => {
                logger::warn(format!("forward on unknown flow {tuple}"));
                return Ok(());
            }
            Some(ConnStatus::Closed) => {
                logger::debug(format!("refusing to forward on closed flow {tuple}"));
                return Ok(());
            }
            Some(_) => {}
        }

        let rv = match tuple.proto {
            Proto::Tcp => self.tcp_forward(pkt, tuple, no_ack),
            Proto::Udp => self.udp_forward(pkt, tuple),
            Proto::Icmp => self.icmp_forward(pkt, tuple),
        };

        if rv.is_ok() {
            if let Some(conn) = self.table.get_mut(tuple) {
                conn.tstamp = unix_now();
                if conn.status == ConnStatus::New {
                    logger::error(format!("{tuple} still NEW after a successful forward"));
                }
            }
        }
        rv
    }

    /// Parse + lookup + forward in one call. Non-SYN TCP packets for
    /// unknown flows are dropped (no flow is created for a conversation
    /// whose handshake we never saw). On a forward error the flow is
    /// destroyed immediately; this is the one place where inline
    /// destruction is safe, because no flow state is borrowed across it.
    pub fn easy_forward(&mut self, frame: &[u8]) -> Option<FiveTuple> {
        let pkt = match packet::parse(frame) {
            Ok(pkt) => pkt,
            Err(err) => {
                logger::debug(format!("easy_forward: {err}"));
                return None;
            }
        };

        let tcp_established = matches!(
            pkt.transport,
            Transport::Tcp(hdr)
                if !hdr.flags.contains(TcpFlags::SYN) || hdr.flags.contains(TcpFlags::ACK)
        );

        let tuple = pkt.tuple;
        if self.lookup(&tuple, !tcp_established).is_none() {
            if tcp_established {
                logger::debug(format!("ignoring non-SYN TCP packet for unknown flow {tuple}"));
            }
            return None;
        }

        if let Err(err) = self.forward(&pkt, &tuple) {
            logger::debug(format!("easy_forward: {err}"));
            self.destroy_conn(&tuple);
            return None;
        }
        Some(tuple)
    }

    /// Idempotent terminal transition: release the OS socket, drop any
    /// pending data, emit the RST toward the client if the flow never saw
    /// a terminal segment, and notify the host. The flow itself stays in
    /// the table until the next purge pass so callbacks can still
    /// reference it.
    pub(super) fn close_conn(&mut self, tuple: &FiveTuple) {
        let (sock, rst) = {
            let Some(conn) = self.table.get_mut(tuple) else {
                return;
            };
            if conn.status == ConnStatus::Closed {
                return;
            }
            let sock = conn.sock.take();
            conn.tcp.pending = None;
            let rst = if tuple.proto == Proto::Tcp && !conn.tcp.fin_ack_sent {
                // latch: the RST is emitted at most once per flow
                conn.tcp.fin_ack_sent = true;
                Some((conn.tcp.tunnel_seq, conn.tcp.client_seq))
            } else {
                None
            };
            (sock, rst)
        };

        if let Some(sock) = sock {
            self.detach_socket(sock);
        }

        if let Some((seq, ack)) = rst {
            let len = reply::fill_tcp_frame(
                &mut self.reply_buf[..],
                tuple,
                TcpFlags::RST | TcpFlags::ACK,
                seq,
                ack,
                self.max_window_size,
                0,
            );
            let _ = self.emit_reply(tuple, len);
        }

        if let Some(conn) = self.table.get_mut(tuple) {
            // a failing RST emission above can re-enter close_conn and
            // complete the transition already
            if conn.status != ConnStatus::Closed {
                self.host.on_connection_close(conn);
                conn.status = ConnStatus::Closed;
                logger::breadcrumb(BreadcrumbFlags::FLOW, format!("{tuple} closed"));
            }
        }
    }

    /// Close the flow and remove it from the table. Never call this from
    /// within packet handling; use the close-then-purge path instead so
    /// host callbacks cannot observe a freed flow.
    pub fn destroy_conn(&mut self, tuple: &FiveTuple) {
        self.close_conn(tuple);
        if self.table.remove(tuple).is_some() {
            self.num_active_connections -= 1;
            logger::breadcrumb(BreadcrumbFlags::FLOW, format!("{tuple} destroyed"));
        }
    }

    /// Release an OS socket: drop it from both descriptor sets, close it,
    /// and tell the host. The owning flow (if any) keeps running; client
    /// communication can continue, e.g. the final ACK after a FIN+ACK.
    pub(super) fn detach_socket(&mut self, sock: Socket) {
        let fd = sock.as_raw_fd();
        self.all_fds.remove(fd);
        self.tcp_connecting.remove(fd);
        self.num_open_socks -= 1;
        drop(sock);
        self.host.on_socket_close(fd);
    }

    /// Close a socket that never made it onto a flow.
    pub(super) fn close_socket(&mut self, sock: Socket) {
        let fd = sock.as_raw_fd();
        drop(sock);
        self.host.on_socket_close(fd);
    }

    /// Hand `len` bytes of the reply buffer to the host. A failing host
    /// closes the flow the frame belongs to.
    pub(super) fn emit_reply(&mut self, tuple: &FiveTuple, len: usize) -> io::Result<()> {
        let rv = match self.table.get(tuple) {
            Some(conn) => self.host.send_client(&self.reply_buf[..len], conn),
            None => return Ok(()),
        };
        match rv {
            Ok(()) => {
                if let Some(conn) = self.table.get(tuple) {
                    self.host.account_packet(
                        &self.reply_buf[..len],
                        PacketDirection::NetworkToClient,
                        conn,
                    );
                }
                Ok(())
            }
            Err(err) => {
                logger::error(format!("send_client failed for {tuple}: {err}"));
                self.close_conn(tuple);
                Err(err)
            }
        }
    }

    pub(super) fn account_inbound(&mut self, pkt: &Pkt<'_>, tuple: &FiveTuple) {
        if let Some(conn) = self.table.get(tuple) {
            self.host
                .account_packet(pkt.buf, PacketDirection::ClientToNetwork, conn);
        }
    }

    /// Snapshot the descriptor sets for the host's `select`: all readable
    /// sockets, the TCP sockets awaiting connect completion (watched for
    /// writability), and the highest descriptor across both.
    pub fn fds(&self) -> (RawFd, FdSet, FdSet) {
        (self.max_fd, self.all_fds, self.tcp_connecting)
    }

    /// Dispatch every socket the host found ready. Returns the number of
    /// sockets serviced. Flows may close (and sockets detach) while the
    /// pass runs, so readiness is collected up front and re-validated per
    /// flow.
    pub fn handle_fd(&mut self, rd: &FdSet, wr: &FdSet) -> usize {
        let mut hits = 0;

        if let Some(icmp_fd) = self.icmp_socket.as_ref().map(|sock| sock.as_raw_fd()) {
            if rd.contains(icmp_fd) {
                self.icmp_reply();
                hits += 1;
            }
        }

        let ready: SmallVec<[(FiveTuple, RawFd, bool); 16]> = self
            .table
            .iter()
            .filter_map(|(tuple, conn)| {
                let fd = conn.sock.as_ref()?.as_raw_fd();
                if rd.contains(fd) {
                    Some((*tuple, fd, true))
                } else if wr.contains(fd) {
                    Some((*tuple, fd, false))
                } else {
                    None
                }
            })
            .collect();

        for (tuple, fd, readable) in ready {
            let current = self
                .table
                .get(&tuple)
                .and_then(|conn| conn.sock.as_ref())
                .map(|sock| sock.as_raw_fd());
            if current != Some(fd) {
                continue;
            }
            if readable {
                match tuple.proto {
                    Proto::Tcp => self.tcp_reply(&tuple),
                    Proto::Udp => self.udp_reply(&tuple),
                    Proto::Icmp => {
                        logger::error(format!("readable socket on ICMP flow {tuple}"))
                    }
                }
            } else if tuple.proto == Proto::Tcp {
                self.tcp_connect_complete(&tuple);
            } else {
                logger::error(format!("writable socket on non-TCP flow {tuple}"));
            }
            hits += 1;
        }
        hits
    }

    /// Visit every non-closed flow. The visitor returns
    /// [`ControlFlow::Break`] to stop early; `iter_connections` reports
    /// whether it did.
    pub fn iter_connections<F>(&self, mut visitor: F) -> bool
    where
        F: FnMut(&Conn) -> ControlFlow<()>,
    {
        for conn in self.table.values() {
            if conn.status == ConnStatus::Closed {
                continue;
            }
            if visitor(conn).is_break() {
                return true;
            }
        }
        false
    }

    pub fn stats(&self) -> EngineStats {
        let mut stats = EngineStats {
            num_tcp_opened: self.num_tcp_opened,
            num_udp_opened: self.num_udp_opened,
            num_icmp_opened: self.num_icmp_opened,
            num_open_sockets: self.num_open_socks,
            ..EngineStats::default()
        };
        for conn in self.table.values() {
            match conn.tuple.proto {
                Proto::Tcp => {
                    stats.num_tcp_conn += 1;
                    stats.oldest_tcp_conn = oldest(stats.oldest_tcp_conn, conn.tstamp);
                }
                Proto::Udp => {
                    stats.num_udp_conn += 1;
                    stats.oldest_udp_conn = oldest(stats.oldest_udp_conn, conn.tstamp);
                }
                Proto::Icmp => {
                    stats.num_icmp_conn += 1;
                    stats.oldest_icmp_conn = oldest(stats.oldest_icmp_conn, conn.tstamp);
                }
            }
        }
        stats
    }
}

fn oldest(current: u64, tstamp: u64) -> u64 {
    if current == 0 {
        tstamp
    } else {
        current.min(tstamp)
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
