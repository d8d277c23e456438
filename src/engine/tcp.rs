//! TCP termination: the client-facing state machine and the proxying of
//! server data back through the client's receive window.

use super::conn::{ConnStatus, PendingData, TUNNEL_ISN};
use super::reply::{self, TCP_PAYLOAD_OFFSET};
use super::sock::{self, ConnectStart};
use super::{unix_now, ForwardError, NatEngine};
use crate::host::HostCallbacks;
use crate::logger::{self, BreadcrumbFlags};
use crate::packet::{FiveTuple, Pkt, TcpFlags, TcpHeader, Transport};
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;

impl<H: HostCallbacks> NatEngine<H> {
    pub(super) fn tcp_forward(
        &mut self,
        pkt: &Pkt<'_>,
        tuple: &FiveTuple,
        no_ack: bool,
    ) -> Result<(), ForwardError> {
        let Transport::Tcp(hdr) = pkt.transport else {
            return Ok(());
        };
        let Some(status) = self.table.get(tuple).map(|conn| conn.status) else {
            return Ok(());
        };
        match status {
            ConnStatus::Connecting => {
                // the async-connect writer drives the handshake; nothing to
                // ACK yet
                logger::debug(format!("dropping client packet while {tuple} connects"));
                Ok(())
            }
            ConnStatus::New => self.tcp_open(pkt, &hdr, tuple),
            _ => self.tcp_established(pkt, &hdr, tuple, no_ack),
        }
    }

    /// First packet of a flow: intercept the SYN and start a non-blocking
    /// connect toward the (possibly DNAT'd) destination.
    fn tcp_open(
        &mut self,
        pkt: &Pkt<'_>,
        hdr: &TcpHeader,
        tuple: &FiveTuple,
    ) -> Result<(), ForwardError> {
        let Some(server) = self.table.get(tuple).map(|conn| conn.server_addr()) else {
            return Ok(());
        };
        logger::breadcrumb(
            BreadcrumbFlags::SOCKET,
            format!("opening TCP socket for {tuple}"),
        );
        let sock = sock::open_tcp()?;
        self.host.on_socket_open(sock.as_raw_fd());
        self.num_tcp_opened += 1;

        let started = match sock::connect_nonblocking(&sock, server) {
            Ok(started) => started,
            Err(err) => {
                logger::warn(format!("TCP connect to {server} failed: {err}"));
                self.close_socket(sock);
                return Err(ForwardError::Socket(err));
            }
        };

        let fd = sock.as_raw_fd();
        {
            let Some(conn) = self.table.get_mut(tuple) else {
                return Ok(());
            };
            conn.sock = Some(sock);
            conn.tcp.client_seq = hdr.seq.wrapping_add(1);
            conn.tcp.tunnel_seq = TUNNEL_ISN;
        }
        self.account_inbound(pkt, tuple);
        self.max_fd = self.max_fd.max(fd);
        self.num_open_socks += 1;

        match started {
            ConnectStart::Established => self.tcp_handshake_done(tuple),
            ConnectStart::InProgress => {
                logger::debug(format!("connect in progress for {tuple}"));
                // watched for writability only; joins the readable set once
                // the handshake completes
                self.tcp_connecting.insert(fd);
                if let Some(conn) = self.table.get_mut(tuple) {
                    conn.status = ConnStatus::Connecting;
                }
                Ok(())
            }
        }
    }

    /// The server socket is connected: leave non-blocking mode, move the
    /// socket into the readable set, and answer the client's SYN. The SYN
    /// we synthesise consumes one sequence number.
    fn tcp_handshake_done(&mut self, tuple: &FiveTuple) -> Result<(), ForwardError> {
        let (fd, seq, ack) = {
            let Some(conn) = self.table.get_mut(tuple) else {
                return Ok(());
            };
            let Some(sock) = conn.sock.as_ref() else {
                return Ok(());
            };
            if let Err(err) = sock.set_nonblocking(false) {
                logger::error(format!("cannot disable non-blocking mode: {err}"));
            }
            conn.status = ConnStatus::Connected;
            (sock.as_raw_fd(), conn.tcp.tunnel_seq, conn.tcp.client_seq)
        };
        self.tcp_connecting.remove(fd);
        self.all_fds.insert(fd);

        let len = reply::fill_tcp_frame(
            &mut self.reply_buf[..],
            tuple,
            TcpFlags::SYN | TcpFlags::ACK,
            seq,
            ack,
            self.max_window_size,
            0,
        );
        if let Some(conn) = self.table.get_mut(tuple) {
            conn.tcp.tunnel_seq = conn.tcp.tunnel_seq.wrapping_add(1);
        }
        self.emit_reply(tuple, len)?;
        Ok(())
    }

    /// A socket in the connecting set turned writable: consult `SO_ERROR`
    /// and either finish the handshake or close the flow.
    pub(super) fn tcp_connect_complete(&mut self, tuple: &FiveTuple) {
        let result = {
            let Some(sock) = self.table.get(tuple).and_then(|conn| conn.sock.as_ref()) else {
                return;
            };
            sock::connect_result(sock)
        };
        match result {
            Ok(()) => {
                logger::breadcrumb(
                    BreadcrumbFlags::SOCKET,
                    format!("async connect completed for {tuple}"),
                );
                let _ = self.tcp_handshake_done(tuple);
                if let Some(conn) = self.table.get_mut(tuple) {
                    conn.tstamp = unix_now();
                }
            }
            Err(err) => {
                logger::debug(format!("async connect failed for {tuple}: {err}"));
                self.close_conn(tuple);
            }
        }
    }

    fn tcp_established(
        &mut self,
        pkt: &Pkt<'_>,
        hdr: &TcpHeader,
        tuple: &FiveTuple,
        no_ack: bool,
    ) -> Result<(), ForwardError> {
        self.account_inbound(pkt, tuple);

        if hdr.flags.contains(TcpFlags::RST) {
            logger::debug(format!("client reset on {tuple}"));
            self.close_conn(tuple);
            return Ok(());
        }

        if hdr.flags.contains(TcpFlags::FIN | TcpFlags::ACK) {
            // the FIN consumes one sequence number on top of any payload
            let (seq, ack) = {
                let Some(conn) = self.table.get_mut(tuple) else {
                    return Ok(());
                };
                conn.tcp.client_seq = conn.tcp.client_seq.wrapping_add(pkt.l7.len() as u32 + 1);
                (conn.tcp.tunnel_seq, conn.tcp.client_seq)
            };
            let len = reply::fill_tcp_frame(
                &mut self.reply_buf[..],
                tuple,
                TcpFlags::ACK,
                seq,
                ack,
                self.max_window_size,
                0,
            );
            let _ = self.emit_reply(tuple, len);
            return Ok(());
        }

        if self.table.get(tuple).map_or(true, |conn| conn.sock.is_none()) {
            logger::debug(format!("ignoring client data on detached {tuple}"));
            return Ok(());
        }

        if hdr.flags.contains(TcpFlags::ACK) {
            // the window the client grants us shrinks by whatever it has
            // not yet acknowledged
            if let Some(conn) = self.table.get_mut(tuple) {
                let in_flight = conn.tcp.tunnel_seq.wrapping_sub(hdr.ack);
                let ceiling = u32::from(hdr.window.min(self.max_window_size));
                conn.tcp.window_size = ceiling.saturating_sub(in_flight);
                logger::breadcrumb(
                    BreadcrumbFlags::WINDOW,
                    format!(
                        "{tuple} window now {} ({in_flight} in flight)",
                        conn.tcp.window_size
                    ),
                );
            }
            self.tcp_drain_pending(tuple);
        }

        if pkt.l7.is_empty() {
            // avoid ACKing a bare ACK
            return Ok(());
        }

        let write_result = {
            let Some(conn) = self.table.get_mut(tuple) else {
                return Ok(());
            };
            let Some(sock) = conn.sock.as_mut() else {
                return Ok(());
            };
            sock.write_all(pkt.l7)
        };
        if let Err(err) = write_result {
            logger::error(format!("TCP send to server failed on {tuple}: {err}"));
            return Err(ForwardError::Socket(err));
        }

        if !no_ack {
            let (seq, ack) = {
                let Some(conn) = self.table.get_mut(tuple) else {
                    return Ok(());
                };
                conn.tcp.client_seq = conn.tcp.client_seq.wrapping_add(pkt.l7.len() as u32);
                (conn.tcp.tunnel_seq, conn.tcp.client_seq)
            };
            let len = reply::fill_tcp_frame(
                &mut self.reply_buf[..],
                tuple,
                TcpFlags::ACK,
                seq,
                ack,
                self.max_window_size,
                0,
            );
            self.emit_reply(tuple, len)?;
        }
        Ok(())
    }

    /// The server socket is readable: proxy data toward the client,
    /// queueing whatever exceeds the client's window.
    pub(super) fn tcp_reply(&mut self, tuple: &FiveTuple) {
        let read_result = {
            let Some(conn) = self.table.get_mut(tuple) else {
                return;
            };
            conn.tstamp = unix_now();
            let Some(sock) = conn.sock.as_mut() else {
                return;
            };
            sock.read(&mut self.reply_buf[TCP_PAYLOAD_OFFSET..])
        };

        let n = match read_result {
            Err(err) => {
                if sock::is_remote_close(&err) {
                    logger::debug(format!("{tuple} terminated by server: {err}"));
                } else {
                    logger::error(format!("error reading server data on {tuple}: {err}"));
                }
                self.close_conn(tuple);
                return;
            }
            Ok(0) => {
                self.tcp_server_eof(tuple);
                return;
            }
            Ok(n) => n,
        };

        let queue = {
            let Some(conn) = self.table.get(tuple) else {
                return;
            };
            conn.tcp.pending.is_some() || (conn.tcp.window_size as usize) < n
        };

        if queue {
            logger::breadcrumb(
                BreadcrumbFlags::WINDOW,
                format!("window exhausted on {tuple}, queueing {n} bytes"),
            );
            let fd = {
                let Some(conn) = self.table.get_mut(tuple) else {
                    return;
                };
                conn.tcp.pending = Some(PendingData {
                    data: self.reply_buf[TCP_PAYLOAD_OFFSET..TCP_PAYLOAD_OFFSET + n].to_vec(),
                    sofar: 0,
                });
                conn.sock.as_ref().map(|sock| sock.as_raw_fd())
            };
            // server reads pause until the queue drains
            if let Some(fd) = fd {
                self.all_fds.remove(fd);
            }
            self.tcp_drain_pending(tuple);
            return;
        }

        let (seq, ack) = {
            let Some(conn) = self.table.get_mut(tuple) else {
                return;
            };
            let seq = conn.tcp.tunnel_seq;
            conn.tcp.tunnel_seq = conn.tcp.tunnel_seq.wrapping_add(n as u32);
            conn.tcp.window_size -= n as u32;
            (seq, conn.tcp.client_seq)
        };
        let len = reply::fill_tcp_frame(
            &mut self.reply_buf[..],
            tuple,
            TcpFlags::PSH | TcpFlags::ACK,
            seq,
            ack,
            self.max_window_size,
            n,
        );
        let _ = self.emit_reply(tuple, len);
    }

    /// EOF from the server: emit FIN+ACK once, then detach the socket so
    /// select stops firing. The flow stays alive for the client's final
    /// ACK until it idles out.
    fn tcp_server_eof(&mut self, tuple: &FiveTuple) {
        let fin_needed = {
            let Some(conn) = self.table.get(tuple) else {
                return;
            };
            if conn.tcp.pending.is_some() {
                logger::warn(format!("server EOF with pending data on {tuple}"));
            }
            !conn.tcp.fin_ack_sent
        };
        if fin_needed {
            self.tcp_send_fin_ack(tuple);
        }
        if let Some(sock) = self.table.get_mut(tuple).and_then(|conn| conn.sock.take()) {
            self.detach_socket(sock);
        }
    }

    /// FIN+ACK toward the client; the FIN consumes one sequence number.
    fn tcp_send_fin_ack(&mut self, tuple: &FiveTuple) {
        let (seq, ack) = {
            let Some(conn) = self.table.get_mut(tuple) else {
                return;
            };
            let seq = conn.tcp.tunnel_seq;
            conn.tcp.tunnel_seq = conn.tcp.tunnel_seq.wrapping_add(1);
            conn.tcp.fin_ack_sent = true;
            (seq, conn.tcp.client_seq)
        };
        let len = reply::fill_tcp_frame(
            &mut self.reply_buf[..],
            tuple,
            TcpFlags::FIN | TcpFlags::ACK,
            seq,
            ack,
            self.max_window_size,
            0,
        );
        let _ = self.emit_reply(tuple, len);
    }

    /// Push queued server bytes into whatever window the client has
    /// opened. A full drain re-arms the server socket for reading.
    pub(super) fn tcp_drain_pending(&mut self, tuple: &FiveTuple) {
        let (to_send, seq, ack) = {
            let Some(conn) = self.table.get_mut(tuple) else {
                return;
            };
            if conn.tcp.window_size == 0 || conn.sock.is_none() {
                return;
            }
            let Some(pending) = conn.tcp.pending.as_ref() else {
                return;
            };
            let remaining = pending.data.len() - pending.sofar;
            let to_send = remaining.min(conn.tcp.window_size as usize);
            logger::breadcrumb(
                BreadcrumbFlags::WINDOW,
                format!("sending {to_send}/{remaining} pending bytes on {tuple}"),
            );
            self.reply_buf[TCP_PAYLOAD_OFFSET..TCP_PAYLOAD_OFFSET + to_send]
                .copy_from_slice(&pending.data[pending.sofar..pending.sofar + to_send]);
            let seq = conn.tcp.tunnel_seq;
            conn.tcp.tunnel_seq = conn.tcp.tunnel_seq.wrapping_add(to_send as u32);
            conn.tcp.window_size -= to_send as u32;
            (to_send, seq, conn.tcp.client_seq)
        };

        let len = reply::fill_tcp_frame(
            &mut self.reply_buf[..],
            tuple,
            TcpFlags::PSH | TcpFlags::ACK,
            seq,
            ack,
            self.max_window_size,
            to_send,
        );
        let _ = self.emit_reply(tuple, len);

        let fd = {
            let Some(conn) = self.table.get_mut(tuple) else {
                return;
            };
            if conn.status == ConnStatus::Closed {
                return;
            }
            let Some(pending) = conn.tcp.pending.as_mut() else {
                return;
            };
            pending.sofar += to_send;
            if pending.sofar < pending.data.len() {
                return;
            }
            conn.tcp.pending = None;
            conn.sock.as_ref().map(|sock| sock.as_raw_fd())
        };
        // fully drained: the server socket becomes selectable again
        if let Some(fd) = fd {
            self.all_fds.insert(fd);
        }
    }
}
