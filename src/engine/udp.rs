//! UDP forwarding and reply proxying, including the single-shot DNS close.

use super::conn::ConnStatus;
use super::reply::{self, UDP_PAYLOAD_OFFSET};
use super::sock;
use super::{unix_now, ForwardError, NatEngine};
use crate::host::HostCallbacks;
use crate::logger::{self, BreadcrumbFlags};
use crate::packet::{FiveTuple, Pkt};
use std::io::Read;
use std::os::unix::io::AsRawFd;

const DNS_PORT: u16 = 53;
const DNS_HEADER_LEN: usize = 12;
const DNS_RESPONSE_FLAG: u16 = 0x8000;

impl<H: HostCallbacks> NatEngine<H> {
    pub(super) fn udp_forward(
        &mut self,
        pkt: &Pkt<'_>,
        tuple: &FiveTuple,
    ) -> Result<(), ForwardError> {
        let Some(status) = self.table.get(tuple).map(|conn| conn.status) else {
            return Ok(());
        };
        if status == ConnStatus::New {
            logger::breadcrumb(
                BreadcrumbFlags::SOCKET,
                format!("opening UDP socket for {tuple}"),
            );
            let sock = sock::open_udp()?;
            let fd = sock.as_raw_fd();
            self.host.on_socket_open(fd);
            self.all_fds.insert(fd);
            self.max_fd = self.max_fd.max(fd);
            self.num_open_socks += 1;
            self.num_udp_opened += 1;
            if let Some(conn) = self.table.get_mut(tuple) {
                conn.sock = Some(sock);
                conn.status = ConnStatus::Connected;
            }
        }
        self.account_inbound(pkt, tuple);

        let (server, send_result) = {
            let Some(conn) = self.table.get(tuple) else {
                return Ok(());
            };
            let Some(sock) = conn.sock.as_ref() else {
                return Ok(());
            };
            let server = conn.server_addr();
            (server, sock.send_to(pkt.l7, &sock::to_sockaddr(server)))
        };
        if let Err(err) = send_result {
            logger::error(format!("UDP send to {server} failed: {err}"));
            return Err(ForwardError::Socket(err));
        }
        Ok(())
    }

    /// The flow socket is readable: NAT the datagram back toward the
    /// client and apply the DNS single-shot close.
    pub(super) fn udp_reply(&mut self, tuple: &FiveTuple) {
        let read_result = {
            let Some(conn) = self.table.get_mut(tuple) else {
                return;
            };
            let Some(sock) = conn.sock.as_mut() else {
                return;
            };
            sock.read(&mut self.reply_buf[UDP_PAYLOAD_OFFSET..])
        };
        let n = match read_result {
            Err(err) => {
                logger::error(format!("error reading UDP reply on {tuple}: {err}"));
                self.close_conn(tuple);
                return;
            }
            Ok(n) => n,
        };

        let len = reply::fill_udp_frame(&mut self.reply_buf[..], tuple, n);
        let _ = self.emit_reply(tuple, len);

        if let Some(conn) = self.table.get_mut(tuple) {
            conn.tstamp = unix_now();
        }
        self.udp_dns_check(tuple, n);
    }

    /// DNS over UDP is single shot: once the response has been proxied the
    /// flow can go away without waiting for the idle timeout.
    fn udp_dns_check(&mut self, tuple: &FiveTuple, payload_len: usize) {
        if tuple.dst_port != DNS_PORT || payload_len < DNS_HEADER_LEN {
            return;
        }
        let off = UDP_PAYLOAD_OFFSET + 2;
        let flags = u16::from_be_bytes([self.reply_buf[off], self.reply_buf[off + 1]]);
        if flags & DNS_RESPONSE_FLAG != 0 {
            logger::breadcrumb(
                BreadcrumbFlags::FLOW,
                format!("DNS response proxied on {tuple}, closing"),
            );
            self.close_conn(tuple);
        }
    }
}
