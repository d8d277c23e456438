//! ICMP echo forwarding over the shared raw socket.

use super::checksum;
use super::conn::ConnStatus;
use super::reply;
use super::sock;
use super::{unix_now, ForwardError, NatEngine};
use crate::host::HostCallbacks;
use crate::logger::{self, BreadcrumbFlags};
use crate::packet::{
    FiveTuple, Pkt, Proto, Transport, ICMP_ECHO, ICMP_ECHO_REPLY, ICMP_HEADER_LEN, IP_HEADER_LEN,
};
use std::io::Read;
use std::net::{Ipv4Addr, SocketAddrV4};

impl<H: HostCallbacks> NatEngine<H> {
    /// Forward one echo request on the shared raw socket. An echo-id
    /// collision with a ping originated by the host itself is possible and
    /// ignored.
    pub(super) fn icmp_forward(
        &mut self,
        pkt: &Pkt<'_>,
        tuple: &FiveTuple,
    ) -> Result<(), ForwardError> {
        if self.icmp_socket.is_none() {
            return Err(ForwardError::IcmpDisabled);
        }

        let was_new = {
            let Some(conn) = self.table.get_mut(tuple) else {
                return Ok(());
            };
            let was_new = conn.status == ConnStatus::New;
            if was_new {
                conn.status = ConnStatus::Connected;
            }
            if let Transport::Icmp(hdr) = pkt.transport {
                conn.icmp.echo_id = hdr.echo_id;
                conn.icmp.echo_seq = hdr.echo_seq;
            }
            was_new
        };
        if was_new {
            self.num_icmp_opened += 1;
        }
        self.account_inbound(pkt, tuple);

        let dest = {
            let Some(conn) = self.table.get(tuple) else {
                return Ok(());
            };
            let ip = conn.dnat.map(|addr| *addr.ip()).unwrap_or(tuple.dst_ip);
            SocketAddrV4::new(ip, 0)
        };
        // the raw socket wants the ICMP message only; the kernel prepends
        // the IP header
        let message = &pkt.buf[pkt.ip_hdr_len..];
        let Some(icmp) = self.icmp_socket.as_ref() else {
            return Err(ForwardError::IcmpDisabled);
        };
        if let Err(err) = icmp.send_to(message, &sock::to_sockaddr(dest)) {
            logger::error(format!("ICMP send to {} failed: {err}", dest.ip()));
            return Err(ForwardError::Socket(err));
        }
        Ok(())
    }

    /// The shared raw socket is readable: pull one whole IPv4+ICMP frame
    /// and demultiplex it.
    pub(super) fn icmp_reply(&mut self) {
        let read_result = {
            let Some(sock) = self.icmp_socket.as_mut() else {
                return;
            };
            sock.read(&mut self.reply_buf[..])
        };
        match read_result {
            Err(err) => logger::error(format!("error reading ICMP reply: {err}")),
            Ok(n) => self.process_icmp_frame(n),
        }
    }

    /// Route one raw frame sitting at the start of the reply buffer back
    /// to the flow it answers, then re-emit it toward the client.
    pub(super) fn process_icmp_frame(&mut self, frame_len: usize) {
        if frame_len < IP_HEADER_LEN {
            logger::error(format!("short ICMP frame ({frame_len} bytes)"));
            return;
        }
        let ip_hdr_len = usize::from(self.reply_buf[0] & 0x0f) * 4;
        if ip_hdr_len < IP_HEADER_LEN || frame_len < ip_hdr_len + ICMP_HEADER_LEN {
            logger::error(format!("ICMP frame too small ({frame_len} bytes)"));
            return;
        }
        let kind = self.reply_buf[ip_hdr_len];
        if kind != ICMP_ECHO && kind != ICMP_ECHO_REPLY {
            logger::breadcrumb(
                BreadcrumbFlags::PACKET,
                format!("discarding unsupported ICMP type {kind}"),
            );
            return;
        }
        let src_ip = Ipv4Addr::new(
            self.reply_buf[12],
            self.reply_buf[13],
            self.reply_buf[14],
            self.reply_buf[15],
        );
        let echo_id = u16::from_be_bytes([
            self.reply_buf[ip_hdr_len + 4],
            self.reply_buf[ip_hdr_len + 5],
        ]);

        // the reply's destination is one of the pivot's own addresses, so
        // there is no reverse index to consult; scan instead (ICMP flow
        // counts stay small)
        let tuple = self.table.keys().find_map(|tuple| {
            (tuple.proto == Proto::Icmp && tuple.dst_ip == src_ip && tuple.src_port == echo_id)
                .then_some(*tuple)
        });
        let Some(tuple) = tuple else {
            logger::breadcrumb(
                BreadcrumbFlags::PACKET,
                format!("no flow for ICMP reply from {src_ip} (id {echo_id})"),
            );
            return;
        };

        if let Some(conn) = self.table.get_mut(&tuple) {
            conn.tstamp = unix_now();
            conn.icmp.echo_seq = 0;
        }

        // the kernel may have rewritten echo fields; recompute before
        // proxying the frame onward
        self.reply_buf[ip_hdr_len + 2..ip_hdr_len + 4].fill(0);
        let sum = checksum::icmp(&self.reply_buf[ip_hdr_len..frame_len]);
        self.reply_buf[ip_hdr_len + 2..ip_hdr_len + 4].copy_from_slice(&sum.to_be_bytes());

        reply::fill_ipv4_header(
            &mut self.reply_buf[..],
            frame_len as u16,
            1,
            tuple.dst_ip,
            tuple.src_ip,
        );
        let _ = self.emit_reply(&tuple, frame_len);
    }
}
