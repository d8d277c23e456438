//! Synthesis of reply frames toward the client side of the tunnel.
//!
//! All builders write into the engine's shared reply buffer. Payloads are
//! staged past the reserved header area first, then the headers are filled
//! in around them and checksummed.

use super::checksum;
use crate::packet::{FiveTuple, TcpFlags, IP_HEADER_LEN, MIN_TCP_HEADER_LEN, UDP_HEADER_LEN};
use std::net::Ipv4Addr;

/// Where TCP reply payload is staged in the reply buffer.
pub(super) const TCP_PAYLOAD_OFFSET: usize = IP_HEADER_LEN + MIN_TCP_HEADER_LEN;
/// Where UDP reply payload is staged in the reply buffer.
pub(super) const UDP_PAYLOAD_OFFSET: usize = IP_HEADER_LEN + UDP_HEADER_LEN;

/// Write a fresh 20-byte IPv4 header (DF set, TTL 64) at the start of
/// `buf` and checksum it.
pub(super) fn fill_ipv4_header(buf: &mut [u8], tot_len: u16, proto: u8, src: Ipv4Addr, dst: Ipv4Addr) {
    let hdr = &mut buf[..IP_HEADER_LEN];
    hdr.fill(0);
    hdr[0] = 0x45; // version 4, IHL 5
    hdr[2..4].copy_from_slice(&tot_len.to_be_bytes());
    hdr[6..8].copy_from_slice(&0x4000u16.to_be_bytes()); // don't fragment
    hdr[8] = 64; // TTL
    hdr[9] = proto;
    hdr[12..16].copy_from_slice(&src.octets());
    hdr[16..20].copy_from_slice(&dst.octets());

    let sum = checksum::ipv4_header(hdr);
    hdr[10..12].copy_from_slice(&sum.to_be_bytes());
}

/// Build a TCP segment toward the client, swapping the tuple direction.
/// `payload_len` bytes must already sit at [`TCP_PAYLOAD_OFFSET`]. The ack
/// field is populated only when the ACK flag is set. Returns the total
/// frame length.
pub(super) fn fill_tcp_frame(
    buf: &mut [u8],
    tuple: &FiveTuple,
    flags: TcpFlags,
    seq: u32,
    ack: u32,
    window: u16,
    payload_len: usize,
) -> usize {
    let l3_len = MIN_TCP_HEADER_LEN + payload_len;
    {
        let tcp = &mut buf[IP_HEADER_LEN..IP_HEADER_LEN + MIN_TCP_HEADER_LEN];
        tcp.fill(0);
        tcp[0..2].copy_from_slice(&tuple.dst_port.to_be_bytes());
        tcp[2..4].copy_from_slice(&tuple.src_port.to_be_bytes());
        tcp[4..8].copy_from_slice(&seq.to_be_bytes());
        let ack_field = if flags.contains(TcpFlags::ACK) { ack } else { 0 };
        tcp[8..12].copy_from_slice(&ack_field.to_be_bytes());
        tcp[12] = 5 << 4; // data offset, no options
        tcp[13] = flags.bits();
        tcp[14..16].copy_from_slice(&window.to_be_bytes());
    }

    let sum = checksum::tcp_ipv4(
        tuple.dst_ip,
        tuple.src_ip,
        &buf[IP_HEADER_LEN..IP_HEADER_LEN + l3_len],
    );
    buf[IP_HEADER_LEN + 16..IP_HEADER_LEN + 18].copy_from_slice(&sum.to_be_bytes());

    fill_ipv4_header(
        buf,
        (IP_HEADER_LEN + l3_len) as u16,
        6,
        tuple.dst_ip,
        tuple.src_ip,
    );
    IP_HEADER_LEN + l3_len
}

/// Build a UDP datagram toward the client. `payload_len` bytes must
/// already sit at [`UDP_PAYLOAD_OFFSET`]. The UDP checksum is elided
/// (legal for IPv4). Returns the total frame length.
pub(super) fn fill_udp_frame(buf: &mut [u8], tuple: &FiveTuple, payload_len: usize) -> usize {
    let l3_len = UDP_HEADER_LEN + payload_len;
    {
        let udp = &mut buf[IP_HEADER_LEN..IP_HEADER_LEN + UDP_HEADER_LEN];
        udp[0..2].copy_from_slice(&tuple.dst_port.to_be_bytes());
        udp[2..4].copy_from_slice(&tuple.src_port.to_be_bytes());
        udp[4..6].copy_from_slice(&(l3_len as u16).to_be_bytes());
        udp[6..8].copy_from_slice(&0u16.to_be_bytes());
    }

    fill_ipv4_header(
        buf,
        (IP_HEADER_LEN + l3_len) as u16,
        17,
        tuple.dst_ip,
        tuple.src_ip,
    );
    IP_HEADER_LEN + l3_len
}
