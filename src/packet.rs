//! IPv4 packet parsing into flow tuples and transport header views.

use bitflags::bitflags;
use std::fmt;
use std::net::Ipv4Addr;
use thiserror::Error;

pub(crate) const IP_HEADER_LEN: usize = 20;
pub(crate) const MIN_TCP_HEADER_LEN: usize = 20;
pub(crate) const UDP_HEADER_LEN: usize = 8;
pub(crate) const ICMP_HEADER_LEN: usize = 8;

pub(crate) const ICMP_ECHO_REPLY: u8 = 0;
pub(crate) const ICMP_ECHO: u8 = 8;

/// Transport protocols the engine understands.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Proto {
    Tcp,
    Udp,
    Icmp,
}

impl Proto {
    /// The IANA protocol number carried in the IPv4 header.
    pub fn number(self) -> u8 {
        match self {
            Proto::Tcp => 6,
            Proto::Udp => 17,
            Proto::Icmp => 1,
        }
    }
}

bitflags! {
    /// TCP header flag bits, as they appear on the wire.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

/// Conversation key for the flow table. For TCP and UDP the port slots
/// carry ports; for ICMP echo they carry `(echo_id, 0)` so the key names
/// the conversation rather than each individual ping.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FiveTuple {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: Proto,
}

impl fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {}:{} -> {}:{}",
            self.proto, self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

#[derive(Clone, Copy, Debug)]
pub struct TcpHeader {
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
}

#[derive(Clone, Copy, Debug)]
pub struct IcmpHeader {
    pub kind: u8,
    pub code: u8,
    pub echo_id: u16,
    pub echo_seq: u16,
}

/// Transport-specific view of a parsed packet.
#[derive(Clone, Copy, Debug)]
pub enum Transport {
    Tcp(TcpHeader),
    Udp,
    Icmp(IcmpHeader),
}

/// Parsed view over one inbound IPv4 datagram. Borrows the input buffer.
#[derive(Debug)]
pub struct Pkt<'a> {
    /// The whole frame, IPv4 header included.
    pub buf: &'a [u8],
    pub tuple: FiveTuple,
    pub ip_hdr_len: usize,
    pub l4_hdr_len: usize,
    pub transport: Transport,
    /// Application payload past the transport header.
    pub l7: &'a [u8],
}

impl<'a> Pkt<'a> {
    pub fn tcp(&self) -> Option<&TcpHeader> {
        match &self.transport {
            Transport::Tcp(hdr) => Some(hdr),
            _ => None,
        }
    }

    pub fn icmp(&self) -> Option<&IcmpHeader> {
        match &self.transport {
            Transport::Icmp(hdr) => Some(hdr),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// Truncated, non-IPv4, or otherwise structurally invalid.
    #[error("malformed or non-IPv4 packet")]
    Malformed,
    /// Valid ICMP, but not an echo request or reply.
    #[error("unsupported ICMP type {0}")]
    UnsupportedIcmp(u8),
    #[error("unknown IP protocol {0}")]
    UnknownProtocol(u8),
}

/// Parse one raw IPv4 datagram into a [`Pkt`] view.
pub fn parse(buf: &[u8]) -> Result<Pkt<'_>, ParseError> {
    if buf.len() < IP_HEADER_LEN || buf[0] >> 4 != 4 {
        return Err(ParseError::Malformed);
    }
    let ip_hdr_len = usize::from(buf[0] & 0x0f) * 4;
    if ip_hdr_len < IP_HEADER_LEN || buf.len() < ip_hdr_len {
        return Err(ParseError::Malformed);
    }

    let src_ip = Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]);
    let dst_ip = Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]);
    let l4 = &buf[ip_hdr_len..];

    let (proto, src_port, dst_port, l4_hdr_len, transport) = match buf[9] {
        6 => {
            if l4.len() < MIN_TCP_HEADER_LEN {
                return Err(ParseError::Malformed);
            }
            let l4_hdr_len = usize::from(l4[12] >> 4) * 4;
            if l4_hdr_len < MIN_TCP_HEADER_LEN || l4.len() < l4_hdr_len {
                return Err(ParseError::Malformed);
            }
            let hdr = TcpHeader {
                seq: u32::from_be_bytes([l4[4], l4[5], l4[6], l4[7]]),
                ack: u32::from_be_bytes([l4[8], l4[9], l4[10], l4[11]]),
                flags: TcpFlags::from_bits_truncate(l4[13]),
                window: u16::from_be_bytes([l4[14], l4[15]]),
            };
            (
                Proto::Tcp,
                u16::from_be_bytes([l4[0], l4[1]]),
                u16::from_be_bytes([l4[2], l4[3]]),
                l4_hdr_len,
                Transport::Tcp(hdr),
            )
        }
        17 => {
            if l4.len() < UDP_HEADER_LEN {
                return Err(ParseError::Malformed);
            }
            (
                Proto::Udp,
                u16::from_be_bytes([l4[0], l4[1]]),
                u16::from_be_bytes([l4[2], l4[3]]),
                UDP_HEADER_LEN,
                Transport::Udp,
            )
        }
        1 => {
            if l4.len() < ICMP_HEADER_LEN {
                return Err(ParseError::Malformed);
            }
            let kind = l4[0];
            if kind != ICMP_ECHO && kind != ICMP_ECHO_REPLY {
                return Err(ParseError::UnsupportedIcmp(kind));
            }
            let hdr = IcmpHeader {
                kind,
                code: l4[1],
                echo_id: u16::from_be_bytes([l4[4], l4[5]]),
                echo_seq: u16::from_be_bytes([l4[6], l4[7]]),
            };
            // echo_seq stays out of the tuple: the key names the
            // conversation, not each individual ping
            (Proto::Icmp, hdr.echo_id, 0, ICMP_HEADER_LEN, Transport::Icmp(hdr))
        }
        other => return Err(ParseError::UnknownProtocol(other)),
    };

    Ok(Pkt {
        buf,
        tuple: FiveTuple {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            proto,
        },
        ip_hdr_len,
        l4_hdr_len,
        transport,
        l7: &buf[ip_hdr_len + l4_hdr_len..],
    })
}
