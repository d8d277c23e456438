use super::conn::{ConnStatus, TUNNEL_ISN};
use super::{checksum, poll, unix_now, Conn, EngineConfig, ForwardError, NatEngine};
use crate::host::{HostCallbacks, PacketDirection};
use crate::packet::{
    self, FiveTuple, Proto, TcpFlags, ICMP_ECHO, ICMP_ECHO_REPLY, ICMP_HEADER_LEN, IP_HEADER_LEN,
    MIN_TCP_HEADER_LEN, UDP_HEADER_LEN,
};
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, UdpSocket};
use std::ops::ControlFlow;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const CLIENT_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 2);

#[derive(Default)]
struct TestHost {
    sent: Vec<Vec<u8>>,
    accounted: Vec<(PacketDirection, usize)>,
    opens: usize,
    closes: usize,
    socket_opens: usize,
    socket_closes: usize,
    reject: bool,
    dnat_to: Option<SocketAddrV4>,
    fail_send: bool,
}

impl HostCallbacks for TestHost {
    fn send_client(&mut self, frame: &[u8], _conn: &Conn) -> io::Result<()> {
        if self.fail_send {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "client sink failed"));
        }
        self.sent.push(frame.to_vec());
        Ok(())
    }

    fn account_packet(&mut self, frame: &[u8], direction: PacketDirection, _conn: &Conn) {
        self.accounted.push((direction, frame.len()));
    }

    fn on_connection_open(&mut self, conn: &mut Conn) -> bool {
        if self.reject {
            return false;
        }
        if let Some(addr) = self.dnat_to {
            conn.set_dnat(addr);
        }
        self.opens += 1;
        true
    }

    fn on_connection_close(&mut self, _conn: &mut Conn) {
        self.closes += 1;
    }

    fn on_socket_open(&mut self, _fd: RawFd) {
        self.socket_opens += 1;
    }

    fn on_socket_close(&mut self, _fd: RawFd) {
        self.socket_closes += 1;
    }
}

fn no_icmp_config() -> EngineConfig {
    EngineConfig {
        enable_icmp: false,
        ..EngineConfig::default()
    }
}

fn new_engine() -> NatEngine<TestHost> {
    NatEngine::new(TestHost::default(), no_icmp_config()).expect("engine init")
}

fn local_v4(addr: SocketAddr) -> SocketAddrV4 {
    match addr {
        SocketAddr::V4(v4) => v4,
        SocketAddr::V6(_) => panic!("expected an IPv4 address"),
    }
}

fn fill_ip(buf: &mut [u8], proto: u8, src: Ipv4Addr, dst: Ipv4Addr) {
    let total = buf.len() as u16;
    buf[0] = 0x45;
    buf[2..4].copy_from_slice(&total.to_be_bytes());
    buf[8] = 64;
    buf[9] = proto;
    buf[12..16].copy_from_slice(&src.octets());
    buf[16..20].copy_from_slice(&dst.octets());
    let sum = checksum::ipv4_header(&buf[..IP_HEADER_LEN]);
    buf[10..12].copy_from_slice(&sum.to_be_bytes());
}

fn udp_frame(src: (Ipv4Addr, u16), dst: (Ipv4Addr, u16), payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; IP_HEADER_LEN + UDP_HEADER_LEN + payload.len()];
    buf[IP_HEADER_LEN..IP_HEADER_LEN + 2].copy_from_slice(&src.1.to_be_bytes());
    buf[IP_HEADER_LEN + 2..IP_HEADER_LEN + 4].copy_from_slice(&dst.1.to_be_bytes());
    buf[IP_HEADER_LEN + 4..IP_HEADER_LEN + 6]
        .copy_from_slice(&((UDP_HEADER_LEN + payload.len()) as u16).to_be_bytes());
    buf[IP_HEADER_LEN + UDP_HEADER_LEN..].copy_from_slice(payload);
    fill_ip(&mut buf, 17, src.0, dst.0);
    buf
}

fn tcp_frame(
    src: (Ipv4Addr, u16),
    dst: (Ipv4Addr, u16),
    flags: TcpFlags,
    seq: u32,
    ack: u32,
    window: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut buf = vec![0u8; IP_HEADER_LEN + MIN_TCP_HEADER_LEN + payload.len()];
    {
        let tcp = &mut buf[IP_HEADER_LEN..];
        tcp[0..2].copy_from_slice(&src.1.to_be_bytes());
        tcp[2..4].copy_from_slice(&dst.1.to_be_bytes());
        tcp[4..8].copy_from_slice(&seq.to_be_bytes());
        tcp[8..12].copy_from_slice(&ack.to_be_bytes());
        tcp[12] = 5 << 4;
        tcp[13] = flags.bits();
        tcp[14..16].copy_from_slice(&window.to_be_bytes());
        tcp[MIN_TCP_HEADER_LEN..].copy_from_slice(payload);
    }
    let sum = checksum::tcp_ipv4(src.0, dst.0, &buf[IP_HEADER_LEN..]);
    buf[IP_HEADER_LEN + 16..IP_HEADER_LEN + 18].copy_from_slice(&sum.to_be_bytes());
    fill_ip(&mut buf, 6, src.0, dst.0);
    buf
}

fn icmp_frame(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    kind: u8,
    id: u16,
    seq: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut buf = vec![0u8; IP_HEADER_LEN + ICMP_HEADER_LEN + payload.len()];
    buf[IP_HEADER_LEN] = kind;
    buf[IP_HEADER_LEN + 4..IP_HEADER_LEN + 6].copy_from_slice(&id.to_be_bytes());
    buf[IP_HEADER_LEN + 6..IP_HEADER_LEN + 8].copy_from_slice(&seq.to_be_bytes());
    buf[IP_HEADER_LEN + ICMP_HEADER_LEN..].copy_from_slice(payload);
    let sum = checksum::icmp(&buf[IP_HEADER_LEN..]);
    buf[IP_HEADER_LEN + 2..IP_HEADER_LEN + 4].copy_from_slice(&sum.to_be_bytes());
    fill_ip(&mut buf, 1, src, dst);
    buf
}

fn drive_once(engine: &mut NatEngine<TestHost>) -> usize {
    let (max_fd, mut rd, mut wr) = engine.fds();
    let ready = poll::select(max_fd, &mut rd, &mut wr, Some(Duration::from_millis(50)))
        .expect("select");
    if ready > 0 {
        engine.handle_fd(&rd, &wr)
    } else {
        0
    }
}

fn drive_until<F>(engine: &mut NatEngine<TestHost>, what: &str, mut done: F)
where
    F: FnMut(&NatEngine<TestHost>) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done(engine) {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        drive_once(engine);
    }
}

fn sent_payload_len(engine: &NatEngine<TestHost>) -> usize {
    engine
        .host()
        .sent
        .iter()
        .filter_map(|frame| packet::parse(frame).ok().map(|pkt| pkt.l7.len()))
        .sum()
}

fn sent_payloads(engine: &NatEngine<TestHost>) -> Vec<u8> {
    engine
        .host()
        .sent
        .iter()
        .filter_map(|frame| packet::parse(frame).ok().map(|pkt| pkt.l7.to_vec()))
        .collect::<Vec<_>>()
        .concat()
}

fn tcp_frames_with(engine: &NatEngine<TestHost>, flag: TcpFlags) -> usize {
    engine
        .host()
        .sent
        .iter()
        .filter(|frame| {
            packet::parse(frame)
                .ok()
                .and_then(|pkt| pkt.tcp().map(|hdr| hdr.flags.contains(flag)))
                .unwrap_or(false)
        })
        .count()
}

/// Run the client side of a handshake against a loopback listener and
/// leave the flow established with `client_window` granted.
fn establish_tcp(
    client_window: u16,
) -> (
    NatEngine<TestHost>,
    TcpListener,
    std::net::TcpStream,
    FiveTuple,
) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let server = local_v4(listener.local_addr().expect("listener addr"));
    let client = (CLIENT_IP, 41000);
    let mut engine = new_engine();

    let syn = tcp_frame(
        client,
        (*server.ip(), server.port()),
        TcpFlags::SYN,
        1000,
        0,
        client_window,
        b"",
    );
    let tuple = engine.easy_forward(&syn).expect("SYN admitted");
    drive_until(&mut engine, "SYN+ACK", |e| !e.host().sent.is_empty());

    let (stream, _) = listener.accept().expect("accept");
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .expect("read timeout");

    let ack = tcp_frame(
        client,
        (*server.ip(), server.port()),
        TcpFlags::ACK,
        1001,
        TUNNEL_ISN.wrapping_add(1),
        client_window,
        b"",
    );
    engine.easy_forward(&ack).expect("handshake ACK");
    engine.host_mut().sent.clear();
    (engine, listener, stream, tuple)
}

#[test]
fn udp_flow_proxies_reply_datagrams() {
    let server = UdpSocket::bind("127.0.0.1:0").expect("bind server");
    server
        .set_read_timeout(Some(Duration::from_secs(2)))
        .expect("read timeout");
    let server_addr = local_v4(server.local_addr().expect("server addr"));
    let mut engine = new_engine();

    let frame = udp_frame(
        (CLIENT_IP, 40000),
        (*server_addr.ip(), server_addr.port()),
        b"PING",
    );
    let tuple = engine.easy_forward(&frame).expect("flow admitted");
    assert_eq!(engine.host().opens, 1);
    assert_eq!(engine.host().socket_opens, 1);
    assert_eq!(engine.conn(&tuple).expect("conn").status(), ConnStatus::Connected);

    let mut buf = [0u8; 64];
    let (n, peer) = server.recv_from(&mut buf).expect("server recv");
    assert_eq!(&buf[..n], b"PING");
    server.send_to(b"PONG", peer).expect("server reply");

    drive_until(&mut engine, "proxied reply", |e| !e.host().sent.is_empty());

    assert_eq!(engine.host().sent.len(), 1);
    let reply = engine.host().sent[0].clone();
    assert_eq!(checksum::ones_complement(0, &reply[..IP_HEADER_LEN]), 0);
    let pkt = packet::parse(&reply).expect("reply parses");
    assert_eq!(pkt.tuple.src_ip, *server_addr.ip());
    assert_eq!(pkt.tuple.src_port, server_addr.port());
    assert_eq!(pkt.tuple.dst_ip, CLIENT_IP);
    assert_eq!(pkt.tuple.dst_port, 40000);
    assert_eq!(
        &reply[IP_HEADER_LEN + 4..IP_HEADER_LEN + 6],
        &12u16.to_be_bytes()
    );
    assert_eq!(pkt.l7, b"PONG");

    let directions: Vec<PacketDirection> =
        engine.host().accounted.iter().map(|(dir, _)| *dir).collect();
    assert_eq!(
        directions,
        vec![
            PacketDirection::ClientToNetwork,
            PacketDirection::NetworkToClient
        ]
    );
}

#[test]
fn tcp_syn_is_answered_with_the_fixed_isn() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let server = local_v4(listener.local_addr().expect("listener addr"));
    let mut engine = new_engine();

    let syn = tcp_frame(
        (CLIENT_IP, 41000),
        (*server.ip(), server.port()),
        TcpFlags::SYN,
        1000,
        0,
        65535,
        b"",
    );
    let tuple = engine.easy_forward(&syn).expect("SYN admitted");
    drive_until(&mut engine, "SYN+ACK", |e| !e.host().sent.is_empty());

    let pkt_buf = engine.host().sent[0].clone();
    let pkt = packet::parse(&pkt_buf).expect("SYN+ACK parses");
    let hdr = pkt.tcp().expect("tcp header");
    assert_eq!(hdr.flags, TcpFlags::SYN | TcpFlags::ACK);
    assert_eq!(hdr.seq, 0x77EB_77EB);
    assert_eq!(hdr.ack, 1001);
    assert_eq!(hdr.window, 64240);
    assert_eq!(pkt.tuple.src_port, server.port());
    assert_eq!(pkt.tuple.dst_port, 41000);

    let conn = engine.conn(&tuple).expect("conn");
    assert_eq!(conn.status(), ConnStatus::Connected);
    assert_eq!(conn.tcp.tunnel_seq, 0x77EB_77EC);
    assert_eq!(engine.stats().num_tcp_opened, 1);

    let _ = listener.accept().expect("accept");
}

#[test]
fn server_data_respects_the_client_window_and_drains_on_ack() {
    let (mut engine, _listener, mut stream, tuple) = establish_tcp(100);
    assert_eq!(engine.conn(&tuple).expect("conn").tcp.window_size, 100);

    let data: Vec<u8> = (0..250u32).map(|i| (i % 251) as u8).collect();
    stream.write_all(&data).expect("server write");

    drive_until(&mut engine, "first window of data", |e| {
        sent_payload_len(e) == 100
            && e.conn(&tuple).map_or(false, |conn| conn.tcp.pending.is_some())
    });
    {
        let conn = engine.conn(&tuple).expect("conn");
        assert_eq!(conn.tcp.window_size, 0);
        let fd = conn.sock.as_ref().expect("socket").as_raw_fd();
        let (_, rd, _) = engine.fds();
        assert!(!rd.contains(fd), "server reads pause while data is pending");
    }

    // the client acknowledges the first 100 bytes and grants 200 more
    let client = (tuple.src_ip, tuple.src_port);
    let server = (tuple.dst_ip, tuple.dst_port);
    let ack = tcp_frame(
        client,
        server,
        TcpFlags::ACK,
        1001,
        TUNNEL_ISN.wrapping_add(101),
        200,
        b"",
    );
    engine.easy_forward(&ack).expect("window update");
    drive_until(&mut engine, "pending drain", |e| sent_payload_len(e) == 250);

    let conn = engine.conn(&tuple).expect("conn");
    assert!(conn.tcp.pending.is_none());
    assert_eq!(conn.tcp.window_size, 50);
    assert_eq!(conn.tcp.tunnel_seq, TUNNEL_ISN.wrapping_add(251));
    let fd = conn.sock.as_ref().expect("socket").as_raw_fd();
    let (_, rd, _) = engine.fds();
    assert!(rd.contains(fd), "a full drain re-arms the server socket");

    // bytes arrive in order no matter how the window moved
    assert_eq!(sent_payloads(&engine), data);
}

#[test]
fn dns_response_closes_the_udp_flow() {
    let resolver = UdpSocket::bind("127.0.0.1:0").expect("bind resolver");
    resolver
        .set_read_timeout(Some(Duration::from_secs(2)))
        .expect("read timeout");
    let host = TestHost {
        dnat_to: Some(local_v4(resolver.local_addr().expect("resolver addr"))),
        ..TestHost::default()
    };
    let mut engine = NatEngine::new(host, no_icmp_config()).expect("engine init");

    let mut query = vec![0u8; 17];
    query[0..2].copy_from_slice(&0x1234u16.to_be_bytes());
    query[2..4].copy_from_slice(&0x0100u16.to_be_bytes());
    query[5] = 1;
    let frame = udp_frame((CLIENT_IP, 40000), (Ipv4Addr::new(8, 8, 8, 8), 53), &query);
    let tuple = engine.easy_forward(&frame).expect("query admitted");

    let mut buf = [0u8; 512];
    let (n, peer) = resolver.recv_from(&mut buf).expect("resolver recv");
    assert_eq!(&buf[..n], &query[..]);

    let mut response = query.clone();
    response[2..4].copy_from_slice(&0x8180u16.to_be_bytes());
    resolver.send_to(&response, peer).expect("resolver reply");

    drive_until(&mut engine, "proxied DNS response", |e| !e.host().sent.is_empty());

    let reply = engine.host().sent[0].clone();
    let pkt = packet::parse(&reply).expect("reply parses");
    // the frame is NATted back to the tuple destination, not the DNAT one
    assert_eq!(pkt.tuple.src_ip, Ipv4Addr::new(8, 8, 8, 8));
    assert_eq!(pkt.tuple.src_port, 53);
    assert_eq!(pkt.l7, &response[..]);

    let conn = engine.conn(&tuple).expect("conn");
    assert_eq!(conn.status(), ConnStatus::Closed);
    assert!(conn.sock.is_none());
    assert_eq!(engine.stats().num_open_sockets, 0);
    assert_eq!(engine.host().sent.len(), 1, "no RST for a UDP close");
    assert_eq!(engine.host().closes, 1);

    // destruction is deferred to the purge pass
    assert_eq!(engine.num_connections(), 1);
    engine.purge_expired(unix_now());
    assert_eq!(engine.num_connections(), 0);
}

#[test]
fn server_eof_emits_fin_ack_and_detaches_the_socket() {
    let (mut engine, _listener, stream, tuple) = establish_tcp(65000);
    drop(stream);

    drive_until(&mut engine, "FIN toward the client", |e| !e.host().sent.is_empty());

    let fin_buf = engine.host().sent[0].clone();
    let hdr = *packet::parse(&fin_buf).expect("FIN parses").tcp().expect("tcp header");
    assert!(hdr.flags.contains(TcpFlags::FIN | TcpFlags::ACK));
    assert_eq!(hdr.seq, TUNNEL_ISN.wrapping_add(1));

    {
        let conn = engine.conn(&tuple).expect("conn");
        assert_eq!(conn.tcp.tunnel_seq, TUNNEL_ISN.wrapping_add(2));
        assert!(conn.tcp.fin_ack_sent);
        assert!(conn.sock.is_none());
        assert_eq!(conn.status(), ConnStatus::Connected);
    }
    assert_eq!(engine.stats().num_open_sockets, 0);

    // the client's final ACK is still consumed quietly
    let client = (tuple.src_ip, tuple.src_port);
    let server = (tuple.dst_ip, tuple.dst_port);
    let ack = tcp_frame(
        client,
        server,
        TcpFlags::ACK,
        1001,
        TUNNEL_ISN.wrapping_add(2),
        65000,
        b"",
    );
    engine.easy_forward(&ack).expect("final ACK");

    // the idle timeout reaps the flow without a second terminal segment
    engine.purge_expired(unix_now() + 31);
    assert_eq!(engine.num_connections(), 0);
    assert_eq!(tcp_frames_with(&engine, TcpFlags::RST), 0);
    assert_eq!(engine.host().closes, 1);
}

#[test]
fn socket_pressure_evicts_the_least_recently_active_flow() {
    let server = UdpSocket::bind("127.0.0.1:0").expect("bind server");
    let server_addr = local_v4(server.local_addr().expect("server addr"));
    let mut config = no_icmp_config();
    config.max_open_sockets = 4;
    config.purge_target = 3;
    let mut engine = NatEngine::new(TestHost::default(), config).expect("engine init");

    let now = unix_now();
    let mut tuples = Vec::new();
    for i in 0..4u16 {
        let frame = udp_frame(
            (CLIENT_IP, 40000 + i),
            (*server_addr.ip(), server_addr.port()),
            b"x",
        );
        let tuple = engine.easy_forward(&frame).expect("flow admitted");
        // distinct ages, none old enough to idle out
        engine.conn_mut(&tuple).expect("conn").tstamp = now - 10 + u64::from(i);
        tuples.push(tuple);
    }
    assert_eq!(engine.stats().num_open_sockets, 4);

    let frame = udp_frame(
        (CLIENT_IP, 40100),
        (*server_addr.ip(), server_addr.port()),
        b"x",
    );
    let newest = engine.easy_forward(&frame).expect("admitted after purge");

    assert!(engine.conn(&tuples[0]).is_none(), "LRU flow must be evicted");
    for tuple in &tuples[1..] {
        assert!(engine.conn(tuple).is_some());
    }
    assert!(engine.conn(&newest).is_some());
    assert_eq!(engine.stats().num_open_sockets, 4);
    assert_eq!(engine.num_connections(), 4);
}

#[test]
fn close_is_idempotent_and_the_rst_is_emitted_once() {
    let (mut engine, _listener, _stream, tuple) = establish_tcp(65000);

    engine.close_conn(&tuple);
    assert_eq!(engine.conn(&tuple).expect("conn").status(), ConnStatus::Closed);
    assert_eq!(tcp_frames_with(&engine, TcpFlags::RST), 1);
    assert_eq!(engine.host().closes, 1);
    assert_eq!(engine.host().socket_closes, 1);

    engine.close_conn(&tuple);
    assert_eq!(tcp_frames_with(&engine, TcpFlags::RST), 1);
    assert_eq!(engine.host().closes, 1);

    // forwarding into a closed flow is a quiet no-op
    let client = (tuple.src_ip, tuple.src_port);
    let server = (tuple.dst_ip, tuple.dst_port);
    let data = tcp_frame(
        client,
        server,
        TcpFlags::PSH | TcpFlags::ACK,
        1001,
        TUNNEL_ISN.wrapping_add(1),
        65000,
        b"x",
    );
    let pkt = packet::parse(&data).expect("parse");
    engine.forward(&pkt, &tuple).expect("closed flow forward");
}

#[test]
fn host_can_reject_admission() {
    let host = TestHost {
        reject: true,
        ..TestHost::default()
    };
    let mut engine = NatEngine::new(host, no_icmp_config()).expect("engine init");
    let frame = udp_frame((CLIENT_IP, 40000), (Ipv4Addr::new(1, 1, 1, 1), 9999), b"x");
    assert!(engine.easy_forward(&frame).is_none());
    assert_eq!(engine.num_connections(), 0);
    assert_eq!(engine.stats().num_open_sockets, 0);
    assert_eq!(engine.host().closes, 0);
}

#[test]
fn easy_forward_drops_non_syn_packets_for_unknown_flows() {
    let mut engine = new_engine();
    let dst = (Ipv4Addr::new(1, 1, 1, 1), 443);
    let ack = tcp_frame((CLIENT_IP, 41000), dst, TcpFlags::ACK, 5, 6, 1000, b"");
    assert!(engine.easy_forward(&ack).is_none());
    let syn_ack = tcp_frame(
        (CLIENT_IP, 41000),
        dst,
        TcpFlags::SYN | TcpFlags::ACK,
        5,
        6,
        1000,
        b"",
    );
    assert!(engine.easy_forward(&syn_ack).is_none());
    assert_eq!(engine.num_connections(), 0);
}

#[test]
fn send_client_failure_closes_the_flow() {
    let server = UdpSocket::bind("127.0.0.1:0").expect("bind server");
    server
        .set_read_timeout(Some(Duration::from_secs(2)))
        .expect("read timeout");
    let server_addr = local_v4(server.local_addr().expect("server addr"));
    let mut engine = new_engine();
    engine.host_mut().fail_send = true;

    let frame = udp_frame(
        (CLIENT_IP, 40001),
        (*server_addr.ip(), server_addr.port()),
        b"hi",
    );
    let tuple = engine.easy_forward(&frame).expect("flow admitted");

    let mut buf = [0u8; 16];
    let (_, peer) = server.recv_from(&mut buf).expect("server recv");
    server.send_to(b"yo", peer).expect("server reply");

    drive_until(&mut engine, "flow closed after send failure", |e| {
        e.conn(&tuple)
            .map_or(false, |conn| conn.status() == ConnStatus::Closed)
    });
    assert!(engine.host().sent.is_empty());
    assert_eq!(engine.host().socket_closes, 1);
}

#[test]
fn icmp_replies_demux_by_destination_and_echo_id() {
    let mut engine = new_engine();
    let target = Ipv4Addr::new(9, 9, 9, 9);
    let tuple = FiveTuple {
        src_ip: CLIENT_IP,
        src_port: 0x0042,
        dst_ip: target,
        dst_port: 0,
        proto: Proto::Icmp,
    };
    engine.lookup(&tuple, true).expect("icmp flow");
    {
        let conn = engine.conn_mut(&tuple).expect("conn");
        conn.status = ConnStatus::Connected;
        conn.icmp.echo_id = 0x0042;
        conn.icmp.echo_seq = 3;
        conn.tstamp = 0;
    }

    // a raw frame as the kernel would deliver it: addressed to the pivot
    let frame = icmp_frame(
        target,
        Ipv4Addr::new(172, 16, 0, 1),
        ICMP_ECHO_REPLY,
        0x0042,
        3,
        b"abcdefgh",
    );
    engine.reply_buf[..frame.len()].copy_from_slice(&frame);
    engine.process_icmp_frame(frame.len());

    assert_eq!(engine.host().sent.len(), 1);
    let reply = engine.host().sent[0].clone();
    let pkt = packet::parse(&reply).expect("reply parses");
    assert_eq!(pkt.tuple.src_ip, target);
    assert_eq!(pkt.tuple.dst_ip, CLIENT_IP);
    assert_eq!(checksum::ones_complement(0, &reply[..IP_HEADER_LEN]), 0);
    assert_eq!(checksum::ones_complement(0, &reply[IP_HEADER_LEN..]), 0);
    let conn = engine.conn(&tuple).expect("conn");
    assert_eq!(conn.icmp.echo_seq, 0);
    assert!(conn.tstamp > 0);

    // an unknown echo id is dropped
    engine.host_mut().sent.clear();
    let stray = icmp_frame(
        target,
        Ipv4Addr::new(172, 16, 0, 1),
        ICMP_ECHO_REPLY,
        0x0099,
        1,
        b"",
    );
    engine.reply_buf[..stray.len()].copy_from_slice(&stray);
    engine.process_icmp_frame(stray.len());
    assert!(engine.host().sent.is_empty());
}

#[test]
fn icmp_forwarding_requires_the_raw_socket() {
    let mut engine = new_engine();
    let frame = icmp_frame(CLIENT_IP, Ipv4Addr::new(9, 9, 9, 9), ICMP_ECHO, 7, 1, b"ping");
    let pkt = packet::parse(&frame).expect("parse");
    engine.lookup(&pkt.tuple, true).expect("flow");
    assert!(matches!(
        engine.forward(&pkt, &pkt.tuple),
        Err(ForwardError::IcmpDisabled)
    ));
}

#[test]
fn purge_reaps_idle_and_closed_flows() {
    let server = UdpSocket::bind("127.0.0.1:0").expect("bind server");
    let server_addr = local_v4(server.local_addr().expect("server addr"));
    let mut engine = new_engine();
    let dst = (*server_addr.ip(), server_addr.port());

    let fresh = engine
        .easy_forward(&udp_frame((CLIENT_IP, 40000), dst, b"a"))
        .expect("fresh flow");
    let idle = engine
        .easy_forward(&udp_frame((CLIENT_IP, 40001), dst, b"b"))
        .expect("idle flow");
    let now = unix_now();
    // one second past the 15s UDP idle timeout
    engine.conn_mut(&idle).expect("conn").tstamp = now - 16;

    engine.purge_expired(now);
    assert!(engine.conn(&idle).is_none());
    assert!(engine.conn(&fresh).is_some());
    assert_eq!(engine.num_connections(), 1);

    engine.close_conn(&fresh);
    engine.purge_expired(now);
    assert_eq!(engine.num_connections(), 0);
    assert_eq!(engine.stats().num_open_sockets, 0);
}

#[test]
fn stats_track_active_flows_and_lifetime_totals() {
    let server = UdpSocket::bind("127.0.0.1:0").expect("bind server");
    let server_addr = local_v4(server.local_addr().expect("server addr"));
    let mut engine = new_engine();
    let dst = (*server_addr.ip(), server_addr.port());

    let first = engine
        .easy_forward(&udp_frame((CLIENT_IP, 40000), dst, b"a"))
        .expect("first flow");
    let second = engine
        .easy_forward(&udp_frame((CLIENT_IP, 40001), dst, b"b"))
        .expect("second flow");
    engine.conn_mut(&first).expect("conn").tstamp = 200;
    engine.conn_mut(&second).expect("conn").tstamp = 100;

    let stats = engine.stats();
    assert_eq!(stats.num_udp_conn, 2);
    assert_eq!(stats.num_udp_opened, 2);
    assert_eq!(stats.oldest_udp_conn, 100);
    assert_eq!(stats.num_tcp_conn, 0);
    assert_eq!(stats.oldest_tcp_conn, 0);
    assert_eq!(stats.num_open_sockets, 2);
}

#[test]
fn iteration_skips_closed_flows_and_can_abort() {
    let server = UdpSocket::bind("127.0.0.1:0").expect("bind server");
    let server_addr = local_v4(server.local_addr().expect("server addr"));
    let mut engine = new_engine();
    let dst = (*server_addr.ip(), server_addr.port());

    let kept = engine
        .easy_forward(&udp_frame((CLIENT_IP, 40000), dst, b"a"))
        .expect("kept flow");
    let closed = engine
        .easy_forward(&udp_frame((CLIENT_IP, 40001), dst, b"b"))
        .expect("closed flow");
    engine.close_conn(&closed);

    let mut seen = Vec::new();
    let aborted = engine.iter_connections(|conn| {
        seen.push(*conn.tuple());
        ControlFlow::Continue(())
    });
    assert!(!aborted);
    assert_eq!(seen, vec![kept]);

    let aborted = engine.iter_connections(|_conn| ControlFlow::Break(()));
    assert!(aborted);
}

#[test]
fn out_of_band_data_skips_the_client_ack() {
    let (mut engine, _listener, mut stream, tuple) = establish_tcp(65000);
    let client = (tuple.src_ip, tuple.src_port);
    let server = (tuple.dst_ip, tuple.dst_port);

    let oob = tcp_frame(
        client,
        server,
        TcpFlags::PSH | TcpFlags::ACK,
        1001,
        TUNNEL_ISN.wrapping_add(1),
        65000,
        b"oob",
    );
    let pkt = packet::parse(&oob).expect("parse");
    engine.send_oob(&pkt, &tuple).expect("oob forward");

    let mut buf = [0u8; 8];
    let n = stream.read(&mut buf).expect("server read");
    assert_eq!(&buf[..n], b"oob");
    assert!(engine.host().sent.is_empty(), "no ACK for out-of-band data");
    assert_eq!(engine.conn(&tuple).expect("conn").tcp.client_seq, 1001);

    // the regular path acknowledges and advances the client sequence
    let data = tcp_frame(
        client,
        server,
        TcpFlags::PSH | TcpFlags::ACK,
        1001,
        TUNNEL_ISN.wrapping_add(1),
        65000,
        b"more",
    );
    let pkt = packet::parse(&data).expect("parse");
    engine.forward(&pkt, &tuple).expect("regular forward");
    assert_eq!(engine.conn(&tuple).expect("conn").tcp.client_seq, 1005);
    assert_eq!(tcp_frames_with(&engine, TcpFlags::ACK), 1);
}

#[derive(Clone, Default)]
struct CountingHost {
    closes: Arc<Mutex<usize>>,
}

impl HostCallbacks for CountingHost {
    fn send_client(&mut self, _frame: &[u8], _conn: &Conn) -> io::Result<()> {
        Ok(())
    }

    fn on_connection_close(&mut self, _conn: &mut Conn) {
        *self.closes.lock().unwrap() += 1;
    }
}

#[test]
fn finalize_tears_down_every_flow() {
    let server = UdpSocket::bind("127.0.0.1:0").expect("bind server");
    let server_addr = local_v4(server.local_addr().expect("server addr"));
    let host = CountingHost::default();
    let closes = Arc::clone(&host.closes);
    let mut engine = NatEngine::new(host, no_icmp_config()).expect("engine init");
    let dst = (*server_addr.ip(), server_addr.port());

    engine
        .easy_forward(&udp_frame((CLIENT_IP, 40000), dst, b"a"))
        .expect("first flow");
    engine
        .easy_forward(&udp_frame((CLIENT_IP, 40001), dst, b"b"))
        .expect("second flow");

    engine.finalize();
    assert_eq!(*closes.lock().unwrap(), 2);
}
