//! Integration tests for the stream/datagram transport.
//!
//! Both ends run on loopback in the test task; events are collected through
//! a recording [`SocketOwner`] and drained with `dispatch`.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use reliable_udp::context::Context;
use reliable_udp::socket::{Protocol, Socket, SocketOwner};

// ---------------------------------------------------------------------------
// Helper
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Events {
    accepted: Vec<SocketAddr>,
    connected: Vec<SocketAddr>,
    disconnected: Vec<Option<SocketAddr>>,
    tcp: Vec<u8>,
    udp: Vec<(Vec<u8>, SocketAddr)>,
    /// Reply to every datagram with its reversed bytes.
    reverse_udp: bool,
}

impl SocketOwner for Events {
    fn accepted(&mut self, _socket: &mut Socket, peer: SocketAddr) {
        self.accepted.push(peer);
    }

    fn connected(&mut self, _socket: &mut Socket, peer: SocketAddr) {
        self.connected.push(peer);
    }

    fn disconnected(&mut self, _socket: &mut Socket, peer: Option<SocketAddr>) {
        self.disconnected.push(peer);
    }

    fn tcp_received(&mut self, _socket: &mut Socket, bytes: &[u8], _from: SocketAddr) {
        self.tcp.extend_from_slice(bytes);
    }

    fn udp_received(&mut self, socket: &mut Socket, bytes: &[u8], from: SocketAddr) {
        if self.reverse_udp {
            let reply: Vec<u8> = bytes.iter().rev().copied().collect();
            socket.send_datagram(&reply, Some(from)).unwrap();
        }
        self.udp.push((bytes.to_vec(), from));
    }
}

/// Dispatch both sockets until `until` holds.  Panics after five seconds.
async fn drive(
    a: (&mut Socket, &mut Events),
    b: (&mut Socket, &mut Events),
    until: impl Fn(&Events, &Events) -> bool,
) {
    let (sa, ea) = a;
    let (sb, eb) = b;
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        sa.dispatch(ea);
        sb.dispatch(eb);
        if until(ea, eb) {
            return;
        }
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tcp_accept_exchange_and_disconnect() {
    let ctx = Context::new();
    let mut server = Socket::new(&ctx);
    let mut server_ev = Events::default();
    server.listen(0, Protocol::Tcp).unwrap();
    let port = server.local_addr().unwrap().port();

    let mut client = Socket::new(&ctx);
    let mut client_ev = Events::default();
    client.connect(loopback(port), Protocol::Tcp).unwrap();

    drive((&mut server, &mut server_ev), (&mut client, &mut client_ev), |s, c| {
        s.accepted.len() == 1 && c.connected.len() == 1
    })
    .await;
    let peer = server_ev.accepted[0];
    assert_eq!(server.accepted_peers(), vec![peer]);
    assert!(client.is_connected());

    client.send_stream(b"hello ", None).unwrap();
    client.send_stream(b"server", None).unwrap();
    server.send_stream(b"hi", Some(peer)).unwrap();
    drive((&mut server, &mut server_ev), (&mut client, &mut client_ev), |s, c| {
        s.tcp == b"hello server" && c.tcp == b"hi"
    })
    .await;

    client.disconnect_stream(None);
    drive((&mut server, &mut server_ev), (&mut client, &mut client_ev), |s, _| {
        s.disconnected == vec![Some(peer)]
    })
    .await;
    assert!(server.accepted_peers().is_empty());
    // Local teardown is not reported back to the owner.
    assert!(client_ev.disconnected.is_empty());
}

#[tokio::test]
async fn tcp_connect_failure_is_a_disconnect() {
    let ctx = Context::new();
    // Grab a free port, then close it again.
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    let mut client = Socket::new(&ctx);
    let mut client_ev = Events::default();
    let mut idle = Socket::new(&ctx);
    let mut idle_ev = Events::default();
    client.connect(loopback(port), Protocol::Tcp).unwrap();

    drive((&mut client, &mut client_ev), (&mut idle, &mut idle_ev), |c, _| {
        !c.disconnected.is_empty()
    })
    .await;
    assert_eq!(client_ev.disconnected, vec![Some(loopback(port))]);
    assert!(client_ev.connected.is_empty());
    assert!(!client.is_connected());
}

#[tokio::test]
async fn udp_datagrams_round_trip() {
    let ctx = Context::new();
    let mut server = Socket::new(&ctx);
    let mut server_ev = Events {
        reverse_udp: true,
        ..Events::default()
    };
    server.listen(0, Protocol::Udp).unwrap();
    let port = server.local_addr().unwrap().port();

    let mut client = Socket::new(&ctx);
    let mut client_ev = Events::default();
    client.connect(loopback(port), Protocol::Udp).unwrap();
    client.send_datagram(b"abc", None).unwrap();

    drive((&mut server, &mut server_ev), (&mut client, &mut client_ev), |_, c| {
        !c.udp.is_empty()
    })
    .await;
    assert_eq!(client_ev.connected, vec![loopback(port)]);
    assert_eq!(server_ev.udp[0].0, b"abc".to_vec());
    assert_eq!(client_ev.udp, vec![(b"cba".to_vec(), loopback(port))]);
}

#[tokio::test]
async fn dropped_sockets_tasks_are_reaped() {
    let ctx = Context::new();
    {
        let mut s = Socket::new(&ctx);
        s.listen(0, Protocol::Tcp).unwrap();
        s.listen(0, Protocol::Udp).unwrap();
    }
    // Accept loop and datagram reader.
    let deadline = Instant::now() + Duration::from_secs(5);
    while ctx.reclaimed() < 2 {
        assert!(Instant::now() < deadline, "tasks not reaped");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
