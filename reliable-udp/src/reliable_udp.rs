//! Reliable connections over one UDP socket.
//!
//! [`ReliableUdp`] gives stream-socket semantics (listen, connect, accept,
//! disconnect) to a connectionless datagram endpoint and multiplexes any
//! number of peers behind it.
//!
//! ```text
//!   ReliableOwner ◀── connect/accept/read/disconnect events ──┐
//!                                                             │
//!   ReliableUdp ── route by Message kind ──┬── Plain ──▶ raw datagram
//!     │                                    └── Sequenced ──▶ Proxy(peer).gbn
//!     ├── primary: Proxy   (the connected server, or a listener's root)
//!     ├── proxies: SocketAddr ─▶ Proxy   (one per other peer, created lazily)
//!     └── socket:  Socket  ── UdpReceived ──▶ decode ──▶ demux by sender
//! ```
//!
//! # Handshake
//!
//! The initiator sends CONNECT as a plain datagram and repeats it on a timer
//! until CONNECTED comes back, then fires `connect_event` once.  A listener
//! answers every CONNECT with CONNECTED but fires `accept_event` only the
//! first time it hears from a peer.  Sequenced sends made while connecting
//! are held and released when the handshake completes.
//!
//! # Driving a connection
//!
//! Nothing runs in the background on the connection's behalf.  The
//! application calls [`ReliableUdp::dispatch`] or awaits
//! [`ReliableUdp::run_once`] in a loop and passes the [`ReliableOwner`] that
//! should receive events.  Connections created from the same [`Context`]
//! share one scheduler; each handles only its own timers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::time::Instant;

use crate::config::Config;
use crate::context::Context;
use crate::gbn::{GoBackN, Output};
use crate::message::Message;
use crate::packet::{Packet, PacketError, PacketKind, MAX_PAYLOAD};
use crate::proxy::Proxy;
use crate::scheduler::{Expiries, Timer, TimerId};
use crate::socket::{self, Protocol, Socket, SocketError, SocketOwner};
use crate::state::ConnectionState;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConnError {
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error("message rejected: {0}")]
    Packet(#[from] PacketError),
    /// The peer behind an [`Accepted`] handle has been dropped.
    #[error("peer {0} is disconnected")]
    Disconnected(SocketAddr),
    #[error("connection is not listening")]
    NotListening,
}

// ---------------------------------------------------------------------------
// Handles and owner hooks
// ---------------------------------------------------------------------------

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one [`ReliableUdp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

/// A peer accepted by a listener.
///
/// Does not own anything: it names the listener and the peer address, and
/// sends through it go to that listener's proxy for the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Accepted {
    listener: ConnId,
    peer: SocketAddr,
}

impl Accepted {
    pub fn listener(&self) -> ConnId {
        self.listener
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

/// Receiver of connection events.  Every hook defaults to a no-op.
///
/// Hooks run synchronously inside [`ReliableUdp::dispatch`] and may call
/// back into the connection.
pub trait ReliableOwner {
    /// The handshake completed.  Fires once per connection.
    fn connect_event(&mut self, _conn: &mut ReliableUdp) {}
    /// A new peer connected to a listener; [`ReliableUdp::accept`] returns
    /// it until this hook returns.
    fn accept_event(&mut self, _conn: &mut ReliableUdp) {}
    fn read_event(&mut self, _conn: &mut ReliableUdp, _msg: Message, _from: SocketAddr) {}
    /// The whole connection (`None`) or one peer (`Some`) was lost.
    fn disconnect_event(&mut self, _conn: &mut ReliableUdp, _peer: Option<SocketAddr>) {}
}

/// Socket events the connection layer cares about, collected in arrival
/// order.
#[derive(Default)]
struct Inbox {
    datagrams: Vec<(Vec<u8>, SocketAddr)>,
    closed: bool,
}

impl SocketOwner for Inbox {
    fn disconnected(&mut self, _socket: &mut Socket, peer: Option<SocketAddr>) {
        if peer.is_none() {
            self.closed = true;
        }
    }

    fn udp_received(&mut self, _socket: &mut Socket, bytes: &[u8], from: SocketAddr) {
        self.datagrams.push((bytes.to_vec(), from));
    }
}

struct Handshake {
    timer: Timer,
    /// CONNECT transmissions so far.
    attempts: u32,
}

// ---------------------------------------------------------------------------
// ReliableUdp
// ---------------------------------------------------------------------------

pub struct ReliableUdp {
    id: ConnId,
    ctx: Context,
    config: Config,
    socket: Socket,
    state: ConnectionState,
    expiries: Expiries,
    primary: Proxy,
    proxies: HashMap<SocketAddr, Proxy>,
    pending_accept: Option<Accepted>,
    handshake: Option<Handshake>,
    /// Sequenced payloads sent before the handshake completed.
    held: Vec<Vec<u8>>,
}

impl std::fmt::Debug for ReliableUdp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliableUdp")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("local", &self.socket.local_addr())
            .field("remote", &self.primary.peer())
            .field("proxies", &self.proxies.len())
            .finish()
    }
}

impl ReliableUdp {
    fn new(ctx: &Context, config: Config, peer: Option<SocketAddr>) -> Self {
        let expiries = Expiries::new();
        let gbn = GoBackN::new(ctx.scheduler().timer_for(&expiries), config.gbn.clone());
        Self {
            id: ConnId(NEXT_ID.fetch_add(1, Ordering::Relaxed)),
            ctx: ctx.clone(),
            socket: Socket::new(ctx),
            state: ConnectionState::Disconnected,
            expiries,
            primary: Proxy::new(peer, gbn),
            proxies: HashMap::new(),
            pending_accept: None,
            handshake: None,
            held: Vec::new(),
            config,
        }
    }

    /// Bind `port` on all interfaces and accept peers.  Port 0 picks a free
    /// port; see [`local_addr`](Self::local_addr).
    pub fn listen(ctx: &Context, port: u16, config: Config) -> Result<Self, ConnError> {
        let mut conn = Self::new(ctx, config, None);
        conn.socket.listen(port, Protocol::Udp)?;
        conn.state = ConnectionState::Listening;
        log::info!("[rudp] listening on {:?}", conn.socket.local_addr());
        Ok(conn)
    }

    /// Resolve `host` and start the handshake with it.
    pub fn connect(ctx: &Context, host: &str, port: u16, config: Config) -> Result<Self, ConnError> {
        let addr = socket::resolve(host, port)?;
        Self::connect_addr(ctx, addr, config)
    }

    /// Start the handshake with `addr`.  The connection is `Connecting` until
    /// CONNECTED arrives.
    pub fn connect_addr(ctx: &Context, addr: SocketAddr, config: Config) -> Result<Self, ConnError> {
        let mut conn = Self::new(ctx, config, Some(addr));
        conn.socket.connect(addr, Protocol::Udp)?;
        conn.state = ConnectionState::Connecting;

        let mut timer = conn.ctx.scheduler().timer_for(&conn.expiries);
        timer.start(conn.config.handshake.retry_interval);
        conn.handshake = Some(Handshake { timer, attempts: 1 });
        conn.transmit(&[Packet::connect()], addr)?;
        log::info!("[rudp] connecting to {addr}");
        Ok(conn)
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr()
    }

    /// The server a client connection talks to.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.primary.peer()
    }

    /// Addresses with a live per-peer proxy.
    pub fn peers(&self) -> Vec<SocketAddr> {
        self.proxies.keys().copied().collect()
    }

    /// The engine serving `peer`, if any.
    pub fn engine(&self, peer: SocketAddr) -> Option<&GoBackN> {
        if self.primary.peer() == Some(peer) {
            return Some(self.primary.gbn());
        }
        self.proxies.get(&peer).map(Proxy::gbn)
    }

    /// The peer being accepted.  Only `Some` while `accept_event` runs, and
    /// only the first time it is called there.
    pub fn accept(&mut self) -> Option<Accepted> {
        self.pending_accept.take()
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Send to the connected server.
    pub fn send(&mut self, msg: Message) -> Result<(), ConnError> {
        self.route(msg, None)
    }

    /// Send to any address, through its own proxy unless it is the
    /// connected server.
    pub fn send_to_addr(&mut self, msg: Message, peer: SocketAddr) -> Result<(), ConnError> {
        self.route(msg, Some(peer))
    }

    /// Send to a peer this listener accepted.
    pub fn send_to(&mut self, accepted: &Accepted, msg: Message) -> Result<(), ConnError> {
        debug_assert_eq!(
            accepted.listener, self.id,
            "accepted handle used on a different connection"
        );
        if accepted.listener != self.id {
            log::error!(
                "[rudp] handle for {:?} used on {:?}; message dropped",
                accepted.listener,
                self.id
            );
            return Ok(());
        }
        if self.state.is_open() && !self.proxies.contains_key(&accepted.peer) {
            return Err(ConnError::Disconnected(accepted.peer));
        }
        self.route(msg, Some(accepted.peer))
    }

    fn route(&mut self, msg: Message, to: Option<SocketAddr>) -> Result<(), ConnError> {
        if !self.state.is_open() {
            log::warn!("[rudp] {:?} message dropped: disconnected", msg.base_kind());
            return Ok(());
        }
        if msg.payload().len() > MAX_PAYLOAD {
            return Err(PacketError::PayloadTooLarge.into());
        }
        let dest = to
            .or(self.primary.peer())
            .ok_or(SocketError::NoDestination)?;

        match msg {
            Message::Plain(payload) => self.transmit(&[Packet::plain(payload)], dest),
            Message::Sequenced(payload) => {
                if self.state == ConnectionState::Connecting && self.primary.peer() == Some(dest) {
                    self.held.push(payload);
                    return Ok(());
                }
                // Queued from here on: a failed send is left to retransmission.
                let out = self.proxy_mut(dest).send(payload);
                self.transmit_logged(&out.transmit, dest);
                Ok(())
            }
        }
    }

    fn transmit(&self, packets: &[Packet], to: SocketAddr) -> Result<(), ConnError> {
        for packet in packets {
            let bytes = packet.encode()?;
            self.socket.send_datagram(&bytes, Some(to))?;
        }
        Ok(())
    }

    /// Protocol traffic: failures are left to retransmission.
    fn transmit_logged(&self, packets: &[Packet], to: SocketAddr) {
        if let Err(e) = self.transmit(packets, to) {
            log::warn!("[rudp] send to {to} failed: {e}");
        }
    }

    fn proxy_mut(&mut self, peer: SocketAddr) -> &mut Proxy {
        if self.primary.peer() == Some(peer) {
            return &mut self.primary;
        }
        let scheduler = self.ctx.scheduler();
        let expiries = &self.expiries;
        let gbn = &self.config.gbn;
        self.proxies.entry(peer).or_insert_with(|| {
            log::debug!("[rudp] new proxy for {peer}");
            Proxy::new(Some(peer), GoBackN::new(scheduler.timer_for(expiries), gbn.clone()))
        })
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Close the socket and drop every peer.  Idempotent.
    pub fn disconnect(&mut self) {
        if !self.state.is_open() {
            return;
        }
        log::info!("[rudp] disconnecting ({})", self.state);
        self.state = ConnectionState::Disconnected;
        self.handshake = None;
        self.held.clear();
        self.pending_accept = None;
        self.primary.abandon();
        self.proxies.clear();
        self.socket.disconnect();
    }

    /// Forget one peer of a listener, including its sequence state.
    pub fn disconnect_peer(&mut self, peer: SocketAddr) -> Result<(), ConnError> {
        if self.state != ConnectionState::Listening {
            return Err(ConnError::NotListening);
        }
        if self.proxies.remove(&peer).is_some() {
            log::info!("[rudp] dropped peer {peer}");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Event loop
    // -----------------------------------------------------------------------

    /// Handle expired timers and every queued socket event without waiting.
    /// Returns how many were handled.
    pub fn dispatch(&mut self, owner: &mut impl ReliableOwner) -> usize {
        let mut handled = self.fire_timers(owner);
        let mut inbox = Inbox::default();
        handled += self.socket.dispatch(&mut inbox);
        self.process(inbox, owner);
        handled
    }

    /// Wait for a socket event or the next timer expiry, then
    /// [`dispatch`](Self::dispatch).
    pub async fn run_once(&mut self, owner: &mut impl ReliableOwner) -> usize {
        let deadline = self.ctx.scheduler().next_expiry();
        let mut inbox = Inbox::default();
        let mut handled = 0;
        tokio::select! {
            event = self.socket.next_event() => {
                if let Some(event) = event {
                    self.socket.deliver(event, &mut inbox);
                    handled += 1;
                }
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {}
        }
        self.process(inbox, owner);
        handled + self.dispatch(owner)
    }

    fn fire_timers(&mut self, owner: &mut impl ReliableOwner) -> usize {
        self.ctx.scheduler().run_due(Instant::now());
        let mut fired = 0;
        while let Some(id) = self.expiries.try_next() {
            if !self.state.is_open() {
                continue;
            }
            self.on_timer(id, owner);
            fired += 1;
        }
        fired
    }

    fn on_timer(&mut self, id: TimerId, owner: &mut impl ReliableOwner) {
        if self.handshake.as_ref().is_some_and(|h| h.timer.id() == id) {
            self.retry_handshake(owner);
            return;
        }

        let peer = if self.primary.gbn().timer_id() == id {
            self.primary.peer()
        } else {
            self.proxies
                .iter()
                .find(|(_, p)| p.gbn().timer_id() == id)
                .map(|(addr, _)| *addr)
        };
        let Some(peer) = peer else {
            return;
        };

        let proxy = self.proxy_mut(peer);
        // Restarted after this expiry was posted.
        if proxy.gbn().timer_armed() {
            return;
        }
        let out = proxy.on_timeout();
        self.apply(out, peer, owner);
    }

    fn retry_handshake(&mut self, owner: &mut impl ReliableOwner) {
        let Some(peer) = self.primary.peer() else {
            return;
        };
        let Some(hs) = self.handshake.as_mut() else {
            return;
        };
        if self.state != ConnectionState::Connecting || hs.timer.is_armed() {
            return;
        }

        if hs.attempts >= self.config.handshake.max_attempts {
            log::warn!("[rudp] no answer from {peer} after {} CONNECT attempts", hs.attempts);
            self.disconnect();
            owner.disconnect_event(self, None);
            return;
        }
        hs.attempts += 1;
        hs.timer.start(self.config.handshake.retry_interval);
        log::debug!("[rudp] CONNECT attempt {} to {peer}", hs.attempts);
        self.transmit_logged(&[Packet::connect()], peer);
    }

    fn process(&mut self, inbox: Inbox, owner: &mut impl ReliableOwner) {
        for (bytes, from) in inbox.datagrams {
            if !self.state.is_open() {
                return;
            }
            self.on_datagram(&bytes, from, owner);
        }
        if inbox.closed && self.state.is_open() {
            log::warn!("[rudp] datagram endpoint failed");
            self.disconnect();
            owner.disconnect_event(self, None);
        }
    }

    fn on_datagram(&mut self, bytes: &[u8], from: SocketAddr, owner: &mut impl ReliableOwner) {
        let packet = match Packet::decode(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                log::warn!("[rudp] malformed datagram from {from}: {e}");
                return;
            }
        };
        let Some(kind) = packet.kind() else {
            return;
        };
        log::debug!(
            "[rudp] {kind:?} seq={} ack={} from {from}",
            packet.header.seq,
            packet.header.ack
        );

        match kind {
            PacketKind::Connect => self.on_connect(from, owner),
            PacketKind::Connected => self.on_connected(from, owner),
            // A client only keeps state for peers it sent to itself.
            _ if self.state != ConnectionState::Listening
                && self.primary.peer() != Some(from)
                && !self.proxies.contains_key(&from) =>
            {
                log::debug!("[rudp] {kind:?} from stranger {from}; dropped");
            }
            _ if self.state == ConnectionState::Connecting => {
                log::debug!("[rudp] {kind:?} from {from} before CONNECTED; dropped");
            }
            PacketKind::Plain => {
                self.proxy_mut(from);
                owner.read_event(self, Message::Plain(packet.payload), from);
            }
            PacketKind::Data | PacketKind::Ack => {
                let out = self.proxy_mut(from).recv(&packet);
                self.apply(out, from, owner);
            }
        }
    }

    fn on_connect(&mut self, from: SocketAddr, owner: &mut impl ReliableOwner) {
        if self.state != ConnectionState::Listening {
            log::warn!("[rudp] unexpected CONNECT from {from} while {}", self.state);
            return;
        }
        let first = self.proxy_mut(from).mark_accepted();
        self.transmit_logged(&[Packet::connected()], from);
        if !first {
            log::debug!("[rudp] repeated CONNECT from {from}");
            return;
        }
        log::info!("[rudp] accepted {from}");
        self.pending_accept = Some(Accepted {
            listener: self.id,
            peer: from,
        });
        owner.accept_event(self);
        self.pending_accept = None;
    }

    fn on_connected(&mut self, from: SocketAddr, owner: &mut impl ReliableOwner) {
        if self.state != ConnectionState::Connecting || self.primary.peer() != Some(from) {
            log::debug!("[rudp] ignoring CONNECTED from {from} while {}", self.state);
            return;
        }
        self.state = ConnectionState::Connected;
        self.handshake = None;
        log::info!("[rudp] connected to {from}");

        for payload in std::mem::take(&mut self.held) {
            let out = self.primary.send(payload);
            self.transmit_logged(&out.transmit, from);
        }
        owner.connect_event(self);
    }

    fn apply(&mut self, out: Output, peer: SocketAddr, owner: &mut impl ReliableOwner) {
        self.transmit_logged(&out.transmit, peer);
        for payload in out.deliver {
            if !self.state.is_open() {
                return;
            }
            owner.read_event(self, Message::Sequenced(payload), peer);
        }
        if out.failed {
            self.lose_peer(peer, owner);
        }
    }

    fn lose_peer(&mut self, peer: SocketAddr, owner: &mut impl ReliableOwner) {
        if self.primary.peer() == Some(peer) {
            log::warn!("[rudp] {peer} stopped acknowledging; disconnecting");
            self.disconnect();
            owner.disconnect_event(self, None);
        } else {
            log::warn!("[rudp] peer {peer} stopped acknowledging");
            self.proxies.remove(&peer);
            owner.disconnect_event(self, Some(peer));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nobody;
    impl ReliableOwner for Nobody {}

    #[tokio::test]
    async fn listener_starts_listening() {
        let ctx = Context::new();
        let conn = ReliableUdp::listen(&ctx, 0, Config::default()).unwrap();
        assert_eq!(conn.state(), ConnectionState::Listening);
        assert!(conn.local_addr().is_some());
        assert!(conn.remote_addr().is_none());
    }

    #[tokio::test]
    async fn connect_starts_connecting_and_arms_handshake() {
        let ctx = Context::new();
        let conn = ReliableUdp::connect(&ctx, "127.0.0.1", 9, Config::default()).unwrap();
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(conn.handshake.as_ref().is_some_and(|h| h.timer.is_armed()));
    }

    #[tokio::test]
    async fn listener_send_without_destination_fails() {
        let ctx = Context::new();
        let mut conn = ReliableUdp::listen(&ctx, 0, Config::default()).unwrap();
        assert!(matches!(
            conn.send(Message::sequenced("x")),
            Err(ConnError::Socket(SocketError::NoDestination))
        ));
    }

    #[tokio::test]
    async fn send_after_disconnect_is_dropped_quietly() {
        let ctx = Context::new();
        let mut conn = ReliableUdp::connect(&ctx, "127.0.0.1", 9, Config::default()).unwrap();
        conn.disconnect();
        conn.disconnect();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.send(Message::sequenced("x")).is_ok());
        assert!(conn.send(Message::plain("x")).is_ok());
        conn.dispatch(&mut Nobody);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn sequenced_sends_wait_for_handshake() {
        let ctx = Context::new();
        let mut conn = ReliableUdp::connect(&ctx, "127.0.0.1", 9, Config::default()).unwrap();
        conn.send(Message::sequenced("early")).unwrap();
        let server = conn.remote_addr().unwrap();
        assert_eq!(conn.engine(server).unwrap().sender().in_flight(), 0);
        assert_eq!(conn.held.len(), 1);
    }

    #[tokio::test]
    async fn oversized_message_rejected() {
        let ctx = Context::new();
        let mut conn = ReliableUdp::connect(&ctx, "127.0.0.1", 9, Config::default()).unwrap();
        let big = vec![0u8; MAX_PAYLOAD + 1];
        assert!(matches!(
            conn.send(Message::Sequenced(big)),
            Err(ConnError::Packet(PacketError::PayloadTooLarge))
        ));
    }

    #[tokio::test]
    async fn disconnect_peer_requires_listener() {
        let ctx = Context::new();
        let mut conn = ReliableUdp::connect(&ctx, "127.0.0.1", 9, Config::default()).unwrap();
        let peer = conn.remote_addr().unwrap();
        assert!(matches!(conn.disconnect_peer(peer), Err(ConnError::NotListening)));
    }
}
