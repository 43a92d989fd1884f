//! Stream and datagram transport primitive.
//!
//! A [`Socket`] owns at most one bound UDP socket, one TCP listener, one
//! outbound TCP stream and any number of accepted TCP streams.  Blocking
//! work happens on background tasks spawned through the [`Context`]:
//!
//! ```text
//!   accept loop ──┐
//!   connect task ─┤  GroupCmd::exec  ┌───────────────┐   try_recv   ┌────────────┐
//!   tcp readers ──┼─────(lock)──────▶│ SocketEvent q │─────────────▶│ dispatch() │──▶ SocketOwner
//!   udp reader ───┘                  └───────────────┘              └────────────┘
//! ```
//!
//! Background tasks never call the owner.  They execute a [`GroupCmd`]
//! against the shared state under the socket lock and queue a
//! [`SocketEvent`]; [`Socket::dispatch`] later delivers queued events to a
//! [`SocketOwner`] on the caller's control context.  Transport failures show
//! up as [`SocketEvent::Disconnected`], never as errors across that
//! boundary.
//!
//! Sends never block: datagrams go out with `try_send_to`, stream bytes are
//! queued to a per-stream writer task.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::config::READ_BUFFER_SIZE;
use crate::context::Context;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors surfaced synchronously by socket operations.
#[derive(Debug, Error)]
pub enum SocketError {
    /// Underlying I/O error from the OS.
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Datagram send without an address and without a default peer.
    #[error("no destination address and no default peer")]
    NoDestination,
    /// Stream send to a peer with no established stream.
    #[error("no stream connected (peer {0:?})")]
    NotConnected(Option<SocketAddr>),
    /// The datagram endpoint has been torn down.
    #[error("socket is closed")]
    Closed,
    /// Host name could not be resolved.
    #[error("could not resolve {0}")]
    Resolve(String),
}

/// Resolve `host:port` to the first matching address.
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr, SocketError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| SocketError::Resolve(format!("{host}:{port}: {e}")))?
        .next()
        .ok_or_else(|| SocketError::Resolve(format!("{host}:{port}")))
}

// ---------------------------------------------------------------------------
// Events and owner hooks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// Notification queued by a background task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// A TCP peer was accepted by the listener.
    Accepted(SocketAddr),
    /// The primary connection is up.
    Connected(SocketAddr),
    /// A stream peer was lost (`Some`) or the listener / datagram endpoint
    /// failed (`None`).
    Disconnected(Option<SocketAddr>),
    TcpReceived { bytes: Vec<u8>, from: SocketAddr },
    UdpReceived { bytes: Vec<u8>, from: SocketAddr },
}

/// Receiver of socket notifications.  Every hook defaults to a no-op.
pub trait SocketOwner {
    fn accepted(&mut self, _socket: &mut Socket, _peer: SocketAddr) {}
    fn connected(&mut self, _socket: &mut Socket, _peer: SocketAddr) {}
    fn disconnected(&mut self, _socket: &mut Socket, _peer: Option<SocketAddr>) {}
    fn tcp_received(&mut self, _socket: &mut Socket, _bytes: &[u8], _from: SocketAddr) {}
    fn udp_received(&mut self, _socket: &mut Socket, _bytes: &[u8], _from: SocketAddr) {}
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// One live TCP stream: a queue into its writer task plus both task handles.
/// Dropping it stops both tasks.
struct StreamLink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    reader: AbortHandle,
    writer: AbortHandle,
}

impl Drop for StreamLink {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Primary,
    Accepted,
}

#[derive(Default)]
struct Shared {
    listening: Option<Protocol>,
    stream: Option<(SocketAddr, StreamLink)>,
    accepted: HashMap<SocketAddr, StreamLink>,
}

/// Everything a background task needs to act on the socket.
#[derive(Clone)]
struct Group {
    ctx: Context,
    shared: Arc<Mutex<Shared>>,
    events: mpsc::UnboundedSender<SocketEvent>,
}

impl Group {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SocketEvent) {
        // The receiver lives in the Socket; if it is gone nobody cares.
        let _ = self.events.send(event);
    }

    /// Split `stream` and start its reader and writer tasks.
    fn attach(&self, stream: TcpStream, peer: SocketAddr, role: Role) -> StreamLink {
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = self.ctx.spawn("tcp-writer", write_loop(write_half, rx, peer));
        let reader = self
            .ctx
            .spawn("tcp-reader", read_loop(self.clone(), read_half, peer, role));
        StreamLink { tx, reader, writer }
    }
}

/// What was lost, from a background task's point of view.
#[derive(Debug, Clone, Copy)]
enum Lost {
    Stream(SocketAddr, Role),
    ConnectFailed(SocketAddr),
    Listener,
    Datagram,
}

/// Work executed by background tasks against the shared state.
///
/// Every command runs under the socket lock, so an accepted stream is
/// registered (and its `Accepted` event queued) before its reader can queue
/// data or a disconnect for it.
enum GroupCmd {
    Accept(TcpStream, SocketAddr),
    Connect(TcpStream, SocketAddr),
    Read {
        bytes: Vec<u8>,
        from: SocketAddr,
        protocol: Protocol,
    },
    Disconnect(Lost),
}

impl GroupCmd {
    fn exec(self, group: &Group) {
        let mut shared = group.lock();
        match self {
            GroupCmd::Accept(stream, peer) => {
                let link = group.attach(stream, peer, Role::Accepted);
                shared.accepted.insert(peer, link);
                log::info!("[socket] accepted {peer}");
                group.emit(SocketEvent::Accepted(peer));
            }
            GroupCmd::Connect(stream, peer) => {
                let link = group.attach(stream, peer, Role::Primary);
                shared.stream = Some((peer, link));
                log::info!("[socket] connected to {peer}");
                group.emit(SocketEvent::Connected(peer));
            }
            GroupCmd::Read {
                bytes,
                from,
                protocol,
            } => {
                log::trace!("[socket] {protocol:?} {} bytes from {from}", bytes.len());
                group.emit(match protocol {
                    Protocol::Tcp => SocketEvent::TcpReceived { bytes, from },
                    Protocol::Udp => SocketEvent::UdpReceived { bytes, from },
                });
            }
            GroupCmd::Disconnect(lost) => {
                let event = match lost {
                    Lost::Stream(peer, Role::Accepted) => {
                        shared.accepted.remove(&peer).map(|_| Some(peer))
                    }
                    Lost::Stream(peer, Role::Primary) => {
                        if shared.stream.as_ref().is_some_and(|(p, _)| *p == peer) {
                            shared.stream = None;
                            Some(Some(peer))
                        } else {
                            None
                        }
                    }
                    Lost::ConnectFailed(peer) => Some(Some(peer)),
                    Lost::Listener => {
                        if shared.listening == Some(Protocol::Tcp) {
                            shared.listening = None;
                        }
                        Some(None)
                    }
                    Lost::Datagram => {
                        if shared.listening == Some(Protocol::Udp) {
                            shared.listening = None;
                        }
                        Some(None)
                    }
                };
                // Nothing is reported for state already torn down locally.
                if let Some(peer) = event {
                    log::info!("[socket] disconnected {lost:?}");
                    group.emit(SocketEvent::Disconnected(peer));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

/// Errors after which a datagram reader keeps going.  Windows reports an
/// ICMP port-unreachable as a reset on the next `recv_from`.
fn is_transient_io_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionRefused
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    )
}

async fn accept_loop(group: Group, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => GroupCmd::Accept(stream, peer).exec(&group),
            Err(e) if is_transient_io_error(&e) => continue,
            Err(e) => {
                log::warn!("[socket] accept failed: {e}");
                GroupCmd::Disconnect(Lost::Listener).exec(&group);
                return;
            }
        }
    }
}

async fn connect_task(group: Group, addr: SocketAddr) {
    match TcpStream::connect(addr).await {
        Ok(stream) => {
            let peer = stream.peer_addr().unwrap_or(addr);
            GroupCmd::Connect(stream, peer).exec(&group);
        }
        Err(e) => {
            log::warn!("[socket] connect to {addr} failed: {e}");
            GroupCmd::Disconnect(Lost::ConnectFailed(addr)).exec(&group);
        }
    }
}

async fn read_loop(group: Group, mut half: OwnedReadHalf, peer: SocketAddr, role: Role) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match half.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => GroupCmd::Read {
                bytes: buf[..n].to_vec(),
                from: peer,
                protocol: Protocol::Tcp,
            }
            .exec(&group),
            Err(e) => {
                log::debug!("[socket] read from {peer} failed: {e}");
                break;
            }
        }
    }
    GroupCmd::Disconnect(Lost::Stream(peer, role)).exec(&group);
}

async fn write_loop(
    mut half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    peer: SocketAddr,
) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = half.write_all(&bytes).await {
            // The reader sees the same failure and reports the disconnect.
            log::debug!("[socket] write to {peer} failed: {e}");
            return;
        }
    }
    let _ = half.shutdown().await;
}

async fn udp_read_loop(group: Group, udp: Arc<UdpSocket>) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match udp.recv_from(&mut buf).await {
            Ok((n, from)) => GroupCmd::Read {
                bytes: buf[..n].to_vec(),
                from,
                protocol: Protocol::Udp,
            }
            .exec(&group),
            Err(e) if is_transient_io_error(&e) => {
                log::debug!("[socket] transient udp error: {e}");
            }
            Err(e) => {
                log::warn!("[socket] udp receive failed: {e}");
                GroupCmd::Disconnect(Lost::Datagram).exec(&group);
                return;
            }
        }
    }
}

fn bind_tcp(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let std_listener = std::net::TcpListener::bind(addr)?;
    std_listener.set_nonblocking(true)?;
    TcpListener::from_std(std_listener)
}

fn bind_udp(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind(addr)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

fn unspecified_for(addr: &SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    }
}

// ---------------------------------------------------------------------------
// Socket
// ---------------------------------------------------------------------------

/// Stream + datagram transport endpoint.
///
/// Must be created inside a tokio runtime.  Dropping the socket aborts its
/// background tasks; the reaper joins them.
pub struct Socket {
    group: Group,
    events_rx: mpsc::UnboundedReceiver<SocketEvent>,
    udp: Option<Arc<UdpSocket>>,
    udp_peer: Option<SocketAddr>,
    udp_reader: Option<AbortHandle>,
    listener: Option<AbortHandle>,
    connectors: Vec<AbortHandle>,
    local_addr: Option<SocketAddr>,
}

impl Socket {
    /// A socket with nothing bound.
    pub fn new(ctx: &Context) -> Self {
        let (events, events_rx) = mpsc::unbounded_channel();
        Self {
            group: Group {
                ctx: ctx.clone(),
                shared: Arc::new(Mutex::new(Shared::default())),
                events,
            },
            events_rx,
            udp: None,
            udp_peer: None,
            udp_reader: None,
            listener: None,
            connectors: Vec::new(),
            local_addr: None,
        }
    }

    /// Bind `port` on all interfaces and start receiving.
    ///
    /// TCP starts a background accept loop; UDP starts a datagram reader.
    /// On error the socket is left not listening.
    pub fn listen(&mut self, port: u16, protocol: Protocol) -> Result<(), SocketError> {
        let addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, port).into();
        let bound = match protocol {
            Protocol::Tcp => {
                self.close_listener();
                self.listen_tcp(addr)
            }
            Protocol::Udp => {
                self.disconnect_datagram();
                match bind_udp(addr) {
                    Ok(udp) => self.start_udp(udp),
                    Err(e) => Err(e.into()),
                }
            }
        };
        if let Err(e) = bound {
            log::warn!("[socket] listen {protocol:?} on port {port} failed: {e}");
            self.local_addr = None;
            return Err(e);
        }
        self.group.lock().listening = Some(protocol);
        log::info!("[socket] listening {protocol:?} on {:?}", self.local_addr);
        Ok(())
    }

    fn listen_tcp(&mut self, addr: SocketAddr) -> Result<(), SocketError> {
        let listener = bind_tcp(addr)?;
        self.local_addr = Some(listener.local_addr()?);
        self.listener = Some(
            self.group
                .ctx
                .spawn("tcp-accept", accept_loop(self.group.clone(), listener)),
        );
        Ok(())
    }

    /// Stop accepting streams.  Accepted streams stay up.
    fn close_listener(&mut self) {
        if let Some(old) = self.listener.take() {
            old.abort();
        }
        let mut shared = self.group.lock();
        if shared.listening == Some(Protocol::Tcp) {
            shared.listening = None;
        }
    }

    /// Start connecting to `addr`.
    ///
    /// TCP connects on a background task and later queues `Connected` or
    /// `Disconnected`.  UDP binds an ephemeral port, makes `addr` the default
    /// peer and queues `Connected` immediately.
    pub fn connect(&mut self, addr: SocketAddr, protocol: Protocol) -> Result<(), SocketError> {
        match protocol {
            Protocol::Tcp => {
                self.connectors.retain(|h| !h.is_finished());
                let handle = self
                    .group
                    .ctx
                    .spawn("tcp-connect", connect_task(self.group.clone(), addr));
                self.connectors.push(handle);
            }
            Protocol::Udp => {
                self.disconnect_datagram();
                self.start_udp(bind_udp(unspecified_for(&addr))?)?;
                self.udp_peer = Some(addr);
                self.group.emit(SocketEvent::Connected(addr));
            }
        }
        Ok(())
    }

    fn start_udp(&mut self, udp: UdpSocket) -> Result<(), SocketError> {
        self.local_addr = Some(udp.local_addr()?);
        let udp = Arc::new(udp);
        self.udp_reader = Some(self.group.ctx.spawn(
            "udp-reader",
            udp_read_loop(self.group.clone(), Arc::clone(&udp)),
        ));
        self.udp = Some(udp);
        Ok(())
    }

    /// Drop one accepted peer, or the primary stream when `peer` is `None`.
    /// In-flight connect attempts are aborted with the primary stream.
    /// Idempotent.
    pub fn disconnect_stream(&mut self, peer: Option<SocketAddr>) {
        let mut shared = self.group.lock();
        match peer {
            Some(peer) => {
                shared.accepted.remove(&peer);
                if matches!(&shared.stream, Some((p, _)) if *p == peer) {
                    shared.stream = None;
                }
            }
            None => {
                shared.stream = None;
                for handle in self.connectors.drain(..) {
                    handle.abort();
                }
            }
        }
    }

    /// Close the datagram endpoint.  Idempotent.
    pub fn disconnect_datagram(&mut self) {
        if let Some(reader) = self.udp_reader.take() {
            reader.abort();
        }
        if self.udp.take().is_some() {
            log::debug!("[socket] datagram endpoint closed");
        }
        self.udp_peer = None;
        let mut shared = self.group.lock();
        if shared.listening == Some(Protocol::Udp) {
            shared.listening = None;
        }
    }

    /// Tear everything down.  Idempotent.
    pub fn disconnect(&mut self) {
        self.close_listener();
        self.disconnect_stream(None);
        self.disconnect_datagram();
        let mut shared = self.group.lock();
        shared.accepted.clear();
        shared.listening = None;
    }

    pub fn is_server(&self) -> bool {
        self.group.lock().listening.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.udp_peer.is_some() || self.group.lock().stream.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Default datagram peer, else the primary stream's peer.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.udp_peer
            .or_else(|| self.group.lock().stream.as_ref().map(|(p, _)| *p))
    }

    pub fn accepted_peers(&self) -> Vec<SocketAddr> {
        self.group.lock().accepted.keys().copied().collect()
    }

    /// Queue `bytes` on an accepted peer's stream, or on the primary stream
    /// when `to` is `None`.
    pub fn send_stream(&self, bytes: &[u8], to: Option<SocketAddr>) -> Result<(), SocketError> {
        let shared = self.group.lock();
        let link = match to {
            Some(peer) => shared
                .accepted
                .get(&peer)
                .or_else(|| shared.stream.as_ref().filter(|(p, _)| *p == peer).map(|(_, l)| l)),
            None => shared.stream.as_ref().map(|(_, l)| l),
        };
        let link = link.ok_or(SocketError::NotConnected(to))?;
        link.tx
            .send(bytes.to_vec())
            .map_err(|_| SocketError::NotConnected(to))
    }

    /// Send one datagram to `to`, or to the default peer.
    ///
    /// A full OS send buffer drops the datagram with a warning, like loss on
    /// the wire.
    pub fn send_datagram(&self, bytes: &[u8], to: Option<SocketAddr>) -> Result<(), SocketError> {
        let udp = self.udp.as_ref().ok_or(SocketError::Closed)?;
        let dest = to.or(self.udp_peer).ok_or(SocketError::NoDestination)?;
        match udp.try_send_to(bytes, dest) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                log::warn!("[socket] send buffer full; dropped datagram to {dest}");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Next queued event, if any, without waiting.
    pub fn poll_event(&mut self) -> Option<SocketEvent> {
        self.events_rx.try_recv().ok()
    }

    /// Wait for the next event.
    pub async fn next_event(&mut self) -> Option<SocketEvent> {
        self.events_rx.recv().await
    }

    /// Deliver one event to `owner`.
    pub fn deliver(&mut self, event: SocketEvent, owner: &mut impl SocketOwner) {
        match event {
            SocketEvent::Accepted(peer) => owner.accepted(self, peer),
            SocketEvent::Connected(peer) => owner.connected(self, peer),
            SocketEvent::Disconnected(peer) => owner.disconnected(self, peer),
            SocketEvent::TcpReceived { bytes, from } => owner.tcp_received(self, &bytes, from),
            SocketEvent::UdpReceived { bytes, from } => owner.udp_received(self, &bytes, from),
        }
    }

    /// Deliver every queued event to `owner`.  Returns how many were
    /// delivered.
    pub fn dispatch(&mut self, owner: &mut impl SocketOwner) -> usize {
        let mut n = 0;
        while let Some(event) = self.poll_event() {
            self.deliver(event, owner);
            n += 1;
        }
        n
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.disconnect();
    }
}
