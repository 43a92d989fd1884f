//! Per-peer protocol state.
//!
//! A [`Proxy`] owns the Go-Back-N engine serving exactly one remote address.
//! A client connection has one, bound to its server.  A listener keeps a root
//! proxy with no peer plus one proxy per remote address it has exchanged
//! traffic with, created on first contact and kept until the peer is
//! disconnected or the listener is dropped.

use std::net::SocketAddr;

use crate::gbn::{GoBackN, Output};
use crate::packet::Packet;

#[derive(Debug)]
pub struct Proxy {
    peer: Option<SocketAddr>,
    gbn: GoBackN,
    /// CONNECT from this peer has been answered and reported.
    accepted: bool,
}

impl Proxy {
    pub fn new(peer: Option<SocketAddr>, gbn: GoBackN) -> Self {
        Self {
            peer,
            gbn,
            accepted: false,
        }
    }

    /// Remote address served, `None` for a listener's root proxy.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn gbn(&self) -> &GoBackN {
        &self.gbn
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted
    }

    /// Record the handshake.  Returns `true` only the first time.
    pub fn mark_accepted(&mut self) -> bool {
        !std::mem::replace(&mut self.accepted, true)
    }

    pub fn send(&mut self, payload: Vec<u8>) -> Output {
        self.gbn.send(payload)
    }

    pub fn recv(&mut self, packet: &Packet) -> Output {
        self.gbn.recv(packet)
    }

    pub fn on_timeout(&mut self) -> Output {
        self.gbn.on_timeout()
    }

    pub fn abandon(&mut self) {
        self.gbn.abandon();
    }
}
