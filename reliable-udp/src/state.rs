//! Connection finite-state machine (FSM) types.
//!
//! Transitions live in [`crate::reliable_udp`]; this module only names the
//! states so logging and tests can refer to them.
//!
//! ```text
//!  connect() ──▶ CONNECTING ──CONNECTED rcvd──▶ CONNECTED
//!                    │                              │
//!      handshake gives up / disconnect()            │ disconnect() / peer lost
//!                    ▼                              ▼
//!               DISCONNECTED ◀──────────────────────┘
//!                    ▲
//!  listen()  ──▶ LISTENING ── disconnect() / socket closed
//! ```
//!
//! `Disconnected` is terminal.

/// All possible states of a reliable UDP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Bound to a local port, accepting peers.
    Listening,
    /// CONNECT sent; waiting for CONNECTED.
    Connecting,
    /// Handshake complete with the remote peer.
    Connected,
    /// Torn down; sends are dropped and no events are produced.
    #[default]
    Disconnected,
}

impl ConnectionState {
    /// `true` while the connection can still carry traffic.
    pub fn is_open(self) -> bool {
        !matches!(self, ConnectionState::Disconnected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Listening => "listening",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}
