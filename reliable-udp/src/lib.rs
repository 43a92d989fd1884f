//! `reliable-udp`: reliable, ordered connections multiplexed over one UDP
//! socket.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────────────────────────────┐
//!  │             ReliableUdp              │  listen / connect / accept /
//!  │  (state machine + per-peer proxies)  │  send / disconnect
//!  └────┬──────────────────────────┬──────┘
//!       │ Sequenced                │ Plain, CONNECT, CONNECTED
//!  ┌────▼─────┐                    │
//!  │ GoBackN  │  one per peer      │
//!  │ sender + │                    │
//!  │ receiver │                    │
//!  └────┬─────┘                    │
//!       │ DATA / ACK packets       │
//!  ┌────▼──────────────────────────▼──────┐
//!  │               Socket                 │  background readers queue
//!  │  (stream + datagram endpoints)       │  events for dispatch()
//!  └──────────────────────────────────────┘
//!
//!  Context = Scheduler (timers) + reaper (background task reclamation)
//! ```
//!
//! Each module has a single responsibility:
//! - [`config`]        : tunable timing and window parameters
//! - [`packet`]        : wire format (serialise / deserialise)
//! - [`message`]       : plain vs. sequenced application messages
//! - [`scheduler`]     : cooperative one-shot timers
//! - [`context`]       : scheduler + reaper handed to every socket
//! - [`socket`]        : stream/datagram transport with event dispatch
//! - [`gbn_sender`]    : GBN outbound window and backlog
//! - [`gbn_receiver`]  : GBN inbound ordering and buffering
//! - [`gbn`]           : sans-I/O Go-Back-N engine with retransmission timer
//! - [`state`]         : connection states
//! - [`proxy`]         : per-peer engine ownership
//! - [`reliable_udp`]  : the connection layer
//! - [`simulator`]     : deterministic lossy link for testing the engine

pub mod config;
pub mod context;
pub mod gbn;
pub mod gbn_receiver;
pub mod gbn_sender;
pub mod message;
pub mod packet;
pub mod proxy;
pub mod reliable_udp;
pub mod scheduler;
pub mod simulator;
pub mod socket;
pub mod state;

pub use config::{Config, GbnConfig, HandshakeConfig};
pub use context::Context;
pub use message::Message;
pub use reliable_udp::{Accepted, ConnError, ReliableOwner, ReliableUdp};
pub use state::ConnectionState;
