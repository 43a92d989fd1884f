//! Tunable protocol parameters.
//!
//! Everything that bounds timing or memory in the ARQ engine and the
//! handshake lives here so the binary (and tests) can override it.  Defaults
//! are chosen for loopback / LAN latencies.

use std::time::Duration;

/// Size of the reusable buffer owned by each background reader.
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

/// How often the reaper looks for finished background tasks.
pub const REAP_INTERVAL: Duration = Duration::from_millis(50);

const DEFAULT_WINDOW_SIZE: usize = 32;
const DEFAULT_RETRANSMIT_INTERVAL: Duration = Duration::from_millis(200);
const DEFAULT_MAX_RETRIES: u32 = 50;
const DEFAULT_HANDSHAKE_INTERVAL: Duration = Duration::from_millis(250);
const DEFAULT_HANDSHAKE_ATTEMPTS: u32 = 20;

/// Go-Back-N engine parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GbnConfig {
    /// Maximum number of unacknowledged messages in flight (N).  Also bounds
    /// how far ahead of the expected sequence the receiver will buffer.
    pub window_size: usize,
    /// Delay between a transmission and the retransmission of the whole
    /// unacknowledged window.
    pub retransmit_interval: Duration,
    /// Consecutive timeouts tolerated without progress before the peer is
    /// declared lost.  `None` retransmits forever.
    pub max_retries: Option<u32>,
}

impl Default for GbnConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            retransmit_interval: DEFAULT_RETRANSMIT_INTERVAL,
            max_retries: Some(DEFAULT_MAX_RETRIES),
        }
    }
}

/// Connect-request retransmission parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeConfig {
    /// Delay between CONNECT retransmissions.
    pub retry_interval: Duration,
    /// Total CONNECT transmissions before giving up.
    pub max_attempts: u32,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            retry_interval: DEFAULT_HANDSHAKE_INTERVAL,
            max_attempts: DEFAULT_HANDSHAKE_ATTEMPTS,
        }
    }
}

/// Complete configuration for one [`crate::reliable_udp::ReliableUdp`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub gbn: GbnConfig,
    pub handshake: HandshakeConfig,
}
