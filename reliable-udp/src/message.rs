//! Application messages.
//!
//! A [`Message`] is either plain (unreliable, sent as one raw datagram) or
//! sequenced (reliable and ordered, routed through the peer's Go-Back-N
//! engine).  The connection layer dispatches on the variant; payload encoding
//! is left to the application.

/// Delivery category of a message, used by the send/receive dispatch rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseKind {
    /// Unreliable and unordered.
    Plain,
    /// Reliable and ordered.
    Sequenced,
}

/// An application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Plain(Vec<u8>),
    Sequenced(Vec<u8>),
}

impl Message {
    pub fn plain(payload: impl Into<Vec<u8>>) -> Self {
        Message::Plain(payload.into())
    }

    pub fn sequenced(payload: impl Into<Vec<u8>>) -> Self {
        Message::Sequenced(payload.into())
    }

    pub fn base_kind(&self) -> BaseKind {
        match self {
            Message::Plain(_) => BaseKind::Plain,
            Message::Sequenced(_) => BaseKind::Sequenced,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Message::Plain(p) | Message::Sequenced(p) => p,
        }
    }

    pub fn into_payload(self) -> Vec<u8> {
        match self {
            Message::Plain(p) | Message::Sequenced(p) => p,
        }
    }
}
