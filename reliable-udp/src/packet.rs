//! Wire-format definitions for datagrams exchanged by the reliable layer.
//!
//! Every datagram sent by [`crate::reliable_udp::ReliableUdp`] is a
//! [`Packet`].  This module is responsible for:
//! - Defining the on-wire binary layout (header fields, flags, payload).
//! - Serialising a [`Packet`] into a byte buffer ready for transmission.
//! - Deserialising a raw byte slice back into a [`Packet`], returning errors
//!   for malformed or truncated input.
//!
//! No I/O happens here; this is pure data transformation.  Application
//! payloads are opaque bytes; their encoding is the application's business.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Flags     |               Sequence Number                 |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |               |            Acknowledgment Number              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |               |        Payload Length         |   Checksum    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |               |            Payload ...                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 13 bytes.
//! flags(1) + seq(4) + ack(4) + payload_len(2) + checksum(2)
//!
//! Sequence numbers count *messages*, not bytes.  `ack` is cumulative: it is
//! the next sequence number the sender of the packet expects to receive.

/// Bit-flag constants for the `flags` header field.
pub mod flags {
    /// Connect request (handshake initiation).
    pub const CONNECT: u8 = 0b0000_0001;
    /// Connect accepted (handshake reply).
    pub const CONNECTED: u8 = 0b0000_0010;
    /// Unreliable, unordered application payload.
    pub const PLAIN: u8 = 0b0000_0100;
    /// Sequenced application payload; `seq` is valid.
    pub const DATA: u8 = 0b0000_1000;
    /// Acknowledgement field is valid.
    pub const ACK: u8 = 0b0001_0000;

    /// Mask of the flags that determine a packet's kind.
    pub(crate) const KIND_MASK: u8 = CONNECT | CONNECTED | PLAIN | DATA | ACK;
}

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 13;

/// Largest UDP payload an IPv4 datagram can carry.
pub const MAX_DATAGRAM: usize = 65_507;

/// Largest payload a single packet can carry.
pub const MAX_PAYLOAD: usize = MAX_DATAGRAM - HEADER_LEN;

// Byte offsets of each field within the serialised header.
const OFF_FLAGS: usize = 0;
const OFF_SEQ: usize = 1;
const OFF_ACK: usize = 5;
const OFF_PAYLOAD_LEN: usize = 9;
const OFF_CHECKSUM: usize = 11;

/// What a packet means to the connection layer, derived from its flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Connect,
    Connected,
    Plain,
    /// Sequenced payload, possibly with a piggybacked ACK.
    Data,
    /// Pure acknowledgement, no payload.
    Ack,
}

/// Fixed-size protocol header.
///
/// Fields are in host byte order; [`Packet::encode`] converts to big-endian
/// on the wire and [`Packet::decode`] converts back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Bitmask of [`flags`] constants.
    pub flags: u8,
    /// Sequence number of the message carried (DATA only).
    pub seq: u32,
    /// Next sequence number expected from the peer (valid with ACK).
    pub ack: u32,
    /// Internet checksum (RFC 1071) over the entire serialised packet.
    ///
    /// Computed on encode; verified on decode.
    pub checksum: u16,
}

/// A complete protocol datagram: header + payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Packet {
    fn control(flags: u8) -> Self {
        Packet {
            header: Header {
                flags,
                seq: 0,
                ack: 0,
                checksum: 0,
            },
            payload: Vec::new(),
        }
    }

    /// Handshake request.
    pub fn connect() -> Self {
        Self::control(flags::CONNECT)
    }

    /// Handshake reply.
    pub fn connected() -> Self {
        Self::control(flags::CONNECTED)
    }

    /// Unreliable datagram carrying `payload` as-is.
    pub fn plain(payload: Vec<u8>) -> Self {
        Packet {
            payload,
            ..Self::control(flags::PLAIN)
        }
    }

    /// Sequenced datagram with a piggybacked cumulative ACK.
    pub fn data(seq: u32, ack: u32, payload: Vec<u8>) -> Self {
        Packet {
            header: Header {
                flags: flags::DATA | flags::ACK,
                seq,
                ack,
                checksum: 0,
            },
            payload,
        }
    }

    /// Pure cumulative ACK.
    pub fn ack(ack: u32) -> Self {
        Packet {
            header: Header {
                ack,
                ..Self::control(flags::ACK).header
            },
            payload: Vec::new(),
        }
    }

    /// Classify by flags.  Control flags take precedence over data flags.
    pub fn kind(&self) -> Option<PacketKind> {
        let f = self.header.flags;
        if f & flags::CONNECT != 0 {
            Some(PacketKind::Connect)
        } else if f & flags::CONNECTED != 0 {
            Some(PacketKind::Connected)
        } else if f & flags::PLAIN != 0 {
            Some(PacketKind::Plain)
        } else if f & flags::DATA != 0 {
            Some(PacketKind::Data)
        } else if f & flags::ACK != 0 {
            Some(PacketKind::Ack)
        } else {
            None
        }
    }

    /// `true` when the `ack` field carries a valid cumulative ACK.
    pub fn has_ack(&self) -> bool {
        self.header.flags & flags::ACK != 0
    }

    /// Serialise this packet into a newly allocated byte vector.
    ///
    /// The checksum is computed from the actual contents; any value already
    /// stored in `header.checksum` is ignored.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let payload_len = self.payload.len();
        if payload_len > MAX_PAYLOAD {
            return Err(PacketError::PayloadTooLarge);
        }
        let mut buf = vec![0u8; HEADER_LEN + payload_len];

        buf[OFF_FLAGS] = self.header.flags;
        buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&self.header.seq.to_be_bytes());
        buf[OFF_ACK..OFF_ACK + 4].copy_from_slice(&self.header.ack.to_be_bytes());
        buf[OFF_PAYLOAD_LEN..OFF_PAYLOAD_LEN + 2]
            .copy_from_slice(&(payload_len as u16).to_be_bytes());
        // Checksum field stays zero while computing the checksum.
        buf[HEADER_LEN..].copy_from_slice(&self.payload);

        let csum = internet_checksum(&buf);
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&csum.to_be_bytes());

        Ok(buf)
    }

    /// Parse a [`Packet`] from a raw byte slice.
    ///
    /// Returns [`Err`] if:
    /// - `buf` is shorter than [`HEADER_LEN`],
    /// - the `payload_len` field disagrees with `buf.len()`,
    /// - the checksum does not verify, or
    /// - no kind flag is set.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < HEADER_LEN {
            return Err(PacketError::BufferTooShort);
        }

        let flags = buf[OFF_FLAGS];
        let seq = read_u32(buf, OFF_SEQ);
        let ack = read_u32(buf, OFF_ACK);
        let payload_len = read_u16(buf, OFF_PAYLOAD_LEN);
        let checksum = read_u16(buf, OFF_CHECKSUM);

        if buf.len() != HEADER_LEN + payload_len as usize {
            return Err(PacketError::LengthMismatch);
        }

        // Verify checksum: zero the stored field, recompute, compare.
        let mut scratch = buf.to_vec();
        scratch[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&0u16.to_be_bytes());
        if internet_checksum(&scratch) != checksum {
            return Err(PacketError::ChecksumFailed);
        }

        if flags & flags::KIND_MASK == 0 {
            return Err(PacketError::UnknownKind(flags));
        }

        Ok(Packet {
            header: Header {
                flags,
                seq,
                ack,
                checksum,
            },
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

/// Errors that can arise when encoding or parsing a datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Buffer shorter than the fixed header size.
    BufferTooShort,
    /// `payload_len` field does not match the actual remaining bytes.
    LengthMismatch,
    /// Checksum did not match recomputed value.
    ChecksumFailed,
    /// None of the kind flags is set.
    UnknownKind(u8),
    /// Payload does not fit the 16-bit length field.
    PayloadTooLarge,
}

impl std::fmt::Display for PacketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketError::BufferTooShort => write!(f, "buffer too short to contain a header"),
            PacketError::LengthMismatch => {
                write!(f, "payload_len field does not match remaining bytes")
            }
            PacketError::ChecksumFailed => write!(f, "checksum verification failed"),
            PacketError::UnknownKind(flags) => write!(f, "no packet kind in flags {flags:#04x}"),
            PacketError::PayloadTooLarge => {
                write!(f, "payload exceeds {MAX_PAYLOAD} bytes")
            }
        }
    }
}

impl std::error::Error for PacketError {}

/// Compute the Internet checksum (RFC 1071) over `data`.
///
/// Sum consecutive 16-bit big-endian words, fold the carry, return the
/// one's-complement.  The caller must zero any checksum field within `data`
/// before calling this function.
fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);

    for pair in &mut chunks {
        sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
    }
    // Odd trailing byte: pad with a zero byte on the right.
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }

    // Fold 32-bit sum into 16 bits.
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_packet_roundtrip() {
        let pkt = Packet::data(42, 7, b"hello".to_vec());
        let decoded = Packet::decode(&pkt.encode().unwrap()).unwrap();
        assert_eq!(decoded.header.seq, 42);
        assert_eq!(decoded.header.ack, 7);
        assert_eq!(decoded.header.flags, flags::DATA | flags::ACK);
        assert_eq!(decoded.payload, b"hello");
        assert_eq!(decoded.kind(), Some(PacketKind::Data));
        assert!(decoded.has_ack());
    }

    #[test]
    fn control_packets_classify() {
        assert_eq!(Packet::connect().kind(), Some(PacketKind::Connect));
        assert_eq!(Packet::connected().kind(), Some(PacketKind::Connected));
        assert_eq!(Packet::plain(vec![1]).kind(), Some(PacketKind::Plain));
        assert_eq!(Packet::ack(3).kind(), Some(PacketKind::Ack));
        assert!(!Packet::plain(vec![]).has_ack());
    }

    #[test]
    fn encode_sets_correct_payload_len() {
        let bytes = Packet::plain(b"world".to_vec()).encode().unwrap();
        assert_eq!(read_u16(&bytes, OFF_PAYLOAD_LEN), 5);
        assert_eq!(bytes.len(), HEADER_LEN + 5);
    }

    #[test]
    fn decode_empty_buffer_returns_error() {
        assert_eq!(Packet::decode(&[]), Err(PacketError::BufferTooShort));
    }

    #[test]
    fn decode_short_header_returns_error() {
        assert_eq!(
            Packet::decode(&[0u8; HEADER_LEN - 1]),
            Err(PacketError::BufferTooShort)
        );
    }

    #[test]
    fn decode_truncated_payload_returns_error() {
        let mut bytes = Packet::data(0, 0, b"data".to_vec()).encode().unwrap();
        bytes.pop(); // payload_len still claims 4 bytes, but buf is one short
        assert_eq!(Packet::decode(&bytes), Err(PacketError::LengthMismatch));
    }

    #[test]
    fn decode_corrupt_byte_returns_checksum_error() {
        let mut bytes = Packet::data(99, 0, b"test".to_vec()).encode().unwrap();
        bytes[OFF_SEQ] ^= 0xff;
        assert_eq!(Packet::decode(&bytes), Err(PacketError::ChecksumFailed));
    }

    #[test]
    fn decode_without_kind_flag_is_rejected() {
        let pkt = Packet {
            header: Header {
                flags: 0,
                seq: 0,
                ack: 0,
                checksum: 0,
            },
            payload: vec![],
        };
        let bytes = pkt.encode().unwrap();
        assert_eq!(Packet::decode(&bytes), Err(PacketError::UnknownKind(0)));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let pkt = Packet::plain(vec![0u8; MAX_PAYLOAD + 1]);
        assert_eq!(pkt.encode(), Err(PacketError::PayloadTooLarge));
    }

    #[test]
    fn largest_packet_fits_one_datagram() {
        let bytes = Packet::data(0, 0, vec![0u8; MAX_PAYLOAD]).encode().unwrap();
        assert_eq!(bytes.len(), MAX_DATAGRAM);
    }

    #[test]
    fn seq_ack_big_endian_on_wire() {
        let bytes = Packet::data(0x0102_0304, 0x0506_0708, vec![]).encode().unwrap();
        assert_eq!(&bytes[OFF_SEQ..OFF_SEQ + 4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[OFF_ACK..OFF_ACK + 4], &[0x05, 0x06, 0x07, 0x08]);
    }

    #[test]
    fn odd_length_checksum_verifies() {
        let pkt = Packet::plain(b"odd".to_vec());
        assert!(Packet::decode(&pkt.encode().unwrap()).is_ok());
    }
}
