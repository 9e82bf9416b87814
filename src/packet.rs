//! Wire-format definitions for protocol segments.
//!
//! Every datagram exchanged between peers is a [`Packet`]: a fixed-size
//! [`Header`] followed by up to one segment's worth of payload.  This module
//! is responsible for:
//! - Defining the on-wire binary layout (header fields, control flags).
//! - Serialising a [`Packet`] into a byte buffer with the checksum filled in.
//! - Verifying and deserialising a raw byte slice back into a [`Packet`].
//!
//! No I/O happens here.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Acknowledgment Number                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |            Control            |            Window             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          Data Length          |           Reserved            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           Checksum                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Payload ...                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 20 bytes.
//!
//! The checksum is CRC-32C over the header (checksum field zeroed) followed
//! by the payload.

use thiserror::Error;

/// Bit-flag constants for the `control` header field.
pub mod flags {
    /// Finish: sender has no more data to send.
    pub const FIN: u16 = 1 << 0;
    /// Synchronise sequence numbers (handshake).
    pub const SYN: u16 = 1 << 1;
    /// Reset the connection.
    pub const RST: u16 = 1 << 2;
    /// Acknowledgement field is valid.
    pub const ACK: u16 = 1 << 3;
}

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 20;

/// Largest payload a single segment may carry: the UDP payload limit minus
/// our header.
pub const MAX_PAYLOAD: usize = 65_507 - HEADER_LEN;

// Byte offsets of each field within the serialised header.
const OFF_SEQ: usize = 0;
const OFF_ACK: usize = 4;
const OFF_CONTROL: usize = 8;
const OFF_WINDOW: usize = 10;
const OFF_DATA_LEN: usize = 12;
const OFF_RESERVED: usize = 14;
const OFF_CHECKSUM: usize = 16;

/// Fixed-size protocol header.
///
/// Fields are in host byte order; [`Packet::encode`] converts to big-endian
/// on the wire and [`Header::decode`] converts back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Header {
    /// Sequence number of the first payload byte in this segment.
    pub seq: u32,
    /// Next sequence number expected from the peer.
    pub ack: u32,
    /// Bitmask of [`flags`] constants.
    pub control: u16,
    /// Advertised receive window in bytes.
    pub window: u16,
    /// Payload length. Computed from the payload on encode.
    pub data_len: u16,
    /// Unused; carried on the wire as-is.
    pub reserved: u16,
    /// Checksum. Computed on encode, verified on decode.
    pub checksum: u32,
}

impl Header {
    /// `true` when every bit of `flag` is set.
    pub fn has(&self, flag: u16) -> bool {
        self.control & flag == flag
    }

    /// Parse the header fields of `buf` without verifying the checksum.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < HEADER_LEN {
            return Err(PacketError::BufferTooShort(buf.len()));
        }
        Ok(Self {
            seq: read_u32(buf, OFF_SEQ),
            ack: read_u32(buf, OFF_ACK),
            control: read_u16(buf, OFF_CONTROL),
            window: read_u16(buf, OFF_WINDOW),
            data_len: read_u16(buf, OFF_DATA_LEN),
            reserved: read_u16(buf, OFF_RESERVED),
            checksum: read_u32(buf, OFF_CHECKSUM),
        })
    }
}

/// A complete protocol datagram: header + payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a payload-less segment carrying only control information.
    pub fn control(seq: u32, ack: u32, control: u16, window: u16) -> Self {
        Self {
            header: Header {
                seq,
                ack,
                control,
                window,
                ..Header::default()
            },
            payload: Vec::new(),
        }
    }

    /// Length of this packet once encoded.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Serialise this packet into a newly allocated byte vector.
    ///
    /// `header.data_len` and `header.checksum` are computed from the actual
    /// payload; any values already stored in those fields are ignored.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let data_len = self.payload.len();
        if data_len > MAX_PAYLOAD {
            return Err(PacketError::PayloadTooLarge(data_len));
        }
        let mut buf = vec![0u8; HEADER_LEN + data_len];

        buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&self.header.seq.to_be_bytes());
        buf[OFF_ACK..OFF_ACK + 4].copy_from_slice(&self.header.ack.to_be_bytes());
        buf[OFF_CONTROL..OFF_CONTROL + 2].copy_from_slice(&self.header.control.to_be_bytes());
        buf[OFF_WINDOW..OFF_WINDOW + 2].copy_from_slice(&self.header.window.to_be_bytes());
        buf[OFF_DATA_LEN..OFF_DATA_LEN + 2].copy_from_slice(&(data_len as u16).to_be_bytes());
        buf[OFF_RESERVED..OFF_RESERVED + 2]
            .copy_from_slice(&self.header.reserved.to_be_bytes());
        buf[HEADER_LEN..].copy_from_slice(&self.payload);

        // Checksum field is still zero here.
        let csum = checksum(&buf);
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 4].copy_from_slice(&csum.to_be_bytes());

        Ok(buf)
    }

    /// Parse a [`Packet`] from a raw byte slice.
    ///
    /// Returns [`Err`] if:
    /// - `buf` is shorter than [`HEADER_LEN`],
    /// - the `data_len` field disagrees with `buf.len()`, or
    /// - the checksum does not verify.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        let header = Header::decode(buf)?;

        if buf.len() != HEADER_LEN + header.data_len as usize {
            return Err(PacketError::LengthMismatch {
                declared: header.data_len as usize,
                actual: buf.len() - HEADER_LEN,
            });
        }
        if !verify(buf) {
            return Err(PacketError::ChecksumFailed);
        }

        Ok(Packet {
            header,
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }
}

/// Errors that can arise when encoding or parsing a raw datagram.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("buffer of {0} bytes is too short to contain a header")]
    BufferTooShort(usize),
    #[error("data_len field says {declared} bytes but {actual} follow the header")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("checksum verification failed")]
    ChecksumFailed,
    #[error("payload of {0} bytes does not fit in one segment")]
    PayloadTooLarge(usize),
}

/// `true` when the checksum stored in `buf` matches the recomputed one.
///
/// Buffers too short to hold a header never verify.
pub fn verify(buf: &[u8]) -> bool {
    if buf.len() < HEADER_LEN {
        return false;
    }
    let stored = read_u32(buf, OFF_CHECKSUM);
    let mut scratch = buf.to_vec();
    scratch[OFF_CHECKSUM..OFF_CHECKSUM + 4].fill(0);
    checksum(&scratch) == stored
}

/// CRC-32C over `data`.  The caller zeroes the checksum field first.
fn checksum(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_packet(seq: u32, ack: u32, control: u16, window: u16, payload: &[u8]) -> Packet {
        Packet {
            header: Header {
                seq,
                ack,
                control,
                window,
                ..Header::default()
            },
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let pkt = make_packet(42, 7, flags::SYN | flags::ACK, 8192, b"hello");
        let decoded = Packet::decode(&pkt.encode().unwrap()).unwrap();
        assert_eq!(decoded.header.seq, 42);
        assert_eq!(decoded.header.ack, 7);
        assert!(decoded.header.has(flags::SYN));
        assert!(decoded.header.has(flags::ACK));
        assert!(!decoded.header.has(flags::FIN));
        assert_eq!(decoded.header.window, 8192);
        assert_eq!(decoded.header.data_len, 5);
        assert_eq!(decoded.payload, b"hello");
    }

    #[test]
    fn header_layout_is_big_endian() {
        let bytes = make_packet(0x0102_0304, 0x0506_0708, flags::ACK, 0x090a, b"")
            .encode()
            .unwrap();
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(&bytes[OFF_SEQ..OFF_SEQ + 4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[OFF_ACK..OFF_ACK + 4], &[0x05, 0x06, 0x07, 0x08]);
        assert_eq!(&bytes[OFF_CONTROL..OFF_CONTROL + 2], &[0x00, 0x08]);
        assert_eq!(&bytes[OFF_WINDOW..OFF_WINDOW + 2], &[0x09, 0x0a]);
    }

    #[test]
    fn flag_bits_match_wire_positions() {
        assert_eq!(flags::FIN, 0b0001);
        assert_eq!(flags::SYN, 0b0010);
        assert_eq!(flags::RST, 0b0100);
        assert_eq!(flags::ACK, 0b1000);
    }

    #[test]
    fn encoded_packet_always_verifies() {
        for len in [0usize, 1, 2, 3, 511, 512, 1400] {
            let payload: Vec<u8> = (0..len).map(|i| (i * 31) as u8).collect();
            let bytes = make_packet(len as u32, u32::MAX, flags::ACK, 100, &payload)
                .encode()
                .unwrap();
            assert!(verify(&bytes), "len {len}");
        }
    }

    #[test]
    fn any_single_bit_flip_fails_verification() {
        let bytes = make_packet(99, 3, flags::FIN | flags::ACK, 1024, b"test")
            .encode()
            .unwrap();
        for bit in 0..bytes.len() * 8 {
            let mut corrupt = bytes.clone();
            corrupt[bit / 8] ^= 1 << (bit % 8);
            assert!(!verify(&corrupt), "flip of bit {bit} went unnoticed");
        }
    }

    #[test]
    fn decode_corrupt_payload_returns_checksum_error() {
        let mut bytes = make_packet(1, 2, flags::ACK, 10, b"data").encode().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x40;
        assert_eq!(Packet::decode(&bytes), Err(PacketError::ChecksumFailed));
    }

    #[test]
    fn decode_short_buffer_returns_error() {
        assert_eq!(Packet::decode(&[]), Err(PacketError::BufferTooShort(0)));
        assert_eq!(
            Packet::decode(&[0u8; HEADER_LEN - 1]),
            Err(PacketError::BufferTooShort(HEADER_LEN - 1))
        );
        assert!(!verify(&[0u8; 3]));
    }

    #[test]
    fn decode_truncated_payload_returns_error() {
        let mut bytes = make_packet(0, 0, 0, 0, b"data").encode().unwrap();
        bytes.pop();
        assert_eq!(
            Packet::decode(&bytes),
            Err(PacketError::LengthMismatch {
                declared: 4,
                actual: 3
            })
        );
    }

    #[test]
    fn encode_ignores_stale_length_and_checksum() {
        let mut pkt = make_packet(5, 6, flags::ACK, 1, b"abc");
        pkt.header.data_len = 999;
        pkt.header.checksum = 0xdead_beef;
        let decoded = Packet::decode(&pkt.encode().unwrap()).unwrap();
        assert_eq!(decoded.header.data_len, 3);
        assert_ne!(decoded.header.checksum, 0xdead_beef);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let pkt = make_packet(0, 0, 0, 0, &vec![0u8; MAX_PAYLOAD + 1]);
        assert_eq!(pkt.encode(), Err(PacketError::PayloadTooLarge(MAX_PAYLOAD + 1)));
    }

    #[test]
    fn header_decode_skips_verification() {
        let mut bytes = make_packet(10, 20, flags::RST, 0, b"").encode().unwrap();
        bytes[OFF_CHECKSUM] ^= 0xff;
        let header = Header::decode(&bytes).unwrap();
        assert_eq!(header.seq, 10);
        assert!(header.has(flags::RST));
        assert!(!verify(&bytes));
    }
}
