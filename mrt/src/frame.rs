//! Wire-format definitions for MRT frames.
//!
//! Every datagram exchanged between a sender and a receiver is one frame.
//! This module is responsible for:
//! - Defining the on-wire binary layout (checksum, type, fragment, window,
//!   payload).
//! - Encoding a frame into a byte buffer ready for transmission.
//! - Decoding a raw byte slice back into a [`Frame`] view, rejecting
//!   truncated input and checksum mismatches.
//!
//! No I/O happens here; this is pure data transformation.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                                                               |
//! +                       Checksum (64 bits)                      +
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         Frame Type                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                  Fragment Number (signed)                     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Window Size (signed)                       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Payload ...                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 20 bytes.
//! The checksum covers every byte after the checksum field.

use thiserror::Error;

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 20;

/// Largest frame ever put on the wire.
///
/// 1500-byte Ethernet MTU minus the IPv4 (20) and UDP (8) headers, so a
/// frame never needs IP fragmentation.
pub const MAX_FRAME: usize = 1472;

/// Largest payload carried by a single DATA frame.
pub const MAX_PAYLOAD: usize = MAX_FRAME - HEADER_LEN;

/// Fragment number carried by keep-alive DATA frames.
///
/// Never equal to a receiver's expected fragment, so the frame is always
/// dropped after refreshing the peer's liveness.
pub const KEEPALIVE_FRAGMENT: i32 = -1;

// Byte offsets of each field within the serialised header.
const OFF_CHECKSUM: usize = 0;
const OFF_TYPE: usize = 8;
const OFF_FRAGMENT: usize = 12;
const OFF_WINDOW: usize = 16;

/// The six transmission types, plus a catch-all for unrecognised codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Unrecognised type code.
    Unkn,
    /// Request connection.
    Rcon,
    /// Acknowledge connection.
    Acon,
    /// Data fragment (or keep-alive when empty).
    Data,
    /// Acknowledge data.
    Adat,
    /// Request close.
    Rcls,
    /// Acknowledge close.
    Acls,
}

impl FrameType {
    /// Code written into the type field.
    pub fn code(self) -> i32 {
        match self {
            FrameType::Unkn => 0,
            FrameType::Rcon => 1,
            FrameType::Acon => 2,
            FrameType::Data => 3,
            FrameType::Adat => 4,
            FrameType::Rcls => 5,
            FrameType::Acls => 6,
        }
    }
}

impl From<i32> for FrameType {
    fn from(code: i32) -> Self {
        match code {
            1 => FrameType::Rcon,
            2 => FrameType::Acon,
            3 => FrameType::Data,
            4 => FrameType::Adat,
            5 => FrameType::Rcls,
            6 => FrameType::Acls,
            _ => FrameType::Unkn,
        }
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FrameType::Unkn => "UNKN",
            FrameType::Rcon => "RCON",
            FrameType::Acon => "ACON",
            FrameType::Data => "DATA",
            FrameType::Adat => "ADAT",
            FrameType::Rcls => "RCLS",
            FrameType::Acls => "ACLS",
        };
        f.write_str(name)
    }
}

/// Fixed-size protocol header, in host representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: FrameType,
    /// Fragment sequence number.
    pub fragment: i32,
    /// Window size. From a receiver: free buffer bytes. From a sender: unused (0).
    pub window: i32,
}

/// A decoded frame borrowing its payload from the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub header: Header,
    pub payload: &'a [u8],
}

/// Errors that can arise when parsing a raw datagram.
///
/// Callers treat every variant the same way: discard the datagram and
/// keep going.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Buffer shorter than the fixed header.
    #[error("datagram of {len} bytes is shorter than the {HEADER_LEN}-byte header")]
    Truncated { len: usize },
    /// Checksum did not match the recomputed value.
    #[error("checksum mismatch: header says {expected:#018x}, computed {actual:#018x}")]
    ChecksumMismatch { expected: u64, actual: u64 },
}

/// Encode a frame into a newly allocated byte vector.
///
/// Deterministic: identical inputs always yield identical bytes.
pub fn encode(kind: FrameType, fragment: i32, window: i32, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; HEADER_LEN + payload.len()];

    buf[OFF_TYPE..OFF_TYPE + 4].copy_from_slice(&kind.code().to_be_bytes());
    buf[OFF_FRAGMENT..OFF_FRAGMENT + 4].copy_from_slice(&fragment.to_be_bytes());
    buf[OFF_WINDOW..OFF_WINDOW + 4].copy_from_slice(&window.to_be_bytes());
    buf[HEADER_LEN..].copy_from_slice(payload);

    let sum = checksum(&buf[OFF_TYPE..]);
    buf[OFF_CHECKSUM..OFF_CHECKSUM + 8].copy_from_slice(&sum.to_be_bytes());

    buf
}

/// Parse a [`Frame`] from a raw datagram.
pub fn decode(raw: &[u8]) -> Result<Frame<'_>, FrameError> {
    if raw.len() < HEADER_LEN {
        return Err(FrameError::Truncated { len: raw.len() });
    }

    let expected = u64::from_be_bytes(field(raw, OFF_CHECKSUM));
    let actual = checksum(&raw[OFF_TYPE..]);
    if expected != actual {
        return Err(FrameError::ChecksumMismatch { expected, actual });
    }

    Ok(Frame {
        header: Header {
            kind: FrameType::from(i32::from_be_bytes(field(raw, OFF_TYPE))),
            fragment: i32::from_be_bytes(field(raw, OFF_FRAGMENT)),
            window: i32::from_be_bytes(field(raw, OFF_WINDOW)),
        },
        payload: &raw[HEADER_LEN..],
    })
}

/// Copy `N` bytes starting at `offset`. Caller has checked the length.
fn field<const N: usize>(raw: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&raw[offset..offset + N]);
    out
}

/// djb2 string hash over `data`, widened to 64 bits with wrapping arithmetic.
///
/// Order-sensitive and stable across platforms; not a cryptographic MAC.
pub fn checksum(data: &[u8]) -> u64 {
    data.iter().fold(5381u64, |hash, &byte| {
        hash.wrapping_shl(5)
            .wrapping_add(hash)
            .wrapping_add(u64::from(byte))
    })
}
