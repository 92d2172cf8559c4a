//! Git pkt-line framing.
//!
//! A pkt-line frame is a four-hex-digit length prefix followed by that many
//! bytes of payload, length prefix included. Two lengths are special:
//! `0000` is a flush packet (end of section) and `0001` is a delimiter
//! packet. See gitprotocol-common(5).

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Maximum payload of a single pkt-line frame (65520 bytes including the
/// four-byte prefix).
pub const MAX_PAYLOAD: usize = 65516;

/// Pkt-line decoding errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PktError {
    #[error("invalid pkt-line length prefix: {0:?}")]
    InvalidLength(String),

    #[error("truncated pkt-line: expected {expected} payload bytes, got {got}")]
    Truncated { expected: usize, got: usize },
}

/// A single pkt-line frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Packet {
    /// `0000`, end of section.
    Flush,
    /// `0001`, section delimiter.
    Delim,
    /// A data frame.
    Data(Bytes),
}

impl Packet {
    /// An error packet as defined by the protocol: a data frame whose
    /// payload is `ERR <message>`.
    pub fn error(message: &str) -> Self {
        Packet::Data(Bytes::from(format!("ERR {message}")))
    }

    /// Append the wire encoding of this packet to `buf`.
    ///
    /// Payloads longer than [`MAX_PAYLOAD`] are split across frames.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Packet::Flush => buf.put_slice(b"0000"),
            Packet::Delim => buf.put_slice(b"0001"),
            Packet::Data(payload) => {
                for chunk in payload.chunks(MAX_PAYLOAD) {
                    let header = format!("{:04x}", chunk.len() + 4);
                    buf.put_slice(header.as_bytes());
                    buf.put_slice(chunk);
                }
            }
        }
    }

    /// Encode this packet as a standalone byte string.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }
}

/// An incremental pkt-line decoder over a byte slice.
pub struct PktReader<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> PktReader<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    /// Byte offset of the next unread frame.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Decode the next frame. Returns `Ok(None)` at a clean end of input.
    pub fn next_packet(&mut self) -> Result<Option<Packet>, PktError> {
        let rest = &self.input[self.pos..];
        if rest.is_empty() {
            return Ok(None);
        }
        if rest.len() < 4 {
            return Err(PktError::Truncated {
                expected: 4,
                got: rest.len(),
            });
        }

        let header = &rest[..4];
        let header_str = std::str::from_utf8(header)
            .map_err(|_| PktError::InvalidLength(format!("{header:?}")))?;
        let len = usize::from_str_radix(header_str, 16)
            .map_err(|_| PktError::InvalidLength(header_str.to_string()))?;

        match len {
            0 => {
                self.pos += 4;
                Ok(Some(Packet::Flush))
            }
            1 => {
                self.pos += 4;
                Ok(Some(Packet::Delim))
            }
            2 | 3 => Err(PktError::InvalidLength(header_str.to_string())),
            _ => {
                let payload_len = len - 4;
                if rest.len() < len {
                    return Err(PktError::Truncated {
                        expected: payload_len,
                        got: rest.len() - 4,
                    });
                }
                let payload = Bytes::copy_from_slice(&rest[4..len]);
                self.pos += len;
                Ok(Some(Packet::Data(payload)))
            }
        }
    }
}
