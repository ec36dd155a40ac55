//! Fixed-header frame codec over any `Read`/`Write` stream.
//!
//! Each frame is a 24-byte header of six little-endian `u32` fields
//! (`command`, `arg0`, `arg1`, `length`, `checksum`, `magic`) followed by
//! `length` payload bytes. The checksum is the wrapping sum of the payload
//! bytes and `magic` is `command ^ 0xffff_ffff`.
//!
//! Checksum and magic are written on encode but not verified on decode,
//! matching what deployed daemons accept from each other.

use std::io::{self, Read, Write};

use crate::message::Message;

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 24;

/// Largest payload length `decode` is willing to allocate for (16 MiB).
pub const MAX_FRAME: u32 = 16 * 1024 * 1024;

/// A parsed frame header, exactly as received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Command code.
    pub command: u32,
    /// First argument.
    pub arg0: u32,
    /// Second argument.
    pub arg1: u32,
    /// Payload length in bytes.
    pub length: u32,
    /// Declared payload checksum.
    pub checksum: u32,
    /// Declared magic (should be `!command`).
    pub magic: u32,
}

impl Header {
    /// Builds the header for `msg`, computing length, checksum and magic.
    pub fn for_message(msg: &Message) -> io::Result<Self> {
        let length = u32::try_from(msg.payload.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "payload exceeds u32::MAX"))?;
        Ok(Self {
            command: msg.command,
            arg0: msg.arg0,
            arg1: msg.arg1,
            length,
            checksum: checksum(&msg.payload),
            magic: msg.command ^ 0xffff_ffff,
        })
    }

    /// Parses a raw 24-byte header.
    pub fn parse(buf: &[u8; HEADER_LEN]) -> Self {
        let field = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Self {
            command: field(0),
            arg0: field(4),
            arg1: field(8),
            length: field(12),
            checksum: field(16),
            magic: field(20),
        }
    }

    /// Serializes the header to its wire form.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        let fields = [
            self.command,
            self.arg0,
            self.arg1,
            self.length,
            self.checksum,
            self.magic,
        ];
        for (chunk, value) in out.chunks_exact_mut(4).zip(fields) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        out
    }

    /// Whether `magic` matches `command` and `checksum` matches `payload`.
    pub fn is_consistent(&self, payload: &[u8]) -> bool {
        self.magic == self.command ^ 0xffff_ffff && self.checksum == checksum(payload)
    }
}

/// Wrapping sum of all payload bytes.
fn checksum(payload: &[u8]) -> u32 {
    payload
        .iter()
        .fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b)))
}

/// Serializes `msg` into a single header + payload buffer.
pub fn to_bytes(msg: &Message) -> io::Result<Vec<u8>> {
    let header = Header::for_message(msg)?;
    let mut out = Vec::with_capacity(HEADER_LEN + msg.payload.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(&msg.payload);
    Ok(out)
}

/// Encodes `msg` and writes it to `w` in one write, then flushes.
pub fn encode<W: Write>(w: &mut W, msg: &Message) -> io::Result<()> {
    w.write_all(&to_bytes(msg)?)?;
    w.flush()
}

/// Reads one frame from `r`.
///
/// A stream that ends before the header or payload is complete yields
/// `UnexpectedEof`.
pub fn decode(r: &mut impl Read) -> io::Result<Message> {
    let mut buf = [0u8; HEADER_LEN];
    r.read_exact(&mut buf)?;
    let header = Header::parse(&buf);
    if header.length > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds 16 MiB limit",
        ));
    }
    let mut payload = vec![0u8; header.length as usize];
    r.read_exact(&mut payload)?;
    Ok(Message {
        command: header.command,
        arg0: header.arg0,
        arg1: header.arg1,
        payload,
    })
}
