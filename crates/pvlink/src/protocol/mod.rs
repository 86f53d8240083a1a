// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire protocol: frame header, command codes, payload helpers.
//!
//! Both the UDP discovery contract and the TCP circuit contract use the
//! same 16-byte header followed by an 8-byte-aligned payload:
//!
//! ```text
//! +-----------+-------------+------------+-----------+----------+----------+
//! | command   | payload_len | field_type | count     | param1   | param2   |
//! | u16 BE    | u16 BE      | u16 BE     | u16 BE    | u32 BE   | u32 BE   |
//! +-----------+-------------+------------+-----------+----------+----------+
//! ```
//!
//! `payload_len` is the *padded* length. Message bodies are opaque at this
//! layer; dispatch happens on the command code in the circuit and
//! discovery modules.

pub mod search;
pub mod value;

use std::fmt;

/// Fixed header length in bytes.
pub const HEADER_LEN: usize = 16;

/// Payload alignment; every payload is padded to a multiple of this.
pub const PAYLOAD_ALIGN: usize = 8;

/// Largest padded payload one frame can carry: `payload_len` is 16 bits,
/// so the wire caps a frame at 65528 payload bytes no matter what the
/// configured array limit says. Issue paths reject anything bigger.
pub const MAX_PAYLOAD_LEN: usize = (u16::MAX as usize) & !(PAYLOAD_ALIGN - 1);

/// Round up to the payload alignment.
pub fn pad8(len: usize) -> usize {
    (len + PAYLOAD_ALIGN - 1) & !(PAYLOAD_ALIGN - 1)
}

/// Protocol command codes.
///
/// The same code is used for a request and its response; direction plus
/// the correlation params disambiguate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Command {
    /// Minor-version negotiation; first frame in each direction.
    Version = 0,
    /// Name search request (UDP).
    Search = 1,
    /// Affirmative search answer (UDP).
    SearchResponse = 2,
    /// Negative search answer (UDP, optional).
    NotFound = 3,
    /// Server liveness announcement (UDP).
    Beacon = 4,
    /// Attach a channel to this circuit.
    CreateChannel = 5,
    /// Server granted the channel: session ID + native type/count.
    ChannelReady = 6,
    /// Detach a channel from this circuit.
    ClearChannel = 7,
    /// Server-side channel vanished.
    ChannelGone = 8,
    /// Access-rights push for one channel.
    AccessRights = 9,
    /// Read request / completion.
    Read = 10,
    /// Fire-and-forget write.
    Write = 11,
    /// Write with completion confirmation.
    WriteNotify = 12,
    /// Start a subscription.
    EventAdd = 13,
    /// Stop a subscription.
    EventCancel = 14,
    /// Subscription value update.
    EventUpdate = 15,
    /// Client user-name announcement.
    ClientName = 16,
    /// Client host-name announcement.
    HostName = 17,
    /// Keepalive probe / reply.
    Echo = 18,
    /// Server-reported error, optionally tied to an operation.
    ErrorResp = 19,
}

impl Command {
    pub fn from_u16(raw: u16) -> Option<Self> {
        Some(match raw {
            0 => Command::Version,
            1 => Command::Search,
            2 => Command::SearchResponse,
            3 => Command::NotFound,
            4 => Command::Beacon,
            5 => Command::CreateChannel,
            6 => Command::ChannelReady,
            7 => Command::ClearChannel,
            8 => Command::ChannelGone,
            9 => Command::AccessRights,
            10 => Command::Read,
            11 => Command::Write,
            12 => Command::WriteNotify,
            13 => Command::EventAdd,
            14 => Command::EventCancel,
            15 => Command::EventUpdate,
            16 => Command::ClientName,
            17 => Command::HostName,
            18 => Command::Echo,
            19 => Command::ErrorResp,
            _ => return None,
        })
    }
}

/// Frame decode failure; tears down the offending circuit, never the
/// process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Unknown command code.
    BadCommand(u16),
    /// Payload length not a multiple of the alignment.
    BadPadding(u16),
    /// Payload length exceeds the configured maximum.
    Oversize(usize),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::BadCommand(cmd) => write!(f, "unknown command code {}", cmd),
            FrameError::BadPadding(len) => write!(f, "unaligned payload length {}", len),
            FrameError::Oversize(len) => write!(f, "payload length {} exceeds limit", len),
        }
    }
}

/// Decoded 16-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub command: Command,
    /// Padded payload length.
    pub payload_len: u16,
    pub field_type: u16,
    pub count: u16,
    pub param1: u32,
    pub param2: u32,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..2].copy_from_slice(&(self.command as u16).to_be_bytes());
        buf[2..4].copy_from_slice(&self.payload_len.to_be_bytes());
        buf[4..6].copy_from_slice(&self.field_type.to_be_bytes());
        buf[6..8].copy_from_slice(&self.count.to_be_bytes());
        buf[8..12].copy_from_slice(&self.param1.to_be_bytes());
        buf[12..16].copy_from_slice(&self.param2.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self, FrameError> {
        let raw_cmd = u16::from_be_bytes([buf[0], buf[1]]);
        let command = Command::from_u16(raw_cmd).ok_or(FrameError::BadCommand(raw_cmd))?;
        let payload_len = u16::from_be_bytes([buf[2], buf[3]]);
        if payload_len as usize % PAYLOAD_ALIGN != 0 {
            return Err(FrameError::BadPadding(payload_len));
        }
        Ok(Self {
            command,
            payload_len,
            field_type: u16::from_be_bytes([buf[4], buf[5]]),
            count: u16::from_be_bytes([buf[6], buf[7]]),
            param1: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            param2: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
        })
    }
}

/// One complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    /// Padded payload (length == `header.payload_len`).
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a frame, padding the payload to the alignment.
    pub fn new(
        command: Command,
        field_type: u16,
        count: u16,
        param1: u32,
        param2: u32,
        mut payload: Vec<u8>,
    ) -> Self {
        payload.resize(pad8(payload.len()), 0);
        assert!(
            payload.len() <= MAX_PAYLOAD_LEN,
            "frame payload exceeds the wire limit"
        );
        Self {
            header: FrameHeader {
                command,
                payload_len: payload.len() as u16,
                field_type,
                count,
                param1,
                param2,
            },
            payload,
        }
    }

    /// Header-only frame.
    pub fn control(command: Command, field_type: u16, count: u16, param1: u32, param2: u32) -> Self {
        Self::new(command, field_type, count, param1, param2, Vec::new())
    }

    /// Total encoded length.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.header.encode());
        buf.extend_from_slice(&self.payload);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.wire_len());
        self.encode_into(&mut buf);
        buf
    }

    /// Parse one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed, `Ok(Some((frame,
    /// consumed)))` on success, and `Err` on a malformed or oversized
    /// header.
    pub fn parse(buf: &[u8], max_payload: usize) -> Result<Option<(Frame, usize)>, FrameError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut head = [0u8; HEADER_LEN];
        head.copy_from_slice(&buf[..HEADER_LEN]);
        let header = FrameHeader::decode(&head)?;
        let payload_len = header.payload_len as usize;
        if payload_len > max_payload {
            return Err(FrameError::Oversize(payload_len));
        }
        let total = HEADER_LEN + payload_len;
        if buf.len() < total {
            return Ok(None);
        }
        Ok(Some((
            Frame {
                header,
                payload: buf[HEADER_LEN..total].to_vec(),
            },
            total,
        )))
    }
}

// ===== String payload helpers =====

/// Encode a NUL-terminated string payload.
pub fn encode_string(s: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(s.len() + 1);
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
    buf
}

/// Decode a NUL-terminated string payload, trimming padding.
pub fn decode_string(payload: &[u8]) -> String {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end]).into_owned()
}

// ===== Tests =====

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let h = FrameHeader {
            command: Command::WriteNotify,
            payload_len: 24,
            field_type: 5,
            count: 3,
            param1: 0xDEAD_BEEF,
            param2: 42,
        };
        let decoded = FrameHeader::decode(&h.encode()).expect("Header should decode");
        assert_eq!(decoded, h);
    }

    #[test]
    fn test_frame_pads_payload() {
        let f = Frame::new(Command::HostName, 0, 0, 0, 0, b"host1".to_vec());
        assert_eq!(f.payload.len(), 8);
        assert_eq!(f.header.payload_len, 8);
        assert_eq!(f.wire_len(), 24);
    }

    #[test]
    fn test_parse_incremental() {
        let f = Frame::new(Command::Read, 4, 1, 7, 9, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        let wire = f.encode();

        // Partial buffers need more bytes.
        assert_eq!(Frame::parse(&wire[..10], 1024).unwrap(), None);
        assert_eq!(Frame::parse(&wire[..HEADER_LEN + 3], 1024).unwrap(), None);

        let (parsed, consumed) = Frame::parse(&wire, 1024)
            .expect("Frame should parse")
            .expect("Frame should be complete");
        assert_eq!(consumed, wire.len());
        assert_eq!(parsed, f);
    }

    #[test]
    fn test_parse_rejects_bad_command() {
        let mut wire = Frame::control(Command::Echo, 0, 0, 0, 0).encode();
        wire[0] = 0xFF;
        wire[1] = 0xFF;
        assert_eq!(
            Frame::parse(&wire, 1024),
            Err(FrameError::BadCommand(0xFFFF))
        );
    }

    #[test]
    fn test_parse_rejects_unaligned_payload() {
        let mut wire = Frame::control(Command::Echo, 0, 0, 0, 0).encode();
        wire[3] = 3; // payload_len = 3, not 8-aligned
        assert!(matches!(
            Frame::parse(&wire, 1024),
            Err(FrameError::BadPadding(3))
        ));
    }

    #[test]
    fn test_parse_rejects_oversize() {
        let f = Frame::new(Command::Write, 4, 100, 1, 0, vec![0u8; 800]);
        let wire = f.encode();
        assert!(matches!(
            Frame::parse(&wire, 256),
            Err(FrameError::Oversize(_))
        ));
    }

    #[test]
    #[should_panic(expected = "wire limit")]
    fn test_frame_rejects_payload_over_wire_limit() {
        let _ = Frame::new(Command::Write, 5, 0, 1, 0, vec![0u8; MAX_PAYLOAD_LEN + 8]);
    }

    #[test]
    fn test_string_payload_roundtrip() {
        let payload = encode_string("pv:temperature");
        let f = Frame::new(Command::Search, 0, 0, 1, 1, payload);
        assert_eq!(decode_string(&f.payload), "pv:temperature");
    }

    #[test]
    fn test_pad8() {
        assert_eq!(pad8(0), 0);
        assert_eq!(pad8(1), 8);
        assert_eq!(pad8(8), 8);
        assert_eq!(pad8(9), 16);
    }
}
