// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Discovery datagram contract: search batches, answers, beacons.
//!
//! A search datagram opens with a Version frame followed by one Search
//! frame per unresolved name, packed until [`SearchBatch`] hits its size
//! bound. Each Search frame carries the client-chosen channel ID in both
//! params so an answer is matched without a name lookup.

use crate::config::{MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};
use crate::protocol::value::FieldType;
use crate::protocol::{encode_string, Command, Frame, FrameHeader, HEADER_LEN};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Incrementally packed search datagram.
pub struct SearchBatch {
    buf: Vec<u8>,
    names: usize,
    max: usize,
}

impl SearchBatch {
    /// Start a batch with the leading Version frame.
    pub fn new(max: usize) -> Self {
        let mut buf = Vec::with_capacity(max.min(1500));
        Frame::control(Command::Version, 0, PROTOCOL_VERSION, 0, 0).encode_into(&mut buf);
        Self {
            buf,
            names: 0,
            max,
        }
    }

    /// Try to append one search frame.
    ///
    /// Returns `false` when the frame would overflow the bound; the caller
    /// flushes this batch and retries on a fresh one.
    pub fn push(&mut self, cid: u32, name: &str) -> bool {
        let frame = Frame::new(
            Command::Search,
            0,
            MIN_PROTOCOL_VERSION,
            cid,
            cid,
            encode_string(name),
        );
        if self.names > 0 && self.buf.len() + frame.wire_len() > self.max {
            return false;
        }
        frame.encode_into(&mut self.buf);
        self.names += 1;
        true
    }

    /// Number of search frames packed so far.
    pub fn names(&self) -> usize {
        self.names
    }

    /// Finished datagram bytes; empty when no name was packed.
    pub fn finish(self) -> Option<Vec<u8>> {
        if self.names == 0 {
            None
        } else {
            Some(self.buf)
        }
    }
}

/// Decoded affirmative search answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchAnswer {
    /// Client channel ID echoed from the request.
    pub cid: u32,
    /// Resolved circuit endpoint.
    pub server: SocketAddr,
    /// Server minor protocol version.
    pub version: u16,
    /// Advisory native type, authoritative only at channel install.
    pub field_type: Option<FieldType>,
    /// Advisory native element count.
    pub count: u32,
}

/// Parse a SearchResponse frame.
///
/// `param1` is the server IPv4 address, `0` meaning "use the datagram
/// source". Payload: `{port u16, field_type u16, count u32}`.
pub fn parse_search_response(
    header: &FrameHeader,
    payload: &[u8],
    src: SocketAddr,
) -> Option<SearchAnswer> {
    if header.command != Command::SearchResponse || payload.len() < 8 {
        return None;
    }
    let port = u16::from_be_bytes([payload[0], payload[1]]);
    let raw_type = u16::from_be_bytes([payload[2], payload[3]]);
    let count = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
    let ip = if header.param1 == 0 {
        src.ip()
    } else {
        IpAddr::V4(Ipv4Addr::from(header.param1))
    };
    Some(SearchAnswer {
        cid: header.param2,
        server: SocketAddr::new(ip, port),
        version: header.count,
        field_type: FieldType::from_u16(raw_type),
        count,
    })
}

/// Build a SearchResponse frame (server side of the contract; used by the
/// test harness).
pub fn build_search_response(
    cid: u32,
    port: u16,
    field_type: FieldType,
    count: u32,
) -> Frame {
    let mut payload = Vec::with_capacity(8);
    payload.extend_from_slice(&port.to_be_bytes());
    payload.extend_from_slice(&(field_type as u16).to_be_bytes());
    payload.extend_from_slice(&count.to_be_bytes());
    Frame::new(
        Command::SearchResponse,
        0,
        PROTOCOL_VERSION,
        0,
        cid,
        payload,
    )
}

/// Decoded beacon announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeaconFrame {
    /// Announcing server's circuit endpoint.
    pub server: SocketAddr,
    /// Monotonic beacon sequence number; resets on server restart.
    pub sequence: u32,
}

/// Parse a Beacon frame. `field_type` carries the server TCP port,
/// `param1` the IPv4 address (`0` = datagram source), `param2` the
/// sequence number.
pub fn parse_beacon(header: &FrameHeader, src: SocketAddr) -> Option<BeaconFrame> {
    if header.command != Command::Beacon {
        return None;
    }
    let ip = if header.param1 == 0 {
        src.ip()
    } else {
        IpAddr::V4(Ipv4Addr::from(header.param1))
    };
    Some(BeaconFrame {
        server: SocketAddr::new(ip, header.field_type),
        sequence: header.param2,
    })
}

/// Build a Beacon frame (test harness).
pub fn build_beacon(port: u16, sequence: u32) -> Frame {
    Frame::control(Command::Beacon, port, PROTOCOL_VERSION, 0, sequence)
}

/// Iterate the frames of one received datagram.
///
/// Malformed tails are dropped silently: discovery traffic is unreliable
/// by design and a bad datagram must never affect circuit state.
pub fn datagram_frames(data: &[u8], max_payload: usize) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut off = 0;
    while off + HEADER_LEN <= data.len() {
        match Frame::parse(&data[off..], max_payload) {
            Ok(Some((frame, consumed))) => {
                frames.push(frame);
                off += consumed;
            }
            Ok(None) | Err(_) => break,
        }
    }
    frames
}

// ===== Tests =====

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_packs_version_plus_names() {
        let mut batch = SearchBatch::new(1400);
        assert!(batch.push(10, "pv:alpha"));
        assert!(batch.push(11, "pv:beta"));
        assert_eq!(batch.names(), 2);

        let data = batch.finish().expect("Batch should contain names");
        let frames = datagram_frames(&data, 1024);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].header.command, Command::Version);
        assert_eq!(frames[1].header.command, Command::Search);
        assert_eq!(frames[1].header.param1, 10);
        assert_eq!(crate::protocol::decode_string(&frames[1].payload), "pv:alpha");
        assert_eq!(frames[2].header.param2, 11);
    }

    #[test]
    fn test_batch_overflow_refuses_push() {
        // Bound small enough for exactly one name.
        let mut batch = SearchBatch::new(HEADER_LEN * 2 + 16);
        assert!(batch.push(1, "a"));
        assert!(!batch.push(2, "b"));
        assert_eq!(batch.names(), 1);
    }

    #[test]
    fn test_empty_batch_finishes_to_none() {
        let batch = SearchBatch::new(1400);
        assert!(batch.finish().is_none());
    }

    #[test]
    fn test_search_response_roundtrip() {
        let src: SocketAddr = "192.168.7.9:5664".parse().unwrap();
        let frame = build_search_response(77, 6000, FieldType::F64, 4);
        let answer = parse_search_response(&frame.header, &frame.payload, src)
            .expect("Answer should parse");
        assert_eq!(answer.cid, 77);
        assert_eq!(answer.server, "192.168.7.9:6000".parse().unwrap());
        assert_eq!(answer.field_type, Some(FieldType::F64));
        assert_eq!(answer.count, 4);
    }

    #[test]
    fn test_beacon_roundtrip() {
        let src: SocketAddr = "10.1.2.3:9999".parse().unwrap();
        let frame = build_beacon(5664, 31);
        let beacon = parse_beacon(&frame.header, src).expect("Beacon should parse");
        assert_eq!(beacon.server, "10.1.2.3:5664".parse().unwrap());
        assert_eq!(beacon.sequence, 31);
    }

    #[test]
    fn test_datagram_frames_drops_bad_tail() {
        let mut data = build_beacon(5664, 1).encode();
        data.extend_from_slice(&[0xFF; 7]); // truncated garbage
        let frames = datagram_frames(&data, 1024);
        assert_eq!(frames.len(), 1);
    }
}
