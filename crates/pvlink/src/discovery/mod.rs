// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Discovery engine: UDP name search with escalating retry tiers.
//!
//! One dedicated thread owns the search socket. It wakes on the earliest
//! tier deadline, batches every due name into bounded datagrams, fans
//! them out to the configured address list, and parses answers and
//! beacons between ticks. Tier intervals double per tier and saturate at
//! the last one: the engine never gives up on a name, it only slows down.
//!
//! Channel ownership rule: a channel ID lives in exactly one tier set
//! while unresolved, and in no tier set at all once a circuit has claimed
//! it.

pub(crate) mod beacon;

use crate::channel::ChanState;
use crate::circuit;
use crate::config::{POLL_INTERVAL, SEARCH_TIER_COUNT};
use crate::context::Shared;
use crate::error::ClientEvent;
use crate::protocol::search::{parse_beacon, parse_search_response, SearchAnswer};
use crate::protocol::Command;
use crate::resolve;
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use std::collections::HashSet;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

// ===== Tier bookkeeping (lives in ClientState, primary lock) =====

/// Per-tier pending sets and deadlines.
pub(crate) struct SearchState {
    tiers: Vec<HashSet<u32>>,
    next_due: Vec<Instant>,
}

impl SearchState {
    pub fn new(now: Instant) -> Self {
        let n = usize::from(SEARCH_TIER_COUNT);
        Self {
            tiers: (0..n).map(|_| HashSet::new()).collect(),
            next_due: vec![now; n],
        }
    }

    /// Add a channel to a tier, due at `due` if the tier was idle.
    pub fn enqueue(&mut self, cid: u32, tier: u8, due: Instant) {
        let t = usize::from(tier.min(SEARCH_TIER_COUNT - 1));
        if self.tiers[t].is_empty() {
            self.next_due[t] = due;
        }
        self.tiers[t].insert(cid);
    }

    /// Drop a channel from whichever tier holds it. Tier membership can
    /// drift below the tier recorded in the channel state after a boost,
    /// so removal scans rather than indexes.
    pub fn remove(&mut self, cid: u32) {
        for set in &mut self.tiers {
            if set.remove(&cid) {
                return;
            }
        }
    }

    /// Collapse everything into tier 0, due immediately. Used on beacon
    /// anomalies.
    pub fn boost_all(&mut self, now: Instant) -> usize {
        let mut moved = 0;
        for t in 1..self.tiers.len() {
            let drained: Vec<u32> = self.tiers[t].drain().collect();
            moved += drained.len();
            self.tiers[0].extend(drained);
        }
        if !self.tiers[0].is_empty() {
            self.next_due[0] = now;
        }
        moved
    }

    /// Earliest deadline across non-empty tiers.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.tiers
            .iter()
            .zip(&self.next_due)
            .filter(|(set, _)| !set.is_empty())
            .map(|(_, due)| *due)
            .min()
    }

    /// Tiers whose deadline has passed.
    pub fn due_tiers(&self, now: Instant) -> Vec<u8> {
        self.tiers
            .iter()
            .zip(&self.next_due)
            .enumerate()
            .filter(|(_, (set, due))| !set.is_empty() && **due <= now)
            .map(|(t, _)| t as u8)
            .collect()
    }

    /// Take every channel out of a tier.
    pub fn drain(&mut self, tier: u8) -> Vec<u32> {
        self.tiers[usize::from(tier)].drain().collect()
    }

    /// Re-schedule a tier's next deadline.
    pub fn schedule(&mut self, tier: u8, due: Instant) {
        self.next_due[usize::from(tier)] = due;
    }

    /// Total unresolved channels across all tiers.
    pub fn pending(&self) -> usize {
        self.tiers.iter().map(HashSet::len).sum()
    }

    #[cfg(test)]
    pub fn contains(&self, cid: u32, tier: u8) -> bool {
        self.tiers[usize::from(tier)].contains(&cid)
    }
}

// ===== Engine thread =====

/// Create the search socket and start the engine thread.
pub(crate) fn spawn(shared: Arc<Shared>) -> io::Result<JoinHandle<()>> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(SockProtocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    let bind_addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, 0).into();
    socket.bind(&bind_addr.into())?;
    let socket: UdpSocket = socket.into();
    socket.set_read_timeout(Some(POLL_INTERVAL))?;
    log::debug!(
        "[SEARCH] engine socket bound to {:?}",
        socket.local_addr().ok()
    );

    thread::Builder::new()
        .name("pvlink-discovery".into())
        .spawn(move || run(shared, socket))
}

fn run(shared: Arc<Shared>, socket: UdpSocket) {
    let mut buf = vec![0u8; 4096];
    loop {
        if shared.shutdown.load(Ordering::Relaxed) {
            break;
        }

        // Fire due tiers and fan out the resulting datagrams.
        let datagrams = crate::context::search_tick(&shared, Instant::now());
        for dgram in &datagrams {
            for dest in &shared.config.addr_list {
                if let Err(err) = socket.send_to(dgram, dest) {
                    log::debug!("[SEARCH] send to {} failed: {}", dest, err);
                }
            }
        }

        // Wake early enough for the next deadline, never longer than the
        // poll interval so shutdown stays responsive.
        let timeout = {
            let g = shared.state.lock();
            g.search
                .next_deadline()
                .map(|due| due.saturating_duration_since(Instant::now()))
                .map_or(POLL_INTERVAL, |d| d.min(POLL_INTERVAL))
                .max(std::time::Duration::from_millis(1))
        };
        let _ = socket.set_read_timeout(Some(timeout));

        match socket.recv_from(&mut buf) {
            Ok((n, src)) => handle_datagram(&shared, &buf[..n], src),
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut => {}
            Err(err) => {
                log::warn!("[SEARCH] socket receive failed: {}", err);
            }
        }
    }
    log::debug!("[SEARCH] engine thread exiting");
}

fn handle_datagram(shared: &Arc<Shared>, data: &[u8], src: SocketAddr) {
    for frame in crate::protocol::search::datagram_frames(data, shared.config.max_array_bytes) {
        match frame.header.command {
            Command::SearchResponse => {
                if let Some(answer) = parse_search_response(&frame.header, &frame.payload, src) {
                    handle_answer(shared, answer);
                }
            }
            Command::Beacon => {
                if let Some(beacon) = parse_beacon(&frame.header, src) {
                    let now = Instant::now();
                    let mut g = shared.state.lock();
                    let anomaly = g.beacons.observe(beacon.server, beacon.sequence, now);
                    if anomaly.boosts_search() {
                        let moved = g.search.boost_all(now);
                        log::debug!(
                            "[SEARCH] beacon anomaly {:?} from {} (seq={}), boosted {} channels",
                            anomaly,
                            beacon.server,
                            beacon.sequence,
                            moved
                        );
                    }
                }
            }
            // Negative answers and stray version frames carry no state.
            Command::NotFound | Command::Version => {}
            other => {
                log::debug!("[SEARCH] ignoring unexpected {:?} from {}", other, src);
            }
        }
    }
}

/// Route an affirmative answer: first responder claims the channel, later
/// conflicting responders are reported once and otherwise ignored.
fn handle_answer(shared: &Arc<Shared>, answer: SearchAnswer) {
    let mut g = shared.state.lock();
    let Some(handle) = g.chan_ids.lookup(answer.cid) else {
        // Channel destroyed while the answer was in flight.
        return;
    };
    let Some(chan) = g.chans.get(handle) else {
        return;
    };

    match chan.state {
        ChanState::Searching { .. } => {
            log::debug!(
                "[SEARCH] {:?} resolved to {} (cid={})",
                chan.name,
                answer.server,
                answer.cid
            );
            g.search.remove(answer.cid);
            circuit::attach_channel(shared, &mut g, answer);
        }
        ChanState::Attaching { key } | ChanState::Connected { key, .. } => {
            if key.0 == answer.server {
                return; // same server re-answering; routine
            }
            let Some(chan) = g.chans.get_mut(handle) else {
                return;
            };
            if chan.dup_reported {
                return;
            }
            chan.dup_reported = true;
            let name = chan.name.to_string();
            let cb = g.exception_cb.clone();
            drop(g);
            log::warn!(
                "[SEARCH] channel {:?} multiply defined: {} and {}",
                name,
                key.0,
                answer.server
            );
            if let Some(cb) = cb {
                resolve::spawn_duplicate_report(
                    Arc::clone(shared),
                    cb,
                    name,
                    key.0,
                    answer.server,
                );
            }
        }
        ChanState::Virgin => {}
    }
}

/// Build the multiply-defined event once hostnames are known. Split out
/// so the resolver thread shares one construction path with tests.
pub(crate) fn multiply_defined_event(
    channel: String,
    connected_host: String,
    rejected_host: String,
) -> ClientEvent {
    ClientEvent::MultiplyDefined {
        channel,
        connected_host,
        rejected_host,
    }
}

// ===== Tests =====

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_enqueue_and_deadline() {
        let now = Instant::now();
        let mut s = SearchState::new(now);
        assert_eq!(s.next_deadline(), None);

        s.enqueue(1, 0, now);
        assert!(s.contains(1, 0));
        assert_eq!(s.next_deadline(), Some(now));
        assert_eq!(s.due_tiers(now), vec![0]);
    }

    #[test]
    fn test_tier_saturation() {
        let now = Instant::now();
        let mut s = SearchState::new(now);
        // Past the last tier, channels stay in the last tier.
        s.enqueue(7, SEARCH_TIER_COUNT + 3, now);
        assert!(s.contains(7, SEARCH_TIER_COUNT - 1));
    }

    #[test]
    fn test_boost_all_collapses_to_tier_zero() {
        let now = Instant::now();
        let mut s = SearchState::new(now);
        s.enqueue(1, 3, now);
        s.enqueue(2, 6, now);
        s.enqueue(3, 0, now);

        let moved = s.boost_all(now + Duration::from_secs(1));
        assert_eq!(moved, 2);
        assert!(s.contains(1, 0));
        assert!(s.contains(2, 0));
        assert!(s.contains(3, 0));
        assert_eq!(s.pending(), 3);
        assert_eq!(s.due_tiers(now + Duration::from_secs(1)), vec![0]);
    }

    #[test]
    fn test_drain_empties_tier() {
        let now = Instant::now();
        let mut s = SearchState::new(now);
        s.enqueue(10, 2, now);
        s.enqueue(11, 2, now);
        let mut drained = s.drain(2);
        drained.sort_unstable();
        assert_eq!(drained, vec![10, 11]);
        assert_eq!(s.pending(), 0);
        assert_eq!(s.next_deadline(), None);
    }

    #[test]
    fn test_empty_tiers_have_no_deadline() {
        let now = Instant::now();
        let mut s = SearchState::new(now);
        s.enqueue(1, 3, now);
        s.remove(1);
        assert_eq!(s.next_deadline(), None);
        assert!(s.due_tiers(now).is_empty());
    }
}
