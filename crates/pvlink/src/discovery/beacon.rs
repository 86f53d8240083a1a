// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Server beacon bookkeeping.
//!
//! Servers announce liveness with a sequence-numbered beacon. The client
//! watches per-server sequence and timing: a brand-new server, a sequence
//! regression (restart), or a beacon returning after a long silence all
//! mean unresolved channels may suddenly be servable, so the discovery
//! engine boosts them back to the fastest retry tier.

use crate::config::BEACON_LONG_GAP;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

/// Classification of one observed beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BeaconAnomaly {
    /// Routine beacon; nothing to do.
    None,
    /// Address never seen before.
    FirstSighting,
    /// Sequence went backwards: the server restarted.
    SequenceRestart,
    /// Beacon resumed after a long silence.
    LongGap,
}

impl BeaconAnomaly {
    /// True when the anomaly warrants a search boost.
    pub fn boosts_search(self) -> bool {
        self != BeaconAnomaly::None
    }
}

struct BeaconRecord {
    sequence: u32,
    last_seen: Instant,
}

/// Per-server-address beacon health table (primary lock).
pub(crate) struct BeaconTable {
    servers: HashMap<SocketAddr, BeaconRecord>,
}

impl BeaconTable {
    pub fn new() -> Self {
        Self {
            servers: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Record a beacon and classify it.
    pub fn observe(&mut self, server: SocketAddr, sequence: u32, now: Instant) -> BeaconAnomaly {
        match self.servers.get_mut(&server) {
            None => {
                self.servers.insert(
                    server,
                    BeaconRecord {
                        sequence,
                        last_seen: now,
                    },
                );
                BeaconAnomaly::FirstSighting
            }
            Some(rec) => {
                let gap = now.duration_since(rec.last_seen);
                let regressed = sequence < rec.sequence;
                rec.sequence = sequence;
                rec.last_seen = now;
                if regressed {
                    BeaconAnomaly::SequenceRestart
                } else if gap > BEACON_LONG_GAP {
                    BeaconAnomaly::LongGap
                } else {
                    BeaconAnomaly::None
                }
            }
        }
    }
}

// ===== Tests =====

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr() -> SocketAddr {
        "10.0.0.5:5664".parse().unwrap()
    }

    #[test]
    fn test_first_sighting_boosts() {
        let mut table = BeaconTable::new();
        let now = Instant::now();
        let anomaly = table.observe(addr(), 1, now);
        assert_eq!(anomaly, BeaconAnomaly::FirstSighting);
        assert!(anomaly.boosts_search());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_steady_beacons_are_routine() {
        let mut table = BeaconTable::new();
        let now = Instant::now();
        table.observe(addr(), 1, now);
        let anomaly = table.observe(addr(), 2, now + Duration::from_secs(15));
        assert_eq!(anomaly, BeaconAnomaly::None);
        assert!(!anomaly.boosts_search());
    }

    #[test]
    fn test_sequence_regression_is_restart() {
        let mut table = BeaconTable::new();
        let now = Instant::now();
        table.observe(addr(), 500, now);
        let anomaly = table.observe(addr(), 3, now + Duration::from_secs(15));
        assert_eq!(anomaly, BeaconAnomaly::SequenceRestart);
    }

    #[test]
    fn test_long_gap_detected() {
        let mut table = BeaconTable::new();
        let now = Instant::now();
        table.observe(addr(), 1, now);
        let anomaly = table.observe(addr(), 2, now + BEACON_LONG_GAP + Duration::from_secs(1));
        assert_eq!(anomaly, BeaconAnomaly::LongGap);
    }
}
