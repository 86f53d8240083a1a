// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! pvlink Global Configuration - Single Source of Truth
//!
//! This module centralizes protocol constants and the runtime client
//! configuration. **NEVER hardcode elsewhere!**
//!
//! Configuration is read once from the environment at context construction
//! and is immutable afterwards. Malformed values are rejected with
//! [`Error::Config`] rather than silently defaulted, so a typo in a
//! deployment script fails loudly.

use crate::error::{Error, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

// =======================================================================
// Wire protocol constants
// =======================================================================

/// Minor protocol version announced in Version frames and search requests.
pub const PROTOCOL_VERSION: u16 = 13;

/// Oldest minor protocol version this engine will talk to.
pub const MIN_PROTOCOL_VERSION: u16 = 11;

/// Default TCP port servers listen on for circuit connections.
pub const DEFAULT_SERVER_PORT: u16 = 5664;

/// Default UDP port for search request fan-out.
///
/// Search datagrams go to `addr_list` entries on this port unless an entry
/// carries its own port.
pub const DEFAULT_SEARCH_PORT: u16 = DEFAULT_SERVER_PORT;

/// Default UDP port servers announce beacons on.
pub const DEFAULT_BEACON_PORT: u16 = DEFAULT_SERVER_PORT + 1;

// =======================================================================
// Discovery engine constants
// =======================================================================

/// Number of search retry tiers.
///
/// Tier `k` fires every `search_base_interval << k`. After the last tier
/// the interval saturates; searching never stops, it only slows down.
pub const SEARCH_TIER_COUNT: u8 = 8;

/// Maximum UDP payload assembled per search datagram.
///
/// Conservative bound below typical ethernet MTU; a tier tick emits as
/// many datagrams as needed to cover every due name.
pub const SEARCH_DATAGRAM_MAX: usize = 1400;

/// Beacon silence beyond which a returning beacon counts as an anomaly.
pub const BEACON_LONG_GAP: Duration = Duration::from_secs(90);

// =======================================================================
// Circuit constants
// =======================================================================

/// Maximum contiguous unacknowledged frames per circuit before blocking
/// request issuance (flow-control window).
pub const FLOW_CONTROL_WINDOW: u32 = 64;

/// Bounded wait applied when a request cannot be issued immediately
/// (flow-control window full, or a prior write-notify still pending).
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP connect timeout for new circuits.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Receive-side poll granularity for circuit and discovery threads.
///
/// Worker threads never block longer than this without re-checking the
/// shutdown flag.
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

// =======================================================================
// Limits
// =======================================================================

/// Floor for `max_array_bytes`; small enough configs break framing.
pub const MIN_ARRAY_BYTES: usize = 16_384;

/// Maximum channel name length carried in a search frame.
pub const MAX_NAME_LEN: usize = 512;

/// Highest channel priority.
pub const MAX_PRIORITY: u8 = 99;

// =======================================================================
// Runtime configuration
// =======================================================================

/// Immutable client configuration, read once at context construction.
///
/// # Environment
///
/// | Variable | Field | Default |
/// |----------|-------|---------|
/// | `PVLINK_SERVER_PORT` | `server_port` | 5664 |
/// | `PVLINK_ADDR_LIST` | `addr_list` | `255.255.255.255` |
/// | `PVLINK_MAX_ARRAY_BYTES` | `max_array_bytes` | 16 MiB |
/// | `PVLINK_CONN_VERIFY_SECS` | `conn_verify_interval` | 30 s |
/// | `PVLINK_SEARCH_BASE_MS` | `search_base_interval` | 50 ms |
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// TCP port used when a search response does not carry one.
    pub server_port: u16,
    /// Destinations for search datagrams (broadcast or unicast).
    pub addr_list: Vec<SocketAddr>,
    /// Upper bound on a single value payload, both directions.
    pub max_array_bytes: usize,
    /// Echo keepalive / unresponsive-circuit detection interval.
    pub conn_verify_interval: Duration,
    /// Tier-0 search interval; tier `k` uses `base << k`.
    pub search_base_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_port: DEFAULT_SERVER_PORT,
            addr_list: vec![SocketAddr::new(
                IpAddr::V4(Ipv4Addr::BROADCAST),
                DEFAULT_SEARCH_PORT,
            )],
            max_array_bytes: 16 * 1024 * 1024,
            conn_verify_interval: Duration::from_secs(30),
            search_base_interval: Duration::from_millis(50),
        }
    }
}

impl ClientConfig {
    /// Build a configuration from the environment, falling back to
    /// defaults for unset variables.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(port) = parse_env::<u16>("PVLINK_SERVER_PORT")? {
            cfg.server_port = port;
        }

        if let Ok(list) = std::env::var("PVLINK_ADDR_LIST") {
            cfg.addr_list = parse_addr_list(&list, cfg.server_port)?;
        } else {
            // Re-derive the broadcast default in case the port changed.
            cfg.addr_list =
                vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), cfg.server_port)];
        }

        if let Some(bytes) = parse_env::<usize>("PVLINK_MAX_ARRAY_BYTES")? {
            cfg.max_array_bytes = bytes.max(MIN_ARRAY_BYTES);
        }

        if let Some(secs) = parse_env::<u64>("PVLINK_CONN_VERIFY_SECS")? {
            if secs == 0 {
                return Err(Error::Config(
                    "PVLINK_CONN_VERIFY_SECS must be nonzero".into(),
                ));
            }
            cfg.conn_verify_interval = Duration::from_secs(secs);
        }

        if let Some(ms) = parse_env::<u64>("PVLINK_SEARCH_BASE_MS")? {
            if ms == 0 {
                return Err(Error::Config("PVLINK_SEARCH_BASE_MS must be nonzero".into()));
            }
            cfg.search_base_interval = Duration::from_millis(ms);
        }

        log::debug!(
            "[CONFIG] server_port={} addr_list={:?} max_array_bytes={} verify={:?} search_base={:?}",
            cfg.server_port,
            cfg.addr_list,
            cfg.max_array_bytes,
            cfg.conn_verify_interval,
            cfg.search_base_interval
        );

        Ok(cfg)
    }

    /// Replace the search destination list (unicast test setups).
    #[must_use]
    pub fn with_addr_list(mut self, addrs: Vec<SocketAddr>) -> Self {
        self.addr_list = addrs;
        self
    }

    /// Override the tier-0 search interval.
    #[must_use]
    pub fn with_search_base_interval(mut self, base: Duration) -> Self {
        self.search_base_interval = base;
        self
    }

    /// Override the connection verification interval.
    #[must_use]
    pub fn with_conn_verify_interval(mut self, interval: Duration) -> Self {
        self.conn_verify_interval = interval;
        self
    }

    /// Search interval for a tier, saturating at the last tier.
    pub fn search_interval(&self, tier: u8) -> Duration {
        let tier = tier.min(SEARCH_TIER_COUNT - 1);
        self.search_base_interval * (1u32 << u32::from(tier))
    }
}

/// Parse an optional environment variable, distinguishing "unset" from
/// "set but malformed".
fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("{}: cannot parse {:?}", name, raw))),
        Err(_) => Ok(None),
    }
}

/// Parse a whitespace-separated address list.
///
/// Entries are `ip` or `ip:port`; bare IPs get `default_port`.
fn parse_addr_list(raw: &str, default_port: u16) -> Result<Vec<SocketAddr>> {
    let mut out = Vec::new();
    for item in raw.split_whitespace() {
        if let Ok(sa) = item.parse::<SocketAddr>() {
            out.push(sa);
        } else if let Ok(ip) = item.parse::<IpAddr>() {
            out.push(SocketAddr::new(ip, default_port));
        } else {
            return Err(Error::Config(format!(
                "PVLINK_ADDR_LIST: cannot parse {:?}",
                item
            )));
        }
    }
    if out.is_empty() {
        return Err(Error::Config("PVLINK_ADDR_LIST is empty".into()));
    }
    Ok(out)
}

// ===== Tests =====

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.server_port, DEFAULT_SERVER_PORT);
        assert_eq!(cfg.addr_list.len(), 1);
        assert!(cfg.addr_list[0].ip().is_ipv4());
    }

    #[test]
    fn test_addr_list_parsing() {
        let list = parse_addr_list("10.0.0.1 10.0.0.2:7777", 5664)
            .expect("Address list should parse");
        assert_eq!(list[0], "10.0.0.1:5664".parse().unwrap());
        assert_eq!(list[1], "10.0.0.2:7777".parse().unwrap());
    }

    #[test]
    fn test_addr_list_rejects_garbage() {
        assert!(parse_addr_list("not-an-address", 5664).is_err());
        assert!(parse_addr_list("   ", 5664).is_err());
    }

    #[test]
    fn test_search_interval_saturates() {
        let cfg = ClientConfig::default().with_search_base_interval(Duration::from_millis(10));
        assert_eq!(cfg.search_interval(0), Duration::from_millis(10));
        assert_eq!(cfg.search_interval(3), Duration::from_millis(80));
        // Past the last tier the interval stops growing.
        assert_eq!(
            cfg.search_interval(SEARCH_TIER_COUNT - 1),
            cfg.search_interval(SEARCH_TIER_COUNT + 5)
        );
    }
}
