// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # pvlink - Process Variable Link
//!
//! A pure Rust client engine for networked process variables: name-based
//! discovery over UDP, multiplexed TCP circuits, and callback-driven
//! reads, writes and subscriptions.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pvlink::{Context, EventMask, Result};
//!
//! fn main() -> Result<()> {
//!     let ctx = Context::new()?;
//!     let temp = ctx.create_channel("plant:temperature", 0)?;
//!
//!     temp.subscribe(EventMask::VALUE, |update| match update {
//!         Ok(value) => println!("temperature = {:?}", value),
//!         Err(status) => eprintln!("subscription: {}", status),
//!     })?;
//!
//!     std::thread::park();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                      Application Layer                       |
//! |        Context -> Channel -> read / write / subscribe        |
//! +--------------------------------------------------------------+
//! |                       Engine Layer                           |
//! |   I/O Ledger | Channel Pool | Search Tiers | Beacon Table    |
//! +--------------------------------------------------------------+
//! |                      Transport Layer                         |
//! |   UDP discovery fan-out | TCP circuits per (server, prio)    |
//! +--------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Context`] | Engine instance, factory for channels |
//! | [`Channel`] | Handle for one named process variable |
//! | [`Value`] | Typed value array carried on the wire |
//! | [`EventMask`] | Subscription event selection |
//! | [`ClientStatus`] | Completion status delivered to callbacks |
//!
//! ## Guarantees
//!
//! - Every started operation terminates its callback **exactly once**:
//!   with a value, a status, or cancellation (callback dropped unfired).
//! - Subscriptions survive circuit loss: one `Disconnected` status per
//!   loss, automatic re-arm after reconnect.
//! - Discovery never gives up on a name; retry tiers only slow it down.
//! - A misbehaving server tears down its circuit, never the process.

/// Channel handles, event masks, access rights.
pub mod channel;
/// Global configuration (protocol constants, runtime config).
pub mod config;
/// Error and status types.
pub mod error;
/// Wire protocol (frames, commands, value codec, discovery datagrams).
pub mod protocol;

/// TCP circuit management (connect, dispatch, flow control, teardown).
mod circuit;
/// Client context and the operation issue paths.
mod context;
/// UDP discovery engine (search tiers, beacons).
mod discovery;
/// Two-lock guard discipline (primary lock, callback gate).
mod guard;
/// I/O ledger with exactly-once completion.
mod ledger;
/// Object pools and wire-ID tables.
mod registry;
/// Off-thread hostname resolution for diagnostics.
mod resolve;

pub use channel::{AccessRights, Channel, ConnectionEvent, EventMask};
pub use config::ClientConfig;
pub use context::Context;
pub use error::{ClientEvent, ClientStatus, Error, Result};
pub use protocol::value::{FieldType, Value};

/// pvlink version string.
pub const VERSION: &str = "0.1.0";
