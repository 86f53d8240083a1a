// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Channels: client-side handles for named remote process variables.
//!
//! A channel is a member of exactly one place at a time: either a search
//! tier in the discovery engine or one circuit's attached set. The
//! internal [`Chan`] record lives in the channel pool under the primary
//! lock; the public [`Channel`] is a cheap handle that re-validates its ID
//! on every call, so a destroyed channel turns into `Error::StaleChannel`
//! instead of undefined behavior.

use crate::context::{self, Shared};
use crate::error::{ClientStatus, Error, Result};
use crate::protocol::value::{FieldType, Value};
use std::collections::HashSet;
use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

// ===== Event masks =====

/// Subscription event selection mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMask(u16);

impl EventMask {
    /// Value changes beyond the server-side deadband.
    pub const VALUE: EventMask = EventMask(1);
    /// Archival-rate value changes.
    pub const LOG: EventMask = EventMask(2);
    /// Alarm state transitions.
    pub const ALARM: EventMask = EventMask(4);
    /// Metadata (units, limits) changes.
    pub const PROPERTY: EventMask = EventMask(8);

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn from_bits(bits: u16) -> Self {
        EventMask(bits & 0xF)
    }

    pub fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Default for EventMask {
    fn default() -> Self {
        EventMask::VALUE
    }
}

impl BitOr for EventMask {
    type Output = EventMask;
    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

// ===== Access rights =====

/// Server-granted access rights for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessRights {
    pub read: bool,
    pub write: bool,
}

/// Full access until the server's first rights push. A server that never
/// sends a rights frame still answers reads and writes, so starting
/// deny-all would reject every operation on such a channel; the server
/// rejects anything actually forbidden with an error response.
impl Default for AccessRights {
    fn default() -> Self {
        Self {
            read: true,
            write: true,
        }
    }
}

impl AccessRights {
    pub fn from_bits(bits: u32) -> Self {
        Self {
            read: bits & 1 != 0,
            write: bits & 2 != 0,
        }
    }

    pub fn bits(self) -> u32 {
        u32::from(self.read) | (u32::from(self.write) << 1)
    }
}

impl fmt::Display for AccessRights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.read, self.write) {
            (true, true) => write!(f, "rw"),
            (true, false) => write!(f, "r-"),
            (false, true) => write!(f, "-w"),
            (false, false) => write!(f, "--"),
        }
    }
}

// ===== Connection events =====

/// Per-channel lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Channel attached to a circuit; native type/count are now known.
    Connected,
    /// Circuit lost; the channel is back in the discovery engine.
    Disconnected,
    /// Server pushed new access rights.
    AccessRightsChanged(AccessRights),
}

/// Per-channel connection event callback.
pub type ConnCallback = Arc<dyn Fn(ConnectionEvent) + Send + Sync>;

// ===== Internal channel record =====

/// Discovery sub-state: a search request was sent and no answer has
/// arrived yet (`ResponsePending`), or the tier timer has not fired since
/// the channel entered the tier (`RequestPending`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SearchPhase {
    RequestPending,
    ResponsePending,
}

/// Channel connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChanState {
    /// Created, not yet registered with discovery.
    Virgin,
    /// Unresolved; owned by the discovery engine.
    Searching { tier: u8, phase: SearchPhase },
    /// Claimed by a circuit, awaiting the server's channel grant.
    Attaching { key: crate::circuit::CircuitKey },
    /// Attached to a circuit.
    Connected {
        key: crate::circuit::CircuitKey,
        sid: u32,
        native: FieldType,
        count: u32,
    },
}

/// Heap-resident channel record (channel pool, primary lock).
pub(crate) struct Chan {
    pub cid: u32,
    pub name: Arc<str>,
    pub priority: u8,
    pub state: ChanState,
    pub rights: AccessRights,
    pub conn_cb: Option<ConnCallback>,
    /// IDs of ledger operations owned by this channel.
    pub ops: HashSet<u32>,
    /// A duplicate responder was already reported for the current
    /// attachment; reset on disconnect.
    pub dup_reported: bool,
    /// A write-notify is outstanding; at most one per channel.
    pub put_busy: bool,
}

impl Chan {
    pub fn new(name: Arc<str>, priority: u8) -> Self {
        Self {
            cid: 0,
            name,
            priority,
            state: ChanState::Virgin,
            rights: AccessRights::default(),
            conn_cb: None,
            ops: HashSet::new(),
            dup_reported: false,
            put_busy: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, ChanState::Connected { .. })
    }

    /// Circuit attachment, when connected.
    pub fn attachment(&self) -> Option<(crate::circuit::CircuitKey, u32)> {
        match self.state {
            ChanState::Connected { key, sid, .. } => Some((key, sid)),
            _ => None,
        }
    }

    /// Circuit this channel is claimed by, attaching or connected.
    pub fn current_key(&self) -> Option<crate::circuit::CircuitKey> {
        match self.state {
            ChanState::Attaching { key } | ChanState::Connected { key, .. } => Some(key),
            _ => None,
        }
    }

    /// Negotiated native type/count, when connected.
    pub fn native(&self) -> Option<(FieldType, u32)> {
        match self.state {
            ChanState::Connected { native, count, .. } => Some((native, count)),
            _ => None,
        }
    }
}

// ===== Public handle =====

/// Handle for one named remote process variable.
///
/// Dropping the handle destroys the channel: it is synchronously detached
/// from its circuit and every pending operation on it is canceled first.
pub struct Channel {
    pub(crate) cid: u32,
    pub(crate) shared: Arc<Shared>,
}

impl Channel {
    /// Channel name.
    pub fn name(&self) -> Result<Arc<str>> {
        context::channel_name(&self.shared, self.cid)
    }

    /// Process-unique client channel ID.
    pub fn id(&self) -> u32 {
        self.cid
    }

    /// True when the channel is attached to a circuit.
    pub fn is_connected(&self) -> bool {
        context::channel_connected(&self.shared, self.cid)
    }

    /// Native field type negotiated with the server.
    pub fn native_type(&self) -> Result<FieldType> {
        context::channel_native(&self.shared, self.cid).map(|(ty, _)| ty)
    }

    /// Native element count negotiated with the server.
    pub fn element_count(&self) -> Result<u32> {
        context::channel_native(&self.shared, self.cid).map(|(_, n)| n)
    }

    /// Current server-granted access rights.
    pub fn access_rights(&self) -> Result<AccessRights> {
        context::channel_rights(&self.shared, self.cid)
    }

    /// Host (address string) of the attached server.
    pub fn host_name(&self) -> Result<String> {
        context::channel_host(&self.shared, self.cid)
    }

    /// Install the connection event handler for this channel.
    pub fn set_connection_handler(
        &self,
        handler: impl Fn(ConnectionEvent) + Send + Sync + 'static,
    ) -> Result<()> {
        context::set_channel_handler(&self.shared, self.cid, Arc::new(handler))
    }

    /// Read at native type and count.
    ///
    /// The callback fires exactly once: with the value, or with the status
    /// that terminated the operation. Returns the operation ID for
    /// [`Channel::cancel`].
    pub fn read(
        &self,
        cb: impl FnOnce(std::result::Result<Value, ClientStatus>) + Send + 'static,
    ) -> Result<u32> {
        context::issue_read(&self.shared, self.cid, None, 0, Box::new(cb))
    }

    /// Read with an explicit type conversion and element count
    /// (`count == 0` means the native count).
    pub fn read_as(
        &self,
        ty: FieldType,
        count: u32,
        cb: impl FnOnce(std::result::Result<Value, ClientStatus>) + Send + 'static,
    ) -> Result<u32> {
        context::issue_read(&self.shared, self.cid, Some(ty), count, Box::new(cb))
    }

    /// Fire-and-forget write. Queued even when the circuit's flow-control
    /// window is full (the watchdog flags the circuit instead).
    pub fn write(&self, value: &Value) -> Result<()> {
        context::issue_write(&self.shared, self.cid, value)
    }

    /// Write with completion confirmation.
    ///
    /// At most one write-notify may be outstanding per channel; a second
    /// one blocks for a bounded interval and then fails with
    /// [`Error::RequestTimeout`].
    pub fn write_notify(
        &self,
        value: &Value,
        cb: impl FnOnce(std::result::Result<(), ClientStatus>) + Send + 'static,
    ) -> Result<u32> {
        context::issue_write_notify(&self.shared, self.cid, value, Box::new(cb))
    }

    /// Subscribe at native type and count.
    ///
    /// The callback persists across circuit loss: it observes one
    /// `Err(Disconnected)` per loss and updates resume automatically after
    /// reconnect.
    pub fn subscribe(
        &self,
        mask: EventMask,
        cb: impl Fn(std::result::Result<Value, ClientStatus>) + Send + Sync + 'static,
    ) -> Result<u32> {
        context::issue_subscribe(&self.shared, self.cid, None, 0, mask, Arc::new(cb))
    }

    /// Subscribe with explicit type/count.
    pub fn subscribe_as(
        &self,
        ty: FieldType,
        count: u32,
        mask: EventMask,
        cb: impl Fn(std::result::Result<Value, ClientStatus>) + Send + Sync + 'static,
    ) -> Result<u32> {
        context::issue_subscribe(&self.shared, self.cid, Some(ty), count, mask, Arc::new(cb))
    }

    /// Tear down a subscription. No further updates are delivered after
    /// this returns.
    pub fn unsubscribe(&self, op_id: u32) -> Result<()> {
        context::cancel_op(&self.shared, self.cid, op_id)
    }

    /// Cancel any outstanding operation by ID. The callback is dropped
    /// without firing; a response already in flight is ignored on arrival.
    pub fn cancel(&self, op_id: u32) -> Result<()> {
        context::cancel_op(&self.shared, self.cid, op_id)
    }

    /// Destroy the channel now instead of at drop.
    pub fn destroy(self) {
        // Drop impl does the work.
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        context::destroy_channel(&self.shared, self.cid);
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").field("cid", &self.cid).finish()
    }
}

// ===== Tests =====

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_mask_bits() {
        let m = EventMask::VALUE | EventMask::ALARM;
        assert!(m.contains(EventMask::VALUE));
        assert!(m.contains(EventMask::ALARM));
        assert!(!m.contains(EventMask::LOG));
        assert_eq!(EventMask::from_bits(m.bits()), m);
    }

    #[test]
    fn test_access_rights_bits() {
        for bits in 0..4u32 {
            let rights = AccessRights::from_bits(bits);
            assert_eq!(rights.bits(), bits);
        }
        assert_eq!(AccessRights::from_bits(3).to_string(), "rw");
        assert_eq!(AccessRights::from_bits(1).to_string(), "r-");
    }

    #[test]
    fn test_default_rights_permissive() {
        let rights = AccessRights::default();
        assert!(rights.read);
        assert!(rights.write);
    }

    #[test]
    fn test_chan_state_accessors() {
        let chan = Chan::new("pv:x".into(), 10);
        assert!(!chan.is_connected());
        assert_eq!(chan.attachment(), None);
        assert_eq!(chan.native(), None);
    }
}
