// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! I/O ledger: per-operation tracking for reads, writes-with-completion
//! and subscriptions.
//!
//! Every operation is registered here *before* its request frame is
//! queued, so a response (or a disconnect exception) can always locate it.
//! One-shot operations leave the ledger on their single completion;
//! subscriptions persist until canceled and are re-armed after a
//! reconnect. Exactly-once delivery is structural: the completion path
//! moves the callback out of the ledger, so a second completion finds
//! nothing.
//!
//! All ledger access happens under the primary lock. Callbacks are never
//! invoked here; completion paths produce [`Delivery`] records that the
//! caller drains under the callback gate after releasing the lock.

use crate::channel::{ConnCallback, ConnectionEvent, EventMask};
use crate::error::{ClientEvent, ClientStatus};
use crate::guard::{CallbackGate, CallbackToken};
use crate::protocol::value::{FieldType, Value};
use crate::registry::{IdTable, Pool};
use std::sync::Arc;

/// One-shot read completion.
pub type ReadCallback = Box<dyn FnOnce(Result<Value, ClientStatus>) + Send>;
/// One-shot write-notify completion.
pub type PutCallback = Box<dyn FnOnce(Result<(), ClientStatus>) + Send>;
/// Persistent subscription callback.
pub type EventCallback = Arc<dyn Fn(Result<Value, ClientStatus>) + Send + Sync>;
/// Context-wide exception handler.
pub type ExceptionCallback = Arc<dyn Fn(ClientEvent) + Send + Sync>;

/// Operation kind and kind-specific state.
pub(crate) enum OpKind {
    Read,
    /// Encoded value payload retained until the request is sent.
    Put,
    /// Subscription; `armed` tracks whether the peer currently knows it.
    Event { mask: EventMask, armed: bool },
}

/// Completion callback storage.
pub(crate) enum OpCallback {
    Read(ReadCallback),
    Put(PutCallback),
    Event(EventCallback),
}

/// One in-flight operation.
pub(crate) struct IoOp {
    pub id: u32,
    pub cid: u32,
    /// Requested type; `None` means the channel's native type, resolved
    /// when the request frame is built.
    pub ty: Option<FieldType>,
    /// Requested element count; `0` means the native count.
    pub count: u32,
    pub kind: OpKind,
    pub cb: OpCallback,
    /// Request frame has been queued on a circuit.
    pub sent: bool,
    /// Encoded value for queued writes awaiting a circuit.
    pub payload: Option<Vec<u8>>,
}

/// A callback ready to fire, detached from all shared state.
pub(crate) enum Delivery {
    Read(ReadCallback, Result<Value, ClientStatus>),
    Put(PutCallback, Result<(), ClientStatus>),
    Event(EventCallback, Result<Value, ClientStatus>),
    Conn(ConnCallback, ConnectionEvent),
    Client(ExceptionCallback, ClientEvent),
}

impl Delivery {
    /// Invoke the callback. Requires the callback gate.
    pub fn deliver(self, _token: &CallbackToken<'_>) {
        match self {
            Delivery::Read(cb, result) => cb(result),
            Delivery::Put(cb, result) => cb(result),
            Delivery::Event(cb, result) => cb(result),
            Delivery::Conn(cb, event) => cb(event),
            Delivery::Client(cb, event) => cb(event),
        }
    }
}

/// Drain deliveries under the callback gate.
///
/// Must be called with the primary lock *released*; the gate asserts that
/// in debug builds.
pub(crate) fn deliver_all(gate: &CallbackGate, deliveries: Vec<Delivery>) {
    if deliveries.is_empty() {
        return;
    }
    let token = gate.enter();
    for d in deliveries {
        d.deliver(&token);
    }
}

/// The ledger proper: operation pool plus wire-ID index.
pub(crate) struct Ledger {
    pool: Pool<IoOp>,
    ids: IdTable,
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            pool: Pool::new(),
            ids: IdTable::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    /// Register a new operation and return its wire ID.
    pub fn register(&mut self, mut op: IoOp) -> u32 {
        debug_assert_eq!(op.id, 0, "operation already registered");
        // Reserve the handle first so the ID exists before any frame
        // referencing it can be sent.
        let handle = self.pool.insert(IoOp { id: 0, ..op_placeholder() });
        let id = self.ids.assign(handle);
        op.id = id;
        *self
            .pool
            .get_mut(handle)
            .expect("handle just inserted") = op;
        id
    }

    /// Remove and return a one-shot operation (completion or cancel).
    pub fn take(&mut self, id: u32) -> Option<IoOp> {
        let handle = self.ids.remove(id)?;
        self.pool.remove(handle)
    }

    pub fn get(&self, id: u32) -> Option<&IoOp> {
        let handle = self.ids.lookup(id)?;
        self.pool.get(handle)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut IoOp> {
        let handle = self.ids.lookup(id)?;
        self.pool.get_mut(handle)
    }

    /// Clone the subscription callback for update delivery.
    pub fn event_callback(&self, id: u32) -> Option<EventCallback> {
        let op = self.get(id)?;
        match &op.cb {
            OpCallback::Event(cb) => Some(Arc::clone(cb)),
            _ => None,
        }
    }

    /// IDs of all operations owned by a channel.
    pub fn ops_of_channel(&self, cid: u32) -> Vec<u32> {
        self.pool
            .iter()
            .filter(|(_, op)| op.cid == cid)
            .map(|(_, op)| op.id)
            .collect()
    }

    /// Exception every operation of a disconnected channel.
    ///
    /// One-shot operations are removed and fail with `status`;
    /// subscriptions stay, are marked unarmed, and observe the status once
    /// through their persistent callback. An already-unarmed subscription
    /// observes nothing, so overlapping teardown paths cannot double the
    /// status.
    pub fn disconnect_channel(&mut self, cid: u32, status: ClientStatus) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        for id in self.ops_of_channel(cid) {
            let is_event = matches!(
                self.get(id).map(|op| &op.kind),
                Some(OpKind::Event { .. })
            );
            if is_event {
                if let Some(op) = self.get_mut(id) {
                    let was_armed = match &mut op.kind {
                        OpKind::Event { armed, .. } => std::mem::replace(armed, false),
                        _ => false,
                    };
                    op.sent = false;
                    if was_armed {
                        if let OpCallback::Event(cb) = &op.cb {
                            deliveries.push(Delivery::Event(Arc::clone(cb), Err(status)));
                        }
                    }
                }
            } else if let Some(op) = self.take(id) {
                deliveries.push(match op.cb {
                    OpCallback::Read(cb) => Delivery::Read(cb, Err(status)),
                    OpCallback::Put(cb) => Delivery::Put(cb, Err(status)),
                    OpCallback::Event(_) => unreachable!("event handled above"),
                });
            }
        }
        deliveries
    }

    /// Drop every operation of a destroyed channel without firing
    /// callbacks (cancellation is the terminal outcome).
    pub fn cancel_channel(&mut self, cid: u32) {
        for id in self.ops_of_channel(cid) {
            self.take(id);
        }
    }

    /// Operations of a channel that still need their request issued
    /// (queued one-shots and all subscriptions) — the re-arm set used
    /// right after a channel is installed on a circuit.
    pub fn pending_issues(&mut self, cid: u32) -> Vec<PendingIssue> {
        let mut issues = Vec::new();
        for id in self.ops_of_channel(cid) {
            let Some(op) = self.get_mut(id) else { continue };
            match &mut op.kind {
                OpKind::Event { mask, armed } => {
                    let mask = *mask;
                    *armed = true;
                    op.sent = true;
                    issues.push(PendingIssue {
                        id,
                        ty: op.ty,
                        count: op.count,
                        request: IssueRequest::Event { mask },
                    });
                }
                OpKind::Read if !op.sent => {
                    op.sent = true;
                    issues.push(PendingIssue {
                        id,
                        ty: op.ty,
                        count: op.count,
                        request: IssueRequest::Read,
                    });
                }
                OpKind::Put if !op.sent => {
                    op.sent = true;
                    let payload = op.payload.take().unwrap_or_default();
                    issues.push(PendingIssue {
                        id,
                        ty: op.ty,
                        count: op.count,
                        request: IssueRequest::Put { payload },
                    });
                }
                _ => {}
            }
        }
        issues
    }

    /// Self-test: pool and ID index must agree.
    pub fn verify(&self) -> bool {
        self.pool.verify() && self.pool.len() == self.ids.len()
    }
}

/// A request frame that must be issued for a freshly installed channel.
pub(crate) struct PendingIssue {
    pub id: u32,
    pub ty: Option<FieldType>,
    pub count: u32,
    pub request: IssueRequest,
}

pub(crate) enum IssueRequest {
    Read,
    Put { payload: Vec<u8> },
    Event { mask: EventMask },
}

fn op_placeholder() -> IoOp {
    IoOp {
        id: 0,
        cid: 0,
        ty: None,
        count: 0,
        kind: OpKind::Read,
        cb: OpCallback::Read(Box::new(|_| {})),
        sent: false,
        payload: None,
    }
}

// ===== Tests =====

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc as StdArc;

    fn read_op(cid: u32, fired: &StdArc<AtomicU32>) -> IoOp {
        let fired = StdArc::clone(fired);
        IoOp {
            id: 0,
            cid,
            ty: Some(FieldType::F64),
            count: 1,
            kind: OpKind::Read,
            cb: OpCallback::Read(Box::new(move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            })),
            sent: true,
            payload: None,
        }
    }

    fn event_op(cid: u32, fired: &StdArc<AtomicU32>) -> IoOp {
        let fired = StdArc::clone(fired);
        IoOp {
            id: 0,
            cid,
            ty: Some(FieldType::F64),
            count: 1,
            kind: OpKind::Event {
                mask: EventMask::VALUE,
                armed: true,
            },
            cb: OpCallback::Event(StdArc::new(move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            })),
            sent: true,
            payload: None,
        }
    }

    #[test]
    fn test_register_take_exactly_once() {
        let fired = StdArc::new(AtomicU32::new(0));
        let mut ledger = Ledger::new();
        let id = ledger.register(read_op(1, &fired));
        assert!(id > 0);

        let op = ledger.take(id).expect("Op should be present");
        assert_eq!(op.id, id);
        // Second take finds nothing: completion cannot double-fire.
        assert!(ledger.take(id).is_none());
        assert!(ledger.verify());
    }

    #[test]
    fn test_disconnect_removes_oneshots_keeps_events() {
        let gate = CallbackGate::new();
        let read_fired = StdArc::new(AtomicU32::new(0));
        let event_fired = StdArc::new(AtomicU32::new(0));
        let mut ledger = Ledger::new();
        let read_id = ledger.register(read_op(1, &read_fired));
        let event_id = ledger.register(event_op(1, &event_fired));
        let other_id = ledger.register(read_op(2, &read_fired));

        let deliveries = ledger.disconnect_channel(1, ClientStatus::Disconnected);
        deliver_all(&gate, deliveries);

        assert_eq!(read_fired.load(Ordering::SeqCst), 1);
        assert_eq!(event_fired.load(Ordering::SeqCst), 1);
        assert!(ledger.get(read_id).is_none(), "one-shot must be removed");
        assert!(ledger.get(event_id).is_some(), "subscription must persist");
        assert!(ledger.get(other_id).is_some(), "other channel untouched");

        // The surviving subscription is unarmed and unsent.
        let op = ledger.get(event_id).unwrap();
        assert!(matches!(op.kind, OpKind::Event { armed: false, .. }));
        assert!(!op.sent);
    }

    #[test]
    fn test_pending_issues_rearms_subscriptions() {
        let fired = StdArc::new(AtomicU32::new(0));
        let mut ledger = Ledger::new();
        let event_id = ledger.register(event_op(1, &fired));
        ledger.disconnect_channel(1, ClientStatus::Disconnected);

        let issues = ledger.pending_issues(1);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].id, event_id);
        assert!(matches!(issues[0].request, IssueRequest::Event { .. }));

        // Re-armed: issuing again produces the subscription again (it is
        // always reissued on install), but its armed flag is set.
        let op = ledger.get(event_id).unwrap();
        assert!(matches!(op.kind, OpKind::Event { armed: true, .. }));
    }

    #[test]
    fn test_cancel_channel_fires_nothing() {
        let fired = StdArc::new(AtomicU32::new(0));
        let mut ledger = Ledger::new();
        ledger.register(read_op(3, &fired));
        ledger.register(event_op(3, &fired));
        ledger.cancel_channel(3);
        assert_eq!(ledger.len(), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(ledger.verify());
    }

    #[test]
    fn test_queued_put_payload_travels() {
        let fired = StdArc::new(AtomicU32::new(0));
        let mut ledger = Ledger::new();
        let fired2 = StdArc::clone(&fired);
        let id = ledger.register(IoOp {
            id: 0,
            cid: 9,
            ty: Some(FieldType::I32),
            count: 1,
            kind: OpKind::Put,
            cb: OpCallback::Put(Box::new(move |_| {
                fired2.fetch_add(1, Ordering::SeqCst);
            })),
            sent: false,
            payload: Some(vec![0, 0, 0, 42]),
        });

        let issues = ledger.pending_issues(9);
        assert_eq!(issues.len(), 1);
        match &issues[0].request {
            IssueRequest::Put { payload } => assert_eq!(payload, &vec![0, 0, 0, 42]),
            _ => panic!("expected put issue"),
        }
        assert!(ledger.get(id).unwrap().sent);
        // Issuing twice must not duplicate the put.
        assert!(ledger.pending_issues(9).is_empty());
    }

    #[test]
    fn test_ids_unique_under_churn() {
        let fired = StdArc::new(AtomicU32::new(0));
        let mut ledger = Ledger::new();
        let mut seen = std::collections::HashSet::new();
        for round in 0..50u32 {
            let id = ledger.register(read_op(round, &fired));
            assert!(seen.insert(id), "wire ID reused while live");
            if round % 2 == 0 {
                ledger.take(id);
            }
        }
        assert!(ledger.verify());
    }
}
