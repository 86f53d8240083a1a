// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client context: the engine instance behind every channel handle.
//!
//! [`Context`] owns the discovery thread, the circuit table and the
//! shared state. All public entry points funnel through the free
//! functions in this module: lock the primary state, mutate, collect
//! callback deliveries, unlock, deliver. No user callback ever runs
//! under the primary lock.
//!
//! Shutdown discipline: flip the flag, wake and join every worker
//! thread, then fail every still-pending operation with `Shutdown`
//! exactly once. Dropping the context does the same.

use crate::channel::{Chan, ChanState, Channel, ConnCallback, EventMask, SearchPhase};
use crate::circuit::{self, CircuitCmd, CircuitEntry, CircuitKey, FlowMode};
use crate::config::{ClientConfig, MAX_NAME_LEN, MAX_PRIORITY, SEARCH_DATAGRAM_MAX};
use crate::discovery::{self, beacon::BeaconTable, SearchState};
use crate::error::{ClientEvent, ClientStatus, Error, Result};
use crate::guard::{CallbackGate, StateLock};
use crate::ledger::{
    deliver_all, Delivery, EventCallback, ExceptionCallback, IoOp, Ledger, OpCallback, OpKind,
    PutCallback, ReadCallback,
};
use crate::protocol::search::SearchBatch;
use crate::protocol::value::{FieldType, Value};
use crate::protocol::{Command, Frame, MAX_PAYLOAD_LEN};
use crate::registry::{IdTable, Pool};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::net::Shutdown as SockShutdown;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

// ===== Shared engine state =====

/// Everything the worker threads share with the API surface.
pub(crate) struct Shared {
    pub config: ClientConfig,
    pub state: StateLock<ClientState>,
    pub gate: CallbackGate,
    /// Signaled by every inbound circuit frame and every teardown; waited
    /// on by flow-control and write-notify slots.
    pub flow_cv: Condvar,
    pub shutdown: AtomicBool,
    /// Handles of circuit threads whose entry is already gone (a circuit
    /// tearing itself down cannot join its own threads). Drained and
    /// joined at shutdown. Leaf lock: never held while taking the primary
    /// lock or the gate.
    pub defunct: Mutex<Vec<JoinHandle<()>>>,
}

/// All mutable engine state, behind the primary lock.
pub(crate) struct ClientState {
    pub chans: Pool<Chan>,
    /// Client channel ID -> channel pool handle.
    pub chan_ids: IdTable,
    pub ledger: Ledger,
    pub circuits: HashMap<CircuitKey, CircuitEntry>,
    pub search: SearchState,
    pub beacons: BeaconTable,
    pub exception_cb: Option<ExceptionCallback>,
}

impl ClientState {
    fn new() -> Self {
        Self {
            chans: Pool::new(),
            chan_ids: IdTable::new(),
            ledger: Ledger::new(),
            circuits: HashMap::new(),
            search: SearchState::new(Instant::now()),
            beacons: BeaconTable::new(),
            exception_cb: None,
        }
    }
}

// ===== Context =====

/// One client engine instance.
///
/// Contexts are independent: channels, circuits and worker threads are
/// never shared between them. The context joins all of its threads on
/// drop.
pub struct Context {
    shared: Arc<Shared>,
    discovery: Option<JoinHandle<()>>,
}

impl Context {
    /// Create a context configured from the environment.
    pub fn new() -> Result<Self> {
        Self::with_config(ClientConfig::from_env()?)
    }

    /// Create a context with an explicit configuration.
    pub fn with_config(config: ClientConfig) -> Result<Self> {
        let shared = Arc::new(Shared {
            config,
            state: StateLock::new(ClientState::new()),
            gate: CallbackGate::new(),
            flow_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            defunct: Mutex::new(Vec::new()),
        });
        let discovery = discovery::spawn(Arc::clone(&shared))?;
        log::info!("[CONTEXT] client context up (pvlink {})", crate::VERSION);
        Ok(Self {
            shared,
            discovery: Some(discovery),
        })
    }

    /// Install the context-wide exception handler.
    ///
    /// Receives conditions that belong to no single operation, such as
    /// duplicate search responders and unresponsive circuits.
    pub fn set_exception_handler(&self, handler: impl Fn(ClientEvent) + Send + Sync + 'static) {
        let mut g = self.shared.state.lock();
        g.exception_cb = Some(Arc::new(handler));
    }

    /// Create a channel for a named process variable.
    ///
    /// The channel starts searching immediately; operations issued before
    /// it connects are queued and issued at connection time.
    pub fn create_channel(&self, name: &str, priority: u8) -> Result<Channel> {
        if self.shared.shutdown.load(Ordering::Relaxed) {
            return Err(Error::Shutdown);
        }
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(Error::InvalidName(name.into()));
        }
        if priority > MAX_PRIORITY {
            return Err(Error::InvalidPriority(priority));
        }

        let mut g = self.shared.state.lock();
        let handle = g.chans.insert(Chan::new(name.into(), priority));
        let cid = g.chan_ids.assign(handle);
        if let Some(chan) = g.chans.get_mut(handle) {
            chan.cid = cid;
            chan.state = ChanState::Searching {
                tier: 0,
                phase: SearchPhase::RequestPending,
            };
        }
        g.search.enqueue(cid, 0, Instant::now());
        log::debug!("[CONTEXT] channel {:?} created (cid={})", name, cid);
        Ok(Channel {
            cid,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Number of channels still unresolved by discovery.
    pub fn pending_searches(&self) -> usize {
        self.shared.state.lock().search.pending()
    }

    /// Number of open circuits.
    pub fn circuit_count(&self) -> usize {
        self.shared.state.lock().circuits.len()
    }

    /// Shut the context down now instead of at drop.
    pub fn shutdown(&mut self) {
        self.shutdown_impl();
    }

    fn shutdown_impl(&mut self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("[CONTEXT] shutting down");

        let mut handles = Vec::new();
        {
            let mut g = self.shared.state.lock();
            for entry in g.circuits.values_mut() {
                let _ = entry.tx.send(CircuitCmd::Shutdown);
                if let Some(stream) = entry.stream.take() {
                    let _ = stream.shutdown(SockShutdown::Both);
                }
                if let Some(h) = entry.recv_handle.take() {
                    handles.push(h);
                }
                if let Some(h) = entry.send_handle.take() {
                    handles.push(h);
                }
            }
        }
        self.shared.flow_cv.notify_all();
        for h in handles {
            let _ = h.join();
        }
        if let Some(h) = self.discovery.take() {
            let _ = h.join();
        }

        // A recv thread joined above may have installed its send handle
        // after the first sweep; collect stragglers now that no circuit
        // thread is running.
        let mut late = Vec::new();
        {
            let mut g = self.shared.state.lock();
            for entry in g.circuits.values_mut() {
                if let Some(h) = entry.send_handle.take() {
                    late.push(h);
                }
            }
        }
        late.extend(self.shared.defunct.lock().drain(..));
        for h in late {
            let _ = h.join();
        }

        // Workers are gone; fail everything still pending exactly once.
        let mut deliveries = Vec::new();
        {
            let mut g = self.shared.state.lock();
            let cids: Vec<u32> = g.chan_ids.iter().map(|(cid, _)| cid).collect();
            for cid in cids {
                deliveries.extend(g.ledger.disconnect_channel(cid, ClientStatus::Shutdown));
            }
            g.circuits.clear();
        }
        deliver_all(&self.shared.gate, deliveries);
        log::info!("[CONTEXT] shutdown complete");
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.shutdown_impl();
    }
}

// ===== Discovery tick (called from the discovery thread) =====

/// Fire every due search tier: advance each drained channel to the next
/// tier and pack its name into bounded datagrams.
pub(crate) fn search_tick(shared: &Arc<Shared>, now: Instant) -> Vec<Vec<u8>> {
    let mut g = shared.state.lock();
    let mut datagrams = Vec::new();
    for tier in g.search.due_tiers(now) {
        let cids = g.search.drain(tier);
        let mut batch = SearchBatch::new(SEARCH_DATAGRAM_MAX);
        // Escalation follows set membership, not the tier recorded in the
        // channel state: a boost moves membership without rewriting every
        // channel.
        let next = tier.saturating_add(1).min(crate::config::SEARCH_TIER_COUNT - 1);
        for cid in cids {
            let Some(handle) = g.chan_ids.lookup(cid) else {
                continue;
            };
            let name = {
                let Some(chan) = g.chans.get_mut(handle) else {
                    continue;
                };
                if !matches!(chan.state, ChanState::Searching { .. }) {
                    continue; // claimed by a circuit since the drain
                }
                chan.state = ChanState::Searching {
                    tier: next,
                    phase: SearchPhase::ResponsePending,
                };
                Arc::clone(&chan.name)
            };
            if !batch.push(cid, &name) {
                if let Some(done) =
                    std::mem::replace(&mut batch, SearchBatch::new(SEARCH_DATAGRAM_MAX)).finish()
                {
                    datagrams.push(done);
                }
                // A fresh batch always fits one bounded name.
                batch.push(cid, &name);
            }
            g.search
                .enqueue(cid, next, now + shared.config.search_interval(next));
        }
        if let Some(done) = batch.finish() {
            datagrams.push(done);
        }
    }
    datagrams
}

// ===== Channel operations (called from the Channel handle) =====

pub(crate) fn channel_name(shared: &Arc<Shared>, cid: u32) -> Result<Arc<str>> {
    let g = shared.state.lock();
    let handle = g.chan_ids.lookup(cid).ok_or(Error::StaleChannel)?;
    let chan = g.chans.get(handle).ok_or(Error::StaleChannel)?;
    Ok(Arc::clone(&chan.name))
}

pub(crate) fn channel_connected(shared: &Arc<Shared>, cid: u32) -> bool {
    let g = shared.state.lock();
    g.chan_ids
        .lookup(cid)
        .and_then(|h| g.chans.get(h))
        .is_some_and(Chan::is_connected)
}

pub(crate) fn channel_native(shared: &Arc<Shared>, cid: u32) -> Result<(FieldType, u32)> {
    let g = shared.state.lock();
    let handle = g.chan_ids.lookup(cid).ok_or(Error::StaleChannel)?;
    let chan = g.chans.get(handle).ok_or(Error::StaleChannel)?;
    chan.native().ok_or(Error::NotConnected)
}

pub(crate) fn channel_rights(shared: &Arc<Shared>, cid: u32) -> Result<crate::channel::AccessRights> {
    let g = shared.state.lock();
    let handle = g.chan_ids.lookup(cid).ok_or(Error::StaleChannel)?;
    let chan = g.chans.get(handle).ok_or(Error::StaleChannel)?;
    if !chan.is_connected() {
        return Err(Error::NotConnected);
    }
    Ok(chan.rights)
}

pub(crate) fn channel_host(shared: &Arc<Shared>, cid: u32) -> Result<String> {
    let g = shared.state.lock();
    let handle = g.chan_ids.lookup(cid).ok_or(Error::StaleChannel)?;
    let chan = g.chans.get(handle).ok_or(Error::StaleChannel)?;
    match chan.current_key() {
        Some(key) => Ok(key.0.to_string()),
        None => Err(Error::NotConnected),
    }
}

pub(crate) fn set_channel_handler(
    shared: &Arc<Shared>,
    cid: u32,
    cb: ConnCallback,
) -> Result<()> {
    let mut g = shared.state.lock();
    let handle = g.chan_ids.lookup(cid).ok_or(Error::StaleChannel)?;
    let chan = g.chans.get_mut(handle).ok_or(Error::StaleChannel)?;
    chan.conn_cb = Some(cb);
    Ok(())
}

/// Snapshot of the channel facts an issue path needs, taken under the
/// lock in one place.
struct ChanFacts {
    attachment: Option<(CircuitKey, u32)>,
    native: Option<(FieldType, u32)>,
    rights: crate::channel::AccessRights,
}

fn chan_facts(g: &ClientState, cid: u32) -> Result<ChanFacts> {
    let handle = g.chan_ids.lookup(cid).ok_or(Error::StaleChannel)?;
    let chan = g.chans.get(handle).ok_or(Error::StaleChannel)?;
    Ok(ChanFacts {
        attachment: chan.attachment(),
        native: chan.native(),
        rights: chan.rights,
    })
}

/// Reject a value payload that exceeds either the configured array limit
/// or the hard wire bound (`payload_len` is 16 bits, so no frame can
/// carry more than `MAX_PAYLOAD_LEN` bytes regardless of configuration).
fn check_payload_size(shared: &Shared, value: &Value) -> Result<()> {
    let cap = shared.config.max_array_bytes.min(MAX_PAYLOAD_LEN);
    if value.wire_size() > cap {
        return Err(Error::ArrayTooLarge {
            bytes: value.wire_size(),
            max: cap,
        });
    }
    Ok(())
}

fn check_count(requested: u32, native: Option<(FieldType, u32)>) -> Result<()> {
    if let Some((_, native_count)) = native {
        if requested > native_count {
            return Err(Error::BadCount {
                requested,
                native: native_count,
            });
        }
    }
    Ok(())
}

pub(crate) fn issue_read(
    shared: &Arc<Shared>,
    cid: u32,
    ty: Option<FieldType>,
    count: u32,
    cb: ReadCallback,
) -> Result<u32> {
    if shared.shutdown.load(Ordering::Relaxed) {
        return Err(Error::Shutdown);
    }
    let mut deliveries = Vec::new();
    let result = {
        let mut g = shared.state.lock();
        let facts = chan_facts(&g, cid)?;
        if facts.attachment.is_some() && !facts.rights.read {
            return Err(Error::NoReadAccess);
        }
        check_count(count, facts.native)?;

        let sent = facts.attachment.is_some();
        let id = g.ledger.register(IoOp {
            id: 0,
            cid,
            ty,
            count,
            kind: OpKind::Read,
            cb: OpCallback::Read(cb),
            sent,
            payload: None,
        });
        track_op(&mut g, cid, id);

        if let Some((key, sid)) = facts.attachment {
            let (native, native_count) = facts.native.unwrap_or((FieldType::F64, 1));
            let ty = ty.unwrap_or(native);
            let n = if count == 0 { native_count } else { count };
            let frame = Frame::control(Command::Read, ty as u16, n as u16, sid, id);
            issue_or_unwind(shared, &mut g, key, frame, FlowMode::Blocking, id, &mut deliveries)?;
        }
        Ok(id)
    };
    deliver_all(&shared.gate, deliveries);
    result
}

pub(crate) fn issue_write(shared: &Arc<Shared>, cid: u32, value: &Value) -> Result<()> {
    if shared.shutdown.load(Ordering::Relaxed) {
        return Err(Error::Shutdown);
    }
    check_payload_size(shared, value)?;
    let mut deliveries = Vec::new();
    let result = {
        let mut g = shared.state.lock();
        let facts = chan_facts(&g, cid)?;
        // Plain writes are not ledgered, so there is nothing to queue for
        // a disconnected channel.
        let Some((key, sid)) = facts.attachment else {
            return Err(Error::NotConnected);
        };
        if !facts.rights.write {
            return Err(Error::NoWriteAccess);
        }
        check_count(value.count(), facts.native)?;

        let mut payload = Vec::with_capacity(value.wire_size());
        value.encode_into(&mut payload);
        let frame = Frame::new(
            Command::Write,
            value.field_type() as u16,
            value.count() as u16,
            sid,
            0,
            payload,
        );
        circuit::queue_request(shared, &mut g, key, frame, FlowMode::FireAndForget, &mut deliveries)
    };
    deliver_all(&shared.gate, deliveries);
    result
}

pub(crate) fn issue_write_notify(
    shared: &Arc<Shared>,
    cid: u32,
    value: &Value,
    cb: PutCallback,
) -> Result<u32> {
    if shared.shutdown.load(Ordering::Relaxed) {
        return Err(Error::Shutdown);
    }
    check_payload_size(shared, value)?;
    let mut deliveries = Vec::new();
    let result = {
        let mut g = shared.state.lock();

        // One write-notify per channel: wait (bounded) for the slot.
        loop {
            let handle = g.chan_ids.lookup(cid).ok_or(Error::StaleChannel)?;
            let chan = g.chans.get(handle).ok_or(Error::StaleChannel)?;
            if !chan.put_busy {
                break;
            }
            if g
                .wait_for(&shared.flow_cv, crate::config::REQUEST_TIMEOUT)
                .timed_out()
            {
                return Err(Error::RequestTimeout);
            }
            if shared.shutdown.load(Ordering::Relaxed) {
                return Err(Error::Shutdown);
            }
        }

        let facts = chan_facts(&g, cid)?;
        if facts.attachment.is_some() && !facts.rights.write {
            return Err(Error::NoWriteAccess);
        }
        check_count(value.count(), facts.native)?;

        let mut payload = Vec::with_capacity(value.wire_size());
        value.encode_into(&mut payload);
        let sent = facts.attachment.is_some();
        let id = g.ledger.register(IoOp {
            id: 0,
            cid,
            ty: Some(value.field_type()),
            count: value.count(),
            kind: OpKind::Put,
            cb: OpCallback::Put(cb),
            sent,
            payload: if sent { None } else { Some(payload.clone()) },
        });
        track_op(&mut g, cid, id);
        set_put_busy(&mut g, cid, true);

        if let Some((key, sid)) = facts.attachment {
            let frame = Frame::new(
                Command::WriteNotify,
                value.field_type() as u16,
                value.count() as u16,
                sid,
                id,
                payload,
            );
            if let Err(err) =
                issue_or_unwind(shared, &mut g, key, frame, FlowMode::Blocking, id, &mut deliveries)
            {
                set_put_busy(&mut g, cid, false);
                return Err(err);
            }
        }
        Ok(id)
    };
    deliver_all(&shared.gate, deliveries);
    result
}

pub(crate) fn issue_subscribe(
    shared: &Arc<Shared>,
    cid: u32,
    ty: Option<FieldType>,
    count: u32,
    mask: EventMask,
    cb: EventCallback,
) -> Result<u32> {
    if shared.shutdown.load(Ordering::Relaxed) {
        return Err(Error::Shutdown);
    }
    let mut deliveries = Vec::new();
    let result = {
        let mut g = shared.state.lock();
        let facts = chan_facts(&g, cid)?;
        if facts.attachment.is_some() && !facts.rights.read {
            return Err(Error::NoReadAccess);
        }
        check_count(count, facts.native)?;

        let connected = facts.attachment.is_some();
        let id = g.ledger.register(IoOp {
            id: 0,
            cid,
            ty,
            count,
            kind: OpKind::Event {
                mask,
                armed: connected,
            },
            cb: OpCallback::Event(cb),
            sent: connected,
            payload: None,
        });
        track_op(&mut g, cid, id);

        if let Some((key, sid)) = facts.attachment {
            let (native, native_count) = facts.native.unwrap_or((FieldType::F64, 1));
            let ty = ty.unwrap_or(native);
            let n = if count == 0 { native_count } else { count };
            let frame = Frame::new(
                Command::EventAdd,
                ty as u16,
                n as u16,
                sid,
                id,
                mask.bits().to_be_bytes().to_vec(),
            );
            issue_or_unwind(shared, &mut g, key, frame, FlowMode::Blocking, id, &mut deliveries)?;
        }
        Ok(id)
    };
    deliver_all(&shared.gate, deliveries);
    result
}

/// Cancel an operation. The callback is dropped without firing; a
/// response already in flight misses the ledger on arrival and is
/// ignored.
pub(crate) fn cancel_op(shared: &Arc<Shared>, cid: u32, op_id: u32) -> Result<()> {
    let mut g = shared.state.lock();
    let handle = g.chan_ids.lookup(cid).ok_or(Error::StaleChannel)?;

    let armed_event = match g.ledger.get(op_id) {
        Some(op) if op.cid == cid => {
            matches!(op.kind, OpKind::Event { armed: true, .. })
        }
        _ => return Err(Error::UnknownOp(op_id)),
    };
    let attachment = g
        .chans
        .get(handle)
        .ok_or(Error::StaleChannel)?
        .attachment();

    let Some(op) = g.ledger.take(op_id) else {
        return Err(Error::UnknownOp(op_id));
    };
    if let Some(chan) = g.chans.get_mut(handle) {
        chan.ops.remove(&op_id);
        if matches!(op.kind, OpKind::Put) {
            chan.put_busy = false;
        }
    }

    // The server only knows about armed subscriptions.
    if armed_event {
        if let Some((key, sid)) = attachment {
            if let Some(entry) = g.circuits.get_mut(&key) {
                let frame = Frame::control(Command::EventCancel, 0, 0, sid, op_id);
                let _ = entry.tx.send(CircuitCmd::Frame(frame.encode()));
            }
        }
    }
    drop(g);
    shared.flow_cv.notify_all();
    Ok(())
}

/// Destroy a channel: cancel all of its operations silently, detach it
/// from its circuit or search tier, and drop the record. Runs from the
/// handle's `Drop`, so it must tolerate any state.
pub(crate) fn destroy_channel(shared: &Arc<Shared>, cid: u32) {
    let mut g = shared.state.lock();
    let Some(handle) = g.chan_ids.remove(cid) else {
        return;
    };
    g.ledger.cancel_channel(cid);
    let Some(chan) = g.chans.remove(handle) else {
        return;
    };
    log::debug!("[CONTEXT] channel {:?} destroyed (cid={})", chan.name, cid);

    match chan.state {
        ChanState::Virgin => {}
        ChanState::Searching { .. } => g.search.remove(cid),
        ChanState::Attaching { key } | ChanState::Connected { key, .. } => {
            if let Some(entry) = g.circuits.get_mut(&key) {
                entry.attached.remove(&cid);
                let sid = match chan.state {
                    ChanState::Connected { sid, .. } => sid,
                    _ => cid,
                };
                let frame = Frame::control(Command::ClearChannel, 0, 0, sid, cid);
                let _ = entry.tx.send(CircuitCmd::Frame(frame.encode()));
            }
        }
    }
    drop(g);
    shared.flow_cv.notify_all();
}

// ===== Internal helpers =====

fn track_op(g: &mut ClientState, cid: u32, id: u32) {
    if let Some(handle) = g.chan_ids.lookup(cid) {
        if let Some(chan) = g.chans.get_mut(handle) {
            chan.ops.insert(id);
        }
    }
}

fn set_put_busy(g: &mut ClientState, cid: u32, busy: bool) {
    if let Some(handle) = g.chan_ids.lookup(cid) {
        if let Some(chan) = g.chans.get_mut(handle) {
            chan.put_busy = busy;
        }
    }
}

/// Queue a request for a just-registered operation; on failure the
/// operation is unregistered so the caller's error is its only signal.
/// If the operation vanished while waiting for window space, a teardown
/// already completed it and the queue failure is not surfaced.
fn issue_or_unwind(
    shared: &Shared,
    g: &mut crate::guard::StateGuard<'_, ClientState>,
    key: CircuitKey,
    frame: Frame,
    mode: FlowMode,
    id: u32,
    deliveries: &mut Vec<Delivery>,
) -> Result<()> {
    match circuit::queue_request(shared, g, key, frame, mode, deliveries) {
        Ok(()) => Ok(()),
        Err(err) => {
            if let Some(op) = g.ledger.take(id) {
                if let Some(handle) = g.chan_ids.lookup(op.cid) {
                    if let Some(chan) = g.chans.get_mut(handle) {
                        chan.ops.remove(&id);
                    }
                }
                Err(err)
            } else {
                Ok(())
            }
        }
    }
}

// ===== Tests =====

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;
    use std::time::Duration;

    fn quiet_config() -> ClientConfig {
        // Unicast to a port nothing listens on; searches go nowhere.
        let dead: SocketAddr = "127.0.0.1:1".parse().unwrap();
        ClientConfig::default()
            .with_addr_list(vec![dead])
            .with_search_base_interval(Duration::from_millis(20))
    }

    #[test]
    fn test_create_channel_validation() {
        let ctx = Context::with_config(quiet_config()).expect("Context should start");
        assert!(matches!(
            ctx.create_channel("", 0),
            Err(Error::InvalidName(_))
        ));
        assert!(matches!(
            ctx.create_channel(&"x".repeat(600), 0),
            Err(Error::InvalidName(_))
        ));
        assert!(matches!(
            ctx.create_channel("pv:ok", 100),
            Err(Error::InvalidPriority(100))
        ));
    }

    #[test]
    fn test_unresolved_channel_queues_operations() {
        let ctx = Context::with_config(quiet_config()).expect("Context should start");
        let ch = ctx.create_channel("pv:queued", 0).expect("Channel");
        assert!(!ch.is_connected());
        assert_eq!(ctx.pending_searches(), 1);
        assert!(matches!(ch.native_type(), Err(Error::NotConnected)));

        // Reads and subscriptions queue while unresolved.
        let read_id = ch.read(|_| {}).expect("Read should queue");
        let sub_id = ch.subscribe(EventMask::VALUE, |_| {}).expect("Subscribe");
        assert_ne!(read_id, sub_id);

        // Plain writes have no queue to live in.
        assert!(matches!(
            ch.write(&Value::F64(vec![1.0])),
            Err(Error::NotConnected)
        ));
    }

    #[test]
    fn test_writes_over_wire_limit_rejected() {
        let ctx = Context::with_config(quiet_config()).expect("Context should start");
        let ch = ctx.create_channel("pv:huge", 0).expect("Channel");

        // 80,000 bytes: under the configured array limit, over what one
        // frame's 16-bit payload length can carry.
        let big = Value::F64(vec![0.0; 10_000]);
        assert!(big.wire_size() < ctx.shared.config.max_array_bytes);
        assert!(matches!(
            ch.write(&big),
            Err(Error::ArrayTooLarge { bytes: 80_000, .. })
        ));
        assert!(matches!(
            ch.write_notify(&big, |_| {}),
            Err(Error::ArrayTooLarge { .. })
        ));
    }

    #[test]
    fn test_cancel_drops_callback_silently() {
        let fired = Arc::new(AtomicU32::new(0));
        let ctx = Context::with_config(quiet_config()).expect("Context should start");
        let ch = ctx.create_channel("pv:cancel", 0).expect("Channel");

        let f = Arc::clone(&fired);
        let id = ch
            .read(move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .expect("Read should queue");
        ch.cancel(id).expect("Cancel should succeed");
        assert!(matches!(ch.cancel(id), Err(Error::UnknownOp(_))));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_destroyed_channel_goes_stale() {
        let ctx = Context::with_config(quiet_config()).expect("Context should start");
        let ch = ctx.create_channel("pv:gone", 0).expect("Channel");
        let ch2 = ctx.create_channel("pv:stays", 0).expect("Channel");
        assert_eq!(ctx.pending_searches(), 2);

        drop(ch);
        assert_eq!(ctx.pending_searches(), 1);
        assert!(ch2.name().is_ok());
    }

    #[test]
    fn test_shutdown_fails_pending_ops_once() {
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let mut ctx = Context::with_config(quiet_config()).expect("Context should start");
        let ch = ctx.create_channel("pv:pending", 0).expect("Channel");

        let o = Arc::clone(&outcomes);
        ch.read(move |result| {
            o.lock().unwrap().push(result.map(|_| ()));
        })
        .expect("Read should queue");

        ctx.shutdown();
        let got = outcomes.lock().unwrap().clone();
        assert_eq!(got, vec![Err(ClientStatus::Shutdown)]);

        // The context rejects new work after shutdown.
        assert!(matches!(
            ctx.create_channel("pv:late", 0),
            Err(Error::Shutdown)
        ));
        drop(ch);
    }

    #[test]
    fn test_search_tick_escalates_tiers() {
        let ctx = Context::with_config(quiet_config()).expect("Context should start");
        let _ch = ctx.create_channel("pv:tiers", 0).expect("Channel");

        let datagrams = search_tick(&ctx.shared, Instant::now());
        // The discovery thread may have raced us to the tick; either way
        // the channel must now sit in tier 1 or higher, still pending.
        assert_eq!(ctx.pending_searches(), 1);
        for d in &datagrams {
            assert!(!d.is_empty());
        }
    }
}
