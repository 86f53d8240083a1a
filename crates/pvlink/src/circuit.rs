// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCP circuits: one multiplexed connection per (server, priority).
//!
//! A circuit is created lazily when the first search answer points at a
//! server, and carries every channel of that (address, priority) pair.
//! Two threads serve it: a receive thread that owns the read half,
//! parses frames and dispatches them under the primary lock, and a send
//! thread that drains a command queue onto the write half. All state
//! mutation happens on the dispatch path; the send thread never touches
//! shared state.
//!
//! Flow control is a contiguous-unacknowledged-frame window: any inbound
//! frame resets the counter. Blocking requests wait on the flow condvar
//! when the window is full; fire-and-forget writes are queued anyway and
//! the circuit is flagged unresponsive instead.
//!
//! Any malformed frame tears the whole circuit down. Channels migrate
//! back to the discovery engine at the fastest tier; the process never
//! dies because a peer misbehaves.

use crate::channel::{AccessRights, ChanState, ConnectionEvent, SearchPhase};
use crate::config::{CONNECT_TIMEOUT, FLOW_CONTROL_WINDOW, POLL_INTERVAL, PROTOCOL_VERSION, REQUEST_TIMEOUT};
use crate::context::{ClientState, Shared};
use crate::error::{ClientEvent, ClientStatus, Error, Result};
use crate::guard::StateGuard;
use crate::ledger::{deliver_all, Delivery, IssueRequest, OpCallback, OpKind, PendingIssue};
use crate::protocol::value::{FieldType, Value};
use crate::protocol::{decode_string, encode_string, Command, Frame};
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Circuit identity: server endpoint plus priority band.
///
/// Channels of different priorities never share a circuit, so one slow
/// low-priority transfer cannot head-of-line-block a high-priority one.
pub(crate) type CircuitKey = (SocketAddr, u8);

/// Commands accepted by a circuit's send thread.
pub(crate) enum CircuitCmd {
    /// Encoded frame to put on the wire.
    Frame(Vec<u8>),
    /// Stop the send thread.
    Shutdown,
}

/// Request issuance discipline for [`queue_request`].
pub(crate) enum FlowMode {
    /// Wait (bounded) for window space; fail with `RequestTimeout`.
    Blocking,
    /// Queue regardless; flag the circuit unresponsive when over window.
    FireAndForget,
    /// Housekeeping frames (attach, detach, echo); never counted.
    Control,
}

/// Per-circuit record (primary lock).
pub(crate) struct CircuitEntry {
    pub key: CircuitKey,
    pub tx: Sender<CircuitCmd>,
    /// Client IDs of channels attached (or attaching) to this circuit.
    pub attached: HashSet<u32>,
    /// Peer minor protocol version, 0 until the Version frame arrives.
    pub version: u16,
    /// Frames sent since the last inbound frame.
    pub unacked: u32,
    /// Window overflowed without acknowledgment; cleared by any inbound
    /// frame.
    pub unresponsive: bool,
    /// TCP connect has completed.
    pub connected: bool,
    /// Clone of the stream, kept so shutdown can unblock the reader.
    pub stream: Option<TcpStream>,
    /// Receive-thread handle, joined at context shutdown.
    pub recv_handle: Option<JoinHandle<()>>,
    /// Send-thread handle, installed once the circuit connects; joined at
    /// context shutdown.
    pub send_handle: Option<JoinHandle<()>>,
}

// ===== Attach path (called from discovery) =====

/// Claim a resolved channel for the circuit named by the search answer,
/// creating the circuit if this is its first channel.
pub(crate) fn attach_channel(
    shared: &Arc<Shared>,
    state: &mut ClientState,
    answer: crate::protocol::search::SearchAnswer,
) {
    let Some(handle) = state.chan_ids.lookup(answer.cid) else {
        return;
    };
    let (priority, name) = {
        let Some(chan) = state.chans.get(handle) else {
            return;
        };
        (chan.priority, Arc::clone(&chan.name))
    };
    let key = (answer.server, priority);

    let Some(entry) = find_or_create(shared, state, key) else {
        // Could not spawn the circuit; keep searching.
        if let Some(chan) = state.chans.get_mut(handle) {
            chan.state = ChanState::Searching {
                tier: 0,
                phase: SearchPhase::RequestPending,
            };
        }
        state.search.enqueue(answer.cid, 0, Instant::now());
        return;
    };
    entry.attached.insert(answer.cid);
    let attach = Frame::new(
        Command::CreateChannel,
        0,
        PROTOCOL_VERSION,
        answer.cid,
        answer.cid,
        encode_string(&name),
    );
    let _ = entry.tx.send(CircuitCmd::Frame(attach.encode()));

    if let Some(chan) = state.chans.get_mut(handle) {
        chan.state = ChanState::Attaching { key };
    }
}

fn find_or_create<'a>(
    shared: &Arc<Shared>,
    state: &'a mut ClientState,
    key: CircuitKey,
) -> Option<&'a mut CircuitEntry> {
    if !state.circuits.contains_key(&key) {
        let (tx, rx) = unbounded();
        let spawned = thread::Builder::new()
            .name(format!("pvlink-circuit-{}", key.0))
            .spawn({
                let shared = Arc::clone(shared);
                move || run_circuit(shared, key, rx)
            });
        let recv_handle = match spawned {
            Ok(h) => Some(h),
            Err(err) => {
                log::error!("[CIRCUIT] cannot spawn thread for {}: {}", key.0, err);
                return None;
            }
        };
        log::info!("[CIRCUIT] opening circuit to {} priority {}", key.0, key.1);
        state.circuits.insert(
            key,
            CircuitEntry {
                key,
                tx,
                attached: HashSet::new(),
                version: 0,
                unacked: 0,
                unresponsive: false,
                connected: false,
                stream: None,
                recv_handle,
                send_handle: None,
            },
        );
    }
    state.circuits.get_mut(&key)
}

// ===== Request issuance =====

/// Queue a request frame on a circuit under the flow-control discipline.
///
/// Must be called with the primary lock held (the guard is the proof).
/// Window waits release the lock; the circuit is re-validated after every
/// wake because it may have been torn down while waiting.
pub(crate) fn queue_request(
    shared: &Shared,
    g: &mut StateGuard<'_, ClientState>,
    key: CircuitKey,
    frame: Frame,
    mode: FlowMode,
    deliveries: &mut Vec<Delivery>,
) -> Result<()> {
    match mode {
        FlowMode::Blocking => loop {
            if shared.shutdown.load(Ordering::Relaxed) {
                return Err(Error::Shutdown);
            }
            let Some(entry) = g.circuits.get(&key) else {
                return Err(Error::NotConnected);
            };
            if entry.unacked < FLOW_CONTROL_WINDOW {
                break;
            }
            if g.wait_for(&shared.flow_cv, REQUEST_TIMEOUT).timed_out() {
                return Err(Error::RequestTimeout);
            }
        },
        FlowMode::FireAndForget => {
            let cb = g.exception_cb.clone();
            if let Some(entry) = g.circuits.get_mut(&key) {
                if entry.unacked >= FLOW_CONTROL_WINDOW && !entry.unresponsive {
                    entry.unresponsive = true;
                    log::warn!("[CIRCUIT] {} over flow-control window, flagging unresponsive", key.0);
                    if let Some(cb) = cb {
                        deliveries.push(Delivery::Client(
                            cb,
                            ClientEvent::CircuitUnresponsive { server: key.0 },
                        ));
                    }
                }
            }
        }
        FlowMode::Control => {}
    }

    let Some(entry) = g.circuits.get_mut(&key) else {
        return Err(Error::NotConnected);
    };
    if !matches!(mode, FlowMode::Control) {
        entry.unacked += 1;
    }
    entry
        .tx
        .send(CircuitCmd::Frame(frame.encode()))
        .map_err(|_| Error::NotConnected)
}

// ===== Circuit threads =====

fn run_circuit(shared: Arc<Shared>, key: CircuitKey, rx: Receiver<CircuitCmd>) {
    let stream = match TcpStream::connect_timeout(&key.0, CONNECT_TIMEOUT) {
        Ok(s) => s,
        Err(err) => {
            log::warn!("[CIRCUIT] connect to {} failed: {}", key.0, err);
            circuit_lost(&shared, key, ClientStatus::Disconnected, None);
            return;
        }
    };
    let _ = stream.set_nodelay(true);
    let _ = stream.set_read_timeout(Some(POLL_INTERVAL));
    let (write_half, shutdown_half) = match (stream.try_clone(), stream.try_clone()) {
        (Ok(w), Ok(s)) => (w, s),
        _ => {
            log::warn!("[CIRCUIT] cannot clone stream for {}", key.0);
            circuit_lost(&shared, key, ClientStatus::Disconnected, None);
            return;
        }
    };

    let verify = shared.config.conn_verify_interval;
    let send_handle = match thread::Builder::new()
        .name(format!("pvlink-send-{}", key.0))
        .spawn(move || run_sender(write_half, rx, key, verify))
    {
        Ok(h) => h,
        Err(err) => {
            log::error!("[CIRCUIT] cannot spawn send thread for {}: {}", key.0, err);
            circuit_lost(&shared, key, ClientStatus::Disconnected, None);
            return;
        }
    };

    {
        let mut g = shared.state.lock();
        let Some(entry) = g.circuits.get_mut(&key) else {
            // Torn down while connecting; the sender exits when it sees
            // the dropped queue, shutdown joins it from the defunct list.
            let _ = stream.shutdown(Shutdown::Both);
            shared.defunct.lock().push(send_handle);
            return;
        };
        entry.connected = true;
        entry.stream = Some(shutdown_half);
        entry.send_handle = Some(send_handle);
    }
    log::info!("[CIRCUIT] connected to {} priority {}", key.0, key.1);

    recv_loop(&shared, key, stream);
}

/// Send thread: handshake, then drain the command queue. Sends an Echo
/// when the queue stays idle for the verification interval so a healthy
/// but quiet circuit keeps proving itself.
fn run_sender(mut stream: TcpStream, rx: Receiver<CircuitCmd>, key: CircuitKey, verify: Duration) {
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".into());
    let host = local_ip_address::local_ip()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|_| "localhost".into());
    let mut handshake = Vec::new();
    Frame::control(Command::Version, u16::from(key.1), PROTOCOL_VERSION, 0, 0)
        .encode_into(&mut handshake);
    Frame::new(Command::ClientName, 0, 0, 0, 0, encode_string(&user)).encode_into(&mut handshake);
    Frame::new(Command::HostName, 0, 0, 0, 0, encode_string(&host)).encode_into(&mut handshake);
    if stream.write_all(&handshake).is_err() {
        return; // recv side will observe the broken stream
    }

    loop {
        match rx.recv_timeout(verify) {
            Ok(CircuitCmd::Frame(bytes)) => {
                if let Err(err) = stream.write_all(&bytes) {
                    log::debug!("[CIRCUIT] write to {} failed: {}", key.0, err);
                    return;
                }
            }
            Ok(CircuitCmd::Shutdown) | Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {
                let echo = Frame::control(Command::Echo, 0, 0, 0, 0).encode();
                if stream.write_all(&echo).is_err() {
                    return;
                }
            }
        }
    }
}

fn recv_loop(shared: &Arc<Shared>, key: CircuitKey, mut stream: TcpStream) {
    let verify = shared.config.conn_verify_interval;
    let max_payload = shared.config.max_array_bytes;
    let mut acc: Vec<u8> = Vec::new();
    let mut buf = [0u8; 8192];
    let mut last_rx = Instant::now();
    let mut probed = false;

    loop {
        if shared.shutdown.load(Ordering::Relaxed) {
            return;
        }

        match stream.read(&mut buf) {
            Ok(0) => {
                log::info!("[CIRCUIT] {} closed by peer", key.0);
                circuit_lost(shared, key, ClientStatus::Disconnected, None);
                return;
            }
            Ok(n) => {
                acc.extend_from_slice(&buf[..n]);
                last_rx = Instant::now();
                probed = false;
                if let Err(msg) = drain_frames(shared, key, &mut acc, max_payload) {
                    log::error!("[CIRCUIT] protocol error on {}: {}", key.0, msg);
                    circuit_lost(shared, key, ClientStatus::Disconnected, None);
                    return;
                }
            }
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut => {}
            Err(err) => {
                log::warn!("[CIRCUIT] read from {} failed: {}", key.0, err);
                circuit_lost(shared, key, ClientStatus::Disconnected, None);
                return;
            }
        }

        // Echo watchdog: one probe after a silent verify interval, teardown
        // after a second one goes unanswered.
        let idle = last_rx.elapsed();
        if idle > verify * 2 {
            log::warn!("[CIRCUIT] {} unresponsive for {:?}", key.0, idle);
            circuit_lost(
                shared,
                key,
                ClientStatus::Disconnected,
                Some(ClientEvent::CircuitUnresponsive { server: key.0 }),
            );
            return;
        }
        if idle > verify && !probed {
            probed = true;
            let echo = Frame::control(Command::Echo, 0, 0, 0, 0);
            let g = shared.state.lock();
            if let Some(entry) = g.circuits.get(&key) {
                let _ = entry.tx.send(CircuitCmd::Frame(echo.encode()));
            }
        }
    }
}

/// Parse every complete frame out of the accumulator and dispatch it.
fn drain_frames(
    shared: &Arc<Shared>,
    key: CircuitKey,
    acc: &mut Vec<u8>,
    max_payload: usize,
) -> std::result::Result<(), String> {
    let mut off = 0;
    let mut frames = Vec::new();
    loop {
        match Frame::parse(&acc[off..], max_payload) {
            Ok(Some((frame, consumed))) => {
                frames.push(frame);
                off += consumed;
            }
            Ok(None) => break,
            Err(err) => return Err(err.to_string()),
        }
    }
    acc.drain(..off);
    if frames.is_empty() {
        return Ok(());
    }

    let mut deliveries = Vec::new();
    let result = {
        let mut g = shared.state.lock();
        let mut result = Ok(());
        for frame in &frames {
            // Any inbound frame acknowledges the window.
            if let Some(entry) = g.circuits.get_mut(&key) {
                entry.unacked = 0;
                entry.unresponsive = false;
            }
            if let Err(msg) = dispatch_frame(&mut g, key, frame, &mut deliveries) {
                result = Err(msg);
                break;
            }
        }
        result
    };
    shared.flow_cv.notify_all();
    deliver_all(&shared.gate, deliveries);
    result
}

// ===== Frame dispatch (primary lock held) =====

fn dispatch_frame(
    g: &mut StateGuard<'_, ClientState>,
    key: CircuitKey,
    frame: &Frame,
    deliveries: &mut Vec<Delivery>,
) -> std::result::Result<(), String> {
    match frame.header.command {
        Command::Version => {
            if let Some(entry) = g.circuits.get_mut(&key) {
                entry.version = frame.header.count;
            }
            Ok(())
        }
        Command::Echo => Ok(()),
        Command::AccessRights => {
            let cid = frame.header.param1;
            let rights = AccessRights::from_bits(frame.header.param2);
            if let Some(handle) = g.chan_ids.lookup(cid) {
                if let Some(chan) = g.chans.get_mut(handle) {
                    chan.rights = rights;
                    if let Some(cb) = &chan.conn_cb {
                        deliveries.push(Delivery::Conn(
                            Arc::clone(cb),
                            ConnectionEvent::AccessRightsChanged(rights),
                        ));
                    }
                }
            }
            Ok(())
        }
        Command::ChannelReady => on_channel_ready(g, key, frame, deliveries),
        Command::ChannelGone => {
            let cid = frame.header.param1;
            log::info!("[CIRCUIT] server dropped channel cid={} on {}", cid, key.0);
            if let Some(entry) = g.circuits.get_mut(&key) {
                entry.attached.remove(&cid);
            }
            detach_to_search(g, cid, ClientStatus::Disconnected, deliveries);
            Ok(())
        }
        Command::Read => on_oneshot_response(g, frame, OneShot::Read, deliveries),
        Command::WriteNotify => on_oneshot_response(g, frame, OneShot::Put, deliveries),
        Command::EventUpdate => on_event_update(g, frame, deliveries),
        Command::ErrorResp => {
            let status = ClientStatus::from_code(frame.header.param1 as u16);
            let id = frame.header.param2;
            let detail = decode_string(&frame.payload);
            log::warn!(
                "[CIRCUIT] server error on {}: {} (op={}, {:?})",
                key.0,
                status,
                id,
                detail
            );
            if id == 0 {
                return Ok(());
            }
            // Tied to an operation: terminate it with the server's status.
            let is_event = g.ledger.event_callback(id).is_some();
            if is_event {
                if let Some(cb) = g.ledger.event_callback(id) {
                    deliveries.push(Delivery::Event(cb, Err(status)));
                }
            } else if let Some(op) = g.ledger.take(id) {
                clear_chan_op(g, op.cid, id);
                if matches!(op.kind, OpKind::Put) {
                    release_put_slot(g, op.cid);
                }
                deliveries.push(match op.cb {
                    OpCallback::Read(cb) => Delivery::Read(cb, Err(status)),
                    OpCallback::Put(cb) => Delivery::Put(cb, Err(status)),
                    OpCallback::Event(cb) => Delivery::Event(cb, Err(status)),
                });
            }
            Ok(())
        }
        other => Err(format!("unexpected {:?} on a circuit", other)),
    }
}

fn on_channel_ready(
    g: &mut StateGuard<'_, ClientState>,
    key: CircuitKey,
    frame: &Frame,
    deliveries: &mut Vec<Delivery>,
) -> std::result::Result<(), String> {
    let cid = frame.header.param1;
    let sid = frame.header.param2;
    let native = FieldType::from_u16(frame.header.field_type)
        .ok_or_else(|| format!("bad native type {} in channel grant", frame.header.field_type))?;
    let native_count = u32::from(frame.header.count);

    let Some(handle) = g.chan_ids.lookup(cid) else {
        return Ok(()); // destroyed while the grant was in flight
    };
    {
        let Some(chan) = g.chans.get_mut(handle) else {
            return Ok(());
        };
        match chan.state {
            ChanState::Attaching { key: claimed } if claimed == key => {}
            // Stray or duplicate grant; the channel belongs elsewhere.
            _ => return Ok(()),
        }
        chan.state = ChanState::Connected {
            key,
            sid,
            native,
            count: native_count,
        };
        log::info!(
            "[CIRCUIT] channel {:?} ready on {} (sid={}, {} x{})",
            chan.name,
            key.0,
            sid,
            native,
            native_count
        );
        if let Some(cb) = &chan.conn_cb {
            deliveries.push(Delivery::Conn(Arc::clone(cb), ConnectionEvent::Connected));
        }
    }

    // Issue everything queued while the channel was unresolved, and
    // re-arm every subscription.
    let issues = g.ledger.pending_issues(cid);
    let mut frames = Vec::new();
    for issue in issues {
        match issue_frame(&issue, native, native_count, sid) {
            Some(f) => frames.push(f),
            None => {
                // Requested count cannot be satisfied on this attachment.
                if let Some(op) = g.ledger.take(issue.id) {
                    clear_chan_op(g, op.cid, issue.id);
                    deliveries.push(match op.cb {
                        OpCallback::Read(cb) => Delivery::Read(cb, Err(ClientStatus::BadCount)),
                        OpCallback::Put(cb) => Delivery::Put(cb, Err(ClientStatus::BadCount)),
                        OpCallback::Event(cb) => Delivery::Event(cb, Err(ClientStatus::BadCount)),
                    });
                }
            }
        }
    }
    if let Some(entry) = g.circuits.get_mut(&key) {
        for f in frames {
            entry.unacked += 1;
            let _ = entry.tx.send(CircuitCmd::Frame(f.encode()));
        }
    }
    Ok(())
}

/// Build the request frame for a pending issue against the negotiated
/// native type/count. `None` means the requested count is impossible.
fn issue_frame(
    issue: &PendingIssue,
    native: FieldType,
    native_count: u32,
    sid: u32,
) -> Option<Frame> {
    let ty = issue.ty.unwrap_or(native);
    let count = if issue.count == 0 {
        native_count
    } else {
        issue.count
    };
    if count > native_count {
        return None;
    }
    Some(match &issue.request {
        IssueRequest::Read => {
            Frame::control(Command::Read, ty as u16, count as u16, sid, issue.id)
        }
        IssueRequest::Put { payload } => Frame::new(
            Command::WriteNotify,
            ty as u16,
            count as u16,
            sid,
            issue.id,
            payload.clone(),
        ),
        IssueRequest::Event { mask } => Frame::new(
            Command::EventAdd,
            ty as u16,
            count as u16,
            sid,
            issue.id,
            mask.bits().to_be_bytes().to_vec(),
        ),
    })
}

enum OneShot {
    Read,
    Put,
}

fn on_oneshot_response(
    g: &mut StateGuard<'_, ClientState>,
    frame: &Frame,
    kind: OneShot,
    deliveries: &mut Vec<Delivery>,
) -> std::result::Result<(), String> {
    let status = frame.header.param1;
    let id = frame.header.param2;
    let Some(op) = g.ledger.take(id) else {
        // Canceled before the response arrived; ignore.
        return Ok(());
    };
    clear_chan_op(g, op.cid, id);

    match (kind, op.cb) {
        (OneShot::Read, OpCallback::Read(cb)) => {
            if status != 0 {
                deliveries.push(Delivery::Read(cb, Err(ClientStatus::from_code(status as u16))));
                return Ok(());
            }
            let decoded = FieldType::from_u16(frame.header.field_type).and_then(|ty| {
                Value::decode(ty, u32::from(frame.header.count), &frame.payload)
            });
            match decoded {
                Some(value) => {
                    deliveries.push(Delivery::Read(cb, Ok(value)));
                    Ok(())
                }
                None => {
                    deliveries.push(Delivery::Read(cb, Err(ClientStatus::Disconnected)));
                    Err("undecodable read completion payload".into())
                }
            }
        }
        (OneShot::Put, OpCallback::Put(cb)) => {
            release_put_slot(g, op.cid);
            let result = if status == 0 {
                Ok(())
            } else {
                Err(ClientStatus::from_code(status as u16))
            };
            deliveries.push(Delivery::Put(cb, result));
            Ok(())
        }
        _ => Err(format!("completion {} does not match operation kind", id)),
    }
}

fn on_event_update(
    g: &mut StateGuard<'_, ClientState>,
    frame: &Frame,
    deliveries: &mut Vec<Delivery>,
) -> std::result::Result<(), String> {
    let status = frame.header.param1;
    let id = frame.header.param2;
    let Some(cb) = g.ledger.event_callback(id) else {
        // Canceled subscription; updates may still be in flight.
        return Ok(());
    };
    if status != 0 {
        deliveries.push(Delivery::Event(cb, Err(ClientStatus::from_code(status as u16))));
        return Ok(());
    }
    let decoded = FieldType::from_u16(frame.header.field_type)
        .and_then(|ty| Value::decode(ty, u32::from(frame.header.count), &frame.payload));
    match decoded {
        Some(value) => {
            deliveries.push(Delivery::Event(cb, Ok(value)));
            Ok(())
        }
        // The subscription survives; teardown delivers its Disconnected.
        None => Err("undecodable subscription update payload".into()),
    }
}

fn clear_chan_op(g: &mut StateGuard<'_, ClientState>, cid: u32, id: u32) {
    if let Some(handle) = g.chan_ids.lookup(cid) {
        if let Some(chan) = g.chans.get_mut(handle) {
            chan.ops.remove(&id);
        }
    }
}

/// Release the per-channel write-notify slot. Every path that terminates
/// a put (completion, server error, disconnect, cancel) must come through
/// here or the channel wedges until the next disconnect.
fn release_put_slot(g: &mut StateGuard<'_, ClientState>, cid: u32) {
    if let Some(handle) = g.chan_ids.lookup(cid) {
        if let Some(chan) = g.chans.get_mut(handle) {
            chan.put_busy = false;
        }
    }
}

// ===== Teardown =====

/// Move one channel back to the discovery engine after its server-side
/// endpoint vanished. Shared between single-channel loss (ChannelGone)
/// and whole-circuit loss.
pub(crate) fn detach_to_search(
    state: &mut ClientState,
    cid: u32,
    status: ClientStatus,
    deliveries: &mut Vec<Delivery>,
) {
    deliveries.extend(state.ledger.disconnect_channel(cid, status));
    let remaining: HashSet<u32> = state.ledger.ops_of_channel(cid).into_iter().collect();

    let Some(handle) = state.chan_ids.lookup(cid) else {
        return;
    };
    let mut resume_search = false;
    if let Some(chan) = state.chans.get_mut(handle) {
        chan.state = ChanState::Searching {
            tier: 0,
            phase: SearchPhase::RequestPending,
        };
        chan.rights = AccessRights::default();
        chan.dup_reported = false;
        chan.put_busy = false;
        chan.ops = remaining;
        if let Some(cb) = &chan.conn_cb {
            deliveries.push(Delivery::Conn(
                Arc::clone(cb),
                ConnectionEvent::Disconnected,
            ));
        }
        resume_search = !matches!(status, ClientStatus::Shutdown);
    }
    if resume_search {
        state.search.enqueue(cid, 0, Instant::now());
    }
}

/// Tear down a circuit: every attached channel migrates back to search
/// and every affected operation observes `status` exactly once.
pub(crate) fn circuit_lost(
    shared: &Arc<Shared>,
    key: CircuitKey,
    status: ClientStatus,
    event: Option<ClientEvent>,
) {
    let mut deliveries = Vec::new();
    {
        let mut g = shared.state.lock();
        let Some(mut entry) = g.circuits.remove(&key) else {
            return; // already torn down
        };
        let _ = entry.tx.send(CircuitCmd::Shutdown);
        if let Some(stream) = entry.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        // The caller usually *is* the receive thread, so neither handle
        // can be joined here; both are parked for the shutdown join.
        {
            let mut defunct = shared.defunct.lock();
            if let Some(h) = entry.recv_handle.take() {
                defunct.push(h);
            }
            if let Some(h) = entry.send_handle.take() {
                defunct.push(h);
            }
        }

        let status = if shared.shutdown.load(Ordering::Relaxed) {
            ClientStatus::Shutdown
        } else {
            status
        };
        log::info!(
            "[CIRCUIT] lost {} priority {} ({} channels, {})",
            key.0,
            key.1,
            entry.attached.len(),
            status
        );
        for cid in entry.attached.iter().copied().collect::<Vec<_>>() {
            detach_to_search(&mut g, cid, status, &mut deliveries);
        }
        if let Some(event) = event {
            if let Some(cb) = g.exception_cb.clone() {
                deliveries.push(Delivery::Client(cb, event));
            }
        }
    }
    shared.flow_cv.notify_all();
    deliver_all(&shared.gate, deliveries);
}

// ===== Tests =====

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::EventMask;

    fn issue(ty: Option<FieldType>, count: u32, request: IssueRequest) -> PendingIssue {
        PendingIssue {
            id: 42,
            ty,
            count,
            request,
        }
    }

    #[test]
    fn test_issue_frame_defaults_to_native() {
        let f = issue_frame(&issue(None, 0, IssueRequest::Read), FieldType::F64, 3, 9)
            .expect("Frame should build");
        assert_eq!(f.header.command, Command::Read);
        assert_eq!(f.header.field_type, FieldType::F64 as u16);
        assert_eq!(f.header.count, 3);
        assert_eq!(f.header.param1, 9);
        assert_eq!(f.header.param2, 42);
    }

    #[test]
    fn test_issue_frame_rejects_over_native_count() {
        assert!(issue_frame(&issue(None, 10, IssueRequest::Read), FieldType::I32, 4, 1).is_none());
    }

    #[test]
    fn test_issue_frame_event_carries_mask() {
        let mask = EventMask::VALUE | EventMask::ALARM;
        let f = issue_frame(
            &issue(Some(FieldType::I16), 1, IssueRequest::Event { mask }),
            FieldType::F64,
            4,
            7,
        )
        .expect("Frame should build");
        assert_eq!(f.header.command, Command::EventAdd);
        assert_eq!(f.header.field_type, FieldType::I16 as u16);
        let bits = u16::from_be_bytes([f.payload[0], f.payload[1]]);
        assert_eq!(EventMask::from_bits(bits), mask);
    }

    #[test]
    fn test_issue_frame_put_keeps_payload() {
        let payload = vec![0, 0, 0, 5, 0, 0, 0, 0];
        let f = issue_frame(
            &issue(Some(FieldType::I32), 1, IssueRequest::Put { payload: payload.clone() }),
            FieldType::I32,
            1,
            3,
        )
        .expect("Frame should build");
        assert_eq!(f.header.command, Command::WriteNotify);
        assert_eq!(f.payload, payload);
    }
}
