// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Diagnostic hostname resolution.
//!
//! Reverse DNS can block for seconds, so it never runs on an engine
//! thread. Exception reports that want human-readable host names are
//! handed to a short-lived resolver thread that looks the names up and
//! then delivers the event under the callback gate. Lookup failure falls
//! back to the numeric address; diagnostics must never fail because DNS
//! is down.

use crate::context::Shared;
use crate::ledger::{deliver_all, Delivery, ExceptionCallback};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

/// Best-effort reverse lookup, numeric fallback.
pub(crate) fn host_string(addr: SocketAddr) -> String {
    match addr {
        SocketAddr::V4(v4) => {
            reverse_lookup_v4(v4).unwrap_or_else(|| addr.to_string())
        }
        SocketAddr::V6(_) => addr.to_string(),
    }
}

fn reverse_lookup_v4(addr: std::net::SocketAddrV4) -> Option<String> {
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = addr.port().to_be();
    sa.sin_addr = libc::in_addr {
        s_addr: u32::from(*addr.ip()).to_be(),
    };

    let mut host = [0 as libc::c_char; libc::NI_MAXHOST as usize];
    // SAFETY: sa is a fully initialized sockaddr_in and the host buffer
    // length matches what getnameinfo is told. NI_NAMEREQD makes the call
    // fail instead of returning the numeric form, which we format
    // ourselves on the fallback path.
    let rc = unsafe {
        libc::getnameinfo(
            &sa as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            host.as_mut_ptr(),
            host.len() as libc::socklen_t,
            std::ptr::null_mut(),
            0,
            libc::NI_NAMEREQD,
        )
    };
    if rc != 0 {
        return None;
    }
    // SAFETY: getnameinfo succeeded, so host holds a NUL-terminated string.
    let cstr = unsafe { std::ffi::CStr::from_ptr(host.as_ptr()) };
    cstr.to_str().ok().map(str::to_owned)
}

/// Resolve both hosts of a duplicate-responder report off-thread, then
/// deliver the event to the exception handler.
pub(crate) fn spawn_duplicate_report(
    shared: Arc<Shared>,
    cb: ExceptionCallback,
    channel: String,
    connected: SocketAddr,
    rejected: SocketAddr,
) {
    let spawned = thread::Builder::new()
        .name("pvlink-resolve".into())
        .spawn(move || {
            let event = crate::discovery::multiply_defined_event(
                channel,
                host_string(connected),
                host_string(rejected),
            );
            deliver_all(&shared.gate, vec![Delivery::Client(cb, event)]);
        });
    if let Err(err) = spawned {
        log::warn!("[RESOLVE] could not spawn resolver thread: {}", err);
    }
}

// ===== Tests =====

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_fallback_formats_address() {
        // Reverse lookup of a reserved documentation address cannot
        // succeed; we must get the numeric form back.
        let addr: SocketAddr = "192.0.2.1:5664".parse().unwrap();
        let host = host_string(addr);
        assert!(host.contains("192.0.2.1"));
    }

    #[test]
    fn test_v6_is_always_numeric() {
        let addr: SocketAddr = "[2001:db8::1]:5664".parse().unwrap();
        assert_eq!(host_string(addr), addr.to_string());
    }
}
