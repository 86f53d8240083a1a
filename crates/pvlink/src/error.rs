// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for pvlink operations.
//!
//! Two distinct surfaces exist:
//!
//! - [`Error`] is returned from API calls (`Context::create_channel`,
//!   `Channel::read`, ...). These are failures the caller caused or can
//!   retry, detected synchronously at the call site.
//! - [`ClientStatus`] is delivered *through completion callbacks*. A lost
//!   circuit, a server-reported type mismatch, or a cancellation never
//!   unwinds through a worker thread; it arrives on the same path a
//!   successful completion would have.
//!
//! [`ClientEvent`] covers conditions that belong to no single operation
//! (duplicate responders, unresponsive circuits) and go to the context-wide
//! exception handler.

use std::fmt;
use std::io;
use std::net::SocketAddr;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned synchronously by pvlink API calls.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration value could not be parsed (variable name + cause).
    Config(String),
    /// Channel priority out of range (0-99).
    InvalidPriority(u8),
    /// Channel name is empty or exceeds the search-frame limit.
    InvalidName(String),

    // ========================================================================
    // Handle Errors
    // ========================================================================
    /// Channel handle refers to a destroyed channel.
    StaleChannel,
    /// Operation ID not found in the I/O ledger.
    UnknownOp(u32),

    // ========================================================================
    // State Errors
    // ========================================================================
    /// Channel is not attached to a circuit.
    NotConnected,
    /// Requested element count exceeds the channel's native count.
    BadCount {
        /// Count the caller asked for.
        requested: u32,
        /// Native count negotiated with the server.
        native: u32,
    },
    /// Server denied read access on this channel.
    NoReadAccess,
    /// Server denied write access on this channel.
    NoWriteAccess,
    /// Request could not be issued within the bounded wait interval.
    RequestTimeout,
    /// Encoded payload exceeds the configured maximum array size.
    ArrayTooLarge {
        /// Size of the rejected payload in bytes.
        bytes: usize,
        /// Configured limit.
        max: usize,
    },

    // ========================================================================
    // Resource / Transport Errors
    // ========================================================================
    /// Underlying socket operation failed.
    IoError(io::Error),
    /// Allocation from the underlying allocator failed.
    OutOfMemory,
    /// Context is shutting down; no new work is accepted.
    Shutdown,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::InvalidPriority(p) => {
                write!(f, "Invalid priority: {} (must be 0-99)", p)
            }
            Error::InvalidName(name) => write!(f, "Invalid channel name: {:?}", name),
            Error::StaleChannel => write!(f, "Channel has been destroyed"),
            Error::UnknownOp(id) => write!(f, "Unknown operation id: {}", id),
            Error::NotConnected => write!(f, "Channel not connected"),
            Error::BadCount { requested, native } => write!(
                f,
                "Invalid element count: requested {} but native count is {}",
                requested, native
            ),
            Error::NoReadAccess => write!(f, "No read access"),
            Error::NoWriteAccess => write!(f, "No write access"),
            Error::RequestTimeout => write!(f, "Request timed out"),
            Error::ArrayTooLarge { bytes, max } => {
                write!(f, "Array too large: {} bytes (max {})", bytes, max)
            }
            Error::IoError(e) => write!(f, "I/O error: {}", e),
            Error::OutOfMemory => write!(f, "Out of memory"),
            Error::Shutdown => write!(f, "Context is shut down"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::IoError(e)
    }
}

/// Application-visible completion status, delivered via callbacks.
///
/// Exactly one of {success, one of these, cancellation} terminates every
/// one-shot operation. Subscriptions may observe `Disconnected` once per
/// circuit loss and then resume after reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    /// Server rejected the requested field type.
    BadType,
    /// Server rejected the requested element count.
    BadCount,
    /// Read denied by server-side access rights.
    NoReadAccess,
    /// Write denied by server-side access rights.
    NoWriteAccess,
    /// Circuit to the server was lost while the operation was in flight.
    Disconnected,
    /// Operation did not complete within the bounded interval.
    Timeout,
    /// Operation was canceled before a response arrived.
    Canceled,
    /// Context shut down while the operation was in flight.
    Shutdown,
    /// Server delivered an error status code not mapped above.
    ServerError(u16),
}

impl ClientStatus {
    /// Map a protocol status code to a client status.
    ///
    /// Code 0 is success and never reaches this path.
    pub fn from_code(code: u16) -> Self {
        match code {
            1 => ClientStatus::BadType,
            2 => ClientStatus::BadCount,
            3 => ClientStatus::NoReadAccess,
            4 => ClientStatus::NoWriteAccess,
            5 => ClientStatus::Disconnected,
            other => ClientStatus::ServerError(other),
        }
    }
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientStatus::BadType => write!(f, "bad field type"),
            ClientStatus::BadCount => write!(f, "bad element count"),
            ClientStatus::NoReadAccess => write!(f, "no read access"),
            ClientStatus::NoWriteAccess => write!(f, "no write access"),
            ClientStatus::Disconnected => write!(f, "disconnected"),
            ClientStatus::Timeout => write!(f, "timed out"),
            ClientStatus::Canceled => write!(f, "canceled"),
            ClientStatus::Shutdown => write!(f, "context shut down"),
            ClientStatus::ServerError(code) => write!(f, "server error (code {})", code),
        }
    }
}

/// Context-wide exception events, delivered to the handler installed with
/// `Context::set_exception_handler`.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Two servers answered a search for the same channel name.
    ///
    /// The channel stays attached to the first responder; the duplicate is
    /// ignored. Host strings come from the diagnostic resolver and may be
    /// numeric if reverse lookup failed.
    MultiplyDefined {
        /// Channel name both servers claimed.
        channel: String,
        /// Host the channel is actually attached to.
        connected_host: String,
        /// Host whose answer was rejected.
        rejected_host: String,
    },
    /// A circuit exceeded its flow-control window and stopped acknowledging.
    CircuitUnresponsive {
        /// Peer address of the stalled circuit.
        server: SocketAddr,
    },
}

impl fmt::Display for ClientEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientEvent::MultiplyDefined {
                channel,
                connected_host,
                rejected_host,
            } => write!(
                f,
                "channel {:?} multiply defined: connected to {}, rejected {}",
                channel, connected_host, rejected_host
            ),
            ClientEvent::CircuitUnresponsive { server } => {
                write!(f, "circuit to {} is unresponsive", server)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(ClientStatus::from_code(1), ClientStatus::BadType);
        assert_eq!(ClientStatus::from_code(4), ClientStatus::NoWriteAccess);
        assert_eq!(ClientStatus::from_code(99), ClientStatus::ServerError(99));
    }

    #[test]
    fn test_error_display_contains_detail() {
        let e = Error::BadCount {
            requested: 10,
            native: 4,
        };
        let msg = e.to_string();
        assert!(msg.contains("10"));
        assert!(msg.contains("4"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let e: Error = io.into();
        assert!(matches!(e, Error::IoError(_)));
    }
}
