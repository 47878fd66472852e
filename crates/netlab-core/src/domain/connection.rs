//! Connection identity and lifecycle.
//!
//! # Connection lifecycle (for beginners)
//!
//! Every accepted client socket walks through these states:
//!
//! ```text
//! Connecting ──► Open ──► Closing ──► Closed
//!      │                     ▲
//!      └─────────────────────┘
//! ```
//!
//! - `Connecting`: the socket was accepted but is not yet registered with the
//!   multiplexer.
//! - `Open`: registered and tracked; bytes flow in both directions.
//! - `Closing`: something decided the connection must end (end-of-stream, an
//!   I/O error, a bad frame, an idle timeout, shutdown…).  The socket is still
//!   registered; the event loop finalizes it at the end of the iteration.
//! - `Closed`: deregistered, removed from the registry, socket released.
//!
//! There is no way back: a `Closing` connection can never become `Open` again.
//! That one-way door is what makes "exactly one cleanup per connection" easy to
//! guarantee.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::protocol::frame::FrameError;

/// Identifier of a live connection.
///
/// Identifiers are handed out monotonically by the server and never reused
/// while the server is running, so an identifier that the multiplexer still
/// reports can never be confused with a newer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub usize);

impl ConnectionId {
    /// Returns the raw numeric value.
    pub fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Accepted, not yet registered for readiness notifications.
    Connecting,
    /// Registered and serviced by the event loop.
    Open,
    /// Marked for finalization at the end of the current loop iteration.
    Closing,
    /// Deregistered and released.
    Closed,
}

/// An illegal lifecycle transition was attempted.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("illegal connection state transition: {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

impl ConnectionState {
    /// Returns `true` if moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Open) | (Connecting, Closing) | (Open, Closing) | (Closing, Closed)
        )
    }

    /// Validates and performs a transition.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] if the transition is not allowed.
    pub fn transition(&mut self, next: ConnectionState) -> Result<(), TransitionError> {
        if !self.can_transition_to(next) {
            return Err(TransitionError {
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }

    /// `true` while the event loop should still service the connection's I/O.
    pub fn is_open(self) -> bool {
        self == ConnectionState::Open
    }
}

/// Why a connection ended.
///
/// Only the *first* reason is kept for a connection: once it is `Closing`,
/// later failures are consequences, not causes.
#[derive(Debug, Error)]
pub enum CloseReason {
    /// The peer performed an orderly shutdown (zero-length read).
    #[error("end of stream")]
    EndOfStream,

    /// Reading from the socket failed.
    #[error("read failed: {0}")]
    ReadFailed(#[source] io::Error),

    /// Writing to the socket failed.
    #[error("write failed: {0}")]
    WriteFailed(#[source] io::Error),

    /// The byte stream could not be decoded into frames.
    #[error("decode failed: {0}")]
    Decode(#[from] FrameError),

    /// The application callback rejected a frame.
    #[error("handler error: {0}")]
    Handler(String),

    /// Updating the readiness registration failed.
    #[error("readiness registration failed: {0}")]
    Registration(#[source] io::Error),

    /// The peer queued more output than the server is willing to buffer.
    #[error("write buffer limit of {limit} bytes exceeded")]
    WriteBufferFull { limit: usize },

    /// No traffic for longer than the idle timeout.
    #[error("idle timeout")]
    IdleTimeout,

    /// The application asked for the connection to be closed.
    #[error("closed on request")]
    Requested,

    /// The server is shutting down.
    #[error("server shutdown")]
    Shutdown,
}

impl CloseReason {
    /// `true` when the close was caused by the peer misbehaving or failing,
    /// as opposed to a decision taken by the server.
    pub fn is_peer_fault(&self) -> bool {
        matches!(
            self,
            CloseReason::ReadFailed(_)
                | CloseReason::WriteFailed(_)
                | CloseReason::Decode(_)
                | CloseReason::Handler(_)
                | CloseReason::WriteBufferFull { .. }
        )
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
