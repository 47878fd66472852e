//! # netlab-core
//!
//! Shared library for netlab containing the framing state machine, the
//! connection domain types, and the text command protocol.
//!
//! This crate is used by both the server and the client.  It has zero
//! dependencies on OS APIs, readiness mechanisms, or network sockets: it only
//! ever sees byte slices.
//!
//! # Architecture overview (for beginners)
//!
//! netlab is a small multi-client TCP server.  A single thread polls every
//! socket for readiness, reads whatever bytes are available, cuts them into
//! *frames*, and hands each frame to an application callback.
//!
//! This crate (`netlab-core`) is the shared foundation.  It defines:
//!
//! - **`protocol`** – How bytes travel over the network.  A byte stream is
//!   split into frames by a resumable [`Session`] (4-byte length prefix by
//!   default, newline-delimited as an alternative), and the application's
//!   text commands (`ECHO`, `UPLOAD`, …) are parsed into typed [`Command`]s.
//!
//! - **`domain`** – Pure connection bookkeeping with no OS dependencies:
//!   identifiers, the `Connecting → Open → Closing → Closed` lifecycle, and
//!   the reasons a connection can be closed, plus transfer throughput
//!   reporting.

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `netlab_core::Session` instead of `netlab_core::protocol::session::Session`.
pub use domain::connection::{CloseReason, ConnectionId, ConnectionState, TransitionError};
pub use domain::transfer::{bitrate_mbps, TransferReport};
pub use protocol::command::{Command, CommandError};
pub use protocol::frame::{encode_frame, encode_frame_vec, FrameError, Framing, DEFAULT_MAX_FRAME_LEN, HEADER_LEN};
pub use protocol::session::{DecodeState, Session};
