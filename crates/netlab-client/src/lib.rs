//! netlab-client library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! # What does the client do? (for beginners)
//!
//! The server speaks frames: every message is a 4-byte big-endian length
//! followed by that many bytes.  The client wraps any async byte stream in
//! a [`FrameClient`] that sends and receives whole frames, then builds the
//! command protocol on top:
//!
//! 1. Text requests (`ECHO`, `TIME`, `LIST`, `CLOSE`) are one frame out,
//!    one frame back.
//! 2. `UPLOAD` and `DOWNLOAD` negotiate a resume offset first and then move
//!    raw file bytes in 64 KiB data frames.

/// Application layer: file transfer use cases.
pub mod application;

/// Infrastructure layer: the framed connection.
pub mod infrastructure;

pub use application::transfer::{download, upload};
pub use infrastructure::network::{ClientError, FrameClient};
