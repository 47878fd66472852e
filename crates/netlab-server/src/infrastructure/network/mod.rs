//! Network infrastructure: everything that touches sockets.
//!
//! # Sub-modules
//!
//! - **`multiplexer`** – Wraps `mio::Poll`.  Maps connection ids to tokens,
//!   tracks the interest registered for each one, and turns raw events into
//!   [`Ready`](multiplexer::Ready) values.
//!
//! - **`registry`** – The live connections with their decoding sessions and
//!   write buffers.
//!
//! - **`server`** – The event loop: accept, read, dispatch, write, close.
//!
//! - **`error`** – Server-level errors and the classification of I/O errors
//!   into "retry", "drop this connection" and "stop the server".
//!
//! - **`socket_opts`** – Listen backlog and TCP keepalive, set through `libc`.

pub mod error;
pub mod multiplexer;
pub mod registry;
pub mod server;
pub mod socket_opts;
