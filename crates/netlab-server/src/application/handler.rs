//! The application callback interface the event loop dispatches frames to.
//!
//! The server knows nothing about what a frame *means*.  For every complete
//! frame it calls [`FrameHandler::on_frame`] and queues whatever [`Reply`]
//! comes back.  The handler runs on the event-loop thread, so it must never
//! block: no sleeping, no blocking network calls, only quick work such as
//! parsing a command or reading one chunk of a local file.
//!
//! # Callback order per connection
//!
//! ```text
//! on_connect ─► on_frame* ─► (on_drain whenever the write buffer empties)* ─► on_disconnect
//! ```
//!
//! `on_disconnect` is called exactly once for every connection that saw
//! `on_connect`, whatever the reason for closing.

use std::io;
use std::net::SocketAddr;

use netlab_core::ConnectionId;
use thiserror::Error;

use super::file_repository::StoreError;

/// Errors a handler can return; any of them closes the offending connection.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The peer violated the application protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The backing file store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Any other I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Frames to send back, plus an optional request to close once they are out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    /// Payloads, each sent as one frame, in order.
    pub frames: Vec<Vec<u8>>,
    /// Close the connection after the write buffer has drained.
    pub close: bool,
}

impl Reply {
    /// A reply carrying one frame.
    pub fn frame(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            frames: vec![payload.into()],
            close: false,
        }
    }

    /// A reply carrying several frames.
    pub fn frames<I, P>(payloads: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        Self {
            frames: payloads.into_iter().map(Into::into).collect(),
            close: false,
        }
    }

    /// A reply with no frames that closes the connection.
    pub fn close() -> Self {
        Self {
            frames: Vec::new(),
            close: true,
        }
    }

    /// Marks this reply as the last one on the connection.
    pub fn and_close(mut self) -> Self {
        self.close = true;
        self
    }

    /// Appends another frame.
    pub fn push(&mut self, payload: impl Into<Vec<u8>>) {
        self.frames.push(payload.into());
    }

    /// `true` if the reply neither sends anything nor closes.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty() && !self.close
    }
}

/// Application logic plugged into the server.
///
/// Only [`FrameHandler::on_frame`] is required; the other callbacks default
/// to doing nothing.
#[cfg_attr(test, mockall::automock)]
pub trait FrameHandler {
    /// A connection was accepted and registered.
    fn on_connect(&mut self, _id: ConnectionId, _peer: SocketAddr) {}

    /// A complete frame arrived on `id`.
    ///
    /// # Errors
    ///
    /// Returning an error closes the connection.
    fn on_frame(&mut self, id: ConnectionId, frame: &[u8]) -> Result<Option<Reply>, HandlerError>;

    /// The write buffer of `id` is empty; return more output to keep
    /// streaming, or `None` to stop asking.
    ///
    /// # Errors
    ///
    /// Returning an error closes the connection.
    fn on_drain(&mut self, _id: ConnectionId) -> Result<Option<Reply>, HandlerError> {
        Ok(None)
    }

    /// The connection is gone; release any per-connection state.
    fn on_disconnect(&mut self, _id: ConnectionId) {}
}

/// Adapter turning a closure into a [`FrameHandler`]; see [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

/// Wraps `f` so that each frame is answered with at most one frame.
///
/// # Examples
///
/// ```rust
/// use netlab_server::application::handler::{handler_fn, FrameHandler};
/// use netlab_core::ConnectionId;
///
/// let mut echo = handler_fn(|_id, frame| Some(frame.to_vec()));
/// let reply = echo.on_frame(ConnectionId(2), b"hi").unwrap().unwrap();
/// assert_eq!(reply.frames, vec![b"hi".to_vec()]);
/// ```
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: FnMut(ConnectionId, &[u8]) -> Option<Vec<u8>>,
{
    FnHandler { f }
}

impl<F> FrameHandler for FnHandler<F>
where
    F: FnMut(ConnectionId, &[u8]) -> Option<Vec<u8>>,
{
    fn on_frame(&mut self, id: ConnectionId, frame: &[u8]) -> Result<Option<Reply>, HandlerError> {
        Ok((self.f)(id, frame).map(Reply::frame))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
