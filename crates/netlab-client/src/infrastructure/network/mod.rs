//! Network infrastructure for the client: one framed connection.
//!
//! [`FrameClient`] is generic over the stream so the same code runs over a
//! real `TcpStream` and over `tokio_test::io::Mock` in unit tests.  Inbound
//! bytes go through the core [`Session`], the same resumable decoder the
//! server uses, so both sides agree on framing by construction.

use std::path::PathBuf;

use bytes::{Bytes, BytesMut};
use netlab_core::protocol::command::replies::ERROR_PREFIX;
use netlab_core::{encode_frame_vec, Command, CommandError, FrameError, Session, DEFAULT_MAX_FRAME_LEN};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, trace};

/// Bytes requested from the stream per read.
const READ_CHUNK: usize = 64 * 1024;

/// Errors that can occur in the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// TCP connection to the server failed.
    #[error("failed to connect to {addr}: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// An I/O error occurred on the established connection.
    #[error("connection I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The byte stream broke the framing rules.
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    /// A command could not be built from the given arguments.
    #[error("invalid command: {0}")]
    Command(#[from] CommandError),

    /// The server closed the connection.
    #[error("connection closed by server")]
    Closed,

    /// A reply that should be text was not UTF-8.
    #[error("reply is not valid UTF-8")]
    NotUtf8,

    /// The server answered with an `ERROR:` line.
    #[error("server error: {0}")]
    Server(String),

    /// The server answered with something other than what the protocol
    /// step expects.
    #[error("expected {expected} reply, got {got:?}")]
    UnexpectedReply { expected: &'static str, got: String },

    /// A data phase delivered more or fewer bytes than announced.
    #[error("transfer protocol violation: {0}")]
    Protocol(String),

    /// Reading or writing the local file failed.
    #[error("local file {path}: {source}")]
    LocalFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ClientError {
    /// Classifies a reply that did not match `expected`: `ERROR:` lines
    /// become [`ClientError::Server`], anything else
    /// [`ClientError::UnexpectedReply`].
    pub fn from_reply(reply: String, expected: &'static str) -> Self {
        if reply.starts_with(ERROR_PREFIX) {
            ClientError::Server(reply)
        } else {
            ClientError::UnexpectedReply {
                expected,
                got: reply,
            }
        }
    }
}

/// A framed, request/response connection to the server.
pub struct FrameClient<S> {
    stream: S,
    session: Session,
    read_buf: BytesMut,
}

impl FrameClient<TcpStream> {
    /// Connects over TCP using length-prefixed framing.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ConnectFailed`] if the connection cannot be
    /// established.
    pub async fn connect(addr: impl ToSocketAddrs + std::fmt::Display) -> Result<Self, ClientError> {
        let label = addr.to_string();
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ClientError::ConnectFailed {
                addr: label.clone(),
                source,
            })?;
        stream.set_nodelay(true)?;
        debug!(addr = %label, "connected");
        Ok(Self::new(stream))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> FrameClient<S> {
    /// Wraps `stream` with length-prefixed framing and a 16 MiB frame limit.
    pub fn new(stream: S) -> Self {
        Self::with_session(stream, Session::length_prefixed(16 * DEFAULT_MAX_FRAME_LEN))
    }

    /// Wraps `stream` with an explicitly configured decoder.
    pub fn with_session(stream: S, session: Session) -> Self {
        Self {
            stream,
            session,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Sends one frame carrying `payload`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Frame`] if the payload cannot be framed, or
    /// [`ClientError::Io`] if the write fails.
    pub async fn send_frame(&mut self, payload: &[u8]) -> Result<(), ClientError> {
        let bytes = encode_frame_vec(self.session.framing(), payload)?;
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        trace!(len = payload.len(), "frame sent");
        Ok(())
    }

    /// Waits for the next complete frame.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Closed`] if the stream ends first (a partial frame
    ///   is discarded).
    /// - [`ClientError::Frame`] if the stream breaks the framing rules.
    pub async fn recv_frame(&mut self) -> Result<Bytes, ClientError> {
        loop {
            if let Some(frame) = self.session.next_frame()? {
                trace!(len = frame.len(), "frame received");
                return Ok(frame);
            }
            self.read_buf.clear();
            self.read_buf.reserve(READ_CHUNK);
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                if self.session.has_partial_frame() {
                    debug!(buffered = self.session.buffered(), "stream ended mid-frame");
                }
                return Err(ClientError::Closed);
            }
            self.session.extend(&self.read_buf[..n]);
        }
    }

    /// Waits for the next frame and decodes it as a text line.
    ///
    /// # Errors
    ///
    /// Same as [`FrameClient::recv_frame`], plus [`ClientError::NotUtf8`].
    pub async fn recv_line(&mut self) -> Result<String, ClientError> {
        let frame = self.recv_frame().await?;
        String::from_utf8(frame.to_vec()).map_err(|_| ClientError::NotUtf8)
    }

    /// Sends `command` and returns the one-line reply.
    ///
    /// # Errors
    ///
    /// Any error of [`FrameClient::send_frame`] or
    /// [`FrameClient::recv_line`].
    pub async fn request(&mut self, command: &Command) -> Result<String, ClientError> {
        self.request_line(&command.to_string()).await
    }

    /// Sends a raw request line and returns the one-line reply.
    ///
    /// # Errors
    ///
    /// Same as [`FrameClient::request`].
    pub async fn request_line(&mut self, line: &str) -> Result<String, ClientError> {
        self.send_frame(line.as_bytes()).await?;
        self.recv_line().await
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
