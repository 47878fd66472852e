//! ConnectionRegistry: every live client connection and its buffers.
//!
//! The registry is owned by the event loop and never shared across threads.
//! It is a `BTreeMap` keyed by [`ConnectionId`]: ids are allocated
//! monotonically, so key order is accept order, which gives shutdown a
//! deterministic close order.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use netlab_core::{encode_frame, CloseReason, ConnectionId, ConnectionState, Session, TransitionError};
use thiserror::Error;
use tracing::trace;

use super::multiplexer::Interest;
use crate::application::handler::Reply;

/// Error type for registry lookups and insertions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection {0} is already registered")]
    Duplicate(ConnectionId),
    #[error("connection {0} not found")]
    NotFound(ConnectionId),
}

/// Result of one non-blocking read attempt.
#[derive(Debug)]
pub enum ReadOutcome {
    /// `n` bytes were read into the scratch buffer.
    Data(usize),
    /// Nothing more to read right now.
    WouldBlock,
    /// The peer closed its sending side.
    Eof,
    /// The read failed.
    Failed(io::Error),
}

/// Result of trying to empty the write buffer.
#[derive(Debug)]
pub enum FlushOutcome {
    /// Everything queued has been handed to the kernel.
    Drained,
    /// The socket's send buffer is full; wait for writability.
    Blocked,
    /// The write failed.
    Failed(io::Error),
}

/// One accepted client socket with its decoding and output state.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    stream: TcpStream,
    state: ConnectionState,
    session: Session,
    write_buf: BytesMut,
    interest: Interest,
    last_activity: Instant,
    close_reason: Option<CloseReason>,
    close_after_flush: bool,
    frames_in: u64,
    bytes_in: u64,
    bytes_out: u64,
}

impl Connection {
    /// Wraps a freshly accepted stream.  The connection starts `Connecting`.
    pub fn new(id: ConnectionId, stream: TcpStream, peer_addr: SocketAddr, session: Session) -> Self {
        Self {
            id,
            peer_addr,
            stream,
            state: ConnectionState::Connecting,
            session,
            write_buf: BytesMut::new(),
            interest: Interest::Readable,
            last_activity: Instant::now(),
            close_reason: None,
            close_after_flush: false,
            frames_in: 0,
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The underlying socket, for (de)registration with the multiplexer.
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Interest last registered for this connection.
    pub fn interest(&self) -> Interest {
        self.interest
    }

    pub fn set_interest(&mut self, interest: Interest) {
        self.interest = interest;
    }

    /// Moves `Connecting → Open`.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] if the connection is not `Connecting`.
    pub fn open(&mut self) -> Result<(), TransitionError> {
        self.state.transition(ConnectionState::Open)
    }

    /// Moves the connection to `Closing`, recording `reason`.
    ///
    /// Only the first reason is kept.  Returns `false` (and drops `reason`)
    /// if the connection was already closing.
    pub fn begin_close(&mut self, reason: CloseReason) -> bool {
        if self.state.transition(ConnectionState::Closing).is_err() {
            trace!(id = %self.id, later = %reason, "already closing; reason ignored");
            return false;
        }
        self.close_reason = Some(reason);
        true
    }

    /// Moves `Closing → Closed` and hands back the recorded reason.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] if the connection is not `Closing`.
    pub fn mark_closed(&mut self) -> Result<Option<CloseReason>, TransitionError> {
        self.state.transition(ConnectionState::Closed)?;
        Ok(self.close_reason.take())
    }

    pub fn is_closing(&self) -> bool {
        self.state == ConnectionState::Closing
    }

    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.close_reason.as_ref()
    }

    /// Asks for the connection to close once its write buffer drains.
    pub fn request_close_after_flush(&mut self) {
        self.close_after_flush = true;
    }

    pub fn close_after_flush(&self) -> bool {
        self.close_after_flush
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Time since the last byte moved in either direction.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Bytes queued but not yet written.
    pub fn pending_output(&self) -> usize {
        self.write_buf.len()
    }

    pub fn frames_in(&self) -> u64 {
        self.frames_in
    }

    pub fn record_frame(&mut self) {
        self.frames_in += 1;
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }

    // ── I/O ───────────────────────────────────────────────────────────────────

    /// One read into `scratch`.  `Interrupted` is retried.
    pub fn read_some(&mut self, scratch: &mut [u8]) -> ReadOutcome {
        loop {
            match self.stream.read(scratch) {
                Ok(0) => return ReadOutcome::Eof,
                Ok(n) => {
                    self.bytes_in += n as u64;
                    return ReadOutcome::Data(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return ReadOutcome::WouldBlock,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return ReadOutcome::Failed(e),
            }
        }
    }

    /// Encodes every frame of `reply` onto the write buffer and records a
    /// close request if the reply carries one.
    ///
    /// # Errors
    ///
    /// - [`CloseReason::Handler`] if a payload cannot be framed.
    /// - [`CloseReason::WriteBufferFull`] if the buffer would exceed `limit`.
    pub fn queue_reply(&mut self, reply: Reply, limit: usize) -> Result<(), CloseReason> {
        let framing = self.session.framing();
        for payload in &reply.frames {
            encode_frame(framing, payload, &mut self.write_buf)
                .map_err(|e| CloseReason::Handler(format!("unframeable reply: {e}")))?;
        }
        if self.write_buf.len() > limit {
            return Err(CloseReason::WriteBufferFull { limit });
        }
        if reply.close {
            self.request_close_after_flush();
        }
        Ok(())
    }

    /// Writes until the buffer is empty or the socket would block.
    pub fn flush(&mut self) -> FlushOutcome {
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => return FlushOutcome::Failed(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => {
                    self.write_buf.advance(n);
                    self.bytes_out += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return FlushOutcome::Blocked,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return FlushOutcome::Failed(e),
            }
        }
        FlushOutcome::Drained
    }

    /// Shuts both directions of the socket down; errors (e.g. the peer is
    /// already gone) are ignored.
    pub fn shutdown_socket(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Map of live connections in accept order.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: BTreeMap<ConnectionId, Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a connection.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Duplicate`] if the id is already present; the
    /// existing entry is left untouched.
    pub fn add(&mut self, connection: Connection) -> Result<(), RegistryError> {
        let id = connection.id();
        if self.connections.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        self.connections.insert(id, connection);
        Ok(())
    }

    /// Removes and returns a connection; `None` if it was not present.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        self.connections.remove(&id)
    }

    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for an unknown id.
    pub fn get(&self, id: ConnectionId) -> Result<&Connection, RegistryError> {
        self.connections.get(&id).ok_or(RegistryError::NotFound(id))
    }

    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for an unknown id.
    pub fn get_mut(&mut self, id: ConnectionId) -> Result<&mut Connection, RegistryError> {
        self.connections
            .get_mut(&id)
            .ok_or(RegistryError::NotFound(id))
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Snapshot of all ids, in accept order, taken at call time.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    /// Ids of connections waiting to be finalized.
    pub fn closing_ids(&self) -> Vec<ConnectionId> {
        self.connections
            .values()
            .filter(|c| c.is_closing())
            .map(Connection::id)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.connections.values_mut()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
