//! Server: owns the listening socket and drives the event loop.
//!
//! # One iteration ("turn") of the loop (for beginners)
//!
//! ```text
//! poll (bounded wait)
//!   │
//!   ├─ listener ready?  ──► accept until WouldBlock, register each new socket
//!   ├─ readable conns   ──► read until WouldBlock (or the read budget), decode
//!   │                       frames, call handler, queue replies, ask for
//!   │                       writability if needed
//!   ├─ writable conns   ──► flush until WouldBlock or empty, ask the handler
//!   │                       for more (streaming), drop writability when done
//!   ├─ idle sweep       ──► silent too long → Closing
//!   └─ finalize         ──► every Closing connection: flush what is left,
//!                           deregister, remove, shut down, on_disconnect
//! ```
//!
//! Finalization is the *only* place a connection is torn down.  Everything
//! else merely marks a connection `Closing`, so a failure on one connection
//! never disturbs the others that were reported ready in the same turn.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::Waker;
use netlab_core::{CloseReason, ConnectionId, Framing, Session, DEFAULT_MAX_FRAME_LEN};
use tracing::{debug, error, info, trace, warn};

use super::error::{classify, ErrorClass, ServerError};
use super::multiplexer::{Interest, Multiplexer, Ready, FIRST_CONNECTION_ID};
use super::registry::{Connection, ConnectionRegistry, FlushOutcome, ReadOutcome};
use super::socket_opts::{self, Keepalive};
use crate::application::handler::FrameHandler;

/// Size of the scratch buffer each read lands in.
const READ_CHUNK: usize = 64 * 1024;

/// Runtime settings of a [`Server`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to listen on.  Port `0` picks a free port.
    pub listen_addr: SocketAddr,
    /// Accept queue length.
    pub backlog: u32,
    /// Simultaneous connections; further clients are turned away.
    pub max_connections: usize,
    /// Upper bound on one wait for readiness.
    pub poll_timeout: Duration,
    /// Connections silent for this long are closed.  `None` disables the sweep.
    pub idle_timeout: Option<Duration>,
    /// How long shutdown keeps flushing pending output.
    pub shutdown_grace: Duration,
    /// Framing rule for every connection.
    pub framing: Framing,
    /// Largest accepted frame body.
    pub max_frame_size: usize,
    /// Largest amount of queued output per connection.
    pub max_write_buffer: usize,
    /// Bytes read from one connection in a single turn before the loop
    /// moves on; the rest is read next turn.
    pub read_budget: usize,
    /// TCP keepalive for accepted sockets, or `None` to leave it off.
    pub keepalive: Option<Keepalive>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 12345)),
            backlog: 128,
            max_connections: 1024,
            poll_timeout: Duration::from_millis(250),
            idle_timeout: Some(Duration::from_secs(300)),
            shutdown_grace: Duration::from_secs(2),
            framing: Framing::LengthPrefixed,
            max_frame_size: DEFAULT_MAX_FRAME_LEN,
            max_write_buffer: 8 * 1024 * 1024,
            read_budget: 1024 * 1024,
            keepalive: Some(Keepalive::default()),
        }
    }
}

/// Cloneable handle for stopping a running [`Server`] from another thread.
#[derive(Clone)]
pub struct ServerHandle {
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ServerHandle {
    /// Asks the server to stop and wakes it if it is waiting in `poll`.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "failed to wake the event loop; it will stop after the poll timeout");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// Single-threaded, readiness-driven TCP frame server.
pub struct Server<H: FrameHandler> {
    config: ServerConfig,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    multiplexer: Multiplexer,
    registry: ConnectionRegistry,
    handler: H,
    next_id: usize,
    shutdown: Arc<AtomicBool>,
    accept_deferred: bool,
    read_backlog: Vec<ConnectionId>,
    scratch: Vec<u8>,
}

impl<H: FrameHandler> Server<H> {
    /// Binds the listening socket and prepares the poller.
    ///
    /// # Errors
    ///
    /// - [`ServerError::Bind`] if the address cannot be bound.
    /// - [`ServerError::Setup`] if the poller cannot be created.
    pub fn bind(config: ServerConfig, handler: H) -> Result<Self, ServerError> {
        let addr = config.listen_addr;
        let mut listener =
            TcpListener::bind(addr).map_err(|source| ServerError::Bind { addr, source })?;
        if let Err(e) = socket_opts::set_backlog(&listener, config.backlog) {
            warn!(error = %e, backlog = config.backlog, "could not apply listen backlog");
        }
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        let mut multiplexer = Multiplexer::new().map_err(ServerError::Setup)?;
        multiplexer
            .register_listener(&mut listener)
            .map_err(ServerError::Setup)?;

        info!(
            addr = %local_addr,
            framing = ?config.framing,
            max_connections = config.max_connections,
            "listening"
        );

        Ok(Self {
            config,
            listener: Some(listener),
            local_addr,
            multiplexer,
            registry: ConnectionRegistry::new(),
            handler,
            next_id: FIRST_CONNECTION_ID,
            shutdown: Arc::new(AtomicBool::new(false)),
            accept_deferred: false,
            read_backlog: Vec::new(),
            scratch: vec![0u8; READ_CHUNK],
        })
    }

    /// The bound address (useful when binding to port `0`).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// A handle that can stop the server from any thread.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: Arc::clone(&self.shutdown),
            waker: self.multiplexer.waker(),
        }
    }

    /// Live connections in the registry.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Connections registered with the multiplexer.  Equal to
    /// [`Server::connection_count`] between turns.
    pub fn registered_count(&self) -> usize {
        self.multiplexer.registered_count()
    }

    /// Ids of the live connections, in accept order.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.registry.ids()
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Marks `id` for closing; it is finalized at the end of the next turn.
    ///
    /// Returns `false` if the connection is unknown or already closing.
    pub fn close(&mut self, id: ConnectionId) -> bool {
        match self.registry.get_mut(id) {
            Ok(conn) => conn.begin_close(CloseReason::Requested),
            Err(_) => false,
        }
    }

    /// Runs the event loop until [`ServerHandle::shutdown`] is called or a
    /// fatal error occurs, then shuts down gracefully.
    ///
    /// # Errors
    ///
    /// Returns the fatal [`ServerError`] that stopped the loop.  Connections
    /// are closed before it is returned.
    pub fn run(&mut self) -> Result<(), ServerError> {
        let result = loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break Ok(());
            }
            if let Err(e) = self.turn() {
                error!(error = %e, "event loop failed");
                break Err(e);
            }
        };
        self.shutdown_gracefully();
        result
    }

    /// One iteration of the event loop.
    ///
    /// # Errors
    ///
    /// Returns a [`ServerError`] only for failures that make the whole
    /// server unusable (poll failure, listener failure).
    pub fn turn(&mut self) -> Result<(), ServerError> {
        // Connections with unread input left over from the last turn will
        // not be reported again, so do not sleep on them.
        let timeout = if self.read_backlog.is_empty() {
            self.config.poll_timeout
        } else {
            Duration::ZERO
        };
        let ready = self
            .multiplexer
            .poll(Some(timeout))
            .map_err(ServerError::Poll)?;
        let now = Instant::now();

        let mut accept = self.accept_deferred;
        let mut readable = std::mem::take(&mut self.read_backlog);
        let mut writable = Vec::new();
        for event in ready {
            match event {
                Ready::Listener => accept = true,
                Ready::Waker => trace!("woken"),
                Ready::Connection {
                    id,
                    readable: r,
                    writable: w,
                } => {
                    if r && !readable.contains(&id) {
                        readable.push(id);
                    }
                    if w {
                        writable.push(id);
                    }
                }
            }
        }

        if accept {
            self.accept_connections()?;
        }
        for id in readable {
            self.service_readable(id, now);
        }
        for id in writable {
            self.service_writable(id, now);
        }
        self.sweep_idle(now);
        self.finalize_closing();
        Ok(())
    }

    // ── Accept ────────────────────────────────────────────────────────────────

    fn accept_connections(&mut self) -> Result<(), ServerError> {
        self.accept_deferred = false;
        loop {
            let Some(listener) = self.listener.as_ref() else {
                return Ok(());
            };
            match listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => match classify(&e) {
                    ErrorClass::Transient => continue,
                    ErrorClass::Connection => {
                        warn!(error = %e, "transient accept error");
                    }
                    ErrorClass::ResourceExhaustion => {
                        warn!(error = %e, "out of resources; accepting again next turn");
                        self.accept_deferred = true;
                        return Ok(());
                    }
                    ErrorClass::Fatal => return Err(ServerError::Accept(e)),
                },
            }
        }
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        if self.registry.len() >= self.config.max_connections {
            warn!(
                peer = %peer,
                limit = self.config.max_connections,
                "connection limit reached; rejecting"
            );
            let _ = stream.shutdown(std::net::Shutdown::Both);
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "could not set TCP_NODELAY");
        }
        if let Some(keepalive) = &self.config.keepalive {
            if let Err(e) = socket_opts::configure_keepalive(&stream, keepalive) {
                debug!(peer = %peer, error = %e, "could not configure keepalive");
            }
        }

        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        let session = Session::new(self.config.framing, self.config.max_frame_size);
        let mut conn = Connection::new(id, stream, peer, session);

        if let Err(e) = self
            .multiplexer
            .register(id, conn.stream_mut(), Interest::Readable)
        {
            warn!(id = %id, peer = %peer, error = %e, "registration failed; dropping connection");
            conn.shutdown_socket();
            return;
        }
        // A fresh connection is always `Connecting`, so this cannot fail.
        let _ = conn.open();
        if let Err(e) = self.registry.add(conn) {
            error!(id = %id, error = %e, "could not track connection");
            return;
        }

        info!(id = %id, peer = %peer, active = self.registry.len(), "connection accepted");
        self.handler.on_connect(id, peer);
    }

    // ── Read path ─────────────────────────────────────────────────────────────

    fn service_readable(&mut self, id: ConnectionId, now: Instant) {
        let Ok(conn) = self.registry.get_mut(id) else {
            trace!(id = %id, "readiness for a connection that is already gone");
            return;
        };
        if !conn.state().is_open() || conn.close_after_flush() {
            return;
        }

        let mut budget = self.config.read_budget;
        loop {
            match conn.read_some(&mut self.scratch) {
                ReadOutcome::Data(n) => {
                    conn.touch(now);
                    conn.session_mut().extend(&self.scratch[..n]);
                    if let Err(reason) =
                        dispatch_frames(conn, &mut self.handler, self.config.max_write_buffer)
                    {
                        conn.begin_close(reason);
                        break;
                    }
                    if conn.close_after_flush() {
                        break;
                    }
                    budget = budget.saturating_sub(n);
                    if budget == 0 {
                        trace!(id = %id, "read budget spent; continuing next turn");
                        self.read_backlog.push(id);
                        break;
                    }
                }
                ReadOutcome::WouldBlock => break,
                ReadOutcome::Eof => {
                    if conn.session().has_partial_frame() {
                        debug!(
                            id = %id,
                            buffered = conn.session().buffered(),
                            "peer closed mid-frame; partial frame discarded"
                        );
                    }
                    conn.begin_close(CloseReason::EndOfStream);
                    break;
                }
                ReadOutcome::Failed(e) => {
                    conn.begin_close(CloseReason::ReadFailed(e));
                    break;
                }
            }
        }

        if !conn.state().is_open() {
            return;
        }
        if conn.close_after_flush() {
            stop_reading(&mut self.multiplexer, conn);
        } else if conn.pending_output() > 0 {
            want_writable(&mut self.multiplexer, conn);
        }
    }

    // ── Write path ────────────────────────────────────────────────────────────

    fn service_writable(&mut self, id: ConnectionId, now: Instant) {
        let Ok(conn) = self.registry.get_mut(id) else {
            return;
        };
        if !conn.state().is_open() {
            return;
        }

        loop {
            let before = conn.bytes_out();
            let outcome = conn.flush();
            if conn.bytes_out() > before {
                conn.touch(now);
            }
            match outcome {
                FlushOutcome::Blocked => return,
                FlushOutcome::Failed(e) => {
                    conn.begin_close(CloseReason::WriteFailed(e));
                    return;
                }
                FlushOutcome::Drained if conn.close_after_flush() => {
                    conn.begin_close(CloseReason::Requested);
                    return;
                }
                FlushOutcome::Drained => match self.handler.on_drain(id) {
                    Ok(Some(reply)) if !reply.is_empty() => {
                        if let Err(reason) = conn.queue_reply(reply, self.config.max_write_buffer) {
                            conn.begin_close(reason);
                            return;
                        }
                        if conn.close_after_flush() {
                            stop_reading(&mut self.multiplexer, conn);
                        }
                    }
                    Ok(_) => {
                        drop_writable(&mut self.multiplexer, conn);
                        return;
                    }
                    Err(e) => {
                        conn.begin_close(CloseReason::Handler(e.to_string()));
                        return;
                    }
                },
            }
        }
    }

    // ── Housekeeping ──────────────────────────────────────────────────────────

    fn sweep_idle(&mut self, now: Instant) {
        let Some(timeout) = self.config.idle_timeout else {
            return;
        };
        for conn in self.registry.iter_mut() {
            if conn.state().is_open() && conn.idle_for(now) >= timeout {
                debug!(id = %conn.id(), idle = ?conn.idle_for(now), "idle timeout");
                conn.begin_close(CloseReason::IdleTimeout);
            }
        }
    }

    fn finalize_closing(&mut self) {
        for id in self.registry.closing_ids() {
            let Some(mut conn) = self.registry.remove(id) else {
                continue;
            };
            if conn.pending_output() > 0 {
                let _ = conn.flush();
            }
            if let Err(e) = self.multiplexer.deregister(id, conn.stream_mut()) {
                debug!(id = %id, error = %e, "deregister failed");
            }
            conn.shutdown_socket();
            let reason = conn.mark_closed().ok().flatten();
            self.handler.on_disconnect(id);
            log_closed(&conn, reason.as_ref(), self.registry.len());
        }
    }

    // ── Shutdown ──────────────────────────────────────────────────────────────

    fn shutdown_gracefully(&mut self) {
        if let Some(mut listener) = self.listener.take() {
            if let Err(e) = self.multiplexer.deregister_listener(&mut listener) {
                debug!(error = %e, "listener deregistration failed");
            }
        }
        info!(connections = self.registry.len(), "shutting down");

        let deadline = Instant::now() + self.config.shutdown_grace;
        loop {
            let mut pending = 0;
            for conn in self.registry.iter_mut() {
                if !conn.state().is_open() || conn.pending_output() == 0 {
                    continue;
                }
                match conn.flush() {
                    FlushOutcome::Drained => {}
                    FlushOutcome::Blocked => pending += 1,
                    FlushOutcome::Failed(e) => {
                        conn.begin_close(CloseReason::WriteFailed(e));
                    }
                }
            }
            let now = Instant::now();
            if pending == 0 || now >= deadline {
                if pending > 0 {
                    warn!(pending, "grace period over; dropping unsent output");
                }
                break;
            }
            let wait = (deadline - now).min(self.config.poll_timeout);
            if let Err(e) = self.multiplexer.poll(Some(wait)) {
                warn!(error = %e, "poll failed during shutdown");
                break;
            }
        }

        for conn in self.registry.iter_mut() {
            conn.begin_close(CloseReason::Shutdown);
        }
        self.finalize_closing();
        info!("server stopped");
    }
}

/// Feeds every frame now complete in `conn`'s session to the handler.
fn dispatch_frames<H: FrameHandler>(
    conn: &mut Connection,
    handler: &mut H,
    max_write_buffer: usize,
) -> Result<(), CloseReason> {
    while !conn.close_after_flush() {
        let Some(frame) = conn.session_mut().next_frame()? else {
            break;
        };
        conn.record_frame();
        trace!(id = %conn.id(), len = frame.len(), "frame");
        match handler.on_frame(conn.id(), &frame) {
            Ok(Some(reply)) => conn.queue_reply(reply, max_write_buffer)?,
            Ok(None) => {}
            Err(e) => return Err(CloseReason::Handler(e.to_string())),
        }
    }
    Ok(())
}

/// After a close request no further input is processed: buffered input is
/// dropped and only write readiness stays armed.  With nothing left to send
/// the connection closes right away.
fn stop_reading(multiplexer: &mut Multiplexer, conn: &mut Connection) {
    let dropped = conn.session_mut().discard();
    if dropped > 0 {
        trace!(id = %conn.id(), dropped, "input after close request discarded");
    }
    if conn.pending_output() == 0 {
        conn.begin_close(CloseReason::Requested);
        return;
    }
    set_interest(multiplexer, conn, Interest::Writable);
}

fn want_writable(multiplexer: &mut Multiplexer, conn: &mut Connection) {
    let interest = conn.interest().with_writable();
    set_interest(multiplexer, conn, interest);
}

fn drop_writable(multiplexer: &mut Multiplexer, conn: &mut Connection) {
    let interest = conn.interest().without_writable();
    set_interest(multiplexer, conn, interest);
}

fn set_interest(multiplexer: &mut Multiplexer, conn: &mut Connection, interest: Interest) {
    if conn.interest() == interest {
        return;
    }
    let id = conn.id();
    match multiplexer.reregister(id, conn.stream_mut(), interest) {
        Ok(()) => conn.set_interest(interest),
        Err(e) => {
            conn.begin_close(CloseReason::Registration(e));
        }
    }
}

fn log_closed(conn: &Connection, reason: Option<&CloseReason>, active: usize) {
    let reason_text = reason.map_or_else(|| "unknown".to_string(), ToString::to_string);
    let peer_fault = reason.is_some_and(CloseReason::is_peer_fault);
    if peer_fault {
        warn!(
            id = %conn.id(),
            peer = %conn.peer_addr(),
            reason = %reason_text,
            frames_in = conn.frames_in(),
            bytes_in = conn.bytes_in(),
            bytes_out = conn.bytes_out(),
            active,
            "connection closed"
        );
    } else {
        info!(
            id = %conn.id(),
            peer = %conn.peer_addr(),
            reason = %reason_text,
            frames_in = conn.frames_in(),
            bytes_in = conn.bytes_in(),
            bytes_out = conn.bytes_out(),
            active,
            "connection closed"
        );
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
