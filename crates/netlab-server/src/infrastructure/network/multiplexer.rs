//! Multiplexer: a thin wrapper over the OS readiness mechanism (`mio::Poll`).
//!
//! # What is readiness multiplexing? (for beginners)
//!
//! Instead of one thread per client blocking in `read`, a single thread asks
//! the kernel "which of these sockets can I read from or write to *right
//! now* without blocking?".  On Linux this is `epoll`, on macOS/BSD `kqueue`;
//! `mio` hides the difference.
//!
//! Each socket is registered under a [`Token`] together with an *interest*
//! (readable, writable, or both).  [`Multiplexer::poll`] then blocks for at
//! most the given timeout and returns the tokens that became ready.
//!
//! `mio` is **edge-triggered**: a socket is reported once when it *becomes*
//! ready.  The event loop therefore always reads (or writes) until the
//! kernel answers `WouldBlock`, otherwise the remaining bytes would never be
//! reported again.
//!
//! # Token layout
//!
//! | token | meaning                                  |
//! |-------|------------------------------------------|
//! | `0`   | the listening socket                     |
//! | `1`   | the [`Waker`] used to interrupt a poll   |
//! | `2..` | client connections (`ConnectionId`)      |

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Poll, Token, Waker};
use netlab_core::ConnectionId;
use tracing::{debug, trace};

/// Token of the listening socket.
pub const LISTENER: Token = Token(0);

/// Token of the cross-thread waker.
pub const WAKER: Token = Token(1);

/// First identifier handed to a client connection.
pub const FIRST_CONNECTION_ID: usize = 2;

/// Default capacity of the per-poll event buffer.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// What a connection wants to be told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
    Both,
}

impl Interest {
    /// `true` if write readiness is requested.
    pub fn is_writable(self) -> bool {
        matches!(self, Interest::Writable | Interest::Both)
    }

    /// `true` if read readiness is requested.
    pub fn is_readable(self) -> bool {
        matches!(self, Interest::Readable | Interest::Both)
    }

    /// The same interest with write readiness added.
    pub fn with_writable(self) -> Self {
        match self {
            Interest::Readable | Interest::Both => Interest::Both,
            Interest::Writable => Interest::Writable,
        }
    }

    /// The same interest with write readiness removed.
    ///
    /// A connection is never left with no interest at all, so `Writable`
    /// falls back to `Readable`.
    pub fn without_writable(self) -> Self {
        Interest::Readable
    }

    fn to_mio(self) -> mio::Interest {
        match self {
            Interest::Readable => mio::Interest::READABLE,
            Interest::Writable => mio::Interest::WRITABLE,
            Interest::Both => mio::Interest::READABLE | mio::Interest::WRITABLE,
        }
    }
}

/// One readiness notification, already translated out of `mio` types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ready {
    /// The listening socket has pending connections.
    Listener,
    /// Another thread called [`Waker::wake`].
    Waker,
    /// A client connection can make progress.
    ///
    /// Errors and hang-ups are folded into `readable`: the next read reports
    /// the actual failure (or end-of-stream).
    Connection {
        id: ConnectionId,
        readable: bool,
        writable: bool,
    },
}

/// Owner of the `mio::Poll` instance plus the bookkeeping of which
/// connection ids are currently registered.
pub struct Multiplexer {
    poll: Poll,
    events: Events,
    registered: HashMap<ConnectionId, Interest>,
    waker: Arc<Waker>,
}

impl Multiplexer {
    /// Creates a poller with room for [`DEFAULT_EVENT_CAPACITY`] events per poll.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the poll instance or the waker cannot be created.
    pub fn new() -> io::Result<Self> {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Creates a poller with room for `capacity` events per poll.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the poll instance or the waker cannot be created.
    pub fn with_capacity(capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        Ok(Self {
            poll,
            events: Events::with_capacity(capacity.max(1)),
            registered: HashMap::new(),
            waker,
        })
    }

    /// Handle that wakes a blocked [`Multiplexer::poll`] from any thread.
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    // ── Listener ──────────────────────────────────────────────────────────────

    /// Registers the listening socket for readable (= acceptable) events.
    ///
    /// # Errors
    ///
    /// Returns the OS error from the registration call.
    pub fn register_listener<S: Source + ?Sized>(&mut self, listener: &mut S) -> io::Result<()> {
        self.poll
            .registry()
            .register(listener, LISTENER, mio::Interest::READABLE)
    }

    /// Removes the listening socket from the poll set.
    ///
    /// # Errors
    ///
    /// Returns the OS error from the deregistration call.
    pub fn deregister_listener<S: Source + ?Sized>(&mut self, listener: &mut S) -> io::Result<()> {
        self.poll.registry().deregister(listener)
    }

    // ── Connections ───────────────────────────────────────────────────────────

    /// Starts watching `source` under `id`.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if `id` is already registered, otherwise the
    /// OS error from the registration call.
    pub fn register<S: Source + ?Sized>(
        &mut self,
        id: ConnectionId,
        source: &mut S,
        interest: Interest,
    ) -> io::Result<()> {
        if self.registered.contains_key(&id) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("connection {id} is already registered"),
            ));
        }
        self.poll
            .registry()
            .register(source, Token(id.get()), interest.to_mio())?;
        self.registered.insert(id, interest);
        trace!(id = %id, ?interest, "registered");
        Ok(())
    }

    /// Changes the interest of an already registered connection.
    ///
    /// Re-registering with the interest already in place is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if `id` is not registered, otherwise the OS error
    /// from the re-registration call.
    pub fn reregister<S: Source + ?Sized>(
        &mut self,
        id: ConnectionId,
        source: &mut S,
        interest: Interest,
    ) -> io::Result<()> {
        match self.registered.get(&id) {
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("connection {id} is not registered"),
            )),
            Some(current) if *current == interest => Ok(()),
            Some(_) => {
                self.poll
                    .registry()
                    .reregister(source, Token(id.get()), interest.to_mio())?;
                self.registered.insert(id, interest);
                trace!(id = %id, ?interest, "reregistered");
                Ok(())
            }
        }
    }

    /// Stops watching `id`.
    ///
    /// Returns `Ok(false)` if `id` was not registered.  The id is forgotten
    /// even when the OS call fails, so the registered set can never drift
    /// from the connection registry.
    ///
    /// # Errors
    ///
    /// Returns the OS error from the deregistration call (for logging only).
    pub fn deregister<S: Source + ?Sized>(
        &mut self,
        id: ConnectionId,
        source: &mut S,
    ) -> io::Result<bool> {
        if self.registered.remove(&id).is_none() {
            return Ok(false);
        }
        trace!(id = %id, "deregistered");
        self.poll.registry().deregister(source)?;
        Ok(true)
    }

    /// Interest currently registered for `id`.
    pub fn interest(&self, id: ConnectionId) -> Option<Interest> {
        self.registered.get(&id).copied()
    }

    /// `true` if `id` is in the poll set.
    pub fn is_registered(&self, id: ConnectionId) -> bool {
        self.registered.contains_key(&id)
    }

    /// Number of registered connections (listener and waker excluded).
    pub fn registered_count(&self) -> usize {
        self.registered.len()
    }

    // ── Polling ───────────────────────────────────────────────────────────────

    /// Waits up to `timeout` (forever for `None`) and returns what became ready.
    ///
    /// An interrupted wait (`EINTR`) is retried.
    ///
    /// # Errors
    ///
    /// Any other poll failure is returned unchanged; the caller treats it as
    /// fatal.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Ready>> {
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    debug!("poll interrupted; retrying");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        let ready = self
            .events
            .iter()
            .map(|event| match event.token() {
                LISTENER => Ready::Listener,
                WAKER => Ready::Waker,
                Token(n) => Ready::Connection {
                    id: ConnectionId(n),
                    readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                    writable: event.is_writable() || event.is_write_closed(),
                },
            })
            .collect();
        Ok(ready)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::{TcpListener, TcpStream};
    use std::io::Write;

    /// A connected pair: the mio side (server end) and a blocking std client.
    fn connected_pair() -> (TcpStream, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        server_side.set_nonblocking(true).unwrap();
        (TcpStream::from_std(server_side), client)
    }

    fn poll_until<F>(mux: &mut Multiplexer, mut pred: F) -> Vec<Ready>
    where
        F: FnMut(&Ready) -> bool,
    {
        for _ in 0..50 {
            let ready = mux.poll(Some(Duration::from_millis(20))).unwrap();
            if ready.iter().any(&mut pred) {
                return ready;
            }
        }
        panic!("expected readiness was never reported");
    }

    #[test]
    fn test_interest_writable_toggling() {
        assert_eq!(Interest::Readable.with_writable(), Interest::Both);
        assert_eq!(Interest::Both.with_writable(), Interest::Both);
        assert_eq!(Interest::Both.without_writable(), Interest::Readable);
        assert!(Interest::Both.is_readable() && Interest::Both.is_writable());
        assert!(!Interest::Readable.is_writable());
    }

    #[test]
    fn test_register_tracks_connection_ids() {
        // Arrange
        let mut mux = Multiplexer::new().unwrap();
        let (mut stream, _client) = connected_pair();
        let id = ConnectionId(FIRST_CONNECTION_ID);

        // Act
        mux.register(id, &mut stream, Interest::Readable).unwrap();

        // Assert
        assert!(mux.is_registered(id));
        assert_eq!(mux.registered_count(), 1);
        assert_eq!(mux.interest(id), Some(Interest::Readable));
    }

    #[test]
    fn test_double_register_is_rejected() {
        let mut mux = Multiplexer::new().unwrap();
        let (mut stream, _client) = connected_pair();
        let id = ConnectionId(7);
        mux.register(id, &mut stream, Interest::Readable).unwrap();

        let err = mux.register(id, &mut stream, Interest::Readable).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(mux.registered_count(), 1);
    }

    #[test]
    fn test_deregister_unknown_id_is_noop() {
        let mut mux = Multiplexer::new().unwrap();
        let (mut stream, _client) = connected_pair();

        let removed = mux.deregister(ConnectionId(99), &mut stream).unwrap();

        assert!(!removed);
        assert_eq!(mux.registered_count(), 0);
    }

    #[test]
    fn test_deregister_forgets_id() {
        let mut mux = Multiplexer::new().unwrap();
        let (mut stream, _client) = connected_pair();
        let id = ConnectionId(3);
        mux.register(id, &mut stream, Interest::Both).unwrap();

        assert!(mux.deregister(id, &mut stream).unwrap());

        assert!(!mux.is_registered(id));
        // A second deregister is a no-op.
        assert!(!mux.deregister(id, &mut stream).unwrap());
    }

    #[test]
    fn test_deregistered_connection_is_not_reported() {
        // Arrange
        let mut mux = Multiplexer::new().unwrap();
        let (mut stream, mut client) = connected_pair();
        let id = ConnectionId(6);
        mux.register(id, &mut stream, Interest::Readable).unwrap();
        mux.deregister(id, &mut stream).unwrap();

        // Act
        client.write_all(b"late").unwrap();
        let mut reported = Vec::new();
        for _ in 0..5 {
            reported.extend(mux.poll(Some(Duration::from_millis(20))).unwrap());
        }

        // Assert
        assert!(reported.is_empty(), "got {reported:?}");
        assert_eq!(mux.interest(id), None);
    }

    #[test]
    fn test_reregister_unknown_id_is_not_found() {
        let mut mux = Multiplexer::new().unwrap();
        let (mut stream, _client) = connected_pair();

        let err = mux
            .reregister(ConnectionId(5), &mut stream, Interest::Both)
            .unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_poll_reports_readable_connection() {
        // Arrange
        let mut mux = Multiplexer::new().unwrap();
        let (mut stream, mut client) = connected_pair();
        let id = ConnectionId(4);
        mux.register(id, &mut stream, Interest::Readable).unwrap();

        // Act
        client.write_all(b"ping").unwrap();
        let ready = poll_until(&mut mux, |r| matches!(r, Ready::Connection { .. }));

        // Assert
        assert!(ready.contains(&Ready::Connection {
            id,
            readable: true,
            writable: false
        }));
    }

    #[test]
    fn test_reregister_for_writable_reports_writable() {
        let mut mux = Multiplexer::new().unwrap();
        let (mut stream, _client) = connected_pair();
        let id = ConnectionId(4);
        mux.register(id, &mut stream, Interest::Readable).unwrap();

        mux.reregister(id, &mut stream, Interest::Both).unwrap();
        let ready = poll_until(&mut mux, |r| {
            matches!(r, Ready::Connection { writable: true, .. })
        });

        assert!(!ready.is_empty());
        assert_eq!(mux.interest(id), Some(Interest::Both));
    }

    #[test]
    fn test_listener_readiness_uses_reserved_token() {
        let mut mux = Multiplexer::new().unwrap();
        let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        mux.register_listener(&mut listener).unwrap();

        let _client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let ready = poll_until(&mut mux, |r| *r == Ready::Listener);

        assert!(ready.contains(&Ready::Listener));
        assert_eq!(mux.registered_count(), 0, "listener is not a connection");
    }

    #[test]
    fn test_waker_interrupts_poll() {
        // Arrange
        let mut mux = Multiplexer::new().unwrap();
        let waker = mux.waker();

        // Act
        let handle = std::thread::spawn(move || waker.wake().unwrap());
        let ready = mux.poll(Some(Duration::from_secs(5))).unwrap();
        handle.join().unwrap();

        // Assert
        assert_eq!(ready, vec![Ready::Waker]);
    }
}
