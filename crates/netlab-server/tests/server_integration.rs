//! Integration tests for the event loop, driven turn by turn.
//!
//! # How these tests work
//!
//! The server is single-threaded, so instead of spawning it the tests call
//! [`Server::turn`] themselves between client actions.  Clients are plain
//! blocking `std::net::TcpStream`s switched to non-blocking mode only while
//! collecting replies.  Every scenario therefore runs deterministically on
//! one thread, and the handler can be inspected directly through
//! [`Server::handler`].
//!
//! ```text
//! client.write_all(..)  ──►  pump(server)  ──►  assert on server.handler()
//! ```

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use netlab_core::{ConnectionId, Framing};
use netlab_server::{handler_fn, FrameHandler, HandlerError, Reply, Server, ServerConfig};

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Handler that remembers every callback and optionally echoes.
#[derive(Default)]
struct RecordingHandler {
    connects: Vec<ConnectionId>,
    frames: Vec<(ConnectionId, Vec<u8>)>,
    disconnects: Vec<ConnectionId>,
    echo: bool,
}

impl RecordingHandler {
    fn echoing() -> Self {
        Self {
            echo: true,
            ..Self::default()
        }
    }

    fn frames_from(&self, id: ConnectionId) -> Vec<Vec<u8>> {
        self.frames
            .iter()
            .filter(|(from, _)| *from == id)
            .map(|(_, f)| f.clone())
            .collect()
    }
}

impl FrameHandler for RecordingHandler {
    fn on_connect(&mut self, id: ConnectionId, _peer: std::net::SocketAddr) {
        self.connects.push(id);
    }

    fn on_frame(&mut self, id: ConnectionId, frame: &[u8]) -> Result<Option<Reply>, HandlerError> {
        self.frames.push((id, frame.to_vec()));
        Ok(self.echo.then(|| Reply::frame(frame.to_vec())))
    }

    fn on_disconnect(&mut self, id: ConnectionId) {
        self.disconnects.push(id);
    }
}

fn config() -> ServerConfig {
    ServerConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        poll_timeout: Duration::from_millis(10),
        idle_timeout: None,
        shutdown_grace: Duration::from_millis(500),
        keepalive: None,
        ..ServerConfig::default()
    }
}

fn frame(body: &[u8]) -> Vec<u8> {
    let mut v = (body.len() as u32).to_be_bytes().to_vec();
    v.extend_from_slice(body);
    v
}

/// Turns the loop until `done` holds, panicking after a generous bound.
fn pump_until<H: FrameHandler>(server: &mut Server<H>, mut done: impl FnMut(&Server<H>) -> bool) {
    for _ in 0..1000 {
        server.turn().expect("turn");
        if done(server) {
            return;
        }
    }
    panic!("condition not reached");
}

/// Turns the loop a fixed number of times.
fn pump<H: FrameHandler>(server: &mut Server<H>, turns: usize) {
    for _ in 0..turns {
        server.turn().expect("turn");
    }
}

/// Reads whatever `client` has available without blocking.
/// Returns `None` once the peer has closed.
fn drain(client: &mut TcpStream, out: &mut Vec<u8>) -> Option<()> {
    client.set_nonblocking(true).unwrap();
    let mut buf = [0u8; 8192];
    loop {
        match client.read(&mut buf) {
            Ok(0) => return None,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Some(()),
            Err(_) => return None,
        }
    }
}

/// Pumps until `want` bytes arrived on `client`.
fn receive<H: FrameHandler>(server: &mut Server<H>, client: &mut TcpStream, want: usize) -> Vec<u8> {
    let mut out = Vec::new();
    for _ in 0..1000 {
        server.turn().expect("turn");
        let open = drain(client, &mut out).is_some();
        if out.len() >= want || !open {
            break;
        }
    }
    out
}

/// Pumps until the server has closed `client`.
fn wait_closed<H: FrameHandler>(server: &mut Server<H>, client: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    for _ in 0..1000 {
        server.turn().expect("turn");
        if drain(client, &mut out).is_none() {
            return out;
        }
    }
    panic!("server never closed the connection");
}

// ── Framing over the wire ─────────────────────────────────────────────────────

#[test]
fn test_hello_frame_is_dispatched_exactly_once() {
    // Arrange
    let mut server = Server::bind(config(), RecordingHandler::default()).unwrap();
    let mut client = TcpStream::connect(server.local_addr()).unwrap();

    // Act
    client.write_all(b"\x00\x00\x00\x05hello").unwrap();
    pump_until(&mut server, |s| !s.handler().frames.is_empty());
    pump(&mut server, 5);

    // Assert
    let h = server.handler();
    assert_eq!(h.frames.len(), 1);
    assert_eq!(h.frames[0].1, b"hello");
}

#[test]
fn test_frame_split_across_writes_is_reassembled() {
    // Arrange
    let mut server = Server::bind(config(), RecordingHandler::default()).unwrap();
    let mut client = TcpStream::connect(server.local_addr()).unwrap();
    client.set_nodelay(true).unwrap();
    let bytes = frame(b"split delivery");

    // Act – one byte per write, with loop turns in between
    for b in &bytes {
        client.write_all(std::slice::from_ref(b)).unwrap();
        pump(&mut server, 1);
    }
    pump_until(&mut server, |s| !s.handler().frames.is_empty());

    // Assert
    assert_eq!(server.handler().frames[0].1, b"split delivery");
}

#[test]
fn test_truncated_frame_then_close_dispatches_nothing() {
    // Arrange
    let mut server = Server::bind(config(), RecordingHandler::default()).unwrap();
    let client = TcpStream::connect(server.local_addr()).unwrap();

    // Act
    (&client).write_all(b"\x00\x00\x00\x05he").unwrap();
    client.shutdown(Shutdown::Write).unwrap();
    pump_until(&mut server, |s| s.handler().disconnects.len() == 1);

    // Assert
    assert!(server.handler().frames.is_empty());
    assert_eq!(server.connection_count(), 0);
}

#[test]
fn test_frames_completed_before_eof_are_still_dispatched() {
    // Arrange
    let mut server = Server::bind(config(), RecordingHandler::default()).unwrap();
    let client = TcpStream::connect(server.local_addr()).unwrap();
    let mut bytes = frame(b"one");
    bytes.extend(frame(b"two"));

    // Act
    (&client).write_all(&bytes).unwrap();
    client.shutdown(Shutdown::Write).unwrap();
    pump_until(&mut server, |s| s.handler().disconnects.len() == 1);

    // Assert
    let frames: Vec<_> = server.handler().frames.iter().map(|(_, f)| f.clone()).collect();
    assert_eq!(frames, vec![b"one".to_vec(), b"two".to_vec()]);
}

#[test]
fn test_line_framing_mode() {
    // Arrange
    let config = ServerConfig {
        framing: Framing::Line,
        ..config()
    };
    let mut server = Server::bind(config, RecordingHandler::echoing()).unwrap();
    let mut client = TcpStream::connect(server.local_addr()).unwrap();

    // Act
    client.write_all(b"ECHO hi\r\nsecond\n").unwrap();
    let reply = receive(&mut server, &mut client, b"ECHO hi\nsecond\n".len());

    // Assert
    assert_eq!(reply, b"ECHO hi\nsecond\n");
}

// ── Isolation between connections ─────────────────────────────────────────────

#[test]
fn test_only_the_sending_client_is_dispatched() {
    // Arrange
    let mut server = Server::bind(config(), RecordingHandler::default()).unwrap();
    let mut a = TcpStream::connect(server.local_addr()).unwrap();
    let _b = TcpStream::connect(server.local_addr()).unwrap();
    pump_until(&mut server, |s| s.connection_count() == 2);
    let ids = server.connection_ids();

    // Act
    a.write_all(&frame(b"from a")).unwrap();
    pump_until(&mut server, |s| !s.handler().frames.is_empty());
    pump(&mut server, 5);

    // Assert
    let h = server.handler();
    assert_eq!(h.frames_from(ids[0]), vec![b"from a".to_vec()]);
    assert!(h.frames_from(ids[1]).is_empty());
}

#[test]
fn test_oversized_frame_closes_only_the_offender() {
    // Arrange
    let config = ServerConfig {
        max_frame_size: 64,
        ..config()
    };
    let mut server = Server::bind(config, RecordingHandler::echoing()).unwrap();
    let mut offender = TcpStream::connect(server.local_addr()).unwrap();
    let mut bystander = TcpStream::connect(server.local_addr()).unwrap();
    pump_until(&mut server, |s| s.connection_count() == 2);

    // Act
    offender.write_all(&1_000u32.to_be_bytes()).unwrap();
    wait_closed(&mut server, &mut offender);
    bystander.write_all(&frame(b"still here")).unwrap();
    let reply = receive(&mut server, &mut bystander, 14);

    // Assert
    assert_eq!(reply, frame(b"still here"));
    assert_eq!(server.connection_count(), 1);
    assert_eq!(server.handler().disconnects.len(), 1);
}

#[test]
fn test_offender_and_bystander_ready_in_the_same_turn() {
    // Arrange
    let config = ServerConfig {
        max_frame_size: 64,
        ..config()
    };
    let mut server = Server::bind(config, RecordingHandler::default()).unwrap();
    let mut offender = TcpStream::connect(server.local_addr()).unwrap();
    pump_until(&mut server, |s| s.connection_count() == 1);
    let mut bystander = TcpStream::connect(server.local_addr()).unwrap();
    pump_until(&mut server, |s| s.connection_count() == 2);
    let ids = server.handler().connects.clone();

    // Act – both writes land before a single turn services them
    offender.write_all(&1_000u32.to_be_bytes()).unwrap();
    bystander.write_all(&frame(b"ready")).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    server.turn().expect("turn");

    // Assert
    let h = server.handler();
    assert_eq!(h.frames, vec![(ids[1], b"ready".to_vec())]);
    assert_eq!(h.disconnects, vec![ids[0]]);
    assert_eq!(server.connection_ids(), vec![ids[1]]);
    assert_eq!(server.registered_count(), 1);
}

#[test]
fn test_abrupt_disconnect_cleans_up_once() {
    // Arrange
    let mut server = Server::bind(config(), RecordingHandler::default()).unwrap();
    let client = TcpStream::connect(server.local_addr()).unwrap();
    pump_until(&mut server, |s| s.connection_count() == 1);

    // Act
    drop(client);
    pump_until(&mut server, |s| s.connection_count() == 0);
    pump(&mut server, 5);

    // Assert
    let h = server.handler();
    assert_eq!(h.connects.len(), 1);
    assert_eq!(h.disconnects, h.connects);
    assert_eq!(server.registered_count(), 0);
}

#[test]
fn test_registry_and_multiplexer_stay_in_lockstep() {
    // Arrange
    let mut server = Server::bind(config(), RecordingHandler::default()).unwrap();
    let mut clients: Vec<TcpStream> = (0..5)
        .map(|_| TcpStream::connect(server.local_addr()).unwrap())
        .collect();

    // Act / Assert – grow, then shrink, checking after every step
    pump_until(&mut server, |s| s.connection_count() == 5);
    assert_eq!(server.registered_count(), 5);
    while let Some(client) = clients.pop() {
        drop(client);
        let expected = clients.len();
        pump_until(&mut server, |s| s.connection_count() == expected);
        assert_eq!(server.registered_count(), expected);
    }
}

// ── Output path ───────────────────────────────────────────────────────────────

#[test]
fn test_large_reply_is_written_completely() {
    // Arrange – a reply far larger than a socket send buffer
    let body = vec![0x5Au8; 4 * 1024 * 1024];
    let reply_body = body.clone();
    let handler = handler_fn(move |_, _| Some(reply_body.clone()));
    let config = ServerConfig {
        max_frame_size: 8 * 1024 * 1024,
        ..config()
    };
    let mut server = Server::bind(config, handler).unwrap();
    let mut client = TcpStream::connect(server.local_addr()).unwrap();

    // Act
    client.write_all(&frame(b"go")).unwrap();
    let reply = receive(&mut server, &mut client, body.len() + 4);

    // Assert
    assert_eq!(reply.len(), body.len() + 4);
    assert_eq!(&reply[4..], &body[..]);
}

#[test]
fn test_write_buffer_limit_closes_connection() {
    // Arrange
    let handler = handler_fn(|_, _| Some(vec![0u8; 4096]));
    let config = ServerConfig {
        max_write_buffer: 1024,
        ..config()
    };
    let mut server = Server::bind(config, handler).unwrap();
    let mut client = TcpStream::connect(server.local_addr()).unwrap();

    // Act
    client.write_all(&frame(b"x")).unwrap();

    // Assert
    let received = wait_closed(&mut server, &mut client);
    assert!(received.is_empty());
}

// ── Limits, timeouts, shutdown ────────────────────────────────────────────────

#[test]
fn test_connection_limit_turns_away_extra_clients() {
    // Arrange
    let config = ServerConfig {
        max_connections: 2,
        ..config()
    };
    let mut server = Server::bind(config, RecordingHandler::default()).unwrap();
    let _a = TcpStream::connect(server.local_addr()).unwrap();
    let _b = TcpStream::connect(server.local_addr()).unwrap();
    pump_until(&mut server, |s| s.connection_count() == 2);

    // Act
    let mut c = TcpStream::connect(server.local_addr()).unwrap();
    wait_closed(&mut server, &mut c);

    // Assert
    assert_eq!(server.connection_count(), 2);
    assert_eq!(server.handler().connects.len(), 2);
}

#[test]
fn test_idle_timeout_spares_active_clients() {
    // Arrange
    let config = ServerConfig {
        idle_timeout: Some(Duration::from_millis(200)),
        ..config()
    };
    let mut server = Server::bind(config, RecordingHandler::default()).unwrap();
    let mut idle = TcpStream::connect(server.local_addr()).unwrap();
    let mut busy = TcpStream::connect(server.local_addr()).unwrap();
    pump_until(&mut server, |s| s.connection_count() == 2);

    // Act – keep `busy` talking while `idle` stays silent
    let mut idle_out = Vec::new();
    let mut idle_closed = false;
    for _ in 0..100 {
        busy.write_all(&frame(b"ping")).unwrap();
        pump(&mut server, 1);
        std::thread::sleep(Duration::from_millis(10));
        if drain(&mut idle, &mut idle_out).is_none() {
            idle_closed = true;
            break;
        }
    }

    // Assert
    assert!(idle_closed, "idle client should have been closed");
    assert_eq!(server.connection_count(), 1);
}

#[test]
fn test_shutdown_flushes_pending_replies_then_closes() {
    // Arrange
    let mut server = Server::bind(config(), RecordingHandler::echoing()).unwrap();
    let mut client = TcpStream::connect(server.local_addr()).unwrap();
    pump_until(&mut server, |s| s.connection_count() == 1);
    client.write_all(&frame(b"last words")).unwrap();
    pump_until(&mut server, |s| !s.handler().frames.is_empty());

    // Act
    server.handle().shutdown();
    server.run().unwrap();

    // Assert
    let mut out = Vec::new();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    client.read_to_end(&mut out).unwrap();
    assert_eq!(out, frame(b"last words"));
    assert_eq!(server.connection_count(), 0);
    assert_eq!(server.handler().disconnects.len(), 1);
}

#[test]
fn test_shutdown_from_another_thread_stops_run() {
    // Arrange
    let mut server = Server::bind(config(), handler_fn(|_, f| Some(f.to_vec()))).unwrap();
    let handle = server.handle();
    let addr = server.local_addr();

    // Act
    let runner = std::thread::spawn(move || server.run());
    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(&frame(b"hi")).unwrap();
    let mut reply = [0u8; 6];
    client.read_exact(&mut reply).unwrap();
    handle.shutdown();

    // Assert
    assert_eq!(&reply, b"\x00\x00\x00\x02hi");
    assert!(runner.join().unwrap().is_ok());
}

#[test]
fn test_handler_error_closes_connection() {
    // Arrange
    struct Strict;
    impl FrameHandler for Strict {
        fn on_frame(&mut self, _: ConnectionId, frame: &[u8]) -> Result<Option<Reply>, HandlerError> {
            if frame.is_empty() {
                return Err(HandlerError::Protocol("empty frame".into()));
            }
            Ok(None)
        }
    }
    let mut server = Server::bind(config(), Strict).unwrap();
    let mut client = TcpStream::connect(server.local_addr()).unwrap();

    // Act
    client.write_all(&frame(b"")).unwrap();

    // Assert
    wait_closed(&mut server, &mut client);
    assert_eq!(server.connection_count(), 0);
}
