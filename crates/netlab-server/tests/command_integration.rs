//! End-to-end tests of the command protocol over a real socket.
//!
//! A [`CommandHandler`] backed by a [`FileStore`] in a temporary directory is
//! served by a [`Server`] that the test drives turn by turn, exactly like
//! `server_integration.rs`.  The client side decodes replies with the same
//! `Session` the server uses.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use bytes::Bytes;
use netlab_core::protocol::command::replies;
use netlab_core::{encode_frame_vec, Framing, Session};
use netlab_server::{CommandHandler, FileStore, Server, ServerConfig};
use tempfile::TempDir;

type CommandServer = Server<CommandHandler<FileStore>>;

struct Harness {
    server: CommandServer,
    dir: TempDir,
}

struct Client {
    stream: TcpStream,
    session: Session,
    closed: bool,
}

impl Harness {
    fn new() -> Self {
        Self::with_framing(Framing::LengthPrefixed)
    }

    fn with_framing(framing: Framing) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("files")).unwrap();
        let config = ServerConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            poll_timeout: Duration::from_millis(10),
            idle_timeout: None,
            keepalive: None,
            framing,
            ..ServerConfig::default()
        };
        let server = Server::bind(config, CommandHandler::new(store, framing)).unwrap();
        Self { server, dir }
    }

    fn connect(&mut self) -> Client {
        let stream = TcpStream::connect(self.server.local_addr()).unwrap();
        stream.set_nonblocking(true).unwrap();
        let framing = self.server.config().framing;
        Client {
            stream,
            session: Session::new(framing, 16 * 1024 * 1024),
            closed: false,
        }
    }

    fn stored(&self, name: &str) -> Option<Vec<u8>> {
        std::fs::read(self.dir.path().join("files").join(name)).ok()
    }

    fn store(&self, name: &str, content: &[u8]) {
        std::fs::write(self.dir.path().join("files").join(name), content).unwrap();
    }

    /// Pumps the server until `client` has received `count` frames.
    fn recv_frames(&mut self, client: &mut Client, count: usize) -> Vec<Bytes> {
        let mut frames = Vec::new();
        for _ in 0..2000 {
            while let Some(frame) = client.session.next_frame().unwrap() {
                frames.push(frame);
            }
            if frames.len() >= count || client.closed {
                break;
            }
            self.server.turn().unwrap();
            client.pull();
        }
        frames
    }

    fn recv_line(&mut self, client: &mut Client) -> String {
        let frames = self.recv_frames(client, 1);
        assert_eq!(frames.len(), 1, "expected exactly one reply frame");
        String::from_utf8(frames[0].to_vec()).unwrap()
    }

    fn request(&mut self, client: &mut Client, line: &str) -> String {
        client.send(line.as_bytes());
        self.recv_line(client)
    }
}

impl Client {
    fn send(&mut self, payload: &[u8]) {
        let bytes = encode_frame_vec(self.session.framing(), payload).unwrap();
        self.stream.set_nonblocking(false).unwrap();
        self.stream.write_all(&bytes).unwrap();
        self.stream.set_nonblocking(true).unwrap();
    }

    fn pull(&mut self) {
        let mut buf = [0u8; 65536];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    self.closed = true;
                    return;
                }
                Ok(n) => self.session.extend(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(_) => {
                    self.closed = true;
                    return;
                }
            }
        }
    }
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

// ── Simple commands ───────────────────────────────────────────────────────────

#[test]
fn test_echo_replies_with_text() {
    let mut h = Harness::new();
    let mut c = h.connect();
    assert_eq!(h.request(&mut c, "ECHO hello world"), "hello world");
}

#[test]
fn test_time_has_expected_shape() {
    // Arrange
    let mut h = Harness::new();
    let mut c = h.connect();

    // Act
    let reply = h.request(&mut c, "TIME");

    // Assert – YYYY-MM-DD HH:MM:SS
    assert_eq!(reply.len(), 19);
    assert!(chrono::NaiveDateTime::parse_from_str(&reply, "%Y-%m-%d %H:%M:%S").is_ok());
}

#[test]
fn test_list_on_empty_store_and_after_upload() {
    // Arrange
    let mut h = Harness::new();
    let mut c = h.connect();
    assert_eq!(h.request(&mut c, "LIST"), replies::NO_FILES);
    h.store("b.txt", b"b");
    h.store("a.txt", b"a");

    // Act
    let reply = h.request(&mut c, "LIST");

    // Assert
    assert_eq!(reply, "a.txt, b.txt");
}

#[test]
fn test_unknown_command() {
    let mut h = Harness::new();
    let mut c = h.connect();
    assert_eq!(h.request(&mut c, "DANCE"), replies::UNKNOWN_COMMAND);
}

#[test]
fn test_close_says_bye_and_disconnects() {
    // Arrange
    let mut h = Harness::new();
    let mut c = h.connect();

    // Act
    let reply = h.request(&mut c, "CLOSE");
    h.recv_frames(&mut c, usize::MAX);

    // Assert
    assert_eq!(reply, replies::BYE);
    assert!(c.closed);
    assert_eq!(h.server.connection_count(), 0);
}

// ── Uploads ───────────────────────────────────────────────────────────────────

#[test]
fn test_upload_stores_file() {
    // Arrange
    let mut h = Harness::new();
    let mut c = h.connect();
    let content = patterned(200_000);

    // Act
    let offset = h.request(&mut c, &format!("UPLOAD data.bin {}", content.len()));
    for chunk in content.chunks(64 * 1024) {
        c.send(chunk);
    }
    let done = h.recv_line(&mut c);

    // Assert
    assert_eq!(offset, "OFFSET 0");
    assert_eq!(done, replies::UPLOAD_COMPLETE);
    assert_eq!(h.stored("data.bin").unwrap(), content);
}

#[test]
fn test_upload_resumes_partial_file() {
    // Arrange – a previous attempt stored the first 1000 bytes
    let mut h = Harness::new();
    let content = patterned(5000);
    h.store("resume.bin", &content[..1000]);
    let mut c = h.connect();

    // Act
    let offset = h.request(&mut c, "UPLOAD resume.bin 5000");
    c.send(&content[1000..]);
    let done = h.recv_line(&mut c);

    // Assert
    assert_eq!(offset, "OFFSET 1000");
    assert_eq!(done, replies::UPLOAD_COMPLETE);
    assert_eq!(h.stored("resume.bin").unwrap(), content);
}

#[test]
fn test_upload_after_interrupted_connection_resumes() {
    // Arrange
    let mut h = Harness::new();
    let content = patterned(10_000);
    let mut first = h.connect();
    assert_eq!(h.request(&mut first, "UPLOAD cut.bin 10000"), "OFFSET 0");
    first.send(&content[..4000]);
    for _ in 0..20 {
        h.server.turn().unwrap();
    }
    drop(first);
    for _ in 0..20 {
        h.server.turn().unwrap();
    }

    // Act
    let mut second = h.connect();
    let offset = h.request(&mut second, "UPLOAD cut.bin 10000");
    second.send(&content[4000..]);
    let done = h.recv_line(&mut second);

    // Assert
    assert_eq!(offset, "OFFSET 4000");
    assert_eq!(done, replies::UPLOAD_COMPLETE);
    assert_eq!(h.stored("cut.bin").unwrap(), content);
}

#[test]
fn test_upload_path_is_reduced_to_base_name() {
    // Arrange
    let mut h = Harness::new();
    let mut c = h.connect();

    // Act
    h.request(&mut c, "UPLOAD ../../escape.txt 3");
    c.send(b"abc");
    let done = h.recv_line(&mut c);

    // Assert
    assert_eq!(done, replies::UPLOAD_COMPLETE);
    assert_eq!(h.stored("escape.txt").unwrap(), b"abc");
    assert!(!h.dir.path().join("escape.txt").exists());
}

// ── Downloads ─────────────────────────────────────────────────────────────────

#[test]
fn test_download_streams_whole_file() {
    // Arrange
    let mut h = Harness::new();
    let content = patterned(300_000);
    h.store("big.bin", &content);
    let mut c = h.connect();

    // Act
    let size = h.request(&mut c, "DOWNLOAD big.bin");
    c.send(b"OFFSET 0");
    let mut received = Vec::new();
    while received.len() < content.len() {
        let frames = h.recv_frames(&mut c, 1);
        assert!(!frames.is_empty(), "download stalled at {} bytes", received.len());
        for f in frames {
            received.extend_from_slice(&f);
        }
    }

    // Assert
    assert_eq!(size, "SIZE 300000");
    assert_eq!(received, content);
}

#[test]
fn test_download_resumes_from_offset() {
    // Arrange
    let mut h = Harness::new();
    let content = patterned(1000);
    h.store("part.bin", &content);
    let mut c = h.connect();

    // Act
    assert_eq!(h.request(&mut c, "DOWNLOAD part.bin"), "SIZE 1000");
    c.send(b"OFFSET 600");
    let frames = h.recv_frames(&mut c, 1);

    // Assert
    assert_eq!(frames.len(), 1);
    assert_eq!(&frames[0][..], &content[600..]);
}

#[test]
fn test_download_missing_file() {
    let mut h = Harness::new();
    let mut c = h.connect();
    assert_eq!(h.request(&mut c, "DOWNLOAD nope.txt"), replies::FILE_NOT_FOUND);
    // The connection stays usable.
    assert_eq!(h.request(&mut c, "ECHO still here"), "still here");
}

// ── Framing interaction ───────────────────────────────────────────────────────

#[test]
fn test_line_framing_serves_text_but_refuses_transfers() {
    // Arrange
    let mut h = Harness::with_framing(Framing::Line);
    let mut c = h.connect();

    // Act
    let echo = h.request(&mut c, "ECHO over lines");
    let upload = h.request(&mut c, "UPLOAD a.txt 3");

    // Assert
    assert_eq!(echo, "over lines");
    assert!(upload.starts_with(replies::ERROR_PREFIX));
}

#[test]
fn test_clients_are_served_independently() {
    // Arrange
    let mut h = Harness::new();
    let mut uploader = h.connect();
    let mut chatter = h.connect();

    // Act – an upload in progress on one connection...
    assert_eq!(h.request(&mut uploader, "UPLOAD slow.bin 10"), "OFFSET 0");
    uploader.send(b"01234");
    // ...does not turn the other connection's commands into file data
    let echo = h.request(&mut chatter, "ECHO independent");
    uploader.send(b"56789");
    let done = h.recv_line(&mut uploader);

    // Assert
    assert_eq!(echo, "independent");
    assert_eq!(done, replies::UPLOAD_COMPLETE);
    assert_eq!(h.stored("slow.bin").unwrap(), b"0123456789");
}

#[test]
fn test_concurrent_upload_of_same_file_is_refused() {
    // Arrange
    let mut h = Harness::new();
    let mut first = h.connect();
    let mut second = h.connect();
    assert_eq!(h.request(&mut first, "UPLOAD f.bin 10"), "OFFSET 0");
    first.send(b"AAAAA");

    // Act
    let refused = h.request(&mut second, "UPLOAD f.bin 10");
    first.send(b"aaaaa");
    let done = h.recv_line(&mut first);
    let retry = h.request(&mut second, "UPLOAD f.bin 10");

    // Assert
    assert_eq!(refused, "ERROR: f.bin is being uploaded");
    assert_eq!(done, replies::UPLOAD_COMPLETE);
    assert_eq!(h.stored("f.bin").unwrap(), b"AAAAAaaaaa");
    assert_eq!(retry, "OFFSET 0", "a finished file can be uploaded again");
}
