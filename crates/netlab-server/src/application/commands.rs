//! CommandHandler: the text command protocol served on top of the frame
//! server.
//!
//! Each connection is a small state machine of its own:
//!
//! ```text
//!            UPLOAD ok                 last data frame
//!   Idle ───────────────► Receiving ─────────────────► Idle   (UPLOAD COMPLETE)
//!    │
//!    │ DOWNLOAD ok            OFFSET k                 last chunk sent
//!    └──────────► AwaitingOffset ──────► Sending ─────────────────► Idle
//! ```
//!
//! While `Receiving`, every frame is raw file data.  While `Sending`, the
//! handler produces one 64 KiB chunk each time the server reports the write
//! buffer empty ([`FrameHandler::on_drain`]), so a large download never sits
//! in memory all at once and never starves other connections.
//!
//! A file is written by one connection at a time: `UPLOAD` is refused while
//! another connection is uploading or downloading the same name, and
//! `DOWNLOAD` is refused while it is being uploaded.
//!
//! Interrupted transfers keep what was written: the next `UPLOAD` of the
//! same file resumes from the stored size, and a client resumes a download
//! by sending the size of its own partial copy as the `OFFSET`.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Instant;

use netlab_core::protocol::command::replies::{
    error_line, offset_line, parse_offset_line, size_line, BYE, FILE_NOT_FOUND, NO_FILES,
    UNKNOWN_COMMAND, UPLOAD_COMPLETE,
};
use netlab_core::{Command, CommandError, ConnectionId, Framing, TransferReport};
use tracing::{debug, info, warn};

use super::file_repository::{FileReader, FileRepository, FileWriter, StoreError};
use super::handler::{FrameHandler, HandlerError, Reply};

/// Size of one download data frame.
pub const TRANSFER_CHUNK: usize = 64 * 1024;

/// `strftime` pattern of the `TIME` reply.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Reason given when a transfer is requested on a line-framed server.
pub const TRANSFERS_NEED_LENGTH_PREFIX: &str = "transfers require length-prefixed framing";

/// Reply to `HELP`.
pub const HELP_TEXT: &str =
    "Commands: ECHO <text>, TIME, LIST, UPLOAD <file> <size>, DOWNLOAD <file>, CLOSE";

struct Upload {
    name: String,
    writer: FileWriter,
    remaining: u64,
    received: u64,
    resumed_from: u64,
    started: Instant,
}

impl Upload {
    fn report(&self) -> TransferReport {
        TransferReport {
            bytes: self.received,
            resumed_from: self.resumed_from,
            elapsed: self.started.elapsed(),
        }
    }
}

struct Download {
    name: String,
    reader: FileReader,
    remaining: u64,
    sent: u64,
    resumed_from: u64,
    started: Instant,
}

impl Download {
    fn report(&self) -> TransferReport {
        TransferReport {
            bytes: self.sent,
            resumed_from: self.resumed_from,
            elapsed: self.started.elapsed(),
        }
    }

    /// Reads the next data frame, at most [`TRANSFER_CHUNK`] bytes.
    fn next_chunk(&mut self) -> Result<Vec<u8>, HandlerError> {
        let want = self.remaining.min(TRANSFER_CHUNK as u64) as usize;
        let mut buf = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(StoreError::Io {
                        name: self.name.clone(),
                        source,
                    }
                    .into())
                }
            }
        }
        if filled == 0 {
            return Err(StoreError::Io {
                name: self.name.clone(),
                source: io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "file shrank while it was being sent",
                ),
            }
            .into());
        }
        buf.truncate(filled);
        self.remaining -= filled as u64;
        self.sent += filled as u64;
        Ok(buf)
    }
}

enum Transfer {
    Idle,
    Receiving(Upload),
    AwaitingOffset { name: String, size: u64 },
    Sending(Download),
}

impl Transfer {
    fn uploading(&self) -> Option<&str> {
        match self {
            Transfer::Receiving(upload) => Some(&upload.name),
            _ => None,
        }
    }

    fn downloading(&self) -> Option<&str> {
        match self {
            Transfer::AwaitingOffset { name, .. } => Some(name),
            Transfer::Sending(download) => Some(&download.name),
            _ => None,
        }
    }
}

/// Serves `ECHO`, `TIME`, `LIST`, `CLOSE`, `UPLOAD` and `DOWNLOAD`.
pub struct CommandHandler<R: FileRepository> {
    repo: R,
    transfers: HashMap<ConnectionId, Transfer>,
    transfers_enabled: bool,
}

impl<R: FileRepository> CommandHandler<R> {
    /// Creates a handler storing files in `repo`.
    ///
    /// File transfers carry arbitrary bytes, so they are only offered when
    /// the server uses length-prefixed framing.
    pub fn new(repo: R, framing: Framing) -> Self {
        Self {
            repo,
            transfers: HashMap::new(),
            transfers_enabled: framing == Framing::LengthPrefixed,
        }
    }

    /// The backing store.
    pub fn repository(&self) -> &R {
        &self.repo
    }

    /// Number of connections with a transfer in progress.
    pub fn active_transfers(&self) -> usize {
        self.transfers
            .values()
            .filter(|t| !matches!(t, Transfer::Idle))
            .count()
    }

    /// `true` if another connection is uploading `name`.  The calling
    /// connection's own state is out of the map while its frame is handled.
    fn is_uploading(&self, name: &str) -> bool {
        self.transfers.values().any(|t| t.uploading() == Some(name))
    }

    fn is_downloading(&self, name: &str) -> bool {
        self.transfers.values().any(|t| t.downloading() == Some(name))
    }

    fn command(
        &mut self,
        id: ConnectionId,
        frame: &[u8],
    ) -> Result<(Transfer, Option<Reply>), HandlerError> {
        let Ok(line) = std::str::from_utf8(frame) else {
            return Ok(idle(error_line("command is not valid UTF-8")));
        };
        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(CommandError::Empty) => return Ok((Transfer::Idle, None)),
            Err(e) => return Ok(idle(error_line(e))),
        };
        debug!(id = %id, %command, "command received");

        let outcome = match command {
            Command::Help => idle(HELP_TEXT),
            Command::Echo(text) => idle(text),
            Command::Time => idle(chrono::Local::now().format(TIME_FORMAT).to_string()),
            Command::List => match self.repo.list() {
                Ok(names) if names.is_empty() => idle(NO_FILES),
                Ok(names) => idle(names.join(", ")),
                Err(e) => {
                    warn!(id = %id, error = %e, "listing files failed");
                    idle(error_line(e))
                }
            },
            Command::Close => (Transfer::Idle, Some(Reply::frame(BYE).and_close())),
            Command::Upload { name, size } => self.begin_upload(id, name, size),
            Command::Download { name } => self.begin_download(id, name),
            Command::Offset(_) => idle(error_line("no download is waiting for an offset")),
            Command::Unknown(_) => idle(UNKNOWN_COMMAND),
        };
        Ok(outcome)
    }

    fn begin_upload(&mut self, id: ConnectionId, name: String, size: u64) -> (Transfer, Option<Reply>) {
        if !self.transfers_enabled {
            return idle(error_line(TRANSFERS_NEED_LENGTH_PREFIX));
        }
        if self.is_uploading(&name) {
            debug!(id = %id, file = %name, "upload refused; file is being uploaded");
            return idle(error_line(format!("{name} is being uploaded")));
        }
        if self.is_downloading(&name) {
            debug!(id = %id, file = %name, "upload refused; file is being downloaded");
            return idle(error_line(format!("{name} is being downloaded")));
        }
        let existing = match self.repo.size(&name) {
            Ok(existing) => existing,
            Err(e) => return idle(error_line(e)),
        };
        // A partial file resumes; a complete (or larger) one starts over.
        let offset = match existing {
            Some(stored) if stored < size => stored,
            _ => 0,
        };
        let writer = match self.repo.writer(&name, offset > 0) {
            Ok(writer) => writer,
            Err(e) => {
                warn!(id = %id, file = %name, error = %e, "cannot open upload target");
                return idle(error_line(e));
            }
        };
        info!(id = %id, file = %name, size, offset, "upload started");

        if offset == size {
            info!(id = %id, file = %name, "upload complete (empty)");
            return (
                Transfer::Idle,
                Some(Reply::frames([offset_line(offset), UPLOAD_COMPLETE.to_string()])),
            );
        }
        let upload = Upload {
            name,
            writer,
            remaining: size - offset,
            received: 0,
            resumed_from: offset,
            started: Instant::now(),
        };
        (Transfer::Receiving(upload), Some(Reply::frame(offset_line(offset))))
    }

    fn receive(
        &mut self,
        id: ConnectionId,
        mut upload: Upload,
        frame: &[u8],
    ) -> Result<(Transfer, Option<Reply>), HandlerError> {
        let len = frame.len() as u64;
        if len > upload.remaining {
            return Err(HandlerError::Protocol(format!(
                "upload of {} overran its declared size by {} bytes",
                upload.name,
                len - upload.remaining
            )));
        }
        let io_error = |name: &str, source| StoreError::Io {
            name: name.to_string(),
            source,
        };
        upload
            .writer
            .write_all(frame)
            .map_err(|e| io_error(&upload.name, e))?;
        upload.remaining -= len;
        upload.received += len;

        if upload.remaining > 0 {
            return Ok((Transfer::Receiving(upload), None));
        }
        upload.writer.flush().map_err(|e| io_error(&upload.name, e))?;
        let report = upload.report();
        info!(
            id = %id,
            file = %upload.name,
            bytes = report.bytes,
            resumed_from = report.resumed_from,
            mbps = format!("{:.2}", report.mbps()),
            "upload complete"
        );
        Ok(idle(UPLOAD_COMPLETE))
    }

    fn begin_download(&mut self, id: ConnectionId, name: String) -> (Transfer, Option<Reply>) {
        if !self.transfers_enabled {
            return idle(error_line(TRANSFERS_NEED_LENGTH_PREFIX));
        }
        if self.is_uploading(&name) {
            debug!(id = %id, file = %name, "download refused; file is being uploaded");
            return idle(error_line(format!("{name} is being uploaded")));
        }
        match self.repo.size(&name) {
            Ok(Some(size)) => {
                debug!(id = %id, file = %name, size, "download offered");
                let reply = Reply::frame(size_line(size));
                (Transfer::AwaitingOffset { name, size }, Some(reply))
            }
            Ok(None) => idle(FILE_NOT_FOUND),
            Err(e) => idle(error_line(e)),
        }
    }

    fn start_download(
        &mut self,
        id: ConnectionId,
        name: String,
        size: u64,
        frame: &[u8],
    ) -> Result<(Transfer, Option<Reply>), HandlerError> {
        let Some(offset) = std::str::from_utf8(frame).ok().and_then(parse_offset_line) else {
            return Ok(idle(error_line("expected OFFSET <n> after SIZE")));
        };
        let offset = offset.min(size);
        let reader = self.repo.reader(&name, offset)?;
        info!(id = %id, file = %name, size, offset, "download started");

        let mut download = Download {
            name,
            reader,
            remaining: size - offset,
            sent: 0,
            resumed_from: offset,
            started: Instant::now(),
        };
        if download.remaining == 0 {
            log_download_complete(id, &download);
            return Ok((Transfer::Idle, None));
        }
        let chunk = download.next_chunk()?;
        let next = if download.remaining == 0 {
            log_download_complete(id, &download);
            Transfer::Idle
        } else {
            Transfer::Sending(download)
        };
        Ok((next, Some(Reply::frame(chunk))))
    }
}

fn idle(reply: impl Into<Vec<u8>>) -> (Transfer, Option<Reply>) {
    (Transfer::Idle, Some(Reply::frame(reply)))
}

fn log_download_complete(id: ConnectionId, download: &Download) {
    let report = download.report();
    info!(
        id = %id,
        file = %download.name,
        bytes = report.bytes,
        resumed_from = report.resumed_from,
        mbps = format!("{:.2}", report.mbps()),
        "download complete"
    );
}

impl<R: FileRepository> FrameHandler for CommandHandler<R> {
    fn on_connect(&mut self, id: ConnectionId, peer: SocketAddr) {
        debug!(id = %id, peer = %peer, "session started");
        self.transfers.insert(id, Transfer::Idle);
    }

    fn on_frame(&mut self, id: ConnectionId, frame: &[u8]) -> Result<Option<Reply>, HandlerError> {
        let state = self.transfers.remove(&id).unwrap_or(Transfer::Idle);
        let (next, reply) = match state {
            Transfer::Idle => self.command(id, frame)?,
            Transfer::Receiving(upload) => self.receive(id, upload, frame)?,
            Transfer::AwaitingOffset { name, size } => self.start_download(id, name, size, frame)?,
            Transfer::Sending(download) => {
                return Err(HandlerError::Protocol(format!(
                    "frame received while {} is being downloaded",
                    download.name
                )))
            }
        };
        self.transfers.insert(id, next);
        Ok(reply)
    }

    fn on_drain(&mut self, id: ConnectionId) -> Result<Option<Reply>, HandlerError> {
        let Some(Transfer::Sending(download)) = self.transfers.get_mut(&id) else {
            return Ok(None);
        };
        let chunk = download.next_chunk()?;
        if download.remaining == 0 {
            log_download_complete(id, download);
            self.transfers.insert(id, Transfer::Idle);
        }
        Ok(Some(Reply::frame(chunk)))
    }

    fn on_disconnect(&mut self, id: ConnectionId) {
        match self.transfers.remove(&id) {
            Some(Transfer::Receiving(upload)) => info!(
                id = %id,
                file = %upload.name,
                received = upload.received,
                missing = upload.remaining,
                "upload interrupted; partial file kept for resume"
            ),
            Some(Transfer::Sending(download)) => info!(
                id = %id,
                file = %download.name,
                sent = download.sent,
                missing = download.remaining,
                "download interrupted"
            ),
            _ => {}
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
