//! Resumable file transfers over a [`FrameClient`].
//!
//! # Upload
//!
//! ```text
//! client                              server
//!   UPLOAD <name> <size>  ────────►
//!                         ◄────────  OFFSET <n>        (bytes it already has)
//!   data frames from n    ────────►
//!                         ◄────────  UPLOAD COMPLETE
//! ```
//!
//! # Download
//!
//! ```text
//!   DOWNLOAD <name>       ────────►
//!                         ◄────────  SIZE <n>  |  ERROR: File not found
//!   OFFSET <k>            ────────►            (bytes the client already has)
//!                         ◄────────  data frames from k to n
//! ```

use std::io::SeekFrom;
use std::path::Path;
use std::time::Instant;

use netlab_core::protocol::command::base_name;
use netlab_core::protocol::command::replies::{parse_offset_line, parse_size_line, UPLOAD_COMPLETE};
use netlab_core::{Command, TransferReport};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tracing::info;

use crate::infrastructure::network::{ClientError, FrameClient};

/// Size of one upload data frame.
pub const UPLOAD_CHUNK: usize = 64 * 1024;

fn local_error(path: &Path) -> impl FnOnce(std::io::Error) -> ClientError {
    let path = path.to_path_buf();
    move |source| ClientError::LocalFile { path, source }
}

/// Uploads the file at `path`, resuming wherever the server left off.
///
/// The file is stored on the server under its base name.
///
/// # Errors
///
/// - [`ClientError::LocalFile`] if the file cannot be read.
/// - [`ClientError::Server`] / [`ClientError::UnexpectedReply`] if the
///   server refuses or answers out of protocol.
/// - Any connection error of the client.
pub async fn upload<S>(client: &mut FrameClient<S>, path: &Path) -> Result<TransferReport, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let name = base_name(&path.to_string_lossy())?;
    let mut file = File::open(path).await.map_err(local_error(path))?;
    let size = file.metadata().await.map_err(local_error(path))?.len();

    let reply = client.request(&Command::Upload { name: name.clone(), size }).await?;
    let offset = match parse_offset_line(&reply) {
        Some(offset) if offset <= size => offset,
        _ => return Err(ClientError::from_reply(reply, "OFFSET")),
    };
    if offset > 0 {
        info!(file = %name, offset, size, "resuming upload");
    }
    file.seek(SeekFrom::Start(offset))
        .await
        .map_err(local_error(path))?;

    let started = Instant::now();
    let mut remaining = size - offset;
    let mut sent = 0u64;
    let mut buf = vec![0u8; UPLOAD_CHUNK];
    while remaining > 0 {
        let want = remaining.min(UPLOAD_CHUNK as u64) as usize;
        let n = file.read(&mut buf[..want]).await.map_err(local_error(path))?;
        if n == 0 {
            return Err(ClientError::Protocol(format!(
                "{} shrank during upload ({remaining} bytes missing)",
                path.display()
            )));
        }
        client.send_frame(&buf[..n]).await?;
        remaining -= n as u64;
        sent += n as u64;
    }

    let done = client.recv_line().await?;
    if done != UPLOAD_COMPLETE {
        return Err(ClientError::from_reply(done, UPLOAD_COMPLETE));
    }
    let report = TransferReport {
        bytes: sent,
        resumed_from: offset,
        elapsed: started.elapsed(),
    };
    info!(file = %name, bytes = sent, mbps = format!("{:.2}", report.mbps()), "upload complete");
    Ok(report)
}

/// Downloads `name` into `dir`, resuming a partial local copy.
///
/// A local file at least as large as the remote one is treated as stale and
/// downloaded again from the start.
///
/// # Errors
///
/// - [`ClientError::Server`] if the file does not exist on the server.
/// - [`ClientError::LocalFile`] if the target cannot be written.
/// - [`ClientError::Protocol`] if the server sends more data than announced.
/// - Any connection error of the client.
pub async fn download<S>(client: &mut FrameClient<S>, name: &str, dir: &Path) -> Result<TransferReport, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let name = base_name(name)?;
    let reply = client.request(&Command::Download { name: name.clone() }).await?;
    let Some(size) = parse_size_line(&reply) else {
        return Err(ClientError::from_reply(reply, "SIZE"));
    };

    fs::create_dir_all(dir).await.map_err(local_error(dir))?;
    let path = dir.join(&name);
    let existing = match fs::metadata(&path).await {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
        Err(source) => return Err(ClientError::LocalFile { path, source }),
    };
    let offset = if existing >= size { 0 } else { existing };
    if offset > 0 {
        info!(file = %name, offset, size, "resuming download");
    }

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(offset > 0)
        .truncate(offset == 0)
        .open(&path)
        .await
        .map_err(local_error(&path))?;
    client.send_frame(Command::Offset(offset).to_string().as_bytes()).await?;

    let started = Instant::now();
    let mut remaining = size - offset;
    let mut received = 0u64;
    while remaining > 0 {
        let chunk = client.recv_frame().await?;
        let len = chunk.len() as u64;
        if len > remaining {
            return Err(ClientError::Protocol(format!(
                "server sent {len} bytes with only {remaining} outstanding"
            )));
        }
        file.write_all(&chunk).await.map_err(local_error(&path))?;
        remaining -= len;
        received += len;
    }
    file.flush().await.map_err(local_error(&path))?;

    let report = TransferReport {
        bytes: received,
        resumed_from: offset,
        elapsed: started.elapsed(),
    };
    info!(file = %name, bytes = received, mbps = format!("{:.2}", report.mbps()), "download complete");
    Ok(report)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
