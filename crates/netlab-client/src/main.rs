//! netlab-client entry point: an interactive command prompt.
//!
//! # Usage
//!
//! ```text
//! netlab-client [HOST] [PORT] [--download-dir <DIR>]
//! ```
//!
//! `HOST` defaults to `127.0.0.1` and `PORT` to `12345`.  At the `client>`
//! prompt, `UPLOAD` takes a *local* path, `DOWNLOAD` a server-side name;
//! every other line is sent to the server as-is.

use std::path::{Path, PathBuf};

use clap::Parser;
use netlab_client::{download, upload, ClientError, FrameClient};
use netlab_core::TransferReport;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing_subscriber::EnvFilter;

const HELP: &str = "\
--- Available Commands ---
  HELP                - Show this help message
  ECHO <message>      - Ask the server to echo the message back
  TIME                - Get the current time from the server
  LIST                - List the files stored on the server
  UPLOAD <path>       - Upload a local file (resumes partial uploads)
  DOWNLOAD <name>     - Download a file (resumes partial downloads)
  CLOSE               - Close the connection and exit
--------------------------";

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Interactive client for the netlab frame server.
#[derive(Debug, Parser)]
#[command(name = "netlab-client", about = "Interactive client for netlab-server", version)]
struct Cli {
    /// Server host name or IP address.
    #[arg(default_value = "127.0.0.1", env = "NETLAB_HOST")]
    host: String,

    /// Server TCP port.
    #[arg(default_value_t = 12345, env = "NETLAB_PORT")]
    port: u16,

    /// Directory downloads are written to.
    #[arg(long, default_value = "client_downloads", env = "NETLAB_DOWNLOAD_DIR")]
    download_dir: PathBuf,
}

/// What one prompt line asks for.
#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Help,
    Upload(&'a str),
    Download(&'a str),
    Close,
    /// Sent verbatim; the server parses it.
    Raw(&'a str),
    Usage(&'static str),
}

fn parse_input(line: &str) -> Input<'_> {
    let (verb, arg) = match line.split_once(' ') {
        Some((verb, arg)) => (verb, arg.trim()),
        None => (line, ""),
    };
    match verb.to_ascii_uppercase().as_str() {
        "HELP" => Input::Help,
        "CLOSE" => Input::Close,
        "UPLOAD" if arg.is_empty() => Input::Usage("Usage: UPLOAD <path>"),
        "UPLOAD" => Input::Upload(arg),
        "DOWNLOAD" if arg.is_empty() => Input::Usage("Usage: DOWNLOAD <name>"),
        "DOWNLOAD" => Input::Download(arg),
        _ => Input::Raw(line),
    }
}

fn describe(report: &TransferReport) -> String {
    let resumed = if report.resumed_from > 0 {
        format!(" (resumed from byte {})", report.resumed_from)
    } else {
        String::new()
    };
    format!(
        "{} bytes in {:.3}s, {:.2} Mbps{resumed}",
        report.bytes,
        report.elapsed.as_secs_f64(),
        report.mbps()
    )
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Quiet by default so log lines do not interleave with the prompt.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let addr = format!("{}:{}", cli.host, cli.port);
    println!("Attempting to connect to {addr}...");
    let mut client = FrameClient::connect(addr.as_str()).await?;
    println!("Successfully connected to {addr}");
    println!("{HELP}");

    let result = repl(&mut client, &cli.download_dir).await;
    println!("Client closed.");
    result
}

async fn repl(client: &mut FrameClient<TcpStream>, download_dir: &Path) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        stdout.write_all(b"client> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            return Ok(());
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let outcome = match parse_input(line) {
            Input::Help => {
                println!("{HELP}");
                Ok(())
            }
            Input::Usage(usage) => {
                println!("{usage}");
                Ok(())
            }
            Input::Upload(path) => upload(client, Path::new(path))
                .await
                .map(|report| println!("Upload complete: {}", describe(&report))),
            Input::Download(name) => download(client, name, download_dir)
                .await
                .map(|report| println!("Download complete: {}", describe(&report))),
            Input::Close => {
                let reply = client.request_line("CLOSE").await?;
                println!("Server: {reply}");
                return Ok(());
            }
            Input::Raw(line) => client
                .request_line(line)
                .await
                .map(|reply| println!("Server: {reply}")),
        };

        match outcome {
            Ok(()) => {}
            // Refusals and local mistakes leave the connection usable.
            Err(e @ (ClientError::Server(_)
            | ClientError::LocalFile { .. }
            | ClientError::Command(_)
            | ClientError::UnexpectedReply { .. })) => println!("Error: {e}"),
            Err(e) => return Err(e.into()),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        // Arrange / Act
        let cli = Cli::parse_from(["netlab-client"]);

        // Assert
        assert_eq!(cli.host, "127.0.0.1");
        assert_eq!(cli.port, 12345);
        assert_eq!(cli.download_dir, PathBuf::from("client_downloads"));
    }

    #[test]
    fn test_cli_positional_host_and_port() {
        let cli = Cli::parse_from(["netlab-client", "10.0.0.5", "9000"]);
        assert_eq!(cli.host, "10.0.0.5");
        assert_eq!(cli.port, 9000);
    }

    #[test]
    fn test_cli_rejects_bad_port() {
        assert!(Cli::try_parse_from(["netlab-client", "host", "port"]).is_err());
    }

    #[test]
    fn test_parse_input_routes_transfers_locally() {
        assert_eq!(parse_input("upload ./a b.txt"), Input::Upload("./a b.txt"));
        assert_eq!(parse_input("DOWNLOAD x.bin"), Input::Download("x.bin"));
        assert_eq!(parse_input("UPLOAD"), Input::Usage("Usage: UPLOAD <path>"));
    }

    #[test]
    fn test_parse_input_passes_other_lines_through() {
        assert_eq!(parse_input("ECHO hi"), Input::Raw("ECHO hi"));
        assert_eq!(parse_input("time"), Input::Raw("time"));
        assert_eq!(parse_input("help"), Input::Help);
        assert_eq!(parse_input("Close"), Input::Close);
    }

    #[test]
    fn test_describe_mentions_resume_point() {
        let report = TransferReport {
            bytes: 1_000_000,
            resumed_from: 500,
            elapsed: std::time::Duration::from_secs(1),
        };
        let text = describe(&report);
        assert!(text.contains("8.00 Mbps"));
        assert!(text.contains("resumed from byte 500"));
    }
}
