//! netlab-server entry point.
//!
//! Serves the text command protocol (`ECHO`, `TIME`, `LIST`, `UPLOAD`,
//! `DOWNLOAD`, `CLOSE`) over the readiness-driven frame server.
//!
//! # Usage
//!
//! ```text
//! netlab-server [OPTIONS]
//!
//! Options:
//!   -c, --config <PATH>          TOML config file [default: netlab-server.toml]
//!       --host <HOST>            Bind host (overrides listen.host)
//!   -p, --port <PORT>            Bind port (overrides listen.port)
//!       --framing <MODE>         length-prefixed | line
//!       --storage-dir <DIR>      File store root
//!       --max-connections <N>    Connection limit
//!       --log-level <FILTER>     Used when RUST_LOG is unset
//!       --print-config           Print the effective config and exit
//! ```
//!
//! Every option can also be given as a `NETLAB_*` environment variable.
//! Command-line values win over the environment, which wins over the file.
//!
//! # Threads
//!
//! ```text
//! tokio runtime
//!  ├─ ctrl_c task ──► ServerHandle::shutdown() ──► Waker
//!  └─ spawn_blocking ──► Server::run()   (mio event loop, one thread)
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use netlab_core::Framing;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use netlab_server::infrastructure::storage::config::{load_config, AppConfig};
use netlab_server::{CommandHandler, FileStore, Server};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Readiness-multiplexed TCP frame server.
#[derive(Debug, Parser)]
#[command(
    name = "netlab-server",
    about = "Readiness-multiplexed TCP server speaking a framed command protocol",
    version
)]
struct Cli {
    /// Path of the TOML configuration file.  A missing file means defaults.
    #[arg(short, long, default_value = "netlab-server.toml", env = "NETLAB_CONFIG")]
    config: PathBuf,

    /// Host name or IP address to bind.
    #[arg(long, env = "NETLAB_HOST")]
    host: Option<String>,

    /// TCP port to listen on.
    #[arg(short, long, env = "NETLAB_PORT")]
    port: Option<u16>,

    /// Framing rule: `length-prefixed` or `line`.
    ///
    /// File transfers need `length-prefixed`.
    #[arg(long, value_parser = parse_framing, env = "NETLAB_FRAMING")]
    framing: Option<Framing>,

    /// Directory holding uploaded files.
    #[arg(long, env = "NETLAB_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// Maximum number of simultaneous connections.
    #[arg(long, env = "NETLAB_MAX_CONNECTIONS")]
    max_connections: Option<usize>,

    /// Log filter used when `RUST_LOG` is not set (e.g. `debug`).
    #[arg(long, env = "NETLAB_LOG_LEVEL")]
    log_level: Option<String>,

    /// Print the effective configuration as TOML and exit.
    #[arg(long)]
    print_config: bool,
}

fn parse_framing(value: &str) -> Result<Framing, String> {
    match value.to_ascii_lowercase().as_str() {
        "length-prefixed" | "length" => Ok(Framing::LengthPrefixed),
        "line" => Ok(Framing::Line),
        other => Err(format!("unknown framing {other:?}; expected `length-prefixed` or `line`")),
    }
}

impl Cli {
    /// Applies command-line overrides on top of the file configuration.
    fn apply(&self, mut config: AppConfig) -> AppConfig {
        if let Some(host) = &self.host {
            config.listen.host = host.clone();
        }
        if let Some(port) = self.port {
            config.listen.port = port;
        }
        if let Some(framing) = self.framing {
            config.framing.mode = framing;
        }
        if let Some(dir) = &self.storage_dir {
            config.storage.directory = dir.clone();
        }
        if let Some(max) = self.max_connections {
            config.listen.max_connections = max;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        config
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let file_config = load_config(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let config = cli.apply(file_config);

    if cli.print_config {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    // `RUST_LOG` wins; otherwise the configured level applies.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    let server_config = config.to_server_config().context("invalid configuration")?;
    let store = FileStore::open(&config.storage.directory).with_context(|| {
        format!("opening storage directory {}", config.storage.directory.display())
    })?;
    info!(storage = %store.root().display(), "file store ready");

    let handler = CommandHandler::new(store, server_config.framing);
    let mut server = Server::bind(server_config, handler)?;
    let handle = server.handle();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C, shutting down");
                handle.shutdown();
            }
            Err(e) => error!("failed to listen for Ctrl+C signal: {e}"),
        }
    });

    // The event loop blocks in `poll`, so it gets a thread of its own.
    tokio::task::spawn_blocking(move || server.run())
        .await
        .context("event loop thread panicked")??;

    info!("netlab-server stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
