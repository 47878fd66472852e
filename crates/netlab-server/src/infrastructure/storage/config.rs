//! TOML configuration for the server binary.
//!
//! # What is TOML? (for beginners)
//!
//! TOML is a small configuration format that maps cleanly onto Rust structs.
//! A complete server configuration looks like this:
//!
//! ```toml
//! [listen]
//! host = "0.0.0.0"
//! port = 12345
//! max_connections = 1024
//!
//! [timeouts]
//! idle_timeout_secs = 300   # 0 disables the idle sweep
//!
//! [framing]
//! mode = "length-prefixed"  # or "line"
//!
//! [storage]
//! directory = "server_files"
//! ```
//!
//! Every field carries a `#[serde(default = "...")]` helper, so a file only
//! needs the keys it changes, and a missing file means "all defaults".

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use netlab_core::{Framing, DEFAULT_MAX_FRAME_LEN};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::infrastructure::network::server::ServerConfig;
use crate::infrastructure::network::socket_opts::Keepalive;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value is out of range.
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub framing: FramingConfig,
    #[serde(default)]
    pub keepalive: KeepaliveConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where and how many.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListenConfig {
    /// Host name or IP to bind.  `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Accept queue length.
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeoutConfig {
    /// Upper bound on one wait for readiness.  Must be positive.
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Silent connections are closed after this long; `0` disables.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// How long shutdown keeps flushing queued output.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FramingConfig {
    #[serde(default)]
    pub mode: Framing,
    /// Largest accepted frame body in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Largest queued output per connection in bytes.
    #[serde(default = "default_max_write_buffer")]
    pub max_write_buffer: usize,
    /// Bytes read from one connection per turn before moving on.
    #[serde(default = "default_read_budget")]
    pub read_budget: usize,
}

/// TCP keepalive on accepted sockets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeepaliveConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_keepalive_idle_secs")]
    pub idle_secs: u64,
    #[serde(default = "default_keepalive_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_keepalive_retries")]
    pub retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Root directory of the file commands.
    #[serde(default = "default_storage_directory")]
    pub directory: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// `tracing` filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    12345
}
fn default_backlog() -> u32 {
    128
}
fn default_max_connections() -> usize {
    1024
}
fn default_poll_timeout_ms() -> u64 {
    250
}
fn default_idle_timeout_secs() -> u64 {
    300
}
fn default_shutdown_grace_ms() -> u64 {
    2000
}
fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_LEN
}
fn default_max_write_buffer() -> usize {
    8 * 1024 * 1024
}

fn default_read_budget() -> usize {
    1024 * 1024
}
fn default_true() -> bool {
    true
}
fn default_keepalive_idle_secs() -> u64 {
    10
}
fn default_keepalive_interval_secs() -> u64 {
    1
}
fn default_keepalive_retries() -> u32 {
    5
}
fn default_storage_directory() -> PathBuf {
    PathBuf::from("server_files")
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: default_poll_timeout_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            mode: Framing::default(),
            max_frame_size: default_max_frame_size(),
            max_write_buffer: default_max_write_buffer(),
            read_budget: default_read_budget(),
        }
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            idle_secs: default_keepalive_idle_secs(),
            interval_secs: default_keepalive_interval_secs(),
            retries: default_keepalive_retries(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            directory: default_storage_directory(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ── Validation and conversion ─────────────────────────────────────────────────

impl AppConfig {
    /// Checks value ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeouts.poll_timeout_ms == 0 {
            return Err(invalid("timeouts.poll_timeout_ms", "must be greater than 0"));
        }
        if self.framing.max_frame_size == 0 || self.framing.max_frame_size as u64 > u64::from(u32::MAX) {
            return Err(invalid(
                "framing.max_frame_size",
                format!("must be between 1 and {}", u32::MAX),
            ));
        }
        if self.framing.read_budget == 0 {
            return Err(invalid("framing.read_budget", "must be greater than 0"));
        }
        if self.listen.max_connections == 0 {
            return Err(invalid("listen.max_connections", "must be greater than 0"));
        }
        if self.listen.backlog == 0 {
            return Err(invalid("listen.backlog", "must be greater than 0"));
        }
        Ok(())
    }

    /// Builds the runtime [`ServerConfig`], resolving `listen.host`.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::Invalid`] if validation fails or the host does not
    ///   resolve.
    pub fn to_server_config(&self) -> Result<ServerConfig, ConfigError> {
        self.validate()?;
        let listen_addr = resolve(&self.listen.host, self.listen.port)?;
        let idle_timeout = match self.timeouts.idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let keepalive = self.keepalive.enabled.then(|| Keepalive {
            idle: Duration::from_secs(self.keepalive.idle_secs),
            interval: Duration::from_secs(self.keepalive.interval_secs),
            retries: self.keepalive.retries,
        });
        Ok(ServerConfig {
            listen_addr,
            backlog: self.listen.backlog,
            max_connections: self.listen.max_connections,
            poll_timeout: Duration::from_millis(self.timeouts.poll_timeout_ms),
            idle_timeout,
            shutdown_grace: Duration::from_millis(self.timeouts.shutdown_grace_ms),
            framing: self.framing.mode,
            max_frame_size: self.framing.max_frame_size,
            max_write_buffer: self.framing.max_write_buffer,
            read_budget: self.framing.read_budget,
            keepalive,
        })
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| invalid("listen.host", format!("{host:?}: {e}")))?
        .next()
        .ok_or_else(|| invalid("listen.host", format!("{host:?} resolved to no address")))
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Loads `AppConfig` from `path`, returning `AppConfig::default()` if the file
/// does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Writes `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(config: &AppConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
