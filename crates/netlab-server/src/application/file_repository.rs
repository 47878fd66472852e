//! Storage abstraction used by the command application.
//!
//! The command handler only needs four things from storage: list the files,
//! look up a size, append to a file and read a file from an offset.  Keeping
//! that behind a trait lets the handler be tested against an in-memory store
//! while the binary uses the directory-backed
//! [`FileStore`](crate::infrastructure::storage::file_store::FileStore).

use std::io::{self, Read, Write};
use std::path::PathBuf;

use thiserror::Error;

/// Error type for file storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The storage root could not be created or read.
    #[error("storage directory {path} is unavailable: {source}")]
    Root {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The name does not denote a plain file inside the store.
    #[error("invalid file name: {0:?}")]
    InvalidName(String),

    /// An I/O error on a stored file.
    #[error("I/O error on {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// Sink for an upload in progress.
pub type FileWriter = Box<dyn Write + Send>;

/// Source for a download in progress.
pub type FileReader = Box<dyn Read + Send>;

/// Flat namespace of named files.
pub trait FileRepository: Send {
    /// Names of all stored files, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be enumerated.
    fn list(&self) -> Result<Vec<String>, StoreError>;

    /// Size of `name` in bytes, or `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] for an invalid name or an I/O failure.
    fn size(&self, name: &str) -> Result<Option<u64>, StoreError>;

    /// Opens `name` for writing.  With `resume` the existing content is
    /// kept and writes append to it; otherwise the file is truncated.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] for an invalid name or an I/O failure.
    fn writer(&self, name: &str, resume: bool) -> Result<FileWriter, StoreError>;

    /// Opens `name` for reading, positioned at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] for an invalid name or an I/O failure.
    fn reader(&self, name: &str, offset: u64) -> Result<FileReader, StoreError>;
}
