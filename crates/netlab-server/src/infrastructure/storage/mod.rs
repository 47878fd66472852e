//! Storage infrastructure: configuration file persistence and the on-disk
//! file store behind the transfer commands.
//!
//! - **`config`** – reads and writes the TOML configuration, with defaults
//!   for every missing key.
//! - **`file_store`** – a flat directory implementing
//!   [`FileRepository`](crate::application::file_repository::FileRepository).

pub mod config;
pub mod file_store;
