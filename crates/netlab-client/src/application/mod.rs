//! Application layer use cases for the client.
//!
//! - **`transfer`** – Resumable upload and download of files.

pub mod transfer;
