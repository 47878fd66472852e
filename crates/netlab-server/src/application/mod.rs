//! Application layer: what the server does with frames.
//!
//! # What is the "application" layer? (for beginners)
//!
//! The event loop in `infrastructure::network` only knows how to move bytes
//! and cut them into frames.  What a frame *means* is decided here, behind
//! the [`FrameHandler`](handler::FrameHandler) trait.  Code in this layer:
//!
//! - **Depends on abstractions** (traits) rather than concrete sockets or
//!   directories, so it can be tested with in-memory doubles.
//! - **Performs no socket I/O**.  Replies are returned as values and the
//!   event loop writes them when the peer can take them.
//!
//! # Sub-modules
//!
//! - **`handler`** – The `FrameHandler` callback trait, `Reply`, and the
//!   closure adapter `handler_fn`.
//!
//! - **`commands`** – The text command protocol (`ECHO`, `TIME`, `LIST`,
//!   `UPLOAD`, `DOWNLOAD`, `CLOSE`) with resumable transfers.
//!
//! - **`file_repository`** – The storage trait the commands are written
//!   against.

pub mod commands;
pub mod file_repository;
pub mod handler;
