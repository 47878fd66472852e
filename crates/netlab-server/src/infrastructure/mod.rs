//! Infrastructure layer of the server.
//!
//! Contains the OS-facing adapters: sockets and the readiness poller,
//! configuration files, and the file store.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `netlab_core`, but MUST NOT be imported by the `application` layer.

pub mod network;
pub mod storage;
