//! Infrastructure layer for the client.
//!
//! **Dependency rule**: this layer may depend on `netlab_core`, but MUST NOT
//! be imported by `netlab_core`.

pub mod network;
