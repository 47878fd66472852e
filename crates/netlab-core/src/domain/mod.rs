//! Domain entities for netlab.
//!
//! This module contains pure connection bookkeeping with no infrastructure
//! dependencies.
//!
//! # What is "domain" in Clean Architecture? (for beginners)
//!
//! Clean Architecture organises code into concentric layers.  The innermost
//! layer is called the **domain**.  Domain code:
//!
//! - Contains the core rules of the application.
//! - Has **no** imports from OS APIs, readiness mechanisms, or sockets.
//! - Can be compiled and tested on any platform without any external setup.
//!
//! Here the rules are the connection lifecycle: which identifiers exist, which
//! state transitions are legal, and why a connection ended.  The server's
//! event loop enforces them, but never redefines them.

/// Connection identifiers, lifecycle states, and close reasons.
///
/// See [`connection::ConnectionState`] for the state machine.
pub mod connection;

/// Throughput reporting for file transfers.
pub mod transfer;
