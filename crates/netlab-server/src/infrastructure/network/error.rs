//! Server error type and the failure taxonomy used by the event loop.
//!
//! Every I/O failure the loop sees is sorted into an [`ErrorClass`], and the
//! class alone decides what happens next:
//!
//! | class                | example                    | reaction                          |
//! |----------------------|----------------------------|-----------------------------------|
//! | `Transient`          | `EINTR`                    | retry the call                    |
//! | `Connection`         | `ECONNRESET`, bad frame    | close that connection, carry on   |
//! | `ResourceExhaustion` | `EMFILE` on accept         | defer accepting to the next turn  |
//! | `Fatal`              | poll failure               | stop the loop, return the error   |

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors that stop the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The poll instance or the listener registration could not be set up.
    #[error("failed to set up readiness polling: {0}")]
    Setup(#[source] io::Error),

    /// Waiting for readiness failed.
    #[error("readiness poll failed: {0}")]
    Poll(#[source] io::Error),

    /// The listening socket itself failed.
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
}

/// How the event loop reacts to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry immediately.
    Transient,
    /// Confined to one connection: close it and continue.
    Connection,
    /// Out of descriptors or memory: back off until the next iteration.
    ResourceExhaustion,
    /// The server cannot continue.
    Fatal,
}

impl ErrorClass {
    /// `true` only for [`ErrorClass::Fatal`].
    pub fn is_fatal(self) -> bool {
        self == ErrorClass::Fatal
    }
}

/// Sorts an I/O error into its [`ErrorClass`].
pub fn classify(err: &io::Error) -> ErrorClass {
    use io::ErrorKind::*;

    match err.kind() {
        Interrupted | WouldBlock => ErrorClass::Transient,
        ConnectionAborted | ConnectionReset | ConnectionRefused | BrokenPipe | NotConnected
        | UnexpectedEof | TimedOut | InvalidData => ErrorClass::Connection,
        OutOfMemory => ErrorClass::ResourceExhaustion,
        _ => err.raw_os_error().map_or(ErrorClass::Fatal, classify_os_code),
    }
}

#[cfg(unix)]
fn classify_os_code(code: i32) -> ErrorClass {
    match code {
        libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM => {
            ErrorClass::ResourceExhaustion
        }
        // accept(2) passes on pending network errors of the new socket;
        // they concern that connection only.
        libc::EPROTO
        | libc::ENETDOWN
        | libc::ENETUNREACH
        | libc::EHOSTUNREACH
        | libc::EHOSTDOWN
        | libc::ENOPROTOOPT
        | libc::EOPNOTSUPP => ErrorClass::Connection,
        _ => ErrorClass::Fatal,
    }
}

#[cfg(not(unix))]
fn classify_os_code(_code: i32) -> ErrorClass {
    ErrorClass::Fatal
}

// ── Tests ─────────────────────────────────────────────────────────────────────
