//! netlab-server library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! Embedding the server takes three steps:
//!
//! ```rust,no_run
//! use netlab_server::{handler_fn, Server, ServerConfig};
//!
//! let echo = handler_fn(|_id, frame| Some(frame.to_vec()));
//! let mut server = Server::bind(ServerConfig::default(), echo)?;
//! server.run()?;
//! # Ok::<(), netlab_server::ServerError>(())
//! ```

pub mod application;
pub mod infrastructure;

pub use application::commands::CommandHandler;
pub use application::handler::{handler_fn, FrameHandler, HandlerError, Reply};
pub use infrastructure::network::error::ServerError;
pub use infrastructure::network::server::{Server, ServerConfig, ServerHandle};
pub use infrastructure::storage::file_store::FileStore;
