//! Multi-reactor TCP server.
//!
//! Built on the `reactor` engine crate: one base loop accepts, a pool of
//! worker loops serves connections, each connection is a state machine over
//! its own channel and buffers. Embedders construct a [`TcpServer`], hang
//! callbacks on it, and call [`TcpServer::start`].
//!
//! ```ignore
//! let mut worker = reactor::EventLoopThread::new("base", None);
//! let base = worker.start_loop();
//!
//! let server = server::TcpServer::new(
//!     base,
//!     "127.0.0.1:9999".parse()?,
//!     "echo",
//!     server::ServerOption::Plain,
//! )?;
//! server.set_thread_num(3);
//! server.set_message_callback(std::sync::Arc::new(|conn, buf, _ts| {
//!     conn.send(buf.retrieve_all_as_bytes());
//! }));
//! server.start();
//! ```

pub mod acceptor;
pub mod callbacks;
pub mod config;
pub mod connection;
pub mod logging;
pub mod metrics;
pub mod server;

pub use callbacks::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnectionRef,
    WriteCompleteCallback,
};
pub use config::ServerConfig;
pub use connection::{ConnState, TcpConnection};
pub use server::{ServerOption, TcpServer};
