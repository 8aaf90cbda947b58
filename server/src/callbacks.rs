//! Callback aliases shared across the server crate.
//!
//! All user callbacks receive a shared handle to the connection; the
//! erasure mechanism is an `Arc<dyn Fn>` so the same callback value can be
//! installed on every connection a server accepts.

use std::sync::Arc;
use std::time::SystemTime;

use reactor::Buffer;

use crate::connection::TcpConnection;

/// Shared handle to a connection.
pub type TcpConnectionRef = Arc<TcpConnection>;

/// Fired on both directions of the connection lifecycle: once when the
/// connection reaches CONNECTED and once when it reaches DISCONNECTED.
/// Distinguish with [`TcpConnection::connected`].
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionRef) + Send + Sync>;

/// Fired when bytes arrive; consume them through the buffer's retrieval
/// operations.
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionRef, &mut Buffer, SystemTime) + Send + Sync>;

/// Fired when the output buffer drains from non-empty to empty.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionRef) + Send + Sync>;

/// Fired when queued output crosses the high-water mark upward; the second
/// argument is the total bytes queued at the crossing.
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionRef, usize) + Send + Sync>;

/// Internal: routes a closed connection back to its server for removal.
pub type CloseCallback = Arc<dyn Fn(&TcpConnectionRef) + Send + Sync>;
