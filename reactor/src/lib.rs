//! Multi-reactor event-loop engine.
//!
//! One acceptor loop plus a pool of worker loops, each pinned to a single
//! thread. This crate is the engine only: the readiness poller, the
//! channel abstraction binding descriptors to their owners, the per-thread
//! event loop with cross-thread task submission, the worker thread and
//! pool, and the connection byte buffer. The TCP connection machinery and
//! server facade live in the `server` crate.

pub mod buffer;
pub mod channel;
pub mod event_loop;
pub mod loop_pool;
pub mod loop_thread;
pub mod poller;

pub use buffer::Buffer;
pub use channel::{Channel, ChannelHandler, Ready};
pub use event_loop::{EventLoop, LoopHandle, Task};
pub use loop_pool::EventLoopThreadPool;
pub use loop_thread::{EventLoopThread, ThreadInitCallback};
pub use poller::Poller;
