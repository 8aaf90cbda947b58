//! Server facade: wires the acceptor to the loop pool and tracks live
//! connections.
//!
//! New descriptors arrive on the base loop, get a unique name, and are
//! handed to a worker loop picked round-robin; removal routes back through
//! the base loop so the connection map has a single writer thread.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use socket2::Socket;
use tracing::{error, info};

use reactor::{EventLoopThreadPool, LoopHandle, ThreadInitCallback};

use crate::acceptor::Acceptor;
use crate::callbacks::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnectionRef,
    WriteCompleteCallback,
};
use crate::config::ServerConfig;
use crate::connection::{DEFAULT_HIGH_WATER_MARK, TcpConnection};
use crate::metrics::{CONNECTIONS_ACCEPTED, CONNECTIONS_ACTIVE};

/// Listener socket options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerOption {
    Plain,
    ReusePort,
}

pub struct TcpServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    base: LoopHandle,
    self_ref: std::sync::Weak<ServerInner>,
    name: String,
    ip_port: String,
    acceptor: Arc<Acceptor>,
    pool: Arc<EventLoopThreadPool>,
    connections: Mutex<HashMap<String, TcpConnectionRef>>,
    started: AtomicU32,
    next_conn_id: AtomicU64,
    high_water_mark: AtomicUsize,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    high_water_cb: Mutex<Option<HighWaterMarkCallback>>,
    thread_init_cb: Mutex<Option<ThreadInitCallback>>,
}

impl TcpServer {
    pub fn new(
        base: LoopHandle,
        addr: SocketAddr,
        name: impl Into<String>,
        option: ServerOption,
    ) -> io::Result<TcpServer> {
        let name = name.into();
        let acceptor = Acceptor::new(base.clone(), addr, option == ServerOption::ReusePort)?;
        let pool = Arc::new(EventLoopThreadPool::new(base.clone(), name.clone()));

        let inner = Arc::new_cyclic(|me: &std::sync::Weak<ServerInner>| ServerInner {
            base,
            self_ref: me.clone(),
            ip_port: addr.to_string(),
            name,
            acceptor,
            pool,
            connections: Mutex::new(HashMap::new()),
            started: AtomicU32::new(0),
            next_conn_id: AtomicU64::new(1),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            connection_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            high_water_cb: Mutex::new(None),
            thread_init_cb: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        inner
            .acceptor
            .set_new_connection_callback(Box::new(move |socket, peer| {
                if let Some(inner) = weak.upgrade() {
                    inner.new_connection(socket, peer);
                }
            }));

        Ok(TcpServer { inner })
    }

    /// Construct from a loaded [`ServerConfig`].
    pub fn from_config(base: LoopHandle, config: &ServerConfig) -> io::Result<TcpServer> {
        let option = if config.reuse_port {
            ServerOption::ReusePort
        } else {
            ServerOption::Plain
        };
        let server = TcpServer::new(base, config.address, config.name.clone(), option)?;
        server.set_thread_num(config.threads());
        server
            .inner
            .high_water_mark
            .store(config.high_water_mark, Ordering::SeqCst);
        Ok(server)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn ip_port(&self) -> &str {
        &self.inner.ip_port
    }

    /// Number of worker loops; must be set before [`TcpServer::start`].
    pub fn set_thread_num(&self, num: usize) {
        self.inner.pool.set_thread_num(num);
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.inner.connection_cb.lock() = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.inner.message_cb.lock() = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.inner.write_complete_cb.lock() = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, mark: usize) {
        *self.inner.high_water_cb.lock() = Some(cb);
        self.inner.high_water_mark.store(mark, Ordering::SeqCst);
    }

    pub fn set_thread_init_callback(&self, cb: ThreadInitCallback) {
        *self.inner.thread_init_cb.lock() = Some(cb);
    }

    /// Start the pool and begin listening. Idempotent: only the first call
    /// initializes anything.
    pub fn start(&self) {
        if self.inner.started.fetch_add(1, Ordering::SeqCst) == 0 {
            info!(
                name = %self.inner.name,
                address = %self.inner.ip_port,
                "starting server"
            );
            let init = self.inner.thread_init_cb.lock().clone();
            self.inner.pool.start(init);

            let acceptor = self.inner.acceptor.clone();
            self.inner.base.run_in_loop(move || acceptor.listen());
        }
    }
}

impl ServerInner {
    /// Runs on the base loop for each accepted descriptor.
    fn new_connection(&self, socket: Socket, peer: SocketAddr) {
        let worker = self.pool.next_loop();
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, id);

        info!(server = %self.name, conn = %conn_name, peer = %peer, "new connection");
        CONNECTIONS_ACCEPTED.increment();

        let local_addr = match socket.local_addr() {
            Ok(addr) => addr
                .as_socket()
                .unwrap_or_else(|| "0.0.0.0:0".parse().unwrap()),
            Err(e) => {
                error!(conn = %conn_name, error = %e, "failed to query local address");
                "0.0.0.0:0".parse().unwrap()
            }
        };

        let conn = TcpConnection::new(worker.clone(), conn_name.clone(), socket, local_addr, peer);

        if let Some(cb) = self.connection_cb.lock().clone() {
            conn.set_connection_callback(cb);
        }
        if let Some(cb) = self.message_cb.lock().clone() {
            conn.set_message_callback(cb);
        }
        if let Some(cb) = self.write_complete_cb.lock().clone() {
            conn.set_write_complete_callback(cb);
        }
        conn.set_high_water_mark(self.high_water_mark.load(Ordering::SeqCst));
        if let Some(cb) = self.high_water_cb.lock().clone() {
            conn.set_high_water_mark_callback(cb, self.high_water_mark.load(Ordering::SeqCst));
        }

        let weak = self.self_ref.clone();
        conn.set_close_callback(Arc::new(move |conn| {
            if let Some(inner) = weak.upgrade() {
                inner.remove_connection(conn);
            }
        }));

        self.connections.lock().insert(conn_name, conn.clone());
        CONNECTIONS_ACTIVE.increment();

        worker.run_in_loop(move || conn.connect_established());
    }

    /// May fire on any worker loop; hops to the base loop where the map is
    /// maintained.
    fn remove_connection(&self, conn: &TcpConnectionRef) {
        let Some(inner) = self.self_ref.upgrade() else {
            return;
        };
        let conn = conn.clone();
        self.base
            .run_in_loop(move || inner.remove_connection_in_loop(&conn));
    }

    fn remove_connection_in_loop(&self, conn: &TcpConnectionRef) {
        info!(server = %self.name, conn = %conn.name(), "removing connection");
        if self.connections.lock().remove(conn.name()).is_some() {
            CONNECTIONS_ACTIVE.decrement();
        }

        let worker = conn.loop_handle().clone();
        let conn = conn.clone();
        worker.queue_in_loop(move || conn.connect_destroyed());
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        // Destroy any connection still alive on its owning loop, then pull
        // the acceptor out of the poller. The pool (and its worker threads)
        // is dropped after this body, so the queued teardown still runs.
        let connections = std::mem::take(&mut *self.connections.lock());
        for (_, conn) in connections {
            CONNECTIONS_ACTIVE.decrement();
            let worker = conn.loop_handle().clone();
            worker.run_in_loop(move || conn.connect_destroyed());
        }
        self.acceptor.teardown();
    }
}
