//! Per-connection state machine.
//!
//! A `TcpConnection` owns the connected socket, its channel, and the input
//! and output buffers. Every state transition and all buffer access happen
//! on the owning worker loop; `send` and `shutdown` are the only
//! cross-thread entry points and marshal themselves over as tasks. The
//! connection is shared: the server map holds one reference and the
//! channel's owner tie upgrades a weak reference for the duration of each
//! event dispatch, so a connection can never be torn down mid-callback.

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use parking_lot::Mutex;
use socket2::Socket;
use tracing::{debug, error, trace};

use reactor::{Buffer, Channel, ChannelHandler, LoopHandle};

use crate::callbacks::{
    CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback,
    WriteCompleteCallback,
};
use crate::metrics::{BYTES_RECEIVED, BYTES_SENT};

/// Default output-buffer threshold for the high-water callback.
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnState {
    fn from_u8(v: u8) -> ConnState {
        match v {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }
}

pub struct TcpConnection {
    owner_loop: LoopHandle,
    name: String,
    /// Atomically readable from any thread; written only on the owning loop
    /// (plus the connected → disconnecting edge taken by `shutdown`).
    state: AtomicU8,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    input: Mutex<Buffer>,
    output: Mutex<Buffer>,
    high_water_mark: AtomicUsize,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    high_water_cb: Mutex<Option<HighWaterMarkCallback>>,
    close_cb: Mutex<Option<CloseCallback>>,
    self_ref: Weak<TcpConnection>,
}

impl TcpConnection {
    /// Wrap an already-connected socket. The channel is created here but
    /// registration and the owner tie wait for
    /// [`TcpConnection::connect_established`] on the owning loop.
    pub fn new(
        owner_loop: LoopHandle,
        name: impl Into<String>,
        socket: Socket,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Arc<TcpConnection> {
        let name = name.into();
        let fd = socket.as_raw_fd();
        let channel = Channel::new(owner_loop.clone(), fd);

        let conn = Arc::new_cyclic(|me| TcpConnection {
            owner_loop,
            name,
            state: AtomicU8::new(ConnState::Connecting as u8),
            socket,
            channel,
            local_addr,
            peer_addr,
            input: Mutex::new(Buffer::new()),
            output: Mutex::new(Buffer::new()),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            connection_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            high_water_cb: Mutex::new(None),
            close_cb: Mutex::new(None),
            self_ref: me.clone(),
        });

        if let Err(e) = conn.socket.set_keepalive(true) {
            error!(name = %conn.name, error = %e, "failed to enable keep-alive");
        }
        debug!(name = %conn.name, fd, "connection created");
        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn loop_handle(&self) -> &LoopHandle {
        &self.owner_loop
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        self.socket.set_nodelay(on)
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_cb.lock() = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_cb.lock() = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_cb.lock() = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, mark: usize) {
        *self.high_water_cb.lock() = Some(cb);
        self.high_water_mark.store(mark, Ordering::SeqCst);
    }

    pub fn set_high_water_mark(&self, mark: usize) {
        self.high_water_mark.store(mark, Ordering::SeqCst);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        *self.close_cb.lock() = Some(cb);
    }

    /// Send bytes to the peer. Thread-safe: from the owning loop the write
    /// happens inline, from any other thread the payload moves into a task
    /// (no extra copy) that runs on the owning loop.
    pub fn send(&self, data: impl Into<Vec<u8>>) {
        if self.state() != ConnState::Connected {
            return;
        }
        if self.owner_loop.is_in_loop_thread() {
            self.send_in_loop(&data.into());
        } else if let Some(conn) = self.self_ref.upgrade() {
            let data = data.into();
            self.owner_loop
                .run_in_loop(move || conn.send_in_loop(&data));
        }
    }

    /// Half-close the write side once queued output has drained. Safe from
    /// any thread; only the first call on a connected connection acts.
    pub fn shutdown(&self) {
        let swapped = self.state.compare_exchange(
            ConnState::Connected as u8,
            ConnState::Disconnecting as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if swapped.is_ok()
            && let Some(conn) = self.self_ref.upgrade()
        {
            self.owner_loop.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    /// Finish establishing the connection on its owning loop: tie the
    /// channel to this connection, subscribe to reads, tell the user.
    pub fn connect_established(&self) {
        assert_eq!(self.state(), ConnState::Connecting);
        self.set_state(ConnState::Connected);

        let tie: Weak<dyn ChannelHandler> = self.self_ref.clone();
        self.channel.tie(tie);
        self.channel.enable_reading();

        if let (Some(cb), Some(conn)) =
            (self.connection_cb.lock().clone(), self.self_ref.upgrade())
        {
            cb(&conn);
        }
    }

    /// Final teardown on the owning loop. When the connection is still up
    /// (server-side teardown rather than peer close) this also reports the
    /// DOWN transition; in every case the channel leaves the poller.
    pub fn connect_destroyed(&self) {
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnected);
            self.channel.disable_all();
            if let (Some(cb), Some(conn)) =
                (self.connection_cb.lock().clone(), self.self_ref.upgrade())
            {
                cb(&conn);
            }
        }
        self.channel.remove();
    }

    fn send_in_loop(&self, data: &[u8]) {
        if self.state() == ConnState::Disconnected {
            error!(name = %self.name, "disconnected, giving up on write");
            return;
        }

        let fd = self.channel.fd();
        let mut nwrote = 0usize;
        let mut remaining = data.len();
        let mut fault = false;

        let mut output = self.output.lock();

        // Nothing queued and not yet subscribed to writability: try the
        // direct write and skip the buffer for the common case.
        if !self.channel.is_writing() && output.readable_bytes() == 0 {
            match write_fd(fd, data) {
                Ok(n) => {
                    BYTES_SENT.add(n as u64);
                    nwrote = n;
                    remaining = data.len() - n;
                    if remaining == 0 {
                        drop(output);
                        self.queue_write_complete();
                        return;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    error!(name = %self.name, error = %e, "direct write failed");
                    if is_fault(&e) {
                        fault = true;
                    }
                }
            }
        }

        if !fault && remaining > 0 {
            let old_len = output.readable_bytes();
            let mark = self.high_water_mark.load(Ordering::SeqCst);
            if old_len + remaining >= mark && old_len < mark {
                self.queue_high_water(old_len + remaining);
            }
            output.append(&data[nwrote..]);
            drop(output);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    fn shutdown_in_loop(&self) {
        // Still subscribed to writability means queued output remains; the
        // write path performs the half-close after draining.
        if !self.channel.is_writing()
            && let Err(e) = self.socket.shutdown(Shutdown::Write)
        {
            error!(name = %self.name, error = %e, "shutdown failed");
        }
    }

    fn queue_write_complete(&self) {
        let cb = self.write_complete_cb.lock().clone();
        if let (Some(cb), Some(conn)) = (cb, self.self_ref.upgrade()) {
            // Deferred so user code never re-enters the current dispatch.
            self.owner_loop.queue_in_loop(move || cb(&conn));
        }
    }

    fn queue_high_water(&self, total: usize) {
        let cb = self.high_water_cb.lock().clone();
        if let (Some(cb), Some(conn)) = (cb, self.self_ref.upgrade()) {
            self.owner_loop.queue_in_loop(move || cb(&conn, total));
        }
    }
}

impl ChannelHandler for TcpConnection {
    fn handle_read(&self, ts: SystemTime) {
        let fd = self.channel.fd();
        // Edge-triggered readiness: drain until the kernel runs dry.
        loop {
            if self.state() == ConnState::Disconnected {
                return;
            }
            let result = self.input.lock().read_fd(fd);
            match result {
                Ok(0) => {
                    self.handle_close();
                    return;
                }
                Ok(n) => {
                    BYTES_RECEIVED.add(n as u64);
                    trace!(name = %self.name, bytes = n, "read");
                    let cb = self.message_cb.lock().clone();
                    if let (Some(cb), Some(conn)) = (cb, self.self_ref.upgrade()) {
                        let mut input = self.input.lock();
                        cb(&conn, &mut input, ts);
                    } else {
                        // No consumer installed; discard instead of letting
                        // the input buffer grow without bound.
                        self.input.lock().retrieve_all();
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!(name = %self.name, error = %e, "read failed");
                    self.handle_error();
                    if is_fault(&e) {
                        self.handle_close();
                    }
                    return;
                }
            }
        }
    }

    fn handle_write(&self) {
        if !self.channel.is_writing() {
            trace!(name = %self.name, "write event on a connection no longer writing");
            return;
        }

        let fd = self.channel.fd();
        let mut emptied = false;
        let mut fault = false;
        {
            let mut output = self.output.lock();
            while output.readable_bytes() > 0 {
                match write_fd(fd, output.peek()) {
                    Ok(n) => {
                        BYTES_SENT.add(n as u64);
                        output.retrieve(n);
                        if output.readable_bytes() == 0 {
                            emptied = true;
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        error!(name = %self.name, error = %e, "write failed");
                        if is_fault(&e) {
                            fault = true;
                        }
                        break;
                    }
                }
            }
        }

        if emptied {
            // Unsubscribe or the loop spins on an always-writable socket.
            self.channel.disable_writing();
            self.queue_write_complete();
            if self.state() == ConnState::Disconnecting {
                self.shutdown_in_loop();
            }
        } else if fault {
            self.handle_close();
        }
    }

    fn handle_close(&self) {
        if self.state() == ConnState::Disconnected {
            return;
        }
        debug!(name = %self.name, state = ?self.state(), "closing");
        self.set_state(ConnState::Disconnected);
        self.channel.disable_all();

        let Some(conn) = self.self_ref.upgrade() else {
            return;
        };
        if let Some(cb) = self.connection_cb.lock().clone() {
            cb(&conn);
        }
        // Routes back to the server, which unmaps the connection and queues
        // the final destroy.
        if let Some(cb) = self.close_cb.lock().clone() {
            cb(&conn);
        }
    }

    fn handle_error(&self) {
        match self.socket.take_error() {
            Ok(Some(e)) => error!(name = %self.name, error = %e, "socket error"),
            Ok(None) => {}
            Err(e) => error!(name = %self.name, error = %e, "failed to read socket error"),
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug!(name = %self.name, state = ?self.state(), "connection destroyed");
    }
}

fn write_fd(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

fn is_fault(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EPIPE) | Some(libc::ECONNRESET)
    )
}
