//! Listening socket bound to the base loop.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{error, trace};

use reactor::{Channel, ChannelHandler, LoopHandle};

const BACKLOG: i32 = 1024;

/// Delivered once per accepted connection: the connected socket (already
/// non-blocking and close-on-exec) and the peer address.
pub type NewConnectionCallback = Box<dyn FnMut(Socket, SocketAddr) + Send>;

/// Owns the listening socket and turns its readability into
/// new-connection callbacks on the base loop.
pub struct Acceptor {
    owner_loop: LoopHandle,
    socket: Socket,
    channel: Arc<Channel>,
    listening: AtomicBool,
    on_connection: Mutex<Option<NewConnectionCallback>>,
    self_ref: Weak<Acceptor>,
}

impl Acceptor {
    /// Create the listening socket (non-blocking, close-on-exec, address
    /// reuse, optional port reuse) and bind it. Listening starts separately
    /// via [`Acceptor::listen`] on the base loop.
    pub fn new(
        owner_loop: LoopHandle,
        addr: SocketAddr,
        reuse_port: bool,
    ) -> io::Result<Arc<Acceptor>> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_cloexec(true)?;
        socket.set_reuse_address(true)?;
        socket.set_reuse_port(reuse_port)?;
        socket.bind(&addr.into())?;

        let channel = Channel::new(owner_loop.clone(), socket.as_raw_fd());
        let acceptor = Arc::new_cyclic(|me: &Weak<Acceptor>| Acceptor {
            owner_loop,
            socket,
            channel,
            listening: AtomicBool::new(false),
            on_connection: Mutex::new(None),
            self_ref: me.clone(),
        });
        let acceptor_dyn: Arc<dyn ChannelHandler> = acceptor.clone();
        let tie: Weak<dyn ChannelHandler> = Arc::downgrade(&acceptor_dyn);
        acceptor.channel.tie(tie);
        Ok(acceptor)
    }

    pub fn set_new_connection_callback(&self, callback: NewConnectionCallback) {
        *self.on_connection.lock() = Some(callback);
    }

    pub fn listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// Put the socket into listening state and subscribe to readability.
    /// Runs on the base loop thread; a listen failure here is fatal.
    pub fn listen(&self) {
        if let Err(e) = self.socket.listen(BACKLOG) {
            error!(fd = self.socket.as_raw_fd(), error = %e, "listen failed");
            panic!("listen failed: {e}");
        }
        self.listening.store(true, Ordering::SeqCst);
        self.channel.enable_reading();
    }

    /// Detach from the poller; queued on the base loop so teardown is safe
    /// from any thread. The `Arc` moved into the task keeps the descriptor
    /// open until after deregistration.
    pub(crate) fn teardown(&self) {
        let Some(acceptor) = self.self_ref.upgrade() else {
            return;
        };
        self.owner_loop.run_in_loop(move || {
            acceptor.channel.disable_all();
            acceptor.channel.remove();
        });
    }
}

impl ChannelHandler for Acceptor {
    fn handle_read(&self, _ts: SystemTime) {
        // Edge-triggered readiness: drain the accept queue completely.
        loop {
            match self.socket.accept() {
                Ok((socket, addr)) => {
                    if let Err(e) = socket.set_nonblocking(true) {
                        error!(error = %e, "failed to make accepted socket non-blocking");
                        continue;
                    }
                    let peer = addr
                        .as_socket()
                        .unwrap_or_else(|| "0.0.0.0:0".parse().unwrap());

                    let mut guard = self.on_connection.lock();
                    if let Some(callback) = guard.as_mut() {
                        callback(socket, peer);
                    } else {
                        // Nobody to hand the descriptor to; dropping the
                        // socket closes it.
                        trace!(peer = %peer, "no connection callback installed, closing");
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!(error = %e, "accept failed");
                    if e.raw_os_error() == Some(libc::EMFILE) {
                        error!("process descriptor limit reached");
                    }
                    break;
                }
            }
        }
    }
}
