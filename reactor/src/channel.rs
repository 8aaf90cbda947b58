//! Binding of a descriptor to its owner's event handlers and owning loop.
//!
//! A `Channel` does not own its descriptor; the owner (acceptor,
//! connection, or the loop's own wakeup fd) keeps the fd alive and holds
//! the `Arc<Channel>`. The poller hands out clones of that `Arc` when the
//! descriptor turns ready, and dispatch upgrades the owner tie before any
//! handler runs so the owner cannot be torn down mid-callback.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI8, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::event_loop::LoopHandle;
use crate::poller;

/// Bit-set over readiness kinds: the shared vocabulary for a channel's
/// interest mask and the observed mask reported by the poller.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Ready(u8);

impl Ready {
    pub const NONE: Ready = Ready(0);
    pub const READABLE: Ready = Ready(1);
    pub const WRITABLE: Ready = Ready(1 << 1);
    pub const ERROR: Ready = Ready(1 << 2);
    pub const HUP: Ready = Ready(1 << 3);
    pub const PRIORITY: Ready = Ready(1 << 4);

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn contains(self, other: Ready) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub fn remove(self, other: Ready) -> Ready {
        Ready(self.0 & !other.0)
    }

    #[inline]
    pub(crate) fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub(crate) fn from_bits(bits: u8) -> Ready {
        Ready(bits)
    }
}

impl BitOr for Ready {
    type Output = Ready;

    fn bitor(self, rhs: Ready) -> Ready {
        Ready(self.0 | rhs.0)
    }
}

impl BitOrAssign for Ready {
    fn bitor_assign(&mut self, rhs: Ready) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        for (flag, name) in [
            (Ready::READABLE, "READABLE"),
            (Ready::WRITABLE, "WRITABLE"),
            (Ready::ERROR, "ERROR"),
            (Ready::HUP, "HUP"),
            (Ready::PRIORITY, "PRIORITY"),
        ] {
            if self.contains(flag) {
                set.entry(&name);
            }
        }
        set.finish()
    }
}

/// Event handlers supplied by a channel's owner.
///
/// All methods default to no-ops so owners implement only the events they
/// subscribe to. Dispatch order and the hangup/error special cases live in
/// [`Channel::handle_event`].
pub trait ChannelHandler: Send + Sync {
    fn handle_read(&self, _ts: SystemTime) {}
    fn handle_write(&self) {}
    fn handle_close(&self) {}
    fn handle_error(&self) {}
}

pub struct Channel {
    owner_loop: LoopHandle,
    fd: RawFd,
    /// Interest mask requested from the poller.
    events: AtomicU8,
    /// Observed mask written back by the poller after each poll.
    revents: AtomicU8,
    /// Poller-side registration state, stored here so the poller avoids a
    /// second map lookup. See `poller::{STATE_NEW, STATE_ADDED, STATE_DELETED}`.
    index: AtomicI8,
    /// Owner tie: upgraded for the duration of each dispatch.
    handler: Mutex<Option<Weak<dyn ChannelHandler>>>,
    self_ref: Weak<Channel>,
}

impl Channel {
    pub fn new(owner_loop: LoopHandle, fd: RawFd) -> Arc<Channel> {
        Arc::new_cyclic(|me| Channel {
            owner_loop,
            fd,
            events: AtomicU8::new(Ready::NONE.bits()),
            revents: AtomicU8::new(Ready::NONE.bits()),
            index: AtomicI8::new(poller::STATE_NEW),
            handler: Mutex::new(None),
            self_ref: me.clone(),
        })
    }

    /// Install the owner tie. Dispatch upgrades the weak reference and
    /// silently skips the event when the owner is already gone.
    pub fn tie(&self, handler: Weak<dyn ChannelHandler>) {
        *self.handler.lock() = Some(handler);
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn events(&self) -> Ready {
        Ready::from_bits(self.events.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set_revents(&self, revents: Ready) {
        self.revents.store(revents.bits(), Ordering::Relaxed);
    }

    #[inline]
    pub fn is_none_event(&self) -> bool {
        self.events().is_empty()
    }

    #[inline]
    pub fn is_reading(&self) -> bool {
        self.events().contains(Ready::READABLE)
    }

    #[inline]
    pub fn is_writing(&self) -> bool {
        self.events().contains(Ready::WRITABLE)
    }

    pub(crate) fn index(&self) -> i8 {
        self.index.load(Ordering::Relaxed)
    }

    pub(crate) fn set_index(&self, index: i8) {
        self.index.store(index, Ordering::Relaxed);
    }

    pub fn enable_reading(&self) {
        self.modify_events(|events| events | Ready::READABLE);
    }

    pub fn disable_reading(&self) {
        self.modify_events(|events| events.remove(Ready::READABLE));
    }

    pub fn enable_writing(&self) {
        self.modify_events(|events| events | Ready::WRITABLE);
    }

    pub fn disable_writing(&self) {
        self.modify_events(|events| events.remove(Ready::WRITABLE));
    }

    pub fn disable_all(&self) {
        self.modify_events(|_| Ready::NONE);
    }

    fn modify_events(&self, f: impl FnOnce(Ready) -> Ready) {
        let events = f(self.events());
        self.events.store(events.bits(), Ordering::Relaxed);
        if let Some(me) = self.self_ref.upgrade() {
            self.owner_loop.update_channel(&me);
        }
    }

    /// Drop this channel from the poller entirely. Must follow
    /// [`Channel::disable_all`] and runs on the owning loop thread.
    pub fn remove(&self) {
        if let Some(me) = self.self_ref.upgrade() {
            self.owner_loop.remove_channel(&me);
        }
    }

    /// Dispatch the observed events to the owner's handlers.
    ///
    /// Order matters: hangup-without-readable first (peer vanished with
    /// nothing left to drain), then the async error, then read, then write.
    pub fn handle_event(&self, ts: SystemTime) {
        let tie = self.handler.lock().clone();
        let Some(handler) = tie.as_ref().and_then(Weak::upgrade) else {
            tracing::trace!(fd = self.fd, "owner gone, skipping event dispatch");
            return;
        };

        let revents = Ready::from_bits(self.revents.load(Ordering::Relaxed));
        tracing::trace!(fd = self.fd, revents = ?revents, "dispatching events");

        if revents.contains(Ready::HUP) && !revents.contains(Ready::READABLE) {
            handler.handle_close();
        }
        if revents.contains(Ready::ERROR) {
            handler.handle_error();
        }
        if revents.contains(Ready::READABLE) || revents.contains(Ready::PRIORITY) {
            handler.handle_read(ts);
        }
        if revents.contains(Ready::WRITABLE) {
            handler.handle_write();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_set_operations() {
        let mut r = Ready::NONE;
        assert!(r.is_empty());

        r |= Ready::READABLE;
        r |= Ready::WRITABLE;
        assert!(r.contains(Ready::READABLE));
        assert!(r.contains(Ready::WRITABLE));
        assert!(!r.contains(Ready::ERROR));

        let r = r.remove(Ready::READABLE);
        assert!(!r.contains(Ready::READABLE));
        assert!(r.contains(Ready::WRITABLE));
    }

    #[test]
    fn ready_debug_names_flags() {
        let r = Ready::READABLE | Ready::HUP;
        let s = format!("{:?}", r);
        assert!(s.contains("READABLE"));
        assert!(s.contains("HUP"));
        assert!(!s.contains("WRITABLE"));
    }
}
