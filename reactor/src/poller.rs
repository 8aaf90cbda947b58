//! Readiness poller: wraps `mio::Poll` and owns the descriptor → channel
//! map registered with the kernel.
//!
//! Registration state is tracked on the channel itself (see
//! [`Channel`]'s index) so a poll-to-dispatch round trip costs one map
//! lookup. mio registers descriptors edge-triggered, which is why every
//! consumer of readiness in this workspace drains until `WouldBlock`.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use tracing::{error, trace};

use crate::channel::{Channel, Ready};

/// Channel not yet known to the poller.
pub(crate) const STATE_NEW: i8 = -1;
/// Channel registered with the kernel.
pub(crate) const STATE_ADDED: i8 = 1;
/// Channel still in the map but currently deregistered (empty interest).
pub(crate) const STATE_DELETED: i8 = 2;

const INIT_EVENT_CAPACITY: usize = 16;
/// Upper bound for the grow-on-full event vector.
const MAX_EVENT_CAPACITY: usize = 4096;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Op {
    Add,
    Modify,
    Remove,
}

pub struct Poller {
    poll: Poll,
    events: Events,
    channels: HashMap<RawFd, Arc<Channel>>,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        Ok(Poller {
            poll: Poll::new()?,
            events: Events::with_capacity(INIT_EVENT_CAPACITY),
            channels: HashMap::new(),
        })
    }

    /// Block up to `timeout` for readiness, write the observed mask into
    /// each ready channel and append it to `active`. Returns the wall-clock
    /// time of return.
    ///
    /// When a poll fills the event vector exactly, its capacity doubles
    /// (bounded by an upper cap) so a busy loop converges on a vector large
    /// enough for its descriptor set.
    pub fn poll(&mut self, timeout: Duration, active: &mut Vec<Arc<Channel>>) -> SystemTime {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            // Interrupted syscalls are retried by the next loop iteration.
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => error!(error = %e, "poll failed"),
        }
        let now = SystemTime::now();

        let mut count = 0;
        for event in self.events.iter() {
            count += 1;
            let fd = event.token().0 as RawFd;
            if let Some(channel) = self.channels.get(&fd) {
                channel.set_revents(observed(event));
                active.push(channel.clone());
            }
        }

        if count > 0 {
            trace!(events = count, "poll returned");
            if count == self.events.capacity() && self.events.capacity() < MAX_EVENT_CAPACITY {
                self.events = Events::with_capacity(self.events.capacity() * 2);
            }
        }
        now
    }

    /// Sync a channel's interest mask with the kernel.
    ///
    /// State machine over the channel's registration index: a new or
    /// deregistered channel is (re-)added; an added channel whose interest
    /// emptied is deregistered and parked as deleted; otherwise modified.
    pub fn update_channel(&mut self, channel: &Arc<Channel>) {
        let index = channel.index();
        trace!(fd = channel.fd(), events = ?channel.events(), index, "update channel");

        if index == STATE_NEW || index == STATE_DELETED {
            if index == STATE_NEW {
                self.channels.insert(channel.fd(), channel.clone());
            }
            if channel.is_none_event() {
                // Nothing to watch yet; park in the map until interest
                // appears (registrations carry a non-empty interest set).
                channel.set_index(STATE_DELETED);
            } else {
                channel.set_index(STATE_ADDED);
                self.update(Op::Add, channel);
            }
        } else if channel.is_none_event() {
            self.update(Op::Remove, channel);
            channel.set_index(STATE_DELETED);
        } else {
            self.update(Op::Modify, channel);
        }
    }

    /// Drop a channel from the map, deregistering it first if needed.
    pub fn remove_channel(&mut self, channel: &Arc<Channel>) {
        trace!(fd = channel.fd(), "remove channel");
        self.channels.remove(&channel.fd());
        if channel.index() == STATE_ADDED {
            self.update(Op::Remove, channel);
        }
        channel.set_index(STATE_NEW);
    }

    pub fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|c| Arc::ptr_eq(c, channel))
    }

    #[cfg(test)]
    pub(crate) fn event_capacity(&self) -> usize {
        self.events.capacity()
    }

    fn update(&mut self, op: Op, channel: &Arc<Channel>) {
        let fd = channel.fd();
        let mut source = SourceFd(&fd);
        let registry = self.poll.registry();
        let result = match op {
            Op::Add => registry.register(&mut source, Token(fd as usize), interest(channel)),
            Op::Modify => registry.reregister(&mut source, Token(fd as usize), interest(channel)),
            Op::Remove => registry.deregister(&mut source),
        };

        if let Err(e) = result {
            match op {
                // A failed deregistration leaves a dead registration behind
                // but the loop can keep serving other descriptors.
                Op::Remove => error!(fd, error = %e, "failed to deregister descriptor"),
                _ => {
                    error!(fd, error = %e, "failed to register descriptor");
                    panic!("poller registration failed for fd {fd}: {e}");
                }
            }
        }
    }
}

fn interest(channel: &Arc<Channel>) -> Interest {
    let events = channel.events();
    match (
        events.contains(Ready::READABLE),
        events.contains(Ready::WRITABLE),
    ) {
        (true, true) => Interest::READABLE | Interest::WRITABLE,
        (true, false) => Interest::READABLE,
        (false, true) => Interest::WRITABLE,
        (false, false) => unreachable!("empty interest is deregistered, never registered"),
    }
}

fn observed(event: &mio::event::Event) -> Ready {
    let mut ready = Ready::NONE;
    if event.is_readable() {
        ready |= Ready::READABLE;
    }
    if event.is_writable() {
        ready |= Ready::WRITABLE;
    }
    if event.is_error() {
        ready |= Ready::ERROR;
    }
    // Both directions closed is the kernel's hangup; a read-side close alone
    // surfaces through a zero-length read on the read path.
    if event.is_read_closed() && event.is_write_closed() {
        ready |= Ready::HUP;
    }
    if event.is_priority() {
        ready |= Ready::PRIORITY;
    }
    ready
}
