//! Per-thread event loop: poll, dispatch, then drain submitted tasks.
//!
//! One loop per thread. The loop value itself lives on its thread's stack;
//! everything another thread may touch (the task queue, the wakeup
//! descriptor, the quit flag, the poller guard) sits behind a cloneable
//! [`LoopHandle`]. Cross-thread work is marshalled as boxed tasks and woken
//! through an `eventfd` registered as an ordinary read channel.

use std::cell::Cell;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::channel::{Channel, ChannelHandler};
use crate::poller::Poller;

/// Upper bound on a single poll; quit requests cut this short via wakeup.
pub(crate) const POLL_TIMEOUT: Duration = Duration::from_secs(10);

pub type Task = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    // One-loop-per-thread slot; a second construction on the same thread is
    // a programming error and fatal.
    static LOOP_IN_THIS_THREAD: Cell<bool> = const { Cell::new(false) };
}

struct LoopInner {
    thread_id: ThreadId,
    poller: Mutex<Poller>,
    pending: Mutex<Vec<Task>>,
    handling_pending: AtomicBool,
    quit: AtomicBool,
    wakeup_fd: OwnedFd,
}

impl LoopInner {
    fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    fn wakeup(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.wakeup_fd.as_raw_fd(),
                (&raw const one).cast(),
                size_of::<u64>(),
            )
        };
        if n != size_of::<u64>() as isize {
            error!(bytes = n, "wakeup write returned wrong size");
        }
    }
}

/// Thread-safe face of an [`EventLoop`].
///
/// Task submission and `quit` may be called from any thread; the channel
/// operations assert loop-thread affinity.
#[derive(Clone)]
pub struct LoopHandle {
    inner: Arc<LoopInner>,
}

impl LoopHandle {
    pub fn is_in_loop_thread(&self) -> bool {
        self.inner.is_in_loop_thread()
    }

    /// True when both handles refer to the same loop.
    pub fn same_loop(&self, other: &LoopHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Run `task` on the loop thread: inline when the caller already is the
    /// loop thread, queued otherwise.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Queue `task` for the tail of the loop's next cycle.
    ///
    /// The loop is woken when the caller is foreign, and also when the loop
    /// is currently inside its pending-task drain: a task queued by another
    /// task would otherwise sit until the next poll timeout.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.inner.pending.lock().push(Box::new(task));

        if !self.is_in_loop_thread() || self.inner.handling_pending.load(Ordering::SeqCst) {
            self.inner.wakeup();
        }
    }

    /// Request loop exit. Effective within one poll cycle; a foreign caller
    /// wakes the loop so that cycle starts immediately.
    pub fn quit(&self) {
        self.inner.quit.store(true, Ordering::SeqCst);
        if !self.is_in_loop_thread() {
            self.inner.wakeup();
        }
    }

    pub fn update_channel(&self, channel: &Arc<Channel>) {
        assert!(
            self.is_in_loop_thread(),
            "channel interest changed off the loop thread"
        );
        self.inner.poller.lock().update_channel(channel);
    }

    pub fn remove_channel(&self, channel: &Arc<Channel>) {
        assert!(
            self.is_in_loop_thread(),
            "channel removed off the loop thread"
        );
        self.inner.poller.lock().remove_channel(channel);
    }

    pub fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.inner.poller.lock().has_channel(channel)
    }
}

/// Drains the wakeup eventfd so it re-arms for the next cross-thread nudge.
struct WakeupDrain {
    fd: RawFd,
}

impl ChannelHandler for WakeupDrain {
    fn handle_read(&self, _ts: SystemTime) {
        let mut count: u64 = 0;
        let n = unsafe { libc::read(self.fd, (&raw mut count).cast(), size_of::<u64>()) };
        if n != size_of::<u64>() as isize {
            error!(bytes = n, "wakeup read returned wrong size");
        }
    }
}

pub struct EventLoop {
    inner: Arc<LoopInner>,
    // Keeps the wakeup channel's owner tie upgradeable for the loop's life.
    #[allow(dead_code)]
    wakeup_drain: Arc<WakeupDrain>,
    wakeup_channel: Arc<Channel>,
    active: Vec<Arc<Channel>>,
    poll_return_time: SystemTime,
    looping: bool,
}

impl EventLoop {
    pub fn new() -> io::Result<EventLoop> {
        let poller = Poller::new()?;

        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let wakeup_fd = unsafe { OwnedFd::from_raw_fd(fd) };

        LOOP_IN_THIS_THREAD.with(|slot| {
            if slot.get() {
                panic!(
                    "another event loop already exists on thread {:?}",
                    thread::current().id()
                );
            }
            slot.set(true);
        });

        let inner = Arc::new(LoopInner {
            thread_id: thread::current().id(),
            poller: Mutex::new(poller),
            pending: Mutex::new(Vec::new()),
            handling_pending: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            wakeup_fd,
        });

        let handle = LoopHandle {
            inner: inner.clone(),
        };
        let wakeup_drain = Arc::new(WakeupDrain { fd });
        let wakeup_channel = Channel::new(handle, fd);
        let wakeup_drain_dyn: Arc<dyn ChannelHandler> = wakeup_drain.clone();
        let tie: Weak<dyn ChannelHandler> = Arc::downgrade(&wakeup_drain_dyn);
        wakeup_channel.tie(tie);
        wakeup_channel.enable_reading();

        debug!(thread = ?inner.thread_id, "event loop created");

        Ok(EventLoop {
            inner,
            wakeup_drain,
            wakeup_channel,
            active: Vec::new(),
            poll_return_time: SystemTime::now(),
            looping: false,
        })
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            inner: self.inner.clone(),
        }
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.inner.is_in_loop_thread()
    }

    /// Wall-clock time of the most recent poll return.
    pub fn poll_return_time(&self) -> SystemTime {
        self.poll_return_time
    }

    /// True while [`EventLoop::run`] is executing.
    pub fn is_running(&self) -> bool {
        self.looping
    }

    /// Drive the loop until [`LoopHandle::quit`] is observed.
    ///
    /// Each cycle: poll (bounded by the poll timeout), dispatch the ready
    /// channels with the poll-return timestamp, then drain submitted tasks.
    pub fn run(&mut self) {
        assert!(
            self.is_in_loop_thread(),
            "event loop driven off its owning thread"
        );
        self.looping = true;
        debug!("event loop running");

        while !self.inner.quit.load(Ordering::SeqCst) {
            self.active.clear();
            // The poller guard is scoped to the poll call: dispatch below
            // re-enters it through channel interest changes.
            let ts = self.inner.poller.lock().poll(POLL_TIMEOUT, &mut self.active);
            self.poll_return_time = ts;

            for channel in &self.active {
                channel.handle_event(ts);
            }
            self.run_pending_tasks();
        }

        debug!("event loop stopped");
        self.looping = false;
    }

    pub fn quit(&self) {
        self.handle().quit();
    }

    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.handle().run_in_loop(task);
    }

    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.handle().queue_in_loop(task);
    }

    /// Swap the queue out under the lock, then run the tasks lock-free so a
    /// task may queue further tasks (the wakeup keeps them from stalling).
    fn run_pending_tasks(&mut self) {
        self.inner.handling_pending.store(true, Ordering::SeqCst);
        let tasks = std::mem::take(&mut *self.inner.pending.lock());
        for task in tasks {
            task();
        }
        self.inner.handling_pending.store(false, Ordering::SeqCst);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.wakeup_channel.disable_all();
        self.wakeup_channel.remove();
        LOOP_IN_THIS_THREAD.with(|slot| slot.set(false));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Sink;
    impl ChannelHandler for Sink {}

    #[test]
    fn run_in_loop_is_inline_on_the_creator_thread() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        assert!(handle.is_in_loop_thread());

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        handle.run_in_loop(move || flag.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn second_loop_on_one_thread_is_fatal() {
        let _first = EventLoop::new().unwrap();
        let second = std::panic::catch_unwind(EventLoop::new);
        assert!(second.is_err());
    }

    #[test]
    fn loop_slot_is_released_on_drop() {
        {
            let _event_loop = EventLoop::new().unwrap();
        }
        let again = EventLoop::new();
        assert!(again.is_ok());
    }

    #[test]
    fn event_vector_doubles_when_a_poll_fills_it() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let sink = Arc::new(Sink);

        let mut channels = Vec::new();
        for _ in 0..16 {
            let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
            assert!(fd >= 0);
            let channel = Channel::new(handle.clone(), fd);
            let sink_dyn: Arc<dyn ChannelHandler> = sink.clone();
            let tie: Weak<dyn ChannelHandler> = Arc::downgrade(&sink_dyn);
            channel.tie(tie);
            channel.enable_reading();

            let one: u64 = 1;
            unsafe { libc::write(fd, (&raw const one).cast(), size_of::<u64>()) };
            channels.push(channel);
        }

        {
            let mut poller = event_loop.inner.poller.lock();
            assert_eq!(poller.event_capacity(), 16);
            let mut active = Vec::new();
            poller.poll(Duration::from_millis(200), &mut active);
            assert_eq!(active.len(), 16);
            assert_eq!(poller.event_capacity(), 32);
        }

        for channel in &channels {
            channel.disable_all();
            channel.remove();
            unsafe { libc::close(channel.fd()) };
        }
    }

    #[test]
    fn pending_tasks_run_in_fifo_order() {
        let mut event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();

        let order = Arc::new(Mutex::new(Vec::new()));
        let producer = {
            let handle = handle.clone();
            let order = order.clone();
            thread::spawn(move || {
                for i in 0..32 {
                    let order = order.clone();
                    handle.queue_in_loop(move || order.lock().push(i));
                }
                let stopper = handle.clone();
                handle.queue_in_loop(move || stopper.quit());
            })
        };
        producer.join().unwrap();

        event_loop.run();
        assert_eq!(*order.lock(), (0..32).collect::<Vec<_>>());
    }
}
