//! A worker thread that owns one event loop on its own stack.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::event_loop::{EventLoop, LoopHandle};

/// Per-thread initialization hook, run on the worker before it starts
/// serving events.
pub type ThreadInitCallback = Arc<dyn Fn(&LoopHandle) + Send + Sync>;

struct Handshake {
    slot: Mutex<Option<LoopHandle>>,
    ready: Condvar,
}

/// Spawns a thread, builds an [`EventLoop`] on that thread's stack, and
/// hands the parent a [`LoopHandle`] once the worker has published it.
///
/// Dropping the value quits the loop and joins the thread.
pub struct EventLoopThread {
    name: String,
    init: Option<ThreadInitCallback>,
    thread: Option<JoinHandle<()>>,
    handle: Option<LoopHandle>,
    handshake: Arc<Handshake>,
}

impl EventLoopThread {
    pub fn new(name: impl Into<String>, init: Option<ThreadInitCallback>) -> EventLoopThread {
        EventLoopThread {
            name: name.into(),
            init,
            thread: None,
            handle: None,
            handshake: Arc::new(Handshake {
                slot: Mutex::new(None),
                ready: Condvar::new(),
            }),
        }
    }

    /// Start the worker and block until its loop handle is published.
    pub fn start_loop(&mut self) -> LoopHandle {
        assert!(self.thread.is_none(), "loop thread started twice");

        let handshake = self.handshake.clone();
        let init = self.init.take();
        let thread = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let mut event_loop =
                    EventLoop::new().expect("failed to create worker event loop");

                if let Some(init) = init {
                    init(&event_loop.handle());
                }

                {
                    let mut slot = handshake.slot.lock();
                    *slot = Some(event_loop.handle());
                    handshake.ready.notify_one();
                }

                event_loop.run();

                // The loop is gone; clear the slot so late observers do not
                // see a handle whose loop no longer drains tasks.
                *handshake.slot.lock() = None;
            })
            .expect("failed to spawn loop thread");
        self.thread = Some(thread);

        let handle = {
            let mut slot = self.handshake.slot.lock();
            while slot.is_none() {
                self.handshake.ready.wait(&mut slot);
            }
            slot.clone().unwrap()
        };
        self.handle = Some(handle.clone());
        handle
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.quit();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[test]
    fn start_loop_publishes_a_live_handle() {
        let mut worker = EventLoopThread::new("test-loop", None);
        let handle = worker.start_loop();
        assert!(!handle.is_in_loop_thread());

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        handle.run_in_loop(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let deadline = Instant::now() + Duration::from_secs(2);
        while ran.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn init_callback_runs_on_the_worker() {
        let init_count = Arc::new(AtomicUsize::new(0));
        let counter = init_count.clone();
        let init: ThreadInitCallback = Arc::new(move |handle| {
            assert!(handle.is_in_loop_thread());
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut worker = EventLoopThread::new("init-loop", Some(init));
        let _handle = worker.start_loop();
        assert_eq!(init_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn quit_from_a_foreign_thread_unblocks_promptly() {
        let mut worker = EventLoopThread::new("quit-loop", None);
        let handle = worker.start_loop();

        // The loop sits idle inside a 10s poll; quit must interrupt it well
        // before that timeout.
        let start = Instant::now();
        handle.quit();
        drop(worker);
        assert!(Instant::now() - start < Duration::from_secs(1));
    }
}
