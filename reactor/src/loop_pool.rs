//! Round-robin pool of worker event loops behind a base loop.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::info;

use crate::event_loop::LoopHandle;
use crate::loop_thread::{EventLoopThread, ThreadInitCallback};

/// Owns the worker loop threads and distributes connections over them.
///
/// With zero workers every caller is handed the base loop, which then
/// serves both accepting and connection I/O.
pub struct EventLoopThreadPool {
    base: LoopHandle,
    name: String,
    started: AtomicBool,
    num_threads: AtomicUsize,
    next: AtomicUsize,
    threads: Mutex<Vec<EventLoopThread>>,
    loops: Mutex<Vec<LoopHandle>>,
}

impl EventLoopThreadPool {
    pub fn new(base: LoopHandle, name: impl Into<String>) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base,
            name: name.into(),
            started: AtomicBool::new(false),
            num_threads: AtomicUsize::new(0),
            next: AtomicUsize::new(0),
            threads: Mutex::new(Vec::new()),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Number of worker threads to spawn on [`EventLoopThreadPool::start`].
    pub fn set_thread_num(&self, num: usize) {
        self.num_threads.store(num, Ordering::SeqCst);
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Spawn the workers, running `init` on each; with zero workers the
    /// init hook runs once on the base loop instead.
    pub fn start(&self, init: Option<ThreadInitCallback>) {
        assert!(!self.started.swap(true, Ordering::SeqCst), "pool started twice");

        let num = self.num_threads.load(Ordering::SeqCst);
        info!(name = %self.name, workers = num, "starting loop pool");

        for i in 0..num {
            let mut worker =
                EventLoopThread::new(format!("{}{}", self.name, i), init.clone());
            let handle = worker.start_loop();
            self.threads.lock().push(worker);
            self.loops.lock().push(handle);
        }

        if num == 0
            && let Some(init) = init
        {
            init(&self.base);
        }
    }

    /// Next loop in round-robin order; the base loop when the pool is empty.
    pub fn next_loop(&self) -> LoopHandle {
        let loops = self.loops.lock();
        if loops.is_empty() {
            return self.base.clone();
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % loops.len();
        loops[i].clone()
    }

    /// All worker loops, or `[base]` when the pool is empty.
    pub fn all_loops(&self) -> Vec<LoopHandle> {
        let loops = self.loops.lock();
        if loops.is_empty() {
            vec![self.base.clone()]
        } else {
            loops.clone()
        }
    }

    pub fn base_loop(&self) -> &LoopHandle {
        &self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn empty_pool_serves_the_base_loop() {
        let base = EventLoop::new().unwrap();
        let pool = EventLoopThreadPool::new(base.handle(), "pool");

        let init_count = Arc::new(AtomicUsize::new(0));
        let counter = init_count.clone();
        let init: ThreadInitCallback = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        pool.start(Some(init));

        assert_eq!(init_count.load(Ordering::SeqCst), 1);
        assert!(pool.next_loop().is_in_loop_thread());
        assert_eq!(pool.all_loops().len(), 1);
    }

    #[test]
    fn round_robin_cycles_over_workers() {
        let base = EventLoop::new().unwrap();
        let pool = EventLoopThreadPool::new(base.handle(), "worker");
        pool.set_thread_num(3);
        pool.start(None);

        let loops = pool.all_loops();
        assert_eq!(loops.len(), 3);

        // Two full cycles in order, never the base loop.
        for _ in 0..2 {
            for expected in &loops {
                let next = pool.next_loop();
                assert!(next.same_loop(expected));
                assert!(!next.same_loop(pool.base_loop()));
            }
        }
    }

    #[test]
    fn init_runs_once_per_worker() {
        let base = EventLoop::new().unwrap();
        let pool = EventLoopThreadPool::new(base.handle(), "init-worker");
        pool.set_thread_num(2);

        let init_count = Arc::new(AtomicUsize::new(0));
        let counter = init_count.clone();
        let init: ThreadInitCallback = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        pool.start(Some(init));

        assert_eq!(init_count.load(Ordering::SeqCst), 2);
    }
}
