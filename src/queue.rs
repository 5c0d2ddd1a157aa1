//! Blocking FIFO queue shared between producers and worker threads.
//!
//! Backs the result queue and both local task queues. Workers use
//! `timed_pop` so they can re-check the shutdown flag several times per
//! second instead of parking indefinitely.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

pub struct BlockingQueue<T> {
    inner: Mutex<VecDeque<T>>,
    cv: Condvar,
    shutdown: AtomicBool,
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        BlockingQueue {
            inner: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }
}

impl<T> BlockingQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes an item unless the queue has been shut down.
    pub fn push(&self, item: T) {
        {
            let mut q = self.inner.lock();
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            q.push_back(item);
        }
        self.cv.notify_one();
    }

    pub fn try_pop(&self) -> Option<T> {
        let mut q = self.inner.lock();
        q.pop_front()
    }

    /// Blocks up to `timeout` for an item. Returns `None` on timeout or
    /// shutdown with an empty queue.
    pub fn timed_pop(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut q = self.inner.lock();
        loop {
            if let Some(item) = q.pop_front() {
                return Some(item);
            }
            if self.shutdown.load(Ordering::Acquire) {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            if self.cv.wait_for(&mut q, deadline - now).timed_out() {
                return q.pop_front();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn shut_down(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.cv.notify_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}
