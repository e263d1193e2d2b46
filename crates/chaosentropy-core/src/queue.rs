//! Bounded blocking FIFO shared between pipeline stages.
//!
//! All suspension in the pipeline happens here: producers wait while the
//! queue is full, consumers wait while it is empty, and every wait has a
//! timeout so workers can re-check shutdown.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Why a push did not complete. The item is handed back either way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushError<T> {
    Full(T),
    Closed(T),
}

impl<T> PushError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(item) | Self::Closed(item) => item,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopError {
    /// Nothing arrived within the timeout.
    Empty,
    /// Closed and fully drained.
    Closed,
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    not_full: Condvar,
    not_empty: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Append without waiting.
    pub fn try_push(&self, item: T) -> Result<(), PushError<T>> {
        self.push_timeout(item, Duration::ZERO)
    }

    /// Append, waiting up to `timeout` for space.
    pub fn push_timeout(&self, item: T, timeout: Duration) -> Result<(), PushError<T>> {
        self.push_waited(item, timeout).map(|_| ())
    }

    /// Append, waiting up to `timeout` for space. `Ok(true)` if the push had
    /// to wait for a consumer first.
    pub fn push_waited(&self, item: T, timeout: Duration) -> Result<bool, PushError<T>> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        let mut waited = false;
        loop {
            if inner.closed {
                return Err(PushError::Closed(item));
            }
            if inner.items.len() < self.capacity {
                inner.items.push_back(item);
                drop(inner);
                self.not_empty.notify_one();
                return Ok(waited);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(PushError::Full(item));
            }
            waited = true;
            inner = self.not_full.wait_timeout(inner, deadline - now).unwrap().0;
        }
    }

    /// Remove the oldest item, waiting up to `timeout` for one to arrive.
    ///
    /// After [`close`](Self::close) the remaining items are still returned;
    /// `PopError::Closed` only once the queue is empty.
    pub fn pop_timeout(&self, timeout: Duration) -> Result<T, PopError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(item) = inner.items.pop_front() {
                drop(inner);
                self.not_full.notify_one();
                return Ok(item);
            }
            if inner.closed {
                return Err(PopError::Closed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(PopError::Empty);
            }
            inner = self.not_empty.wait_timeout(inner, deadline - now).unwrap().0;
        }
    }

    pub fn try_pop(&self) -> Result<T, PopError> {
        self.pop_timeout(Duration::ZERO)
    }

    /// Remove everything currently queued.
    pub fn drain(&self) -> Vec<T> {
        let items: Vec<T> = self.inner.lock().unwrap().items.drain(..).collect();
        self.not_full.notify_all();
        items
    }

    /// Refuse further pushes and wake every waiter.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let q = BoundedQueue::new(4);
        for i in 0..4 {
            q.try_push(i).unwrap();
        }
        let out: Vec<i32> = (0..4).map(|_| q.try_pop().unwrap()).collect();
        assert_eq!(out, vec![0, 1, 2, 3]);
        assert_eq!(q.try_pop(), Err(PopError::Empty));
    }

    #[test]
    fn test_full_returns_item() {
        let q = BoundedQueue::new(1);
        q.try_push("a").unwrap();
        let err = q.push_timeout("b", Duration::from_millis(5)).unwrap_err();
        assert_eq!(err, PushError::Full("b"));
        assert_eq!(err.into_inner(), "b");
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_blocked_push_completes_after_pop() {
        let q = Arc::new(BoundedQueue::new(1));
        q.try_push(1).unwrap();
        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.push_waited(2, Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(q.pop_timeout(Duration::from_secs(1)), Ok(1));
        assert_eq!(producer.join().unwrap(), Ok(true));
        assert_eq!(q.try_pop(), Ok(2));
    }

    #[test]
    fn test_close_drains_then_reports_closed() {
        let q = BoundedQueue::new(4);
        q.try_push(7).unwrap();
        q.close();
        assert!(matches!(q.try_push(8), Err(PushError::Closed(8))));
        assert_eq!(q.pop_timeout(Duration::from_millis(5)), Ok(7));
        assert_eq!(q.pop_timeout(Duration::from_millis(5)), Err(PopError::Closed));
    }

    #[test]
    fn test_close_wakes_waiting_consumer() {
        let q: Arc<BoundedQueue<u8>> = Arc::new(BoundedQueue::new(2));
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.pop_timeout(Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(20));
        q.close();
        assert_eq!(consumer.join().unwrap(), Err(PopError::Closed));
    }

    #[test]
    fn test_drain_empties_queue() {
        let q = BoundedQueue::new(8);
        for i in 0..5 {
            q.try_push(i).unwrap();
        }
        assert_eq!(q.drain(), vec![0, 1, 2, 3, 4]);
        assert!(q.is_empty());
    }
}
