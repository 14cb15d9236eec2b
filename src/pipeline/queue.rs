//! Bounded, leaky unit queue feeding one sink.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

struct QueueInner {
    units: VecDeque<Vec<u8>>,
    bytes: usize,
    closed: bool,
    overflow_units: u64,
}

/// Queue between a fan-out and a sink.
///
/// The producer side (the worker thread) never blocks: when the byte budget
/// is exceeded the oldest units are discarded. The consumer side waits a
/// bounded time for the next unit.
pub struct BranchQueue {
    inner: Mutex<QueueInner>,
    ready: Condvar,
    capacity_bytes: usize,
}

impl BranchQueue {
    /// Creates a queue holding at most `capacity_bytes` of audio.
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                units: VecDeque::new(),
                bytes: 0,
                closed: false,
                overflow_units: 0,
            }),
            ready: Condvar::new(),
            capacity_bytes,
        }
    }

    /// Appends a unit, discarding the oldest ones if over budget.
    ///
    /// Returns false if the queue is closed.
    pub fn push(&self, unit: Vec<u8>) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }

        inner.bytes += unit.len();
        inner.units.push_back(unit);
        while inner.bytes > self.capacity_bytes && inner.units.len() > 1 {
            if let Some(old) = inner.units.pop_front() {
                inner.bytes -= old.len();
                inner.overflow_units += 1;
            }
        }
        drop(inner);

        self.ready.notify_one();
        true
    }

    /// Takes the next unit, waiting up to `timeout` for one to arrive.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock();
        if inner.units.is_empty() && !inner.closed {
            let _ = self.ready.wait_for(&mut inner, timeout);
        }
        let unit = inner.units.pop_front()?;
        inner.bytes -= unit.len();
        Some(unit)
    }

    /// Bytes currently queued.
    pub fn queued_bytes(&self) -> usize {
        self.inner.lock().bytes
    }

    /// Units discarded because the budget was exceeded.
    pub fn overflow_units(&self) -> u64 {
        self.inner.lock().overflow_units
    }

    /// Drops queued units and refuses new ones; wakes a waiting consumer.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.units.clear();
        inner.bytes = 0;
        drop(inner);
        self.ready.notify_all();
    }

    /// Returns true once closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_fifo_order() {
        let queue = BranchQueue::new(1024);
        queue.push(vec![1]);
        queue.push(vec![2, 2]);
        assert_eq!(queue.queued_bytes(), 3);
        assert_eq!(queue.pop_timeout(Duration::ZERO), Some(vec![1]));
        assert_eq!(queue.pop_timeout(Duration::ZERO), Some(vec![2, 2]));
        assert_eq!(queue.queued_bytes(), 0);
    }

    #[test]
    fn test_leaks_oldest_when_full() {
        let queue = BranchQueue::new(4);
        queue.push(vec![1, 1]);
        queue.push(vec![2, 2]);
        queue.push(vec![3, 3]);
        assert_eq!(queue.overflow_units(), 1);
        assert_eq!(queue.pop_timeout(Duration::ZERO), Some(vec![2, 2]));
    }

    #[test]
    fn test_oversized_unit_is_kept_alone() {
        let queue = BranchQueue::new(4);
        queue.push(vec![1]);
        queue.push(vec![9; 8]);
        assert_eq!(queue.pop_timeout(Duration::ZERO), Some(vec![9; 8]));
    }

    #[test]
    fn test_pop_times_out() {
        let queue = BranchQueue::new(16);
        let start = Instant::now();
        assert_eq!(queue.pop_timeout(Duration::from_millis(10)), None);
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn test_pop_wakes_on_push() {
        let queue = Arc::new(BranchQueue::new(16));
        let producer = queue.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            producer.push(vec![7]);
        });
        assert_eq!(queue.pop_timeout(Duration::from_secs(2)), Some(vec![7]));
        handle.join().unwrap();
    }

    #[test]
    fn test_close_refuses_and_wakes() {
        let queue = BranchQueue::new(16);
        queue.push(vec![1]);
        queue.close();
        assert!(queue.is_closed());
        assert!(!queue.push(vec![2]));
        assert_eq!(queue.pop_timeout(Duration::from_secs(1)), None);
    }
}
