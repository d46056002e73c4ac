// src/engine/events.rs
//
// Best-effort result notifications for UI and logging listeners.
// Statistics are the source of truth; events may be dropped.

use crate::task::TaskResult;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Receives every recorded result. Must not block the publishing worker.
pub trait EventSink: Send + Sync {
    fn publish(&self, result: &TaskResult);
}

/// Sink that discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _result: &TaskResult) {}
}

/// Bounded buffer of unread results. When full, the oldest unread result is
/// dropped to make room.
#[derive(Debug)]
pub struct EventBuffer {
    capacity: usize,
    events: Mutex<VecDeque<TaskResult>>,
    available: Condvar,
    dropped: AtomicU64,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            events: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            available: Condvar::new(),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn try_recv(&self) -> Option<TaskResult> {
        self.events.lock().pop_front()
    }

    /// Wait up to `timeout` for the next result.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<TaskResult> {
        let mut events = self.events.lock();
        if events.is_empty() {
            // Spurious or timed-out wakeups fall through to pop_front()
            let _ = self.available.wait_for(&mut events, timeout);
        }
        events.pop_front()
    }

    /// Take every unread result.
    pub fn drain(&self) -> Vec<TaskResult> {
        self.events.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Results discarded because no one read them in time
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventSink for EventBuffer {
    fn publish(&self, result: &TaskResult) {
        let mut events = self.events.lock();
        if events.len() >= self.capacity {
            events.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        events.push_back(result.clone());
        drop(events);
        self.available.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{ConversionOptions, Task};
    use std::sync::Arc;
    use std::thread;

    fn result() -> TaskResult {
        let task = Task::new("a.heic", "a.jpg", ConversionOptions::default());
        TaskResult::success(&task, Duration::ZERO, 1, 1)
    }

    #[test]
    fn test_drop_oldest_when_full() {
        let buffer = EventBuffer::new(2);
        let first = result();
        let second = result();
        let third = result();
        buffer.publish(&first);
        buffer.publish(&second);
        buffer.publish(&third);

        assert_eq!(buffer.dropped(), 1);
        let ids: Vec<_> = buffer.drain().into_iter().map(|r| r.task_id).collect();
        assert_eq!(ids, vec![second.task_id, third.task_id]);
    }

    #[test]
    fn test_recv_timeout_wakes_on_publish() {
        let buffer = Arc::new(EventBuffer::new(4));
        let publisher = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                buffer.publish(&result());
            })
        };
        assert!(buffer.recv_timeout(Duration::from_secs(2)).is_some());
        publisher.join().unwrap();
    }

    #[test]
    fn test_recv_timeout_expires_empty() {
        let buffer = EventBuffer::new(1);
        assert!(buffer.recv_timeout(Duration::from_millis(10)).is_none());
    }
}
