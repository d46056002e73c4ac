// src/engine/queue.rs
//
// Bounded hand-off between the discovery producer and the workers.
//
// Memory is capped at O(capacity) no matter how many files discovery
// enumerates: push() blocks while `capacity` unclaimed tasks are waiting.

use crate::error::PushError;
use crate::task::Task;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

#[derive(Debug)]
struct QueueState {
    items: VecDeque<Task>,
    closed: bool,
    high_water: usize,
}

/// Capacity-limited FIFO of unclaimed tasks.
#[derive(Debug)]
pub struct TaskQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(4096)),
                closed: false,
                high_water: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Push, blocking while the queue is full. Fails only once closed.
    pub fn push(&self, task: Task) -> Result<(), PushError> {
        let mut state = self.state.lock();
        while !state.closed && state.items.len() >= self.capacity {
            self.not_full.wait(&mut state);
        }
        if state.closed {
            return Err(PushError::Closed(task));
        }
        Self::enqueue_locked(&mut state, task);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Push without blocking. A full queue hands the task back as `Full`.
    pub fn try_push(&self, task: Task) -> Result<(), PushError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PushError::Closed(task));
        }
        if state.items.len() >= self.capacity {
            return Err(PushError::Full(task));
        }
        Self::enqueue_locked(&mut state, task);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    fn enqueue_locked(state: &mut QueueState, task: Task) {
        state.items.push_back(task);
        state.high_water = state.high_water.max(state.items.len());
    }

    /// Pop, blocking until a task is available. Returns None once the queue
    /// is closed and every remaining task has been handed out.
    pub fn pop(&self) -> Option<Task> {
        let mut state = self.state.lock();
        loop {
            if let Some(task) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(task);
            }
            if state.closed {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    pub fn try_pop(&self) -> Option<Task> {
        let task = self.state.lock().items.pop_front();
        if task.is_some() {
            self.not_full.notify_one();
        }
        task
    }

    /// No more pushes will be accepted. Pending pops drain what is left.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Take every unclaimed task at once.
    pub fn drain(&self) -> Vec<Task> {
        let drained: Vec<Task> = self.state.lock().items.drain(..).collect();
        self.not_full.notify_all();
        drained
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest number of unclaimed tasks held at any one time
    pub fn high_water(&self) -> usize {
        self.state.lock().high_water
    }
}
