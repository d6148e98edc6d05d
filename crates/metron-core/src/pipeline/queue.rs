//! Mutex-guarded FIFO queue between producer and consumer threads.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Strict FIFO handoff queue.
///
/// `pop` never blocks; an empty queue yields `None` and the consumer decides
/// how long to back off. Items leave in exactly the order they arrived.
#[derive(Debug, Default)]
pub struct TaskQueue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }

    /// Appends an item at the back.
    pub fn push(&self, item: T) {
        self.items.lock().unwrap().push_back(item);
    }

    /// Removes and returns the front item, if any.
    pub fn pop(&self) -> Option<T> {
        self.items.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().unwrap().is_empty()
    }
}
