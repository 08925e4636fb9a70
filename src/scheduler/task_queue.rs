//! In-memory FIFO task queue for one phase.
//!
//! Built once from the ordered item list when a phase starts. Workers pop
//! from the front; transient failures are requeued at the back so a flaky
//! item does not hold its slot while waiting for a retry.

use std::collections::VecDeque;
use std::sync::Mutex;

/// A queued work unit with its attempt counter.
#[derive(Debug, Clone)]
pub struct QueuedTask<T> {
    /// The work item.
    pub item: T,
    /// Attempts consumed so far.
    pub attempts: u32,
}

/// FIFO queue of per-item work units for one phase.
pub struct TaskQueue<T> {
    inner: Mutex<VecDeque<QueuedTask<T>>>,
    total: usize,
}

impl<T> TaskQueue<T> {
    /// Builds a queue from an ordered item list.
    pub fn new(items: impl IntoIterator<Item = T>) -> Self {
        let queue: VecDeque<QueuedTask<T>> = items
            .into_iter()
            .map(|item| QueuedTask { item, attempts: 0 })
            .collect();
        let total = queue.len();
        Self {
            inner: Mutex::new(queue),
            total,
        }
    }

    /// Pops the next task, if any.
    pub fn pop(&self) -> Option<QueuedTask<T>> {
        self.lock().pop_front()
    }

    /// Returns a task to the back of the queue for retry.
    pub fn requeue(&self, task: QueuedTask<T>) {
        self.lock().push_back(task);
    }

    /// Returns the number of tasks currently queued.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Returns the number of items the queue was built with.
    pub fn total(&self) -> usize {
        self.total
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<QueuedTask<T>>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let queue = TaskQueue::new(vec!["a", "b", "c"]);
        assert_eq!(queue.total(), 3);
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.pop().unwrap().item, "a");
        assert_eq!(queue.pop().unwrap().item, "b");
        assert_eq!(queue.pop().unwrap().item, "c");
        assert!(queue.pop().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_requeue_goes_to_back() {
        let queue = TaskQueue::new(vec!["a", "b"]);

        let mut first = queue.pop().unwrap();
        first.attempts += 1;
        queue.requeue(first);

        assert_eq!(queue.pop().unwrap().item, "b");
        let retried = queue.pop().unwrap();
        assert_eq!(retried.item, "a");
        assert_eq!(retried.attempts, 1);
    }

    #[test]
    fn test_total_is_stable_across_pops() {
        let queue = TaskQueue::new(vec![1, 2, 3, 4]);
        queue.pop();
        queue.pop();
        assert_eq!(queue.total(), 4);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_empty_queue() {
        let queue: TaskQueue<u32> = TaskQueue::new(Vec::new());
        assert_eq!(queue.total(), 0);
        assert!(queue.is_empty());
        assert!(queue.pop().is_none());
    }
}
