//! Deferred work queue: closures submitted from any thread, run on the
//! reactor thread.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::server::Reactor;

/// A unit of work for the reactor thread.
pub type Task = Box<dyn FnOnce(&mut Reactor) + Send + 'static>;

/// Mutex-guarded FIFO of pending tasks.
///
/// Ordering is submission order into the shared queue; the reactor
/// drains the whole backlog at the top of each loop iteration.
pub(crate) struct TaskQueue {
    queue: Mutex<VecDeque<Task>>,
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn push(&self, task: Task) {
        self.queue.lock().push_back(task);
    }

    /// Take every currently queued task.
    ///
    /// Tasks enqueued while the batch runs are picked up next drain, so
    /// a task that reschedules itself cannot starve the poll wait.
    pub(crate) fn drain(&self) -> VecDeque<Task> {
        std::mem::take(&mut *self.queue.lock())
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.queue.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn drain_takes_the_whole_backlog() {
        let queue = TaskQueue::new();
        for _ in 0..5 {
            queue.push(Box::new(|_| {}));
        }
        assert_eq!(queue.len(), 5);

        // FIFO execution order is exercised end-to-end in the server
        // tests; a drained batch preserves queue order by construction.
        assert_eq!(queue.drain().len(), 5);
        assert_eq!(queue.len(), 0);
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn cross_thread_submission() {
        let queue = Arc::new(TaskQueue::new());
        let count = Arc::new(AtomicUsize::new(0));
        let mut threads = Vec::new();
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            let count = Arc::clone(&count);
            threads.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    let count = Arc::clone(&count);
                    queue.push(Box::new(move |_| {
                        count.fetch_add(1, Ordering::Relaxed);
                    }));
                }
            }));
        }
        for thread in threads {
            thread.join().expect("submitter thread");
        }
        assert_eq!(queue.drain().len(), 400);
    }
}
