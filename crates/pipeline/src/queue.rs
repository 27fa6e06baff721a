//! Priority task queue with a fixed worker pool
//!
//! Three priority classes served strictly by class, FIFO within a class.
//! Workers are tokio tasks parked on a `Notify` while the queue is empty.
//! Shutdown is cooperative: new submissions are rejected, queued items run
//! to completion, workers are joined.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Priority classes, highest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPriority {
    High,
    Normal,
    Low,
}

impl TaskPriority {
    fn index(self) -> usize {
        match self {
            TaskPriority::High => 0,
            TaskPriority::Normal => 1,
            TaskPriority::Low => 2,
        }
    }
}

/// Queue observability counters
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub submitted: u64,
    pub executed: u64,
    pub rejected: u64,
    /// Items currently waiting, per priority class (high, normal, low)
    pub depth: [usize; 3],
}

type Task = BoxFuture<'static, ()>;

struct QueueInner {
    // One FIFO per priority class
    classes: Mutex<[VecDeque<Task>; 3]>,
    notify: Notify,
    accepting: AtomicBool,
    submitted: AtomicU64,
    executed: AtomicU64,
    rejected: AtomicU64,
}

impl QueueInner {
    fn pop(&self) -> Option<Task> {
        let mut classes = self.classes.lock();
        classes.iter_mut().find_map(|q| q.pop_front())
    }

    fn is_empty(&self) -> bool {
        self.classes.lock().iter().all(|q| q.is_empty())
    }
}

/// Priority-ordered MPMC queue of work items dispatched to a worker pool.
///
/// Submitted futures may run on any worker and concurrently with one
/// another; they must own everything they touch (`'static + Send`).
/// There is no per-task cancellation; timeouts are the submitter's concern.
pub struct TaskQueue {
    inner: Arc<QueueInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskQueue {
    pub const DEFAULT_WORKERS: usize = 4;

    /// Create a queue and spawn `workers` worker tasks
    pub fn new(workers: usize) -> Arc<Self> {
        let workers = workers.max(1);
        let inner = Arc::new(QueueInner {
            classes: Mutex::new([VecDeque::new(), VecDeque::new(), VecDeque::new()]),
            notify: Notify::new(),
            accepting: AtomicBool::new(true),
            submitted: AtomicU64::new(0),
            executed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        });

        let handles = (0..workers)
            .map(|worker_id| {
                let inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    tracing::debug!(worker_id, "queue worker started");
                    loop {
                        // Register for wakeup before checking the queue so a
                        // submit between pop and await is not lost.
                        let notified = inner.notify.notified();

                        if let Some(task) = inner.pop() {
                            task.await;
                            inner.executed.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }

                        if !inner.accepting.load(Ordering::Acquire) {
                            break;
                        }

                        notified.await;
                    }
                    tracing::debug!(worker_id, "queue worker exiting");
                })
            })
            .collect();

        Arc::new(Self {
            inner,
            workers: Mutex::new(handles),
        })
    }

    /// Create with the default pool size
    pub fn with_default_workers() -> Arc<Self> {
        Self::new(Self::DEFAULT_WORKERS)
    }

    /// Submit a work item. Returns false once shutdown has begun.
    pub fn submit<F>(&self, priority: TaskPriority, task: F) -> bool
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if !self.inner.accepting.load(Ordering::Acquire) {
            self.inner.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        self.inner.classes.lock()[priority.index()].push_back(Box::pin(task));
        self.inner.submitted.fetch_add(1, Ordering::Relaxed);
        self.inner.notify.notify_one();
        true
    }

    /// Stop accepting work, drain queued items, and join the workers
    pub async fn shutdown(&self) {
        self.inner.accepting.store(false, Ordering::Release);
        self.inner.notify.notify_waiters();

        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("task queue shut down");
    }

    /// Items currently queued across all classes
    pub fn depth(&self) -> usize {
        self.inner.classes.lock().iter().map(|q| q.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        let classes = self.inner.classes.lock();
        QueueStats {
            submitted: self.inner.submitted.load(Ordering::Relaxed),
            executed: self.inner.executed.load(Ordering::Relaxed),
            rejected: self.inner.rejected.load(Ordering::Relaxed),
            depth: [classes[0].len(), classes[1].len(), classes[2].len()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_tasks_execute() {
        let queue = TaskQueue::new(2);
        let (tx, mut rx) = mpsc::unbounded_channel();

        for i in 0..10 {
            let tx = tx.clone();
            assert!(queue.submit(TaskPriority::Normal, async move {
                let _ = tx.send(i);
            }));
        }

        let mut seen = Vec::new();
        for _ in 0..10 {
            seen.push(rx.recv().await.unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_priority_classes_served_in_order() {
        // Single worker, blocked on a gate while we enqueue out of order.
        let queue = TaskQueue::new(1);
        let gate = Arc::new(Notify::new());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let gate_clone = Arc::clone(&gate);
        queue.submit(TaskPriority::High, async move {
            gate_clone.notified().await;
        });
        // Give the worker time to pick up the blocking task
        tokio::time::sleep(Duration::from_millis(20)).await;

        for (priority, label) in [
            (TaskPriority::Low, "low"),
            (TaskPriority::Normal, "normal-1"),
            (TaskPriority::High, "high-1"),
            (TaskPriority::Normal, "normal-2"),
            (TaskPriority::High, "high-2"),
        ] {
            let tx = tx.clone();
            queue.submit(priority, async move {
                let _ = tx.send(label);
            });
        }

        gate.notify_one();

        let mut order = Vec::new();
        for _ in 0..5 {
            order.push(rx.recv().await.unwrap());
        }
        assert_eq!(order, vec!["high-1", "high-2", "normal-1", "normal-2", "low"]);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_and_drains_queued() {
        let queue = TaskQueue::new(1);
        let (tx, mut rx) = mpsc::unbounded_channel();

        for i in 0..5 {
            let tx = tx.clone();
            queue.submit(TaskPriority::Normal, async move {
                let _ = tx.send(i);
            });
        }

        queue.shutdown().await;

        // Queued items ran to completion
        let mut seen = Vec::new();
        while let Ok(v) = rx.try_recv() {
            seen.push(v);
        }
        assert_eq!(seen.len(), 5);

        // New submissions are rejected
        assert!(!queue.submit(TaskPriority::High, async {}));
        assert_eq!(queue.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_stats_counters() {
        let queue = TaskQueue::new(2);
        for _ in 0..3 {
            queue.submit(TaskPriority::Low, async {});
        }
        queue.shutdown().await;

        let stats = queue.stats();
        assert_eq!(stats.submitted, 3);
        assert_eq!(stats.executed, 3);
        assert_eq!(queue.depth(), 0);
    }
}
