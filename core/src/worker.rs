//! Worker pool executing tasks on a capped set of OS threads.
//!
//! The pool owns two [`TaskQueue`]s. Producers hand tasks to
//! [`WorkerPool::submit`]; workers pop from the pending queue, run the
//! execute closure, and push the finished task to the completed queue. The
//! owning thread periodically calls
//! [`drain_completed`](WorkerPool::drain_completed), which invokes completion
//! callbacks and frees tasks, so every user-visible callback runs on one
//! predictable thread even though execution is parallel.
//!
//! # Shutdown
//!
//! [`shutdown`](WorkerPool::shutdown) is cooperative: workers finish their
//! current task, observe the closed pending queue, and exit. Unexecuted tasks
//! are dropped (their payloads are released by `Drop`); tasks that did finish
//! have their callbacks run one last time on the shutting-down thread.
//! In-flight GPU work submitted by a task is not cancelled; only further
//! dequeuing stops.

use std::sync::Arc;
use std::thread::JoinHandle;

use static_assertions::assert_impl_all;

use crate::task::{Task, TaskQueue};

struct PoolShared {
    pending: TaskQueue,
    completed: TaskQueue,
}

/// Fixed pool of worker threads draining a shared pending queue.
///
/// Thread count is `min(cap, available hardware parallelism)`, at least 1.
/// Tasks may run on any worker; producers must not assume affinity.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

assert_impl_all!(WorkerPool: Send);

impl WorkerPool {
    /// Spawn a pool with at most `cap` worker threads.
    pub fn new(cap: usize) -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        let count = parallelism.min(cap).max(1);

        let shared = Arc::new(PoolShared {
            pending: TaskQueue::new(),
            completed: TaskQueue::new(),
        });

        let workers = (0..count)
            .map(|i| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("emberfall-worker-{i}"))
                    .spawn(move || worker_loop(&shared))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        log::info!("Worker pool started with {} threads", count);

        Self { shared, workers }
    }

    /// Spawn a pool sized to the host's available parallelism.
    pub fn with_default_threads() -> Self {
        Self::new(usize::MAX)
    }

    /// Number of worker threads.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Hand a task to the pool. Ownership transfers; the task comes back
    /// through [`drain_completed`](Self::drain_completed).
    ///
    /// Returns `false` (dropping the task) after shutdown.
    pub fn submit(&self, task: Task) -> bool {
        self.shared.pending.push(Box::new(task))
    }

    /// Number of tasks waiting for a worker.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    /// Number of finished tasks awaiting a drain.
    pub fn completed_count(&self) -> usize {
        self.shared.completed.len()
    }

    /// Drain up to `max_tasks` finished tasks (0 = unbounded), invoking each
    /// completion callback and freeing the task. Returns the number drained.
    ///
    /// Call this from the owning thread; it never blocks.
    pub fn drain_completed(&self, max_tasks: usize) -> usize {
        let mut drained = 0;
        while max_tasks == 0 || drained < max_tasks {
            let Some(task) = self.shared.completed.try_pop() else {
                break;
            };
            task.finish();
            drained += 1;
        }
        drained
    }

    /// Stop the pool: close the pending queue, wake and join every worker,
    /// then drop unexecuted tasks and run callbacks for finished ones.
    ///
    /// Idempotent; also invoked by `Drop`.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }

        self.shared.pending.close();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("worker thread panicked during shutdown");
            }
        }

        // Workers are gone; anything still pending never ran. Dropping the
        // boxed tasks releases the payloads they own.
        let leftover = self.shared.pending.drain();
        if !leftover.is_empty() {
            log::debug!("dropping {} unexecuted tasks at shutdown", leftover.len());
        }
        drop(leftover);

        // Finished-but-undrained tasks still get their completion callbacks,
        // on this (owning) thread, preserving exactly-once delivery.
        let drained = self.drain_completed(0);
        if drained > 0 {
            log::debug!("drained {} completed tasks at shutdown", drained);
        }
        self.shared.completed.close();
    }
}

fn worker_loop(shared: &PoolShared) {
    while let Some(mut task) = shared.pending.pop() {
        task.run();
        shared.completed.push(task);
    }
    log::trace!("worker exiting");
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    /// Increments a counter when dropped, for leak accounting.
    struct DropToken(Arc<AtomicUsize>);
    impl Drop for DropToken {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn drain_until(pool: &WorkerPool, expected: usize, counter: &AtomicUsize) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while counter.load(Ordering::SeqCst) < expected {
            pool.drain_completed(0);
            assert!(Instant::now() < deadline, "timed out draining completions");
            std::thread::sleep(Duration::from_micros(100));
        }
    }

    #[test]
    fn tasks_complete_exactly_once() {
        const TASKS: usize = 500;

        let _ = env_logger::builder().is_test(true).try_init();
        let mut pool = WorkerPool::new(8);
        let executed = Arc::new(AtomicUsize::new(0));
        let callbacks = Arc::new(AtomicUsize::new(0));
        let drops = Arc::new(AtomicUsize::new(0));

        for _ in 0..TASKS {
            let executed = Arc::clone(&executed);
            let callbacks = Arc::clone(&callbacks);
            let token = DropToken(Arc::clone(&drops));
            let accepted = pool.submit(Task::with_callback(
                TaskKind::Load,
                move || {
                    let _payload = &token;
                    executed.fetch_add(1, Ordering::SeqCst);
                    true
                },
                move |success| {
                    assert!(success);
                    callbacks.fetch_add(1, Ordering::SeqCst);
                },
            ));
            assert!(accepted);
        }

        drain_until(&pool, TASKS, &callbacks);

        assert_eq!(executed.load(Ordering::SeqCst), TASKS);
        assert_eq!(callbacks.load(Ordering::SeqCst), TASKS);

        pool.shutdown();
        // Allocator balance: every payload dropped exactly once.
        assert_eq!(drops.load(Ordering::SeqCst), TASKS);
        assert_eq!(pool.pending_count(), 0);
        assert_eq!(pool.completed_count(), 0);
    }

    #[test]
    fn callbacks_run_on_owning_thread() {
        let pool = WorkerPool::new(4);
        let owner = std::thread::current().id();
        let checked = Arc::new(AtomicUsize::new(0));

        for _ in 0..16 {
            let checked = Arc::clone(&checked);
            pool.submit(Task::with_callback(
                TaskKind::General,
                || true,
                move |_| {
                    assert_eq!(std::thread::current().id(), owner);
                    checked.fetch_add(1, Ordering::SeqCst);
                },
            ));
        }

        drain_until(&pool, 16, &checked);
        assert_eq!(checked.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn drain_respects_bound() {
        let pool = WorkerPool::new(2);
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let done = Arc::clone(&done);
            pool.submit(Task::with_callback(
                TaskKind::General,
                || true,
                move |_| {
                    done.fetch_add(1, Ordering::SeqCst);
                },
            ));
        }

        // Wait for all eight to finish executing, then drain in bounded steps.
        let deadline = Instant::now() + Duration::from_secs(10);
        while pool.completed_count() < 8 {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_micros(100));
        }

        assert_eq!(pool.drain_completed(3), 3);
        assert_eq!(pool.drain_completed(3), 3);
        assert_eq!(pool.drain_completed(0), 2);
        assert_eq!(done.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn shutdown_drops_unexecuted_tasks_without_leaking() {
        let mut pool = WorkerPool::new(1);
        let drops = Arc::new(AtomicUsize::new(0));
        let started = Arc::new(AtomicUsize::new(0));

        // First task blocks the lone worker so the rest stay queued.
        {
            let started = Arc::clone(&started);
            pool.submit(Task::new(TaskKind::General, move || {
                started.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(50));
                true
            }));
        }
        for _ in 0..32 {
            let token = DropToken(Arc::clone(&drops));
            pool.submit(Task::new(TaskKind::Load, move || {
                let _payload = &token;
                true
            }));
        }

        // Let the worker pick up the blocker, then shut down under load.
        while started.load(Ordering::SeqCst) == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        pool.shutdown();

        // Every payload released: executed ones by the worker, queued ones by
        // the shutdown drain.
        assert_eq!(drops.load(Ordering::SeqCst), 32);
        assert!(!pool.submit(Task::new(TaskKind::General, || true)));
    }

    #[test]
    fn worker_count_is_capped() {
        let pool = WorkerPool::new(2);
        assert!(pool.worker_count() <= 2);
        assert!(pool.worker_count() >= 1);

        let wide = WorkerPool::with_default_threads();
        assert!(wide.worker_count() >= 1);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let mut pool = WorkerPool::new(2);
        pool.submit(Task::new(TaskKind::General, || true));
        pool.shutdown();
        pool.shutdown();
    }
}
