//! Tasks and the FIFO queues that carry them between threads.
//!
//! A [`Task`] bundles a unit of background work (the execute closure, which
//! owns its payload) with an optional completion callback. Tasks flow through
//! two [`TaskQueue`]s owned by the worker pool:
//!
//! ```text
//! producer ──push──► [pending] ──pop──► worker ──push──► [completed] ──drain──► owner
//! ```
//!
//! Ownership transfers with the task: a task is owned by exactly one queue or
//! one thread at any time, and is freed exactly once: either by the owner
//! after its callback runs, or by [`TaskQueue::drain`] during shutdown.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

/// Category tag carried by a task, used for logging and scheduling decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Asset work: texture and mesh uploads, decoding.
    Load,
    /// Parallel command recording on behalf of the render thread.
    Record,
    /// Anything else.
    General,
}

/// A unit of background work.
///
/// The execute closure runs on an arbitrary worker thread and returns whether
/// the work succeeded. The completion callback, if any, runs later on the
/// owning thread when the owner drains the completed queue, never on a
/// worker thread.
pub struct Task {
    kind: TaskKind,
    execute: Option<Box<dyn FnOnce() -> bool + Send>>,
    callback: Option<Box<dyn FnOnce(bool) + Send>>,
    completed: bool,
    success: bool,
}

impl Task {
    /// Create a task with no completion callback.
    pub fn new<F>(kind: TaskKind, execute: F) -> Self
    where
        F: FnOnce() -> bool + Send + 'static,
    {
        Self {
            kind,
            execute: Some(Box::new(execute)),
            callback: None,
            completed: false,
            success: false,
        }
    }

    /// Create a task whose callback is invoked with the success flag when the
    /// owner drains the completed queue.
    pub fn with_callback<F, C>(kind: TaskKind, execute: F, callback: C) -> Self
    where
        F: FnOnce() -> bool + Send + 'static,
        C: FnOnce(bool) + Send + 'static,
    {
        Self {
            kind,
            execute: Some(Box::new(execute)),
            callback: Some(Box::new(callback)),
            completed: false,
            success: false,
        }
    }

    /// The task's category tag.
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Whether the execute closure has run.
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Whether the execute closure reported success. Meaningless before
    /// [`is_completed`](Self::is_completed) is true.
    pub fn succeeded(&self) -> bool {
        self.success
    }

    /// Run the execute closure. Called once, on a worker thread.
    pub(crate) fn run(&mut self) {
        if let Some(execute) = self.execute.take() {
            self.success = execute();
            self.completed = true;
        } else {
            debug_assert!(false, "task executed twice");
        }
    }

    /// Invoke the completion callback. Called once, on the owning thread.
    pub(crate) fn finish(mut self) {
        if let Some(callback) = self.callback.take() {
            callback(self.success);
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("kind", &self.kind)
            .field("completed", &self.completed)
            .field("success", &self.success)
            .finish_non_exhaustive()
    }
}

struct QueueState {
    tasks: VecDeque<Box<Task>>,
    open: bool,
}

/// FIFO queue of owned tasks, guarded by one mutex and one condition variable.
///
/// Two independent instances exist per worker pool: *pending*
/// (producer → workers) and *completed* (workers → owner).
///
/// [`pop`](Self::pop) blocks while the queue is empty and open;
/// [`close`](Self::close) wakes every blocked popper, which is the pool's
/// cancellation point.
pub struct TaskQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl TaskQueue {
    /// Create an empty, open queue.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                open: true,
            }),
            ready: Condvar::new(),
        }
    }

    /// Append a task and wake one waiting popper.
    ///
    /// Returns `false` (dropping the task) if the queue has been closed.
    pub fn push(&self, task: Box<Task>) -> bool {
        let mut state = self.state.lock();
        if !state.open {
            log::warn!("push on closed task queue, dropping {:?} task", task.kind());
            return false;
        }
        state.tasks.push_back(task);
        drop(state);
        self.ready.notify_one();
        true
    }

    /// Remove the oldest task, blocking while the queue is empty and open.
    ///
    /// Returns `None` as soon as the queue is closed, which is the cancellation
    /// point for a worker. Tasks still queued at close time are not handed
    /// out; the shutdown path reclaims them with [`drain`](Self::drain).
    pub fn pop(&self) -> Option<Box<Task>> {
        let mut state = self.state.lock();
        loop {
            if !state.open {
                return None;
            }
            if let Some(task) = state.tasks.pop_front() {
                return Some(task);
            }
            self.ready.wait(&mut state);
        }
    }

    /// Remove the oldest task without blocking.
    pub fn try_pop(&self) -> Option<Box<Task>> {
        self.state.lock().tasks.pop_front()
    }

    /// Close the queue and wake every blocked popper.
    ///
    /// Queued tasks remain retrievable via [`try_pop`](Self::try_pop) or
    /// [`drain`](Self::drain); further pushes are rejected.
    pub fn close(&self) {
        self.state.lock().open = false;
        self.ready.notify_all();
    }

    /// Remove and return every queued task.
    pub fn drain(&self) -> Vec<Box<Task>> {
        self.state.lock().tasks.drain(..).collect()
    }

    /// Number of queued tasks.
    pub fn len(&self) -> usize {
        self.state.lock().tasks.len()
    }

    /// Whether the queue holds no tasks.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the queue still accepts pushes.
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
