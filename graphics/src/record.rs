//! Multithreaded command recording.
//!
//! [`CommandPoolRegistry`] maps a calling thread identity to a dedicated
//! primary + secondary command-buffer pool, created lazily on first request
//! and capped at a fixed number of concurrent threads. Secondary buffers are
//! bump-allocated per frame: [`CommandPoolRegistry::allocate_secondary`]
//! hands out pre-allocated buffers in order, and
//! [`CommandPoolRegistry::reset_all`] rewinds every
//! pool once per frame boundary; individual buffers are never freed
//! mid-frame.
//!
//! [`record_parallel`] is the orchestration on top: it fans record closures
//! out over the worker pool, each worker recording into its own registry
//! pool, and collects the produced secondary buffers on the owning thread in
//! the caller's order. No ordering exists between secondary buffers recorded
//! by different workers until the owner executes them from its primary
//! buffer in that fixed order.
//!
//! Exhaustion, whether of registry slots or of a pool's buffers, is a recoverable
//! [`GpuError::PoolExhausted`], not a crash: callers fall back to
//! single-threaded primary recording.

use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use emberfall_core::{Task, TaskKind, WorkerPool};

use crate::backend::{CommandBufferId, CommandBufferLevel, CommandPoolId, GpuDevice};
use crate::error::GpuError;

/// Token identifying a claimed registry slot. Valid until
/// [`CommandPoolRegistry::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordToken(usize);

struct PoolSlot {
    thread_id: ThreadId,
    primary_pool: CommandPoolId,
    secondary_pool: CommandPoolId,
    secondary_buffers: Vec<CommandBufferId>,
    next_free_index: usize,
    active: bool,
}

/// Fixed-capacity registry of per-thread command pools.
///
/// All methods take `&self`; the registry has its own mutex and shares no
/// lock with any other component.
pub struct CommandPoolRegistry {
    device: Arc<dyn GpuDevice>,
    slots: Mutex<Vec<PoolSlot>>,
    max_threads: usize,
    secondary_per_pool: usize,
}

impl CommandPoolRegistry {
    /// Create a registry for at most `max_threads` concurrent recording
    /// threads, each with `secondary_per_pool` pre-allocated secondary
    /// buffers.
    pub fn new(device: Arc<dyn GpuDevice>, max_threads: usize, secondary_per_pool: usize) -> Self {
        assert!(max_threads > 0, "max_threads must be at least 1");
        assert!(
            secondary_per_pool > 0,
            "secondary_per_pool must be at least 1"
        );
        Self {
            device,
            slots: Mutex::new(Vec::with_capacity(max_threads)),
            max_threads,
            secondary_per_pool,
        }
    }

    /// Get the calling thread's pools, creating them on first request.
    ///
    /// Idempotent per thread identity: a second call from the same thread
    /// returns the same token without growing the registry. Once
    /// `max_threads` distinct threads hold slots, further threads get
    /// [`GpuError::PoolExhausted`] and must record on the primary path.
    pub fn get_or_create(&self, thread_id: ThreadId) -> Result<RecordToken, GpuError> {
        let mut slots = self.slots.lock();

        if let Some(index) = slots
            .iter()
            .position(|slot| slot.active && slot.thread_id == thread_id)
        {
            return Ok(RecordToken(index));
        }

        // Reclaim a released slot before growing.
        let index = match slots.iter().position(|slot| !slot.active) {
            Some(index) => index,
            None if slots.len() < self.max_threads => {
                let slot = self.create_slot(thread_id)?;
                slots.push(slot);
                log::debug!(
                    "command pools created for thread {:?} ({}/{})",
                    thread_id,
                    slots.len(),
                    self.max_threads
                );
                return Ok(RecordToken(slots.len() - 1));
            }
            None => {
                log::debug!("command pool registry at capacity ({})", self.max_threads);
                return Err(GpuError::PoolExhausted);
            }
        };

        let slot = &mut slots[index];
        slot.thread_id = thread_id;
        slot.next_free_index = 0;
        slot.active = true;
        Ok(RecordToken(index))
    }

    fn create_slot(&self, thread_id: ThreadId) -> Result<PoolSlot, GpuError> {
        let primary_pool = self
            .device
            .create_command_pool(CommandBufferLevel::Primary)?;
        let secondary_pool = self
            .device
            .create_command_pool(CommandBufferLevel::Secondary)?;
        let secondary_buffers = self.device.allocate_command_buffers(
            secondary_pool,
            CommandBufferLevel::Secondary,
            self.secondary_per_pool as u32,
        )?;
        Ok(PoolSlot {
            thread_id,
            primary_pool,
            secondary_pool,
            secondary_buffers,
            next_free_index: 0,
            active: true,
        })
    }

    /// The primary command pool behind `token`.
    pub fn primary_pool(&self, token: RecordToken) -> CommandPoolId {
        self.slots.lock()[token.0].primary_pool
    }

    /// Bump-allocate the next secondary buffer from `token`'s pool.
    ///
    /// Buffers come back in pre-allocated order and are reclaimed only by
    /// [`reset_all`](Self::reset_all). Running out is a recoverable
    /// [`GpuError::PoolExhausted`].
    pub fn allocate_secondary(&self, token: RecordToken) -> Result<CommandBufferId, GpuError> {
        let mut slots = self.slots.lock();
        let slot = &mut slots[token.0];
        debug_assert!(slot.active, "allocate_secondary on a released slot");

        if slot.next_free_index >= slot.secondary_buffers.len() {
            log::debug!(
                "secondary buffers exhausted for thread {:?} ({} in pool)",
                slot.thread_id,
                slot.secondary_buffers.len()
            );
            return Err(GpuError::PoolExhausted);
        }
        let buffer = slot.secondary_buffers[slot.next_free_index];
        slot.next_free_index += 1;
        Ok(buffer)
    }

    /// Reset every active secondary pool and rewind its bump index.
    ///
    /// Run once per frame boundary, after every consumer of the previous
    /// frame's secondary buffers has been retired.
    pub fn reset_all(&self) -> Result<(), GpuError> {
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut().filter(|slot| slot.active) {
            self.device.reset_command_pool(slot.secondary_pool)?;
            slot.next_free_index = 0;
        }
        Ok(())
    }

    /// Release `token`'s slot so another thread identity can claim it.
    ///
    /// The pools and their buffers stay allocated; the next claimant reuses
    /// them. Call when a recording thread retires for good, never mid-frame
    /// while its secondary buffers are still awaiting execution.
    pub fn release(&self, token: RecordToken) {
        let mut slots = self.slots.lock();
        let slot = &mut slots[token.0];
        slot.active = false;
        slot.next_free_index = 0;
    }

    /// Number of threads currently holding pools.
    pub fn active_count(&self) -> usize {
        self.slots.lock().iter().filter(|slot| slot.active).count()
    }

    /// Maximum concurrent recording threads.
    pub fn capacity(&self) -> usize {
        self.max_threads
    }

    /// Destroy every pool. Tokens become invalid.
    pub fn shutdown(&self) {
        let mut slots = self.slots.lock();
        for slot in slots.drain(..) {
            self.device.destroy_command_pool(slot.primary_pool);
            self.device.destroy_command_pool(slot.secondary_pool);
        }
        log::debug!("command pool registry shut down");
    }
}

impl Drop for CommandPoolRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for CommandPoolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandPoolRegistry")
            .field("active", &self.active_count())
            .field("capacity", &self.max_threads)
            .finish_non_exhaustive()
    }
}

/// Record `jobs` in parallel on the worker pool, each into a secondary
/// buffer from the recording thread's own pool.
///
/// Returns one result per job, in the caller's order: the order the owner
/// should execute them from its primary buffer. A job whose thread cannot
/// get a pool or a buffer yields `Err(PoolExhausted)` in its position; the
/// caller records those on the primary path instead:
///
/// ```ignore
/// for (job, result) in jobs.iter().zip(record_parallel(&pool, &registry, closures)) {
///     match result {
///         Ok(secondary) => collected.push(secondary),
///         Err(GpuError::PoolExhausted) => record_on_primary(job),
///         Err(error) => return Err(error),
///     }
/// }
/// ```
///
/// Blocks the calling thread until every job has finished; completion
/// callbacks of unrelated tasks on the same pool are drained as a side
/// effect.
pub fn record_parallel<F>(
    pool: &WorkerPool,
    registry: &Arc<CommandPoolRegistry>,
    jobs: Vec<F>,
) -> Vec<Result<CommandBufferId, GpuError>>
where
    F: FnOnce(CommandBufferId) + Send + 'static,
{
    let job_count = jobs.len();
    let results: Arc<Mutex<Vec<Option<Result<CommandBufferId, GpuError>>>>> =
        Arc::new(Mutex::new((0..job_count).map(|_| None).collect()));

    for (index, job) in jobs.into_iter().enumerate() {
        let registry = Arc::clone(registry);
        let results = Arc::clone(&results);
        let task_results = Arc::clone(&results);
        let accepted = pool.submit(Task::new(TaskKind::Record, move || {
            let outcome = registry
                .get_or_create(std::thread::current().id())
                .and_then(|token| registry.allocate_secondary(token))
                .map(|buffer| {
                    job(buffer);
                    buffer
                });
            let ok = outcome.is_ok();
            task_results.lock()[index] = Some(outcome);
            ok
        }));
        if !accepted {
            results.lock()[index] = Some(Err(GpuError::Internal(
                "worker pool is shut down".to_string(),
            )));
        }
    }

    // Drain until every slot is filled. Tasks publish their result before
    // they reach the completed queue, so this terminates as soon as the last
    // worker finishes.
    let start = Instant::now();
    loop {
        pool.drain_completed(0);
        if results.lock().iter().all(Option::is_some) {
            break;
        }
        if start.elapsed() > Duration::from_secs(30) {
            log::error!("parallel recording stalled; abandoning wait");
            break;
        }
        std::thread::yield_now();
    }

    let mut results = results.lock();
    results
        .iter_mut()
        .map(|slot| {
            slot.take()
                .unwrap_or(Err(GpuError::Internal("recording job vanished".to_string())))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyDevice;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn make_registry(max_threads: usize, secondary: usize) -> Arc<CommandPoolRegistry> {
        let device: Arc<dyn GpuDevice> = Arc::new(DummyDevice::new());
        Arc::new(CommandPoolRegistry::new(device, max_threads, secondary))
    }

    /// Claim a registry slot from a brand-new thread identity.
    fn claim_from_new_thread(
        registry: &Arc<CommandPoolRegistry>,
    ) -> Result<RecordToken, GpuError> {
        let registry = Arc::clone(registry);
        std::thread::spawn(move || registry.get_or_create(std::thread::current().id()))
            .join()
            .unwrap()
    }

    #[test]
    fn get_or_create_is_idempotent_per_thread() {
        let registry = make_registry(4, 8);
        let thread_id = std::thread::current().id();

        let first = registry.get_or_create(thread_id).unwrap();
        let second = registry.get_or_create(thread_id).unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn registry_cap_fails_cleanly() {
        let registry = make_registry(3, 8);

        for _ in 0..3 {
            claim_from_new_thread(&registry).unwrap();
        }
        assert_eq!(registry.active_count(), 3);

        // One identity past the cap: failure, not a crash, and no growth.
        assert_eq!(
            claim_from_new_thread(&registry),
            Err(GpuError::PoolExhausted)
        );
        assert_eq!(registry.active_count(), 3);
    }

    #[test]
    fn secondary_allocation_bumps_and_exhausts() {
        let registry = make_registry(1, 3);
        let token = registry.get_or_create(std::thread::current().id()).unwrap();

        let a = registry.allocate_secondary(token).unwrap();
        let b = registry.allocate_secondary(token).unwrap();
        let c = registry.allocate_secondary(token).unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);

        assert_eq!(
            registry.allocate_secondary(token),
            Err(GpuError::PoolExhausted)
        );
    }

    #[test]
    fn reset_all_rewinds_bump_index() {
        let registry = make_registry(1, 2);
        let token = registry.get_or_create(std::thread::current().id()).unwrap();

        let first = registry.allocate_secondary(token).unwrap();
        registry.allocate_secondary(token).unwrap();
        assert_eq!(
            registry.allocate_secondary(token),
            Err(GpuError::PoolExhausted)
        );

        registry.reset_all().unwrap();

        // Same buffers come back out, in pre-allocated order.
        assert_eq!(registry.allocate_secondary(token).unwrap(), first);
    }

    #[test]
    fn released_slot_is_reclaimed_by_new_thread() {
        let registry = make_registry(1, 4);
        let token = registry.get_or_create(std::thread::current().id()).unwrap();
        registry.allocate_secondary(token).unwrap();

        registry.release(token);
        assert_eq!(registry.active_count(), 0);

        // A different identity reuses the slot instead of failing the cap.
        let reclaimed = claim_from_new_thread(&registry).unwrap();
        assert_eq!(reclaimed, token);
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn shutdown_destroys_every_pool() {
        let device = Arc::new(DummyDevice::new());
        let registry = Arc::new(CommandPoolRegistry::new(
            Arc::clone(&device) as Arc<dyn GpuDevice>,
            4,
            4,
        ));
        registry.get_or_create(std::thread::current().id()).unwrap();
        claim_from_new_thread(&registry).unwrap();
        assert_eq!(device.live_object_count(), 4);

        registry.shutdown();
        assert_eq!(device.live_object_count(), 0);
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn record_parallel_collects_in_caller_order() {
        let registry = make_registry(8, 32);
        let pool = WorkerPool::new(4);
        let recorded = Arc::new(AtomicUsize::new(0));

        let jobs: Vec<_> = (0..16)
            .map(|_| {
                let recorded = Arc::clone(&recorded);
                move |_buffer: CommandBufferId| {
                    recorded.fetch_add(1, Ordering::SeqCst);
                }
            })
            .collect();

        let results = record_parallel(&pool, &registry, jobs);

        assert_eq!(results.len(), 16);
        assert_eq!(recorded.load(Ordering::SeqCst), 16);

        // Every job produced a distinct secondary buffer.
        let buffers: HashSet<_> = results.iter().map(|r| r.clone().unwrap()).collect();
        assert_eq!(buffers.len(), 16);
    }

    #[test]
    fn record_parallel_reports_exhaustion_per_job() {
        // One recording thread with two buffers, forced by a 1-thread pool.
        let registry = make_registry(1, 2);
        let pool = WorkerPool::new(1);

        let jobs: Vec<_> = (0..4).map(|_| move |_buffer: CommandBufferId| {}).collect();
        let results = record_parallel(&pool, &registry, jobs);

        let ok = results.iter().filter(|r| r.is_ok()).count();
        let exhausted = results
            .iter()
            .filter(|r| **r == Err(GpuError::PoolExhausted))
            .count();
        assert_eq!(ok, 2);
        assert_eq!(exhausted, 2);
    }
}
