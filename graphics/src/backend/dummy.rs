//! CPU-side device emulation for tests and headless runs.
//!
//! [`DummyDevice`] implements the full [`GpuDevice`] protocol without a GPU:
//! the timeline is an integer under a mutex, fences are booleans, and
//! submissions "complete" either immediately (the default) or when a test
//! drives them explicitly via [`complete_next`](DummyDevice::complete_next).
//!
//! Fault injection hooks let tests exercise the failure paths that a real
//! device only produces under duress:
//!
//! - [`inject_device_loss`](DummyDevice::inject_device_loss) makes every
//!   subsequent wait/submit report [`GpuError::DeviceLost`].
//! - [`fail_next_acquire`](DummyDevice::fail_next_acquire) /
//!   [`fail_next_present`](DummyDevice::fail_next_present) queue one-shot
//!   surface errors.
//! - [`invalidate_timeline`](DummyDevice::invalidate_timeline) simulates a
//!   destroyed primitive reaching a wait call.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::GpuError;

use super::{
    AcquiredImage, CommandBufferId, CommandBufferLevel, CommandPoolId, FenceId, GpuDevice,
    PresentOutcome, SemaphoreId, Submission,
};

#[derive(Debug)]
struct PendingSubmission {
    signal_timeline_value: Option<u64>,
    fence: Option<u64>,
}

#[derive(Debug)]
struct PoolState {
    level: CommandBufferLevel,
    buffers: Vec<u64>,
}

struct State {
    device_lost: bool,
    timeline_completed: u64,
    timeline_alive: bool,
    next_id: u64,
    fences: HashMap<u64, bool>,
    semaphores: HashMap<u64, ()>,
    pools: HashMap<u64, PoolState>,
    manual_completion: bool,
    pending: VecDeque<PendingSubmission>,
    submit_count: u64,
    swapchain_image_count: u32,
    next_image: u32,
    swapchain_generation: u64,
    acquire_faults: VecDeque<GpuError>,
    present_faults: VecDeque<GpuError>,
}

impl State {
    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Apply one finished submission: advance the timeline, signal the fence.
    fn apply(&mut self, submission: PendingSubmission) {
        if let Some(value) = submission.signal_timeline_value {
            self.timeline_completed = self.timeline_completed.max(value);
        }
        if let Some(fence) = submission.fence
            && let Some(signaled) = self.fences.get_mut(&fence)
        {
            *signaled = true;
        }
    }
}

/// Software [`GpuDevice`] with fault injection.
pub struct DummyDevice {
    state: Mutex<State>,
    progress: Condvar,
}

impl DummyDevice {
    /// Create a device with an immediately-completing queue and a 3-image
    /// swapchain.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                device_lost: false,
                timeline_completed: 0,
                timeline_alive: true,
                next_id: 0,
                fences: HashMap::new(),
                semaphores: HashMap::new(),
                pools: HashMap::new(),
                manual_completion: false,
                pending: VecDeque::new(),
                submit_count: 0,
                swapchain_image_count: 3,
                next_image: 0,
                swapchain_generation: 0,
                acquire_faults: VecDeque::new(),
                present_faults: VecDeque::new(),
            }),
            progress: Condvar::new(),
        }
    }

    /// Switch between instant completion (default) and test-driven pacing.
    ///
    /// In manual mode, submissions queue up until
    /// [`complete_next`](Self::complete_next) or
    /// [`complete_all`](Self::complete_all) runs them.
    pub fn set_manual_completion(&self, manual: bool) {
        self.state.lock().manual_completion = manual;
    }

    /// Complete the oldest queued submission. Returns `false` if none.
    pub fn complete_next(&self) -> bool {
        let mut state = self.state.lock();
        let Some(submission) = state.pending.pop_front() else {
            return false;
        };
        state.apply(submission);
        drop(state);
        self.progress.notify_all();
        true
    }

    /// Complete every queued submission in order.
    pub fn complete_all(&self) {
        let mut state = self.state.lock();
        while let Some(submission) = state.pending.pop_front() {
            state.apply(submission);
        }
        drop(state);
        self.progress.notify_all();
    }

    /// Number of submissions awaiting completion (manual mode).
    pub fn pending_submissions(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Total submissions accepted since creation.
    pub fn submit_count(&self) -> u64 {
        self.state.lock().submit_count
    }

    /// Make every subsequent device operation report device loss.
    pub fn inject_device_loss(&self) {
        log::warn!("dummy device: injecting device loss");
        self.state.lock().device_lost = true;
        self.progress.notify_all();
    }

    /// Simulate device recreation: clears the lost flag and the queue.
    pub fn revive(&self) {
        let mut state = self.state.lock();
        state.device_lost = false;
        state.pending.clear();
        state.timeline_alive = true;
        drop(state);
        self.progress.notify_all();
    }

    /// Whether the device is currently lost.
    pub fn is_lost(&self) -> bool {
        self.state.lock().device_lost
    }

    /// Queue a one-shot error for the next `acquire_image` call.
    pub fn fail_next_acquire(&self, error: GpuError) {
        self.state.lock().acquire_faults.push_back(error);
    }

    /// Queue a one-shot error for the next `present` call.
    pub fn fail_next_present(&self, error: GpuError) {
        self.state.lock().present_faults.push_back(error);
    }

    /// Simulate a destroyed timeline primitive reaching a wait call.
    pub fn invalidate_timeline(&self) {
        self.state.lock().timeline_alive = false;
        self.progress.notify_all();
    }

    /// Directly advance the observed completed value (simulates an external
    /// signaler racing the CPU cache).
    pub fn force_timeline_completed(&self, value: u64) {
        let mut state = self.state.lock();
        state.timeline_completed = state.timeline_completed.max(value);
        drop(state);
        self.progress.notify_all();
    }

    /// Number of times the swapchain has been (re)created.
    pub fn swapchain_generation(&self) -> u64 {
        self.state.lock().swapchain_generation
    }

    /// Live fences + semaphores + pools, for balanced-teardown assertions.
    pub fn live_object_count(&self) -> usize {
        let state = self.state.lock();
        state.fences.len() + state.semaphores.len() + state.pools.len()
    }

    fn check_alive(state: &State) -> Result<(), GpuError> {
        if state.device_lost {
            Err(GpuError::DeviceLost)
        } else {
            Ok(())
        }
    }
}

impl Default for DummyDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDevice for DummyDevice {
    fn name(&self) -> &str {
        "Dummy"
    }

    fn timeline_completed_value(&self) -> Result<u64, GpuError> {
        let state = self.state.lock();
        Self::check_alive(&state)?;
        if !state.timeline_alive {
            return Err(GpuError::PrimitiveInvalid);
        }
        Ok(state.timeline_completed)
    }

    fn wait_timeline_value(&self, value: u64, timeout: Duration) -> Result<(), GpuError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            Self::check_alive(&state)?;
            if !state.timeline_alive {
                return Err(GpuError::PrimitiveInvalid);
            }
            if state.timeline_completed >= value {
                return Ok(());
            }
            if self.progress.wait_until(&mut state, deadline).timed_out() {
                return Err(GpuError::Timeout);
            }
        }
    }

    fn reset_timeline(&self, initial_value: u64) -> Result<(), GpuError> {
        let mut state = self.state.lock();
        Self::check_alive(&state)?;
        state.timeline_completed = initial_value;
        state.timeline_alive = true;
        log::debug!("dummy device: timeline reset to {}", initial_value);
        Ok(())
    }

    fn create_fence(&self, signaled: bool) -> Result<FenceId, GpuError> {
        let mut state = self.state.lock();
        Self::check_alive(&state)?;
        let id = state.alloc_id();
        state.fences.insert(id, signaled);
        Ok(FenceId(id))
    }

    fn fence_status(&self, fence: FenceId) -> Result<bool, GpuError> {
        let state = self.state.lock();
        Self::check_alive(&state)?;
        state
            .fences
            .get(&fence.0)
            .copied()
            .ok_or(GpuError::PrimitiveInvalid)
    }

    fn wait_fence(&self, fence: FenceId, timeout: Duration) -> Result<(), GpuError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            Self::check_alive(&state)?;
            match state.fences.get(&fence.0) {
                Some(true) => return Ok(()),
                Some(false) => {}
                None => return Err(GpuError::PrimitiveInvalid),
            }
            if self.progress.wait_until(&mut state, deadline).timed_out() {
                return Err(GpuError::Timeout);
            }
        }
    }

    fn reset_fence(&self, fence: FenceId) -> Result<(), GpuError> {
        let mut state = self.state.lock();
        Self::check_alive(&state)?;
        match state.fences.get_mut(&fence.0) {
            Some(signaled) => {
                *signaled = false;
                Ok(())
            }
            None => Err(GpuError::PrimitiveInvalid),
        }
    }

    fn destroy_fence(&self, fence: FenceId) {
        if self.state.lock().fences.remove(&fence.0).is_none() {
            log::warn!("destroy of unknown fence {}", fence.0);
        }
    }

    fn create_semaphore(&self) -> Result<SemaphoreId, GpuError> {
        let mut state = self.state.lock();
        Self::check_alive(&state)?;
        let id = state.alloc_id();
        state.semaphores.insert(id, ());
        Ok(SemaphoreId(id))
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreId) {
        if self.state.lock().semaphores.remove(&semaphore.0).is_none() {
            log::warn!("destroy of unknown semaphore {}", semaphore.0);
        }
    }

    fn submit(&self, submission: &Submission<'_>) -> Result<(), GpuError> {
        let mut state = self.state.lock();
        Self::check_alive(&state)?;
        if submission.signal_timeline_value.is_some() && !state.timeline_alive {
            return Err(GpuError::PrimitiveInvalid);
        }
        for semaphore in submission
            .wait_semaphores
            .iter()
            .chain(submission.signal_semaphores)
        {
            if !state.semaphores.contains_key(&semaphore.0) {
                return Err(GpuError::PrimitiveInvalid);
            }
        }
        if let Some(fence) = submission.fence
            && !state.fences.contains_key(&fence.0)
        {
            return Err(GpuError::PrimitiveInvalid);
        }

        state.submit_count += 1;
        let pending = PendingSubmission {
            signal_timeline_value: submission.signal_timeline_value,
            fence: submission.fence.map(|f| f.0),
        };
        if state.manual_completion {
            state.pending.push_back(pending);
        } else {
            state.apply(pending);
            drop(state);
            self.progress.notify_all();
        }
        Ok(())
    }

    fn acquire_image(
        &self,
        _signal: SemaphoreId,
        _timeout: Duration,
    ) -> Result<AcquiredImage, GpuError> {
        let mut state = self.state.lock();
        Self::check_alive(&state)?;
        if let Some(error) = state.acquire_faults.pop_front() {
            return Err(error);
        }
        let index = state.next_image;
        state.next_image = (state.next_image + 1) % state.swapchain_image_count;
        Ok(AcquiredImage {
            index,
            suboptimal: false,
        })
    }

    fn present(&self, _image_index: u32, _wait: SemaphoreId) -> Result<PresentOutcome, GpuError> {
        let mut state = self.state.lock();
        Self::check_alive(&state)?;
        if let Some(error) = state.present_faults.pop_front() {
            return Err(error);
        }
        Ok(PresentOutcome::Optimal)
    }

    fn recreate_swapchain(&self, width: u32, height: u32) -> Result<(), GpuError> {
        let mut state = self.state.lock();
        Self::check_alive(&state)?;
        state.next_image = 0;
        state.swapchain_generation += 1;
        log::debug!(
            "dummy device: swapchain recreated at {}x{} (generation {})",
            width,
            height,
            state.swapchain_generation
        );
        Ok(())
    }

    fn create_command_pool(&self, level: CommandBufferLevel) -> Result<CommandPoolId, GpuError> {
        let mut state = self.state.lock();
        Self::check_alive(&state)?;
        let id = state.alloc_id();
        state.pools.insert(
            id,
            PoolState {
                level,
                buffers: Vec::new(),
            },
        );
        Ok(CommandPoolId(id))
    }

    fn allocate_command_buffers(
        &self,
        pool: CommandPoolId,
        level: CommandBufferLevel,
        count: u32,
    ) -> Result<Vec<CommandBufferId>, GpuError> {
        let mut state = self.state.lock();
        Self::check_alive(&state)?;
        if !state.pools.contains_key(&pool.0) {
            return Err(GpuError::PrimitiveInvalid);
        }
        let ids: Vec<u64> = (0..count).map(|_| state.alloc_id()).collect();
        let pool_state = state.pools.get_mut(&pool.0).expect("checked above");
        if pool_state.level != level {
            return Err(GpuError::Internal(
                "command buffer level does not match pool level".to_string(),
            ));
        }
        pool_state.buffers.extend(&ids);
        Ok(ids.into_iter().map(CommandBufferId).collect())
    }

    fn reset_command_pool(&self, pool: CommandPoolId) -> Result<(), GpuError> {
        let state = self.state.lock();
        Self::check_alive(&state)?;
        match state.pools.get(&pool.0) {
            Some(pool_state) => {
                log::trace!(
                    "dummy device: reset pool {} ({} buffers)",
                    pool.0,
                    pool_state.buffers.len()
                );
                Ok(())
            }
            None => Err(GpuError::PrimitiveInvalid),
        }
    }

    fn destroy_command_pool(&self, pool: CommandPoolId) {
        if self.state.lock().pools.remove(&pool.0).is_none() {
            log::warn!("destroy of unknown command pool {}", pool.0);
        }
    }

    fn wait_idle(&self) -> Result<(), GpuError> {
        let mut state = self.state.lock();
        Self::check_alive(&state)?;
        while let Some(submission) = state.pending.pop_front() {
            state.apply(submission);
        }
        drop(state);
        self.progress.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instant_completion_by_default() {
        let device = DummyDevice::new();
        let fence = device.create_fence(false).unwrap();

        device
            .submit(&Submission {
                command_buffers: &[],
                wait_semaphores: &[],
                signal_semaphores: &[],
                signal_timeline_value: Some(7),
                fence: Some(fence),
            })
            .unwrap();

        assert_eq!(device.timeline_completed_value().unwrap(), 7);
        assert!(device.fence_status(fence).unwrap());
    }

    #[test]
    fn manual_completion_defers_signals() {
        let device = DummyDevice::new();
        device.set_manual_completion(true);
        let fence = device.create_fence(false).unwrap();

        device
            .submit(&Submission {
                command_buffers: &[],
                wait_semaphores: &[],
                signal_semaphores: &[],
                signal_timeline_value: Some(3),
                fence: Some(fence),
            })
            .unwrap();

        assert_eq!(device.timeline_completed_value().unwrap(), 0);
        assert!(!device.fence_status(fence).unwrap());
        assert_eq!(device.pending_submissions(), 1);

        assert!(device.complete_next());
        assert_eq!(device.timeline_completed_value().unwrap(), 3);
        assert!(device.fence_status(fence).unwrap());
    }

    #[test]
    fn wait_timeline_times_out() {
        let device = DummyDevice::new();
        let result = device.wait_timeline_value(5, Duration::from_millis(10));
        assert_eq!(result, Err(GpuError::Timeout));
    }

    #[test]
    fn wait_timeline_wakes_on_completion_from_other_thread() {
        let device = std::sync::Arc::new(DummyDevice::new());
        device.set_manual_completion(true);
        device
            .submit(&Submission {
                command_buffers: &[],
                wait_semaphores: &[],
                signal_semaphores: &[],
                signal_timeline_value: Some(1),
                fence: None,
            })
            .unwrap();

        let signaler = {
            let device = std::sync::Arc::clone(&device);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                device.complete_all();
            })
        };

        device
            .wait_timeline_value(1, Duration::from_secs(5))
            .unwrap();
        signaler.join().unwrap();
    }

    #[test]
    fn device_loss_poisons_waits() {
        let device = DummyDevice::new();
        device.inject_device_loss();
        assert_eq!(
            device.wait_timeline_value(1, Duration::from_secs(1)),
            Err(GpuError::DeviceLost)
        );
        assert_eq!(device.timeline_completed_value(), Err(GpuError::DeviceLost));

        device.revive();
        assert!(device.timeline_completed_value().is_ok());
    }

    #[test]
    fn unknown_fence_is_primitive_invalid() {
        let device = DummyDevice::new();
        assert_eq!(
            device.fence_status(FenceId(999)),
            Err(GpuError::PrimitiveInvalid)
        );
        assert_eq!(
            device.wait_fence(FenceId(999), Duration::from_millis(1)),
            Err(GpuError::PrimitiveInvalid)
        );
    }

    #[test]
    fn acquire_faults_are_one_shot() {
        let device = DummyDevice::new();
        let semaphore = device.create_semaphore().unwrap();
        device.fail_next_acquire(GpuError::SurfaceOutdated);

        assert_eq!(
            device.acquire_image(semaphore, Duration::from_secs(1)),
            Err(GpuError::SurfaceOutdated)
        );
        assert!(
            device
                .acquire_image(semaphore, Duration::from_secs(1))
                .is_ok()
        );
    }

    #[test]
    fn acquire_cycles_image_indices() {
        let device = DummyDevice::new();
        let semaphore = device.create_semaphore().unwrap();
        let timeout = Duration::from_secs(1);

        let first = device.acquire_image(semaphore, timeout).unwrap().index;
        let second = device.acquire_image(semaphore, timeout).unwrap().index;
        assert_ne!(first, second);
    }

    #[test]
    fn object_counts_balance_after_destroy() {
        let device = DummyDevice::new();
        let fence = device.create_fence(true).unwrap();
        let semaphore = device.create_semaphore().unwrap();
        let pool = device
            .create_command_pool(CommandBufferLevel::Primary)
            .unwrap();
        assert_eq!(device.live_object_count(), 3);

        device.destroy_fence(fence);
        device.destroy_semaphore(semaphore);
        device.destroy_command_pool(pool);
        assert_eq!(device.live_object_count(), 0);
    }
}
