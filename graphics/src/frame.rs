//! Frame pacing: N frames in flight over the timeline.
//!
//! [`FramePacer`] implements the CPU/GPU overlap protocol. Each of the N
//! frame slots carries a fence, a pair of binary hand-off semaphores, and the
//! timeline value stamped on its last submission:
//!
//! ```text
//! Slot 0: [Frame 0] ──► [Frame 2] ──► [Frame 4] ──►
//! Slot 1: [Frame 1] ──► [Frame 3] ──► [Frame 5] ──►
//! ```
//!
//! Per frame:
//! 1. [`begin_frame`](FramePacer::begin_frame): probe the slot's fence,
//!    wait only if the GPU is behind, reset it.
//! 2. [`acquire_image`](FramePacer::acquire_image): get a presentable image;
//!    an out-of-date surface marks the swapchain for recreation and the
//!    frame is abandoned (no submit, no present).
//! 3. Record commands (see [`record`](crate::record) for the parallel path).
//! 4. [`submit_and_present`](FramePacer::submit_and_present): submit with
//!    the slot's present semaphore *and* a fresh timeline value signaled,
//!    then present. The slot index advances and the double-buffered record
//!    index toggles only after a successful submit, so CPU recording of
//!    frame *i+1* can start while frame *i* executes.
//!
//! Frame slots are created with the swapchain and recreated atomically with
//! it via [`recreate_slots`](FramePacer::recreate_slots).

use std::sync::Arc;

use crate::backend::{AcquiredImage, CommandBufferId, FenceId, GpuDevice, SemaphoreId, Submission};
use crate::config::RendererConfig;
use crate::error::GpuError;
use crate::timeline::TimelineSync;

/// Lifecycle of one frame slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// No submission outstanding; safe to record into.
    Idle,
    /// A submission is in flight; the fence is unsignaled.
    Submitted,
    /// The device was lost while this slot was in flight.
    Lost,
}

/// Synchronization objects for one frame in flight.
#[derive(Debug)]
struct FrameSlot {
    fence: FenceId,
    acquire_semaphore: SemaphoreId,
    present_semaphore: SemaphoreId,
    timeline_value_at_submit: u64,
    state: SlotState,
}

impl FrameSlot {
    fn create(device: &dyn GpuDevice) -> Result<Self, GpuError> {
        Ok(Self {
            // Signaled so the first begin_frame on this slot does not block.
            fence: device.create_fence(true)?,
            acquire_semaphore: device.create_semaphore()?,
            present_semaphore: device.create_semaphore()?,
            timeline_value_at_submit: 0,
            state: SlotState::Idle,
        })
    }

    fn destroy(&self, device: &dyn GpuDevice) {
        device.destroy_fence(self.fence);
        device.destroy_semaphore(self.acquire_semaphore);
        device.destroy_semaphore(self.present_semaphore);
    }
}

/// Paces CPU frame production against GPU completion.
///
/// Not thread-safe; owned by the render thread. Worker threads never touch
/// the pacer; they hand recorded secondary buffers back to the render
/// thread, which submits them here.
pub struct FramePacer {
    device: Arc<dyn GpuDevice>,
    timeline: Arc<TimelineSync>,
    slots: Vec<FrameSlot>,
    current_slot: usize,
    /// Double-buffer index for CPU-side command recording, toggled per frame.
    record_index: usize,
    frame_count: u64,
    needs_recreation: bool,
    config: RendererConfig,
}

impl FramePacer {
    /// Create slots for `config.frames_in_flight` frames.
    ///
    /// # Panics
    ///
    /// Panics if `frames_in_flight` is 0.
    pub fn new(
        device: Arc<dyn GpuDevice>,
        timeline: Arc<TimelineSync>,
        config: RendererConfig,
    ) -> Result<Self, GpuError> {
        assert!(
            config.frames_in_flight > 0,
            "frames_in_flight must be at least 1"
        );

        let slots = (0..config.frames_in_flight)
            .map(|_| FrameSlot::create(device.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        log::info!(
            "Frame pacer created with {} frames in flight",
            config.frames_in_flight
        );

        Ok(Self {
            device,
            timeline,
            slots,
            current_slot: 0,
            record_index: 0,
            frame_count: 0,
            needs_recreation: false,
            config,
        })
    }

    /// Number of frame slots.
    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    /// Index of the slot the next frame will use.
    pub fn current_slot(&self) -> usize {
        self.current_slot
    }

    /// Which of the two CPU-side command-recording sets to write this frame.
    pub fn record_index(&self) -> usize {
        self.record_index
    }

    /// Total frames begun.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Timeline value stamped on the current slot's last submission
    /// (0 if never submitted).
    pub fn slot_timeline_value(&self, slot: usize) -> u64 {
        self.slots[slot].timeline_value_at_submit
    }

    /// Whether acquire or present reported the swapchain out of date.
    pub fn needs_recreation(&self) -> bool {
        self.needs_recreation
    }

    /// Begin a frame: wait for the current slot's previous submission, then
    /// reset its fence.
    ///
    /// Probes the fence first: if the GPU already finished, there is no
    /// wait at all. A slot whose previous frame was abandoned before
    /// submission has no outstanding work and is entered without waiting.
    /// On device loss the slot is marked [`SlotState::Lost`] and the caller
    /// must route into recovery.
    pub fn begin_frame(&mut self) -> Result<(), GpuError> {
        let slot = &mut self.slots[self.current_slot];

        match slot.state {
            SlotState::Lost => return Err(GpuError::DeviceLost),
            SlotState::Submitted => {
                match self.device.fence_status(slot.fence) {
                    Ok(true) => {}
                    Ok(false) => {
                        if let Err(error) =
                            self.device.wait_fence(slot.fence, self.config.submit_timeout)
                        {
                            if error == GpuError::DeviceLost {
                                slot.state = SlotState::Lost;
                            }
                            return Err(error);
                        }
                    }
                    Err(error) => {
                        if error == GpuError::DeviceLost {
                            slot.state = SlotState::Lost;
                        }
                        return Err(error);
                    }
                }
                self.device.reset_fence(slot.fence)?;
            }
            SlotState::Idle => {
                // Fresh slot, or one whose frame was abandoned after the
                // fence reset: nothing outstanding, only normalize the fence.
                if self.device.fence_status(slot.fence)? {
                    self.device.reset_fence(slot.fence)?;
                }
            }
        }

        slot.state = SlotState::Idle;
        self.frame_count += 1;

        log::trace!(
            "Begin frame {} (slot {})",
            self.frame_count,
            self.current_slot
        );
        Ok(())
    }

    /// Acquire the next presentable image using the slot's acquire semaphore.
    ///
    /// An out-of-date, lost, or suboptimal surface marks the swapchain for
    /// recreation and returns the surface error: the caller must abandon the
    /// frame. No submission, no present, no slot advance.
    pub fn acquire_image(&mut self) -> Result<AcquiredImage, GpuError> {
        let slot = &self.slots[self.current_slot];
        match self
            .device
            .acquire_image(slot.acquire_semaphore, self.config.submit_timeout)
        {
            Ok(image) if image.suboptimal => {
                log::debug!("acquired suboptimal image, marking swapchain for recreation");
                self.needs_recreation = true;
                Err(GpuError::SurfaceSuboptimal)
            }
            Ok(image) => Ok(image),
            Err(error) if error.is_surface_error() => {
                log::debug!("surface invalid during acquire: {error}");
                self.needs_recreation = true;
                Err(error)
            }
            Err(error) => Err(error),
        }
    }

    /// Submit the frame's commands and present the image.
    ///
    /// The submission waits on the slot's acquire semaphore and signals both
    /// the slot's present semaphore and a freshly reserved timeline value;
    /// the present waits on the present semaphore. Returns the reserved
    /// value so callers can pin transient resources on it.
    ///
    /// The slot index advances and the record index toggles only once the
    /// submit itself succeeded, never on an early-return failure path. A
    /// present-time out-of-date surface is not a failure of the frame: the
    /// work was submitted, so the slot still advances and the swapchain is
    /// marked for recreation.
    pub fn submit_and_present(
        &mut self,
        image_index: u32,
        command_buffers: &[CommandBufferId],
    ) -> Result<u64, GpuError> {
        let value = self.timeline.reserve_next_value()?;
        let slot = &mut self.slots[self.current_slot];

        self.timeline.signal_and_submit(
            value,
            Submission {
                command_buffers,
                wait_semaphores: &[slot.acquire_semaphore],
                signal_semaphores: &[slot.present_semaphore],
                signal_timeline_value: None,
                fence: Some(slot.fence),
            },
        )?;

        slot.timeline_value_at_submit = value;
        slot.state = SlotState::Submitted;
        let present_semaphore = slot.present_semaphore;

        // The submit is on the queue; the slot advances regardless of how
        // presentation goes.
        self.current_slot = (self.current_slot + 1) % self.slots.len();
        self.record_index ^= 1;

        match self.device.present(image_index, present_semaphore) {
            Ok(outcome) => {
                if outcome == crate::backend::PresentOutcome::Suboptimal {
                    self.needs_recreation = true;
                }
                log::trace!("Submitted and presented frame at timeline value {value}");
                Ok(value)
            }
            Err(error) if error.is_surface_error() => {
                log::debug!("surface invalid during present: {error}");
                self.needs_recreation = true;
                Ok(value)
            }
            Err(error) => Err(error),
        }
    }

    /// Non-blocking probe: is `slot` safe to reuse?
    pub fn is_slot_ready(&self, slot: usize) -> bool {
        assert!(slot < self.slots.len(), "invalid slot index");
        match self.slots[slot].state {
            SlotState::Submitted => self
                .device
                .fence_status(self.slots[slot].fence)
                .unwrap_or(false),
            SlotState::Idle => true,
            SlotState::Lost => false,
        }
    }

    /// Non-blocking probe: would [`wait_idle`](Self::wait_idle) return
    /// immediately?
    pub fn is_idle(&self) -> bool {
        (0..self.slots.len()).all(|i| self.is_slot_ready(i))
    }

    /// Wait for every in-flight frame, bounded by the teardown timeout.
    ///
    /// Call before destroying GPU resources or recreating the swapchain.
    pub fn wait_idle(&self) -> Result<(), GpuError> {
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.state != SlotState::Submitted {
                continue;
            }
            if let Ok(true) = self.device.fence_status(slot.fence) {
                continue;
            }
            log::trace!("Waiting for frame slot {i}");
            self.device
                .wait_fence(slot.fence, self.config.teardown_timeout)?;
        }
        Ok(())
    }

    /// Destroy and recreate every slot's sync objects.
    ///
    /// Must run atomically with swapchain recreation, after
    /// [`wait_idle`](Self::wait_idle): semaphores may be left in a signaled
    /// state by an abandoned acquire, so they cannot be reused with the new
    /// swapchain. Clears the recreation flag.
    pub fn recreate_slots(&mut self) -> Result<(), GpuError> {
        for slot in &self.slots {
            slot.destroy(self.device.as_ref());
        }
        self.slots.clear();
        for _ in 0..self.config.frames_in_flight {
            self.slots.push(FrameSlot::create(self.device.as_ref())?);
        }
        self.needs_recreation = false;
        log::debug!("Frame slots recreated");
        Ok(())
    }

    /// Destroy all slot sync objects. Also invoked by `Drop`.
    pub fn destroy(&mut self) {
        for slot in &self.slots {
            slot.destroy(self.device.as_ref());
        }
        self.slots.clear();
    }
}

impl Drop for FramePacer {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for FramePacer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePacer")
            .field("frames_in_flight", &self.slots.len())
            .field("current_slot", &self.current_slot)
            .field("frame_count", &self.frame_count)
            .field("needs_recreation", &self.needs_recreation)
            .finish()
    }
}
