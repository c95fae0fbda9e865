//! GPU device abstraction layer.
//!
//! The synchronization core talks to the GPU exclusively through the
//! [`GpuDevice`] trait, with one implementation per target selected at build
//! time:
//!
//! - [`DummyDevice`](dummy::DummyDevice) (always compiled): a CPU-side
//!   emulation used by tests and headless runs, with fault injection for
//!   device loss and surface invalidation.
//! - `vulkan-backend` feature: an `ash`-based implementation using Vulkan 1.2
//!   timeline semaphores.
//!
//! The protocol layered on top (value reservation, frame pacing, recovery)
//! is identical across implementations.
//!
//! # Handles
//!
//! Sync objects and command pools are referred to by opaque id handles. A
//! handle owns nothing; the backend keeps the registry and destroys objects
//! on request. Using a handle after destruction yields
//! [`GpuError::PrimitiveInvalid`], never undefined behavior.

pub mod dummy;

#[cfg(feature = "vulkan-backend")]
pub mod vulkan;

use std::time::Duration;

use crate::error::GpuError;

/// Handle to a fence owned by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceId(pub(crate) u64);

/// Handle to a binary semaphore owned by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SemaphoreId(pub(crate) u64);

/// Handle to a command pool owned by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandPoolId(pub(crate) u64);

/// Handle to a command buffer owned by its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandBufferId(pub(crate) u64);

impl FenceId {
    /// Raw id, for logging.
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl CommandBufferId {
    /// Raw id, for logging.
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Recording level of a command buffer or pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferLevel {
    /// Directly submittable.
    Primary,
    /// Must be collected into a primary buffer by the owning thread.
    Secondary,
}

/// One queue submission.
///
/// `signal_timeline_value` is filled in by
/// [`TimelineSync::signal_and_submit`](crate::timeline::TimelineSync::signal_and_submit);
/// callers building a `Submission` leave it `None`.
#[derive(Debug, Clone)]
pub struct Submission<'a> {
    /// Primary command buffers to execute, in order.
    pub command_buffers: &'a [CommandBufferId],
    /// Binary semaphores the GPU waits on before executing.
    pub wait_semaphores: &'a [SemaphoreId],
    /// Binary semaphores signaled on completion.
    pub signal_semaphores: &'a [SemaphoreId],
    /// Timeline value the primitive advances to on completion.
    pub signal_timeline_value: Option<u64>,
    /// Fence signaled on completion.
    pub fence: Option<FenceId>,
}

impl<'a> Submission<'a> {
    /// A submission with only command buffers; sync is added by the caller.
    pub fn new(command_buffers: &'a [CommandBufferId]) -> Self {
        Self {
            command_buffers,
            wait_semaphores: &[],
            signal_semaphores: &[],
            signal_timeline_value: None,
            fence: None,
        }
    }
}

/// Result of acquiring a presentable image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredImage {
    /// Index of the acquired swapchain image.
    pub index: u32,
    /// The image works but the swapchain no longer matches the surface.
    pub suboptimal: bool,
}

/// Result of a successful present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    /// Presented normally.
    Optimal,
    /// Presented, but the swapchain should be recreated soon.
    Suboptimal,
}

/// Platform interface for the synchronization core.
///
/// Every operation is a leaf: it returns a result and never panics on GPU
/// failure. Thread safety is the implementation's problem; all methods take
/// `&self` so components can share the device behind an `Arc`.
pub trait GpuDevice: Send + Sync {
    /// Backend name, for logging.
    fn name(&self) -> &str;

    // --- Timeline primitive -------------------------------------------------

    /// Last value the timeline primitive is observed to have completed.
    fn timeline_completed_value(&self) -> Result<u64, GpuError>;

    /// Block until the primitive reaches `value`, up to `timeout`.
    ///
    /// Errors: [`GpuError::Timeout`], [`GpuError::DeviceLost`],
    /// [`GpuError::PrimitiveInvalid`].
    fn wait_timeline_value(&self, value: u64, timeout: Duration) -> Result<(), GpuError>;

    /// Destroy and recreate the timeline primitive at `initial_value`.
    ///
    /// The caller must hold the timeline's exclusive lock; no submission may
    /// be in flight against the primitive.
    fn reset_timeline(&self, initial_value: u64) -> Result<(), GpuError>;

    // --- Binary sync objects ------------------------------------------------

    /// Create a fence, optionally already signaled.
    fn create_fence(&self, signaled: bool) -> Result<FenceId, GpuError>;

    /// Non-blocking probe: `true` if the fence is signaled.
    fn fence_status(&self, fence: FenceId) -> Result<bool, GpuError>;

    /// Block until the fence signals, up to `timeout`.
    fn wait_fence(&self, fence: FenceId, timeout: Duration) -> Result<(), GpuError>;

    /// Return the fence to the unsignaled state.
    fn reset_fence(&self, fence: FenceId) -> Result<(), GpuError>;

    /// Destroy a fence. Destroying an unknown handle is a logged no-op.
    fn destroy_fence(&self, fence: FenceId);

    /// Create a binary semaphore.
    fn create_semaphore(&self) -> Result<SemaphoreId, GpuError>;

    /// Destroy a semaphore. Destroying an unknown handle is a logged no-op.
    fn destroy_semaphore(&self, semaphore: SemaphoreId);

    // --- Submission ---------------------------------------------------------

    /// Submit work to the device queue.
    fn submit(&self, submission: &Submission<'_>) -> Result<(), GpuError>;

    // --- Swapchain ----------------------------------------------------------

    /// Acquire the next presentable image, signaling `signal` when ready.
    ///
    /// Errors: [`GpuError::SurfaceOutdated`], [`GpuError::SurfaceLost`],
    /// [`GpuError::DeviceLost`], [`GpuError::Timeout`].
    fn acquire_image(
        &self,
        signal: SemaphoreId,
        timeout: Duration,
    ) -> Result<AcquiredImage, GpuError>;

    /// Queue the image for presentation after `wait` signals.
    fn present(&self, image_index: u32, wait: SemaphoreId) -> Result<PresentOutcome, GpuError>;

    /// Recreate the swapchain at the given extent.
    fn recreate_swapchain(&self, width: u32, height: u32) -> Result<(), GpuError>;

    // --- Command pools ------------------------------------------------------

    /// Create a command pool for buffers of the given level.
    fn create_command_pool(&self, level: CommandBufferLevel) -> Result<CommandPoolId, GpuError>;

    /// Allocate `count` command buffers from `pool`.
    fn allocate_command_buffers(
        &self,
        pool: CommandPoolId,
        level: CommandBufferLevel,
        count: u32,
    ) -> Result<Vec<CommandBufferId>, GpuError>;

    /// Reset every buffer allocated from `pool` to the initial state.
    fn reset_command_pool(&self, pool: CommandPoolId) -> Result<(), GpuError>;

    /// Destroy a pool and all its buffers. Unknown handles are a logged no-op.
    fn destroy_command_pool(&self, pool: CommandPoolId);

    // --- Whole device -------------------------------------------------------

    /// Block until all outstanding GPU work completes.
    ///
    /// The conservative fallback for failed targeted waits: expensive but
    /// always correct.
    fn wait_idle(&self) -> Result<(), GpuError>;
}
