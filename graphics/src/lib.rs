//! # Emberfall Graphics
//!
//! The synchronization and resource-lifecycle core of the Emberfall
//! renderer: it decides *when* GPU work may be submitted, *when* completion
//! may be assumed, and *how* failures in that process are contained. It does
//! not define what gets rendered; pipelines, materials, and scene data are
//! external collaborators driven through trait seams.
//!
//! ## Layers
//!
//! | Layer | Type | Purpose |
//! |-------|------|---------|
//! | Timeline | [`TimelineSync`] | Monotonic values naming GPU completion points |
//! | Pacing | [`FramePacer`] | N frames in flight over per-slot fences and semaphores |
//! | Policy | [`throttle`] | Stepped backoff for swapchain recreation churn |
//! | Recovery | [`RecoveryController`] | Bounded teardown/rebuild on device loss |
//! | Recording | [`CommandPoolRegistry`] | Per-thread command pools, parallel secondaries |
//! | Reclamation | [`DeferredReclaimer`] | Transient resources pinned to timeline values |
//!
//! All of it talks to the GPU through the [`GpuDevice`] trait: the
//! [`DummyDevice`] emulation for tests and headless runs, or the Vulkan
//! implementation behind the `vulkan-backend` feature. The protocol is
//! identical across backends.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use emberfall_graphics::backend::{GpuDevice, dummy::DummyDevice};
//! use emberfall_graphics::config::RendererConfig;
//! use emberfall_graphics::frame::FramePacer;
//! use emberfall_graphics::timeline::{TimelineStrategy, TimelineSync};
//!
//! # fn main() -> Result<(), emberfall_graphics::GpuError> {
//! let device: Arc<dyn GpuDevice> = Arc::new(DummyDevice::new());
//! let timeline = Arc::new(TimelineSync::new(Arc::clone(&device), TimelineStrategy::default()));
//! let mut pacer = FramePacer::new(device, timeline, RendererConfig::default())?;
//!
//! pacer.begin_frame()?;
//! let image = pacer.acquire_image()?;
//! // ... record commands ...
//! let completion_value = pacer.submit_and_present(image.index, &[])?;
//! # let _ = completion_value;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod deferred;
pub mod error;
pub mod frame;
pub mod record;
pub mod recovery;
pub mod throttle;
pub mod timeline;

// Re-export main types for convenience
pub use backend::dummy::DummyDevice;
pub use backend::{
    AcquiredImage, CommandBufferId, CommandBufferLevel, CommandPoolId, FenceId, GpuDevice,
    PresentOutcome, SemaphoreId, Submission,
};
pub use config::RendererConfig;
pub use deferred::{DeferredReclaimer, ReclaimHandle};
pub use error::GpuError;
pub use frame::FramePacer;
pub use record::{CommandPoolRegistry, RecordToken, record_parallel};
pub use recovery::{
    LossReason, RebuildStep, RecoveryController, RecoveryHooks, RecoveryStatus, TriggerOutcome,
};
pub use throttle::{RecreationHistory, should_throttle};
pub use timeline::{TimelineStrategy, TimelineSync, WaitOutcome};

/// Graphics library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the graphics subsystem.
pub fn init() {
    log::info!("Emberfall Graphics v{} initialized", VERSION);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_dummy_backend_name() {
        let device = DummyDevice::new();
        assert_eq!(device.name(), "Dummy");
    }
}
