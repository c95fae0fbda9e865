//! Shared harness for integration tests.
//!
//! Bundles the full synchronization core (dummy device, timeline, frame
//! pacer) together with the external-collaborator state that the recovery
//! controller drives (pipelines, scene data, swapchain), so tests can run
//! whole frame loops and whole recovery cycles.

use std::sync::Arc;

use emberfall_graphics::backend::dummy::DummyDevice;
use emberfall_graphics::backend::{CommandBufferId, GpuDevice};
use emberfall_graphics::config::RendererConfig;
use emberfall_graphics::error::GpuError;
use emberfall_graphics::frame::FramePacer;
use emberfall_graphics::recovery::RecoveryHooks;
use emberfall_graphics::timeline::{TimelineStrategy, TimelineSync};

/// Route `log` output through the test harness.
pub fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// The renderer-side state a real application would rebuild on recovery.
pub struct Harness {
    pub device: Arc<DummyDevice>,
    pub gpu: Arc<dyn GpuDevice>,
    pub timeline: Arc<TimelineSync>,
    pub pacer: FramePacer,
    pub pipelines_alive: bool,
    pub scene_loaded: bool,
    pub surface_extent: (u32, u32),
}

impl Harness {
    pub fn new(config: RendererConfig) -> Self {
        let device = Arc::new(DummyDevice::new());
        let gpu: Arc<dyn GpuDevice> = Arc::clone(&device) as Arc<dyn GpuDevice>;
        let timeline = Arc::new(TimelineSync::new(
            Arc::clone(&gpu),
            TimelineStrategy::default(),
        ));
        let pacer = FramePacer::new(Arc::clone(&gpu), Arc::clone(&timeline), config).unwrap();
        Self {
            device,
            gpu,
            timeline,
            pacer,
            pipelines_alive: true,
            scene_loaded: true,
            surface_extent: (1920, 1080),
        }
    }

    /// Run one complete frame, returning the timeline value it signals.
    pub fn render_frame(&mut self, commands: &[CommandBufferId]) -> Result<u64, GpuError> {
        self.pacer.begin_frame()?;
        let image = self.pacer.acquire_image()?;
        self.pacer.submit_and_present(image.index, commands)
    }
}

impl RecoveryHooks for Harness {
    fn destroy_command_sync(&mut self) {
        self.pacer.destroy();
    }

    fn destroy_scene_buffers(&mut self) {
        self.scene_loaded = false;
    }

    fn destroy_pipelines(&mut self) {
        self.pipelines_alive = false;
    }

    fn destroy_swapchain(&mut self) {}

    fn recreate_device(&mut self) -> Result<(), GpuError> {
        self.device.revive();
        Ok(())
    }

    fn create_swapchain(&mut self) -> Result<(), GpuError> {
        self.device
            .recreate_swapchain(self.surface_extent.0, self.surface_extent.1)
    }

    fn create_base_pipeline(&mut self) -> Result<(), GpuError> {
        self.pipelines_alive = true;
        Ok(())
    }

    fn create_feature_pipelines(&mut self) -> Result<(), GpuError> {
        Ok(())
    }

    fn reload_scene(&mut self) -> Result<(), GpuError> {
        self.scene_loaded = true;
        Ok(())
    }

    fn create_command_sync(&mut self) -> Result<(), GpuError> {
        self.pacer.recreate_slots()
    }
}
