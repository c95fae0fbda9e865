//! Integration tests for the synchronization core.
//!
//! These drive whole frame loops, recovery cycles, and parallel recording
//! against the dummy backend:
//!
//! - **Frame loop**: pacing, timeline progression, deferred reclamation
//! - **Recovery**: device-loss injection routed through the controller
//! - **Recreation**: out-of-date surfaces routed through the throttle
//! - **Recording**: secondary buffers recorded on the worker pool and
//!   submitted by the owning thread

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use rstest::rstest;

use common::Harness;
use emberfall_core::WorkerPool;
use emberfall_graphics::backend::GpuDevice;
use emberfall_graphics::config::RendererConfig;
use emberfall_graphics::deferred::DeferredReclaimer;
use emberfall_graphics::error::GpuError;
use emberfall_graphics::record::{CommandPoolRegistry, record_parallel};
use emberfall_graphics::recovery::{
    LossReason, RecoveryController, RecoveryHooks, RecoveryStatus, TriggerOutcome,
};
use emberfall_graphics::throttle::{RecreationHistory, should_throttle};
use emberfall_graphics::timeline::WaitOutcome;

fn config_with_frames(frames_in_flight: usize) -> RendererConfig {
    RendererConfig {
        frames_in_flight,
        ..RendererConfig::default()
    }
}

// ============================================================================
// Frame loop
// ============================================================================

#[rstest]
#[case::double_buffered(2)]
#[case::triple_buffered(3)]
fn frame_loop_reclaims_transients(#[case] frames_in_flight: usize) {
    common::init_test_logging();
    let mut harness = Harness::new(config_with_frames(frames_in_flight));
    let mut reclaimer: DeferredReclaimer<String> = DeferredReclaimer::new();

    for frame in 0..12u64 {
        let value = harness.render_frame(&[]).unwrap();

        // Pin one pretend staging buffer to this frame's completion value.
        reclaimer.defer(format!("staging-{frame}"), value);

        // Opportunistic per-frame drain.
        let observed = harness.timeline.completed_value().unwrap();
        reclaimer.drain(observed, drop);
    }

    // With instant completion every entry is ripe once its frame submits.
    // The last frame's entry may still be pending; shutdown picks it up.
    harness.pacer.wait_idle().unwrap();
    harness.gpu.wait_idle().unwrap();
    reclaimer.drain_all(drop);
    assert_eq!(reclaimer.pending_count(), 0);

    assert_eq!(harness.pacer.frame_count(), 12);
    assert_eq!(harness.device.submit_count(), 12);
}

#[test]
fn timeline_orders_frames_under_manual_pacing() {
    let mut harness = Harness::new(config_with_frames(2));
    harness.device.set_manual_completion(true);

    let first = harness.render_frame(&[]).unwrap();
    let second = harness.render_frame(&[]).unwrap();
    assert!(second > first);

    // Nothing completed yet.
    assert_eq!(
        harness.timeline.wait_for_value(first, Duration::from_millis(5)),
        WaitOutcome::Timeout
    );

    // Completion arrives in issuance order.
    harness.device.complete_next();
    assert_eq!(
        harness.timeline.wait_for_value(first, Duration::from_secs(1)),
        WaitOutcome::Completed
    );
    assert_eq!(
        harness.timeline.wait_for_value(second, Duration::from_millis(5)),
        WaitOutcome::Timeout
    );

    harness.device.complete_all();
    assert_eq!(
        harness.timeline.wait_for_value(second, Duration::from_secs(1)),
        WaitOutcome::Completed
    );
}

#[test]
fn frame_skip_is_silent_and_recoverable() {
    let mut harness = Harness::new(config_with_frames(2));
    harness.device.fail_next_acquire(GpuError::SurfaceOutdated);

    // The frame is abandoned without submission.
    assert_eq!(harness.render_frame(&[]), Err(GpuError::SurfaceOutdated));
    assert!(harness.pacer.needs_recreation());
    assert_eq!(harness.device.submit_count(), 0);

    // Recreate swapchain + slots, then rendering resumes.
    harness.pacer.wait_idle().unwrap();
    harness.device.recreate_swapchain(800, 600).unwrap();
    harness.pacer.recreate_slots().unwrap();
    harness.render_frame(&[]).unwrap();
    assert_eq!(harness.device.submit_count(), 1);
}

// ============================================================================
// Recreation throttle
// ============================================================================

#[test]
fn resize_churn_is_throttled() {
    let mut harness = Harness::new(config_with_frames(2));
    let mut history = RecreationHistory::default();

    // A stream of out-of-date acquires, as during a drag-resize.
    for _ in 0..4 {
        harness.device.fail_next_acquire(GpuError::SurfaceOutdated);
        let _ = harness.render_frame(&[]);

        let now = Instant::now();
        if should_throttle(&history, now) {
            continue; // deferred: no recreation attempt this frame
        }
        history.record_attempt(now);
        match harness.device.recreate_swapchain(640, 480) {
            Ok(()) => {
                harness.pacer.recreate_slots().unwrap();
                history.record_success();
            }
            Err(_) => history.record_failure(),
        }
    }

    // Recreations succeeded, so the streak stayed clear.
    assert_eq!(history.consecutive_failures(), 0);
    assert!(harness.device.swapchain_generation() >= 1);

    // Now a failing surface: the streak builds and the throttle engages.
    let base = Instant::now();
    history.record_attempt(base);
    for _ in 0..3 {
        history.record_failure();
    }
    assert!(should_throttle(&history, base + Duration::from_millis(400)));
    assert!(!should_throttle(&history, base + Duration::from_millis(600)));
}

// ============================================================================
// Device-loss recovery
// ============================================================================

#[test]
fn device_loss_routes_through_recovery_and_rendering_resumes() {
    common::init_test_logging();
    let mut harness = Harness::new(config_with_frames(2));
    let controller = RecoveryController::new(
        Arc::clone(&harness.gpu),
        Arc::clone(&harness.timeline),
        3,
    );

    for _ in 0..3 {
        harness.render_frame(&[]).unwrap();
    }

    harness.device.inject_device_loss();
    let error = harness.render_frame(&[]).unwrap_err();
    assert!(error.is_device_loss());

    let outcome = controller.trigger(LossReason::DeviceLost, &mut harness);
    assert_eq!(outcome, TriggerOutcome::Recovered);
    assert_eq!(controller.status(), RecoveryStatus::Healthy);
    assert!(harness.pipelines_alive);
    assert!(harness.scene_loaded);

    // The timeline restarted with the rebuilt primitive and frames flow.
    let value = harness.render_frame(&[]).unwrap();
    assert_eq!(value, 1);
    assert_eq!(
        harness.timeline.wait_for_value(value, Duration::from_secs(1)),
        WaitOutcome::Completed
    );
}

#[test]
fn unrecoverable_device_ends_in_failed_exactly_once() {
    let mut harness = Harness::new(config_with_frames(2));
    let controller = RecoveryController::new(
        Arc::clone(&harness.gpu),
        Arc::clone(&harness.timeline),
        2,
    );

    let terminal_reports = Arc::new(std::sync::atomic::AtomicU32::new(0));
    {
        let terminal_reports = Arc::clone(&terminal_reports);
        controller.set_on_recovery_complete(move |success| {
            if !success {
                terminal_reports.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        });
    }

    // Device stays dead: every rebuild fails when the swapchain comes back
    // up against a lost device.
    struct DeadDevice<'a>(&'a mut Harness);
    impl RecoveryHooks for DeadDevice<'_> {
        fn destroy_command_sync(&mut self) {
            self.0.destroy_command_sync();
        }
        fn destroy_scene_buffers(&mut self) {
            self.0.destroy_scene_buffers();
        }
        fn destroy_pipelines(&mut self) {
            self.0.destroy_pipelines();
        }
        fn destroy_swapchain(&mut self) {
            self.0.destroy_swapchain();
        }
        fn recreate_device(&mut self) -> Result<(), GpuError> {
            Err(GpuError::DeviceLost)
        }
        fn create_swapchain(&mut self) -> Result<(), GpuError> {
            self.0.create_swapchain()
        }
        fn create_base_pipeline(&mut self) -> Result<(), GpuError> {
            self.0.create_base_pipeline()
        }
        fn create_feature_pipelines(&mut self) -> Result<(), GpuError> {
            self.0.create_feature_pipelines()
        }
        fn reload_scene(&mut self) -> Result<(), GpuError> {
            self.0.reload_scene()
        }
        fn create_command_sync(&mut self) -> Result<(), GpuError> {
            self.0.create_command_sync()
        }
    }

    harness.device.inject_device_loss();

    assert_eq!(
        controller.trigger(LossReason::DeviceLost, &mut DeadDevice(&mut harness)),
        TriggerOutcome::AttemptFailed
    );
    assert_eq!(
        controller.trigger(LossReason::DeviceLost, &mut DeadDevice(&mut harness)),
        TriggerOutcome::Failed
    );
    assert_eq!(controller.status(), RecoveryStatus::Failed);

    // Further triggers stay terminal without replaying the callback.
    assert_eq!(
        controller.trigger(LossReason::DeviceLost, &mut DeadDevice(&mut harness)),
        TriggerOutcome::Failed
    );
    assert_eq!(
        terminal_reports.load(std::sync::atomic::Ordering::SeqCst),
        2
    );
}

// ============================================================================
// Parallel recording
// ============================================================================

#[test]
fn parallel_recording_feeds_frame_submission() {
    let mut harness = Harness::new(config_with_frames(2));
    let registry = Arc::new(CommandPoolRegistry::new(Arc::clone(&harness.gpu), 8, 32));
    let pool = WorkerPool::new(4);

    for _ in 0..3 {
        // Fan recording out across workers.
        let jobs: Vec<_> = (0..8)
            .map(|_| move |_buffer: emberfall_graphics::backend::CommandBufferId| {})
            .collect();
        let results = record_parallel(&pool, &registry, jobs);

        // Collect in caller order and submit from the owning thread.
        let buffers: Vec<_> = results.into_iter().collect::<Result<Vec<_>, _>>().unwrap();
        assert_eq!(buffers.len(), 8);

        harness.pacer.begin_frame().unwrap();
        let image = harness.pacer.acquire_image().unwrap();
        harness.pacer.submit_and_present(image.index, &buffers).unwrap();

        // Frame boundary: previous consumers retired, pools rewind.
        harness.pacer.wait_idle().unwrap();
        registry.reset_all().unwrap();
    }

    assert!(registry.active_count() >= 1);
    assert!(registry.active_count() <= 4);
    assert_eq!(harness.device.submit_count(), 3);
}

// ============================================================================
// Shutdown
// ============================================================================

#[test]
fn shutdown_tears_down_in_order_without_leaks() {
    let mut harness = Harness::new(config_with_frames(2));
    let registry = Arc::new(CommandPoolRegistry::new(Arc::clone(&harness.gpu), 4, 8));
    let mut reclaimer: DeferredReclaimer<&'static str> = DeferredReclaimer::new();
    let mut pool = WorkerPool::new(4);

    registry
        .get_or_create(std::thread::current().id())
        .unwrap();

    let value = harness.render_frame(&[]).unwrap();
    reclaimer.defer("staging", value);

    // Ordered shutdown: stop producing, quiesce the GPU, then reclaim with
    // the observed value treated as infinite, then drop device objects.
    pool.shutdown();
    harness.pacer.wait_idle().unwrap();
    harness.gpu.wait_idle().unwrap();

    assert_eq!(reclaimer.drain_all(drop), 1);
    registry.shutdown();
    harness.pacer.destroy();

    assert_eq!(harness.device.live_object_count(), 0);
}
