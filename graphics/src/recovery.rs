//! Device-loss recovery.
//!
//! [`RecoveryController`] is the state machine that contains device and
//! surface loss: it tears down every device-dependent object in reverse
//! dependency order, rebuilds in forward order, and bounds how many times it
//! will try before giving up.
//!
//! ```text
//! Healthy ──trigger──► Lost ──► Recovering ──success──► Healthy
//!                       ▲            │
//!                       └──failure───┤ (attempts remain)
//!                                    └──attempts exhausted──► Failed
//! ```
//!
//! The actual creation and destruction of pipelines, swapchains, and scene
//! data belongs to external collaborators; the controller drives them through
//! the [`RecoveryHooks`] trait in a fixed order. The timeline primitive is
//! rebuilt under the timeline's exclusive lock, so no thread can submit
//! against a half-torn-down primitive.
//!
//! Only the terminal `Failed` status surfaces to the application, via the
//! registered completion callback; everything before that is silent frame
//! skipping.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::GpuDevice;
use crate::error::GpuError;
use crate::timeline::TimelineSync;

/// What provoked a recovery trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossReason {
    /// The driver reported the device lost.
    DeviceLost,
    /// The presentation surface is gone and recreation alone did not help.
    SurfaceLost,
}

/// Externally visible recovery status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStatus {
    /// Rendering normally.
    Healthy,
    /// Loss observed; a future trigger may retry the rebuild.
    Lost,
    /// A rebuild is executing right now.
    Recovering,
    /// Attempts exhausted; the application decides whether to continue.
    Failed,
}

/// Identity of a rebuild step, reported on failure for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildStep {
    RecreateDevice,
    CreateSwapchain,
    CreateBasePipeline,
    CreateFeaturePipelines,
    ReloadScene,
    CreateCommandSync,
}

/// Result of a [`RecoveryController::trigger`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// A recovery was already in progress; this trigger was dropped.
    Ignored,
    /// The rebuild succeeded; status is `Healthy` again.
    Recovered,
    /// The rebuild failed but attempts remain; status is `Lost`.
    AttemptFailed,
    /// Attempts are exhausted; status is `Failed`.
    Failed,
}

/// The ordered teardown/rebuild operations owned by external collaborators.
///
/// Teardown runs in strict reverse dependency order, rebuild in forward
/// order; the controller never reorders or skips steps. Destroy operations
/// are infallible by contract: on a lost device there is nothing useful a
/// destroy can report.
pub trait RecoveryHooks {
    /// Destroy command pools and per-frame sync objects.
    fn destroy_command_sync(&mut self);
    /// Destroy transient per-scene GPU buffers.
    fn destroy_scene_buffers(&mut self);
    /// Destroy high-level render pipelines.
    fn destroy_pipelines(&mut self);
    /// Destroy the swapchain.
    fn destroy_swapchain(&mut self);

    /// Recreate the logical device. Runs under the timeline's exclusive lock.
    fn recreate_device(&mut self) -> Result<(), GpuError>;
    /// Recreate the swapchain.
    fn create_swapchain(&mut self) -> Result<(), GpuError>;
    /// Recreate the base pipeline.
    fn create_base_pipeline(&mut self) -> Result<(), GpuError>;
    /// Recreate optional feature pipelines.
    fn create_feature_pipelines(&mut self) -> Result<(), GpuError>;
    /// Reload previously bound scene data.
    fn reload_scene(&mut self) -> Result<(), GpuError>;
    /// Recreate command pools and per-frame sync objects.
    fn create_command_sync(&mut self) -> Result<(), GpuError>;
}

type LostCallback = Box<dyn FnMut() + Send>;
type CompleteCallback = Box<dyn FnMut(bool) + Send>;

struct RecoveryState {
    status: RecoveryStatus,
    attempt_count: u32,
    last_failed_step: Option<RebuildStep>,
    on_device_lost: Option<LostCallback>,
    on_recovery_complete: Option<CompleteCallback>,
    failure_reported: bool,
}

/// Bounded-retry device-loss recovery.
///
/// Shareable behind an `Arc`; `trigger` is non-reentrant, so a second trigger
/// while a rebuild is executing is a no-op, not queued.
pub struct RecoveryController {
    device: Arc<dyn GpuDevice>,
    timeline: Arc<TimelineSync>,
    max_attempts: u32,
    state: Mutex<RecoveryState>,
}

impl RecoveryController {
    /// Create a controller that gives up after `max_attempts` failed rebuilds.
    pub fn new(device: Arc<dyn GpuDevice>, timeline: Arc<TimelineSync>, max_attempts: u32) -> Self {
        Self {
            device,
            timeline,
            max_attempts,
            state: Mutex::new(RecoveryState {
                status: RecoveryStatus::Healthy,
                attempt_count: 0,
                last_failed_step: None,
                on_device_lost: None,
                on_recovery_complete: None,
                failure_reported: false,
            }),
        }
    }

    /// Register the callback fired once per transition into `Lost`.
    pub fn set_on_device_lost<F>(&self, callback: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.state.lock().on_device_lost = Some(Box::new(callback));
    }

    /// Register the callback fired after every completed attempt, with
    /// `success = true` exactly when the status returned to `Healthy`.
    pub fn set_on_recovery_complete<F>(&self, callback: F)
    where
        F: FnMut(bool) + Send + 'static,
    {
        self.state.lock().on_recovery_complete = Some(Box::new(callback));
    }

    /// Current status.
    pub fn status(&self) -> RecoveryStatus {
        self.state.lock().status
    }

    /// Rebuild attempts since the last successful recovery.
    pub fn attempt_count(&self) -> u32 {
        self.state.lock().attempt_count
    }

    /// The step that failed in the most recent unsuccessful rebuild.
    pub fn last_failed_step(&self) -> Option<RebuildStep> {
        self.state.lock().last_failed_step
    }

    /// React to a loss: run one bounded rebuild attempt.
    ///
    /// Non-reentrant: if another thread is mid-rebuild, returns
    /// [`TriggerOutcome::Ignored`] immediately. Once attempts are exhausted
    /// the controller transitions straight to `Failed` without attempting a
    /// rebuild, firing the completion callback exactly once for the terminal
    /// transition.
    pub fn trigger(&self, reason: LossReason, hooks: &mut dyn RecoveryHooks) -> TriggerOutcome {
        let Some(mut state) = self.state.try_lock() else {
            log::debug!("recovery trigger ignored: rebuild already in progress");
            return TriggerOutcome::Ignored;
        };
        if state.status == RecoveryStatus::Recovering {
            return TriggerOutcome::Ignored;
        }

        log::warn!("recovery triggered: {:?}", reason);

        if state.attempt_count >= self.max_attempts {
            state.status = RecoveryStatus::Failed;
            if !state.failure_reported {
                state.failure_reported = true;
                if let Some(callback) = state.on_recovery_complete.as_mut() {
                    callback(false);
                }
            }
            return TriggerOutcome::Failed;
        }

        if state.status == RecoveryStatus::Healthy
            && let Some(callback) = state.on_device_lost.as_mut()
        {
            callback();
        }
        state.status = RecoveryStatus::Lost;
        state.attempt_count += 1;
        state.status = RecoveryStatus::Recovering;
        let attempt = state.attempt_count;

        let result = self.rebuild(hooks);

        match result {
            Ok(()) => {
                log::info!("recovery succeeded on attempt {attempt}");
                state.attempt_count = 0;
                state.last_failed_step = None;
                state.status = RecoveryStatus::Healthy;
                if let Some(callback) = state.on_recovery_complete.as_mut() {
                    callback(true);
                }
                TriggerOutcome::Recovered
            }
            Err((step, error)) => {
                log::error!("recovery attempt {attempt} failed at {:?}: {error}", step);
                state.last_failed_step = Some(step);

                // Minimal fallback: enough surface to avoid a hard crash.
                self.minimal_fallback(hooks);

                let outcome = if state.attempt_count >= self.max_attempts {
                    state.status = RecoveryStatus::Failed;
                    state.failure_reported = true;
                    TriggerOutcome::Failed
                } else {
                    state.status = RecoveryStatus::Lost;
                    TriggerOutcome::AttemptFailed
                };
                if let Some(callback) = state.on_recovery_complete.as_mut() {
                    callback(false);
                }
                outcome
            }
        }
    }

    /// Ordered teardown and rebuild. Returns the failing step's identity.
    fn rebuild(&self, hooks: &mut dyn RecoveryHooks) -> Result<(), (RebuildStep, GpuError)> {
        // Best-effort: the device may already be gone, which is fine;
        // everything it owned is about to be destroyed anyway.
        if let Err(error) = self.device.wait_idle() {
            log::warn!("device idle wait before teardown failed: {error}");
        }

        // Teardown, reverse dependency order.
        hooks.destroy_command_sync();
        hooks.destroy_scene_buffers();
        hooks.destroy_pipelines();
        hooks.destroy_swapchain();

        // Rebuild, forward order. Device recreation and the timeline
        // primitive reset run under the timeline's exclusive lock.
        self.timeline
            .rebuild_primitive(|| hooks.recreate_device())
            .map_err(|e| (RebuildStep::RecreateDevice, e))?;
        hooks
            .create_swapchain()
            .map_err(|e| (RebuildStep::CreateSwapchain, e))?;
        hooks
            .create_base_pipeline()
            .map_err(|e| (RebuildStep::CreateBasePipeline, e))?;
        hooks
            .create_feature_pipelines()
            .map_err(|e| (RebuildStep::CreateFeaturePipelines, e))?;
        hooks
            .reload_scene()
            .map_err(|e| (RebuildStep::ReloadScene, e))?;
        hooks
            .create_command_sync()
            .map_err(|e| (RebuildStep::CreateCommandSync, e))?;
        Ok(())
    }

    /// After a failed rebuild, best-effort recreate just enough to present:
    /// swapchain, base pipeline, command sync. Errors are logged and ignored.
    fn minimal_fallback(&self, hooks: &mut dyn RecoveryHooks) {
        log::warn!("attempting minimal fallback surface");
        if let Err(error) = hooks.create_swapchain() {
            log::warn!("fallback swapchain creation failed: {error}");
            return;
        }
        if let Err(error) = hooks.create_base_pipeline() {
            log::warn!("fallback pipeline creation failed: {error}");
        }
        if let Err(error) = hooks.create_command_sync() {
            log::warn!("fallback command sync creation failed: {error}");
        }
    }
}

impl std::fmt::Debug for RecoveryController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RecoveryController")
            .field("status", &state.status)
            .field("attempt_count", &state.attempt_count)
            .field("max_attempts", &self.max_attempts)
            .field("last_failed_step", &state.last_failed_step)
            .finish_non_exhaustive()
    }
}
