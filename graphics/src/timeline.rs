//! Monotonic GPU/CPU timeline synchronization.
//!
//! [`TimelineSync`] owns the device's single timeline primitive and hands out
//! strictly increasing values that name points of GPU completion. Every other
//! subsystem orders and waits on asynchronous GPU work through it:
//!
//! ```text
//! let value = timeline.reserve_next_value()?;      // name the work
//! timeline.signal_and_submit(value, submission)?;  // GPU signals `value` when done
//! ...
//! timeline.wait_for_value(value, timeout);         // CPU observes completion
//! ```
//!
//! # Locking discipline
//!
//! Ordinary submit and wait operations take a shared lock; the recovery
//! path's [`rebuild_primitive`](TimelineSync::rebuild_primitive) takes the
//! exclusive lock for the duration of primitive destruction and recreation,
//! so no thread can submit against a half-torn-down primitive. Internal lock
//! order is always: value counter, then access lock.
//!
//! # Value semantics
//!
//! Value 0 is reserved to mean "no pending work" and is never issued. Values
//! signaled on the same primitive complete in issuance order.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use static_assertions::assert_impl_all;

use crate::backend::{GpuDevice, Submission};
use crate::error::GpuError;

/// Issuance policy for timeline values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineStrategy {
    /// Value the primitive starts at (and restarts at after recovery).
    pub base_value: u64,
    /// Distance between consecutive issued values.
    pub increment_step: u64,
    /// Ceiling the counter must never reach.
    pub max_safe_value: u64,
    /// Distance from the ceiling at which containment kicks in.
    pub overflow_threshold: u64,
    /// Whether containment may recreate the primitive to restart the
    /// sequence. When disabled, approaching the ceiling is logged loudly but
    /// the primitive is left alone.
    pub auto_reset_enabled: bool,
}

impl Default for TimelineStrategy {
    fn default() -> Self {
        Self {
            base_value: 0,
            increment_step: 1,
            max_safe_value: u64::MAX,
            overflow_threshold: 1 << 16,
            auto_reset_enabled: true,
        }
    }
}

/// Outcome of a bounded wait on a timeline value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The primitive reached the requested value.
    Completed,
    /// The timeout elapsed first. Transient; the caller may retry.
    Timeout,
    /// The device was lost. Route to the recovery controller.
    DeviceLost,
    /// A destroyed or null primitive reached the wait. Programmer error.
    PrimitiveInvalid,
}

/// The process-wide timeline counter for one device.
///
/// Constructed once at startup and shared by `Arc`; there is no implicit
/// global instance. Destroyed only at shutdown, after all consumers have
/// quiesced.
pub struct TimelineSync {
    device: Arc<dyn GpuDevice>,
    strategy: TimelineStrategy,
    /// Highest value handed out so far. Non-decreasing between recoveries.
    last_issued: Mutex<u64>,
    /// Shared: submit/wait paths. Exclusive: primitive recreation.
    access: RwLock<()>,
}

assert_impl_all!(TimelineSync: Send, Sync);

impl TimelineSync {
    /// Create the counter for `device` with the given issuance policy.
    ///
    /// # Panics
    ///
    /// Panics if `increment_step` is 0 or `base_value` is not below
    /// `max_safe_value`.
    pub fn new(device: Arc<dyn GpuDevice>, strategy: TimelineStrategy) -> Self {
        assert!(strategy.increment_step > 0, "increment_step must be nonzero");
        assert!(
            strategy.base_value < strategy.max_safe_value,
            "base_value must be below max_safe_value"
        );
        Self {
            device,
            strategy,
            last_issued: Mutex::new(strategy.base_value),
            access: RwLock::new(()),
        }
    }

    /// The device this counter issues values for.
    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    /// The issuance policy.
    pub fn strategy(&self) -> &TimelineStrategy {
        &self.strategy
    }

    /// Highest value issued so far.
    pub fn last_issued(&self) -> u64 {
        *self.last_issued.lock()
    }

    /// Non-blocking probe of the primitive's completed value.
    pub fn completed_value(&self) -> Result<u64, GpuError> {
        self.device.timeline_completed_value()
    }

    /// Reserve the next timeline value.
    ///
    /// Guarantees, across any number of concurrent callers:
    /// - strictly greater than every previously issued value;
    /// - strictly greater than the primitive's completed value observed at
    ///   issuance time (the cache self-repairs if an external signaler or
    ///   counter drift pushed completion past it);
    /// - never 0.
    ///
    /// If the candidate value would land within `overflow_threshold` of
    /// `max_safe_value`, the counter is contained rather than allowed to
    /// wrap: the primitive is recreated at the observed completed value
    /// (under the exclusive lock) and issuance restarts just above it.
    pub fn reserve_next_value(&self) -> Result<u64, GpuError> {
        let mut last = self.last_issued.lock();

        let completed = self.device.timeline_completed_value()?;
        if *last < completed {
            log::warn!(
                "timeline cache behind observed completion ({} < {}), repairing",
                *last,
                completed
            );
            *last = completed;
        }

        let ceiling = self
            .strategy
            .max_safe_value
            .saturating_sub(self.strategy.overflow_threshold);
        let candidate = last.checked_add(self.strategy.increment_step);

        let value = match candidate {
            Some(value) if value < ceiling => value,
            _ if self.strategy.auto_reset_enabled => {
                // Containment: restart the sequence just above what the GPU
                // has actually completed, instead of wrapping.
                let _exclusive = self.access.write();
                let completed = self.device.timeline_completed_value()?;
                self.device.reset_timeline(completed)?;
                log::info!(
                    "timeline counter contained: primitive reset at {}, sequence restarts",
                    completed
                );
                *last = completed;
                completed + self.strategy.increment_step
            }
            _ => {
                log::error!(
                    "timeline counter within {} of max safe value {} and auto-reset is disabled",
                    self.strategy.overflow_threshold,
                    self.strategy.max_safe_value
                );
                candidate.unwrap_or(self.strategy.max_safe_value)
            }
        };

        debug_assert!(value > 0, "timeline value 0 is reserved for no-work");
        *last = value;
        Ok(value)
    }

    /// Submit GPU work that advances the primitive to exactly `value` on
    /// completion.
    ///
    /// `value` must come from [`reserve_next_value`](Self::reserve_next_value)
    /// immediately prior. Runs under the shared lock, so a concurrent
    /// primitive recreation cannot interleave.
    pub fn signal_and_submit(
        &self,
        value: u64,
        mut submission: Submission<'_>,
    ) -> Result<(), GpuError> {
        debug_assert!(
            submission.signal_timeline_value.is_none(),
            "signal value is stamped here, not by the caller"
        );
        let _shared = self.access.read();
        submission.signal_timeline_value = Some(value);
        self.device.submit(&submission)
    }

    /// Wait until the primitive reaches `value`, up to `timeout`.
    ///
    /// Probes first and returns immediately when the GPU is already ahead of
    /// the CPU: no syscall, no stall. On a query or wait failure that is not
    /// a timeout, device loss, or an invalid primitive, falls back to a full
    /// device-idle wait: expensive, but always correct.
    pub fn wait_for_value(&self, value: u64, timeout: Duration) -> WaitOutcome {
        if value == 0 {
            // 0 means "no pending work"; there is nothing to wait for.
            return WaitOutcome::Completed;
        }

        let _shared = self.access.read();

        match self.device.timeline_completed_value() {
            Ok(completed) if completed >= value => return WaitOutcome::Completed,
            Ok(_) => {}
            Err(GpuError::DeviceLost) => return WaitOutcome::DeviceLost,
            Err(GpuError::PrimitiveInvalid) => {
                log::error!("destroyed timeline primitive reached wait_for_value");
                return WaitOutcome::PrimitiveInvalid;
            }
            Err(error) => {
                log::warn!("timeline status query failed ({error}), falling back to device idle");
                return self.conservative_idle_wait();
            }
        }

        match self.device.wait_timeline_value(value, timeout) {
            Ok(()) => WaitOutcome::Completed,
            Err(GpuError::Timeout) => WaitOutcome::Timeout,
            Err(GpuError::DeviceLost) => WaitOutcome::DeviceLost,
            Err(GpuError::PrimitiveInvalid) => {
                log::error!("destroyed timeline primitive reached wait_for_value");
                WaitOutcome::PrimitiveInvalid
            }
            Err(error) => {
                log::warn!("timeline wait failed ({error}), falling back to device idle");
                self.conservative_idle_wait()
            }
        }
    }

    /// Block on all outstanding GPU work, not just one value.
    fn conservative_idle_wait(&self) -> WaitOutcome {
        match self.device.wait_idle() {
            Ok(()) => WaitOutcome::Completed,
            Err(GpuError::DeviceLost) => WaitOutcome::DeviceLost,
            Err(error) => {
                log::error!("device idle fallback failed: {error}");
                WaitOutcome::PrimitiveInvalid
            }
        }
    }

    /// Recreate the primitive as part of device recovery.
    ///
    /// Holds the exclusive lock across `recreate_device` and the primitive
    /// reset, excluding every submit and wait for the duration. The counter
    /// restarts at the strategy's base value.
    pub fn rebuild_primitive<F>(&self, recreate_device: F) -> Result<(), GpuError>
    where
        F: FnOnce() -> Result<(), GpuError>,
    {
        let mut last = self.last_issued.lock();
        let _exclusive = self.access.write();
        recreate_device()?;
        self.device.reset_timeline(self.strategy.base_value)?;
        *last = self.strategy.base_value;
        log::info!(
            "timeline primitive rebuilt, counter restarted at {}",
            self.strategy.base_value
        );
        Ok(())
    }
}

impl std::fmt::Debug for TimelineSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimelineSync")
            .field("backend", &self.device.name())
            .field("last_issued", &self.last_issued())
            .field("strategy", &self.strategy)
            .finish()
    }
}
