//! Renderer tuning knobs.
//!
//! All limits and timeouts of the synchronization core are configuration
//! inputs, not hardcoded protocol. The config is built once at startup and
//! passed into the components that need it; nothing reads it from ambient
//! global state.

use std::time::Duration;

/// Tuning parameters for the synchronization core.
///
/// # Example
///
/// ```
/// use emberfall_graphics::config::RendererConfig;
/// use std::time::Duration;
///
/// let config = RendererConfig {
///     frames_in_flight: 3,
///     ..RendererConfig::default()
/// };
/// assert_eq!(config.submit_timeout, Duration::from_secs(10));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendererConfig {
    /// Number of frames the CPU may run ahead of the GPU. Typically 2 or 3.
    pub frames_in_flight: usize,
    /// Upper bound on worker threads; the pool also caps at the host's
    /// available parallelism.
    pub worker_threads: usize,
    /// Maximum concurrent threads with their own command-buffer pools.
    /// Requests beyond this fail with `PoolExhausted` and callers fall back
    /// to primary-only recording.
    pub max_record_threads: usize,
    /// Secondary command buffers pre-allocated per thread pool.
    pub secondary_buffers_per_pool: usize,
    /// Bound on waits tied to frame submission (fence waits, timeline waits,
    /// image acquisition).
    pub submit_timeout: Duration,
    /// Bound on waits during teardown and recovery.
    pub teardown_timeout: Duration,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            worker_threads: 8,
            max_record_threads: 8,
            secondary_buffers_per_pool: 32,
            submit_timeout: Duration::from_secs(10),
            teardown_timeout: Duration::from_secs(5),
        }
    }
}
