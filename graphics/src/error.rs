//! Graphics error types.

use std::fmt;

/// Errors that can occur in the synchronization core.
///
/// The taxonomy drives routing, not just reporting:
/// - [`Timeout`](Self::Timeout) is transient and retryable by the caller.
/// - [`DeviceLost`](Self::DeviceLost) routes to the recovery controller.
/// - The surface variants route to the recreation throttle and swapchain
///   recreation, not full recovery, unless the device is also lost.
/// - [`PrimitiveInvalid`](Self::PrimitiveInvalid) is a programmer error: a
///   destroyed or null synchronization handle reached a wait call.
/// - [`PoolExhausted`](Self::PoolExhausted) is recoverable; callers fall back
///   to a simpler path such as primary-only recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    /// A bounded wait elapsed before the awaited work completed.
    Timeout,
    /// The GPU device was lost; all device objects are invalid.
    DeviceLost,
    /// The surface was lost and must be recreated.
    SurfaceLost,
    /// The surface is out of date and the swapchain must be recreated.
    SurfaceOutdated,
    /// The surface still works but no longer matches the window exactly.
    SurfaceSuboptimal,
    /// A destroyed or null synchronization handle reached an operation.
    PrimitiveInvalid,
    /// A fixed-capacity pool has no free slot or buffer.
    PoolExhausted,
    /// Failed to initialize the graphics system.
    InitializationFailed(String),
    /// An internal error occurred.
    Internal(String),
}

impl fmt::Display for GpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "wait timed out"),
            Self::DeviceLost => write!(f, "GPU device lost"),
            Self::SurfaceLost => write!(f, "surface lost, needs recreation"),
            Self::SurfaceOutdated => write!(f, "surface out of date, needs recreation"),
            Self::SurfaceSuboptimal => write!(f, "surface suboptimal, recreation recommended"),
            Self::PrimitiveInvalid => write!(f, "invalid synchronization primitive handle"),
            Self::PoolExhausted => write!(f, "pool capacity exhausted"),
            Self::InitializationFailed(msg) => write!(f, "initialization failed: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for GpuError {}

impl GpuError {
    /// Whether this error indicates the swapchain (not the device) needs
    /// recreation.
    pub fn is_surface_error(&self) -> bool {
        matches!(
            self,
            Self::SurfaceLost | Self::SurfaceOutdated | Self::SurfaceSuboptimal
        )
    }

    /// Whether this error must be routed into full device recovery.
    pub fn is_device_loss(&self) -> bool {
        matches!(self, Self::DeviceLost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(GpuError::DeviceLost.to_string(), "GPU device lost");
        assert_eq!(
            GpuError::InitializationFailed("no GPU found".to_string()).to_string(),
            "initialization failed: no GPU found"
        );
    }

    #[test]
    fn test_error_routing_predicates() {
        assert!(GpuError::SurfaceOutdated.is_surface_error());
        assert!(GpuError::SurfaceLost.is_surface_error());
        assert!(!GpuError::DeviceLost.is_surface_error());
        assert!(GpuError::DeviceLost.is_device_loss());
        assert!(!GpuError::Timeout.is_device_loss());
    }
}
