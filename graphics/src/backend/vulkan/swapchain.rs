//! Vulkan swapchain creation and teardown.
//!
//! Frame-slot sync objects do not live here; they belong to the
//! [`FramePacer`](crate::frame::FramePacer) and are recreated together with
//! the swapchain through the same recovery/recreation paths.

use ash::vk;

use crate::error::GpuError;

/// The swapchain and the images negotiated with the surface.
pub struct SwapchainState {
    pub(super) swapchain: vk::SwapchainKHR,
    pub(super) images: Vec<vk::Image>,
    pub(super) format: vk::Format,
    pub(super) extent: vk::Extent2D,
}

impl SwapchainState {
    /// A placeholder state with no live swapchain.
    pub(super) fn null() -> Self {
        Self {
            swapchain: vk::SwapchainKHR::null(),
            images: Vec::new(),
            format: vk::Format::UNDEFINED,
            extent: vk::Extent2D {
                width: 0,
                height: 0,
            },
        }
    }

    /// Number of presentable images.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Current extent.
    pub fn extent(&self) -> (u32, u32) {
        (self.extent.width, self.extent.height)
    }
}

/// Create a swapchain for `surface` at the requested extent.
///
/// `old_swapchain` allows the driver to reuse resources across recreation;
/// the caller destroys the old handle afterwards.
pub(super) fn create_swapchain(
    surface_fn: &ash::khr::surface::Instance,
    swapchain_fn: &ash::khr::swapchain::Device,
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    width: u32,
    height: u32,
    old_swapchain: vk::SwapchainKHR,
) -> Result<SwapchainState, GpuError> {
    let capabilities = unsafe {
        surface_fn.get_physical_device_surface_capabilities(physical_device, surface)
    }
    .map_err(map_surface_error)?;

    let formats =
        unsafe { surface_fn.get_physical_device_surface_formats(physical_device, surface) }
            .map_err(map_surface_error)?;
    if formats.is_empty() {
        return Err(GpuError::Internal(
            "surface reports no supported formats".to_string(),
        ));
    }

    let present_modes = unsafe {
        surface_fn.get_physical_device_surface_present_modes(physical_device, surface)
    }
    .map_err(map_surface_error)?;

    // Prefer SRGB; fall back to whatever the surface offers first.
    let surface_format = formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .copied()
        .unwrap_or(formats[0]);

    // FIFO is always available; MAILBOX lowers latency when present.
    let present_mode = present_modes
        .iter()
        .copied()
        .find(|&mode| mode == vk::PresentModeKHR::MAILBOX)
        .unwrap_or(vk::PresentModeKHR::FIFO);

    let extent = if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    };

    let image_count = (capabilities.min_image_count + 1).min(if capabilities.max_image_count > 0 {
        capabilities.max_image_count
    } else {
        u32::MAX
    });

    let create_info = vk::SwapchainCreateInfoKHR::default()
        .surface(surface)
        .min_image_count(image_count)
        .image_format(surface_format.format)
        .image_color_space(surface_format.color_space)
        .image_extent(extent)
        .image_array_layers(1)
        .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
        .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        .pre_transform(capabilities.current_transform)
        .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
        .present_mode(present_mode)
        .clipped(true)
        .old_swapchain(old_swapchain);

    let swapchain = unsafe { swapchain_fn.create_swapchain(&create_info, None) }
        .map_err(map_surface_error)?;

    let images =
        unsafe { swapchain_fn.get_swapchain_images(swapchain) }.map_err(map_surface_error)?;

    log::info!(
        "Created swapchain: {}x{} with {} images",
        extent.width,
        extent.height,
        images.len()
    );

    Ok(SwapchainState {
        swapchain,
        images,
        format: surface_format.format,
        extent,
    })
}

/// Destroy the swapchain handle, leaving a null state behind.
pub(super) fn destroy_swapchain(
    swapchain_fn: &ash::khr::swapchain::Device,
    state: &mut SwapchainState,
) {
    if state.swapchain != vk::SwapchainKHR::null() {
        unsafe { swapchain_fn.destroy_swapchain(state.swapchain, None) };
        *state = SwapchainState::null();
    }
}

fn map_surface_error(result: vk::Result) -> GpuError {
    match result {
        vk::Result::ERROR_SURFACE_LOST_KHR => GpuError::SurfaceLost,
        vk::Result::ERROR_OUT_OF_DATE_KHR => GpuError::SurfaceOutdated,
        vk::Result::ERROR_DEVICE_LOST => GpuError::DeviceLost,
        other => GpuError::Internal(format!("swapchain operation failed: {:?}", other)),
    }
}
