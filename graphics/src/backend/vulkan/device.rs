//! Vulkan physical and logical device management.

use std::ffi::CStr;

use ash::vk;

use crate::error::GpuError;

/// Select the best physical device that can present to `surface` and
/// supports timeline semaphores.
///
/// Prefers discrete GPUs over integrated GPUs.
pub fn select_physical_device(
    instance: &ash::Instance,
    surface_fn: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
) -> Result<(vk::PhysicalDevice, u32), GpuError> {
    let devices = unsafe { instance.enumerate_physical_devices() }.map_err(|e| {
        GpuError::InitializationFailed(format!("failed to enumerate physical devices: {:?}", e))
    })?;

    if devices.is_empty() {
        return Err(GpuError::InitializationFailed(
            "no Vulkan-capable GPU found".to_string(),
        ));
    }

    let mut best: Option<(vk::PhysicalDevice, u32)> = None;
    let mut best_score = 0;

    for device in devices {
        let Some(queue_family) = find_queue_family(instance, device, surface_fn, surface) else {
            continue;
        };
        if !supports_timeline_semaphores(instance, device) {
            continue;
        }

        let properties = unsafe { instance.get_physical_device_properties(device) };

        let mut score = 1;
        if properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            score += 1000;
        } else if properties.device_type == vk::PhysicalDeviceType::INTEGRATED_GPU {
            score += 100;
        }
        score += properties.limits.max_image_dimension2_d / 1024;

        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) };
        log::info!(
            "Found GPU: {:?} (type: {:?}, score: {})",
            device_name,
            properties.device_type,
            score
        );

        if score > best_score {
            best_score = score;
            best = Some((device, queue_family));
        }
    }

    best.ok_or_else(|| {
        GpuError::InitializationFailed(
            "no GPU with presentation and timeline semaphore support".to_string(),
        )
    })
}

/// Find a queue family supporting both graphics and presentation to `surface`.
pub fn find_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    surface_fn: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
) -> Option<u32> {
    let queue_families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    for (index, family) in queue_families.iter().enumerate() {
        let supports_graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
        let supports_surface = unsafe {
            surface_fn
                .get_physical_device_surface_support(physical_device, index as u32, surface)
                .unwrap_or(false)
        };
        if supports_graphics && supports_surface {
            return Some(index as u32);
        }
    }
    None
}

/// Whether the device exposes the Vulkan 1.2 timeline semaphore feature.
fn supports_timeline_semaphores(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> bool {
    let mut vulkan_12 = vk::PhysicalDeviceVulkan12Features::default();
    let mut features = vk::PhysicalDeviceFeatures2::default().push_next(&mut vulkan_12);
    unsafe { instance.get_physical_device_features2(physical_device, &mut features) };
    vulkan_12.timeline_semaphore == vk::TRUE
}

/// Create a logical device with the swapchain extension and timeline
/// semaphores enabled.
pub fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
) -> Result<ash::Device, GpuError> {
    let queue_priorities = [1.0f32];
    let queue_create_info = vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family)
        .queue_priorities(&queue_priorities);
    let queue_create_infos = [queue_create_info];

    let device_extensions = [ash::khr::swapchain::NAME.as_ptr()];

    let features = vk::PhysicalDeviceFeatures::default();
    let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default().timeline_semaphore(true);

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&device_extensions)
        .enabled_features(&features)
        .push_next(&mut vulkan_12_features);

    let device =
        unsafe { instance.create_device(physical_device, &create_info, None) }.map_err(|e| {
            GpuError::InitializationFailed(format!("failed to create logical device: {:?}", e))
        })?;

    Ok(device)
}
