//! Vulkan implementation of the [`GpuDevice`] trait.
//!
//! The timeline primitive is a Vulkan 1.2 timeline semaphore; frame-slot
//! fences and hand-off semaphores are plain binary objects. Sync objects and
//! command pools are tracked in id registries so the rest of the core can
//! hold plain handles, and a destroyed handle surfaces as
//! [`GpuError::PrimitiveInvalid`] instead of undefined behavior.
//!
//! Staging memory for transient uploads comes from `gpu-allocator`; a
//! [`StagingBuffer`] is destroyed through
//! [`destroy_staging_buffer`](VulkanDevice::destroy_staging_buffer), which a
//! renderer defers via
//! [`DeferredReclaimer`](crate::deferred::DeferredReclaimer) until the
//! submission that read it has passed on the timeline.

mod device;
mod instance;
mod swapchain;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::backend::{
    AcquiredImage, CommandBufferId, CommandBufferLevel, CommandPoolId, FenceId, GpuDevice,
    PresentOutcome, SemaphoreId, Submission,
};
use crate::error::GpuError;

pub use swapchain::SwapchainState;

/// A host-visible transfer buffer.
///
/// Safe to destroy only after the GPU work that reads it completes; pin it
/// to that submission's timeline value in a deferred reclaimer.
pub struct StagingBuffer {
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: u64,
}

impl StagingBuffer {
    /// The raw buffer handle.
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Buffer size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Copy `data` into the mapped allocation at `offset`.
    pub fn write(&mut self, offset: usize, data: &[u8]) {
        if let Some(allocation) = self.allocation.as_mut()
            && let Some(mapped) = allocation.mapped_slice_mut()
        {
            let end = offset + data.len();
            if end <= mapped.len() {
                mapped[offset..end].copy_from_slice(data);
            } else {
                log::error!(
                    "staging write out of bounds: {}..{} of {}",
                    offset,
                    end,
                    mapped.len()
                );
            }
        }
    }
}

struct Objects {
    next_id: u64,
    fences: HashMap<u64, vk::Fence>,
    semaphores: HashMap<u64, vk::Semaphore>,
    pools: HashMap<u64, vk::CommandPool>,
    /// Command buffer handle plus the id of the pool it came from.
    buffers: HashMap<u64, (vk::CommandBuffer, u64)>,
}

impl Objects {
    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Vulkan [`GpuDevice`] implementation.
pub struct VulkanDevice {
    _entry: ash::Entry,
    instance: ash::Instance,
    surface_fn: ash::khr::surface::Instance,
    swapchain_fn: ash::khr::swapchain::Device,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    queue: vk::Queue,
    queue_family: u32,
    /// vkQueueSubmit / vkQueuePresentKHR require external synchronization.
    queue_lock: Mutex<()>,
    /// The timeline primitive. Swapped out by `reset_timeline`.
    timeline: Mutex<vk::Semaphore>,
    objects: Mutex<Objects>,
    swapchain: Mutex<SwapchainState>,
    allocator: Mutex<Option<Allocator>>,
}

impl VulkanDevice {
    /// Bring up instance, surface, device, queue, timeline primitive, and
    /// swapchain for `window`.
    pub fn new(window: Arc<winit::window::Window>, validation: bool) -> Result<Self, GpuError> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::InitializationFailed(format!("failed to load Vulkan: {e}")))?;

        let display_handle = window
            .display_handle()
            .map_err(|e| GpuError::InitializationFailed(e.to_string()))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| GpuError::InitializationFailed(e.to_string()))?;

        let instance = instance::create_instance(&entry, display_handle.as_raw(), validation)?;

        let surface_fn = ash::khr::surface::Instance::new(&entry, &instance);
        let surface = unsafe {
            ash_window::create_surface(
                &entry,
                &instance,
                display_handle.as_raw(),
                window_handle.as_raw(),
                None,
            )
        }
        .map_err(|e| GpuError::InitializationFailed(format!("failed to create surface: {:?}", e)))?;

        let (physical_device, queue_family) =
            device::select_physical_device(&instance, &surface_fn, surface)?;
        let device = device::create_logical_device(&instance, physical_device, queue_family)?;
        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        let swapchain_fn = ash::khr::swapchain::Device::new(&instance, &device);

        let timeline = create_timeline_semaphore(&device, 0)?;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::InitializationFailed(format!("failed to create allocator: {e}")))?;

        let size = window.inner_size();
        let swapchain = swapchain::create_swapchain(
            &surface_fn,
            &swapchain_fn,
            physical_device,
            surface,
            size.width.max(1),
            size.height.max(1),
            vk::SwapchainKHR::null(),
        )?;

        log::info!("Vulkan device initialized");

        Ok(Self {
            _entry: entry,
            instance,
            surface_fn,
            swapchain_fn,
            surface,
            physical_device,
            device,
            queue,
            queue_family,
            queue_lock: Mutex::new(()),
            timeline: Mutex::new(timeline),
            objects: Mutex::new(Objects {
                next_id: 0,
                fences: HashMap::new(),
                semaphores: HashMap::new(),
                pools: HashMap::new(),
                buffers: HashMap::new(),
            }),
            swapchain: Mutex::new(swapchain),
            allocator: Mutex::new(Some(allocator)),
        })
    }

    /// Current swapchain extent.
    pub fn swapchain_extent(&self) -> (u32, u32) {
        self.swapchain.lock().extent()
    }

    /// Create a host-visible transfer buffer of `size` bytes.
    pub fn create_staging_buffer(&self, label: &str, size: u64) -> Result<StagingBuffer, GpuError> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }
            .map_err(map_vk_error)?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let mut allocator_guard = self.allocator.lock();
        let allocator = allocator_guard
            .as_mut()
            .ok_or_else(|| GpuError::Internal("allocator already shut down".to_string()))?;

        let allocation = allocator
            .allocate(&AllocationCreateDesc {
                name: label,
                requirements,
                location: MemoryLocation::CpuToGpu,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| {
                unsafe { self.device.destroy_buffer(buffer, None) };
                GpuError::Internal(format!("staging allocation failed: {e}"))
            })?;

        if let Err(error) = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            let _ = allocator.free(allocation);
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(map_vk_error(error));
        }

        Ok(StagingBuffer {
            buffer,
            allocation: Some(allocation),
            size,
        })
    }

    /// Destroy a staging buffer immediately.
    ///
    /// The caller must have proven GPU completion, normally by routing the
    /// buffer through a deferred reclaimer keyed on the timeline.
    pub fn destroy_staging_buffer(&self, mut staging: StagingBuffer) {
        if let Some(allocation) = staging.allocation.take()
            && let Some(allocator) = self.allocator.lock().as_mut()
            && let Err(e) = allocator.free(allocation)
        {
            log::error!("failed to free staging allocation: {e}");
        }
        unsafe { self.device.destroy_buffer(staging.buffer, None) };
    }
}

fn create_timeline_semaphore(
    device: &ash::Device,
    initial_value: u64,
) -> Result<vk::Semaphore, GpuError> {
    let mut type_info = vk::SemaphoreTypeCreateInfo::default()
        .semaphore_type(vk::SemaphoreType::TIMELINE)
        .initial_value(initial_value);
    let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
    unsafe { device.create_semaphore(&create_info, None) }.map_err(map_vk_error)
}

fn map_vk_error(result: vk::Result) -> GpuError {
    match result {
        vk::Result::TIMEOUT => GpuError::Timeout,
        vk::Result::ERROR_DEVICE_LOST => GpuError::DeviceLost,
        vk::Result::ERROR_SURFACE_LOST_KHR => GpuError::SurfaceLost,
        vk::Result::ERROR_OUT_OF_DATE_KHR => GpuError::SurfaceOutdated,
        other => GpuError::Internal(format!("Vulkan error: {:?}", other)),
    }
}

fn timeout_ns(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX)
}

fn convert_level(level: CommandBufferLevel) -> vk::CommandBufferLevel {
    match level {
        CommandBufferLevel::Primary => vk::CommandBufferLevel::PRIMARY,
        CommandBufferLevel::Secondary => vk::CommandBufferLevel::SECONDARY,
    }
}

impl GpuDevice for VulkanDevice {
    fn name(&self) -> &str {
        "Vulkan"
    }

    fn timeline_completed_value(&self) -> Result<u64, GpuError> {
        let timeline = self.timeline.lock();
        unsafe { self.device.get_semaphore_counter_value(*timeline) }.map_err(map_vk_error)
    }

    fn wait_timeline_value(&self, value: u64, timeout: Duration) -> Result<(), GpuError> {
        let semaphores = [*self.timeline.lock()];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        unsafe { self.device.wait_semaphores(&wait_info, timeout_ns(timeout)) }
            .map_err(map_vk_error)
    }

    fn reset_timeline(&self, initial_value: u64) -> Result<(), GpuError> {
        let mut timeline = self.timeline.lock();
        let fresh = create_timeline_semaphore(&self.device, initial_value)?;
        unsafe { self.device.destroy_semaphore(*timeline, None) };
        *timeline = fresh;
        log::debug!("timeline semaphore recreated at {}", initial_value);
        Ok(())
    }

    fn create_fence(&self, signaled: bool) -> Result<FenceId, GpuError> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);
        let fence =
            unsafe { self.device.create_fence(&create_info, None) }.map_err(map_vk_error)?;

        let mut objects = self.objects.lock();
        let id = objects.alloc_id();
        objects.fences.insert(id, fence);
        Ok(FenceId(id))
    }

    fn fence_status(&self, fence: FenceId) -> Result<bool, GpuError> {
        let objects = self.objects.lock();
        let fence = *objects
            .fences
            .get(&fence.0)
            .ok_or(GpuError::PrimitiveInvalid)?;
        unsafe { self.device.get_fence_status(fence) }.map_err(map_vk_error)
    }

    fn wait_fence(&self, fence: FenceId, timeout: Duration) -> Result<(), GpuError> {
        let raw = {
            let objects = self.objects.lock();
            *objects
                .fences
                .get(&fence.0)
                .ok_or(GpuError::PrimitiveInvalid)?
        };
        unsafe {
            self.device
                .wait_for_fences(&[raw], true, timeout_ns(timeout))
        }
        .map_err(map_vk_error)
    }

    fn reset_fence(&self, fence: FenceId) -> Result<(), GpuError> {
        let objects = self.objects.lock();
        let fence = *objects
            .fences
            .get(&fence.0)
            .ok_or(GpuError::PrimitiveInvalid)?;
        unsafe { self.device.reset_fences(&[fence]) }.map_err(map_vk_error)
    }

    fn destroy_fence(&self, fence: FenceId) {
        let mut objects = self.objects.lock();
        match objects.fences.remove(&fence.0) {
            Some(raw) => unsafe { self.device.destroy_fence(raw, None) },
            None => log::warn!("destroy of unknown fence {}", fence.0),
        }
    }

    fn create_semaphore(&self) -> Result<SemaphoreId, GpuError> {
        let create_info = vk::SemaphoreCreateInfo::default();
        let semaphore =
            unsafe { self.device.create_semaphore(&create_info, None) }.map_err(map_vk_error)?;

        let mut objects = self.objects.lock();
        let id = objects.alloc_id();
        objects.semaphores.insert(id, semaphore);
        Ok(SemaphoreId(id))
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreId) {
        let mut objects = self.objects.lock();
        match objects.semaphores.remove(&semaphore.0) {
            Some(raw) => unsafe { self.device.destroy_semaphore(raw, None) },
            None => log::warn!("destroy of unknown semaphore {}", semaphore.0),
        }
    }

    fn submit(&self, submission: &Submission<'_>) -> Result<(), GpuError> {
        let objects = self.objects.lock();

        let command_buffers = submission
            .command_buffers
            .iter()
            .map(|id| {
                objects
                    .buffers
                    .get(&id.0)
                    .map(|(raw, _)| *raw)
                    .ok_or(GpuError::PrimitiveInvalid)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let wait_semaphores = submission
            .wait_semaphores
            .iter()
            .map(|id| {
                objects
                    .semaphores
                    .get(&id.0)
                    .copied()
                    .ok_or(GpuError::PrimitiveInvalid)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut signal_semaphores = submission
            .signal_semaphores
            .iter()
            .map(|id| {
                objects
                    .semaphores
                    .get(&id.0)
                    .copied()
                    .ok_or(GpuError::PrimitiveInvalid)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let fence = match submission.fence {
            Some(id) => *objects.fences.get(&id.0).ok_or(GpuError::PrimitiveInvalid)?,
            None => vk::Fence::null(),
        };

        // Binary semaphores carry a placeholder value; the timeline entry
        // carries the reserved completion value.
        let mut signal_values = vec![0u64; signal_semaphores.len()];
        let timeline = self.timeline.lock();
        if let Some(value) = submission.signal_timeline_value {
            signal_semaphores.push(*timeline);
            signal_values.push(value);
        }

        let wait_values = vec![0u64; wait_semaphores.len()];
        let wait_stages =
            vec![vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT; wait_semaphores.len()];

        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::default()
            .wait_semaphore_values(&wait_values)
            .signal_semaphore_values(&signal_values);

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info);

        let _queue = self.queue_lock.lock();
        unsafe { self.device.queue_submit(self.queue, &[submit_info], fence) }.map_err(map_vk_error)
    }

    fn acquire_image(
        &self,
        signal: SemaphoreId,
        timeout: Duration,
    ) -> Result<AcquiredImage, GpuError> {
        let semaphore = {
            let objects = self.objects.lock();
            *objects
                .semaphores
                .get(&signal.0)
                .ok_or(GpuError::PrimitiveInvalid)?
        };
        let swapchain = self.swapchain.lock();

        match unsafe {
            self.swapchain_fn.acquire_next_image(
                swapchain.swapchain,
                timeout_ns(timeout),
                semaphore,
                vk::Fence::null(),
            )
        } {
            Ok((index, suboptimal)) => Ok(AcquiredImage { index, suboptimal }),
            Err(vk::Result::NOT_READY) => Err(GpuError::Timeout),
            Err(error) => Err(map_vk_error(error)),
        }
    }

    fn present(&self, image_index: u32, wait: SemaphoreId) -> Result<PresentOutcome, GpuError> {
        let semaphore = {
            let objects = self.objects.lock();
            *objects
                .semaphores
                .get(&wait.0)
                .ok_or(GpuError::PrimitiveInvalid)?
        };
        let swapchain = self.swapchain.lock();

        let wait_semaphores = [semaphore];
        let swapchains = [swapchain.swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let _queue = self.queue_lock.lock();
        match unsafe { self.swapchain_fn.queue_present(self.queue, &present_info) } {
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Ok(false) => Ok(PresentOutcome::Optimal),
            Err(error) => Err(map_vk_error(error)),
        }
    }

    fn recreate_swapchain(&self, width: u32, height: u32) -> Result<(), GpuError> {
        let mut state = self.swapchain.lock();
        let old = state.swapchain;
        let fresh = swapchain::create_swapchain(
            &self.surface_fn,
            &self.swapchain_fn,
            self.physical_device,
            self.surface,
            width,
            height,
            old,
        )?;
        if old != vk::SwapchainKHR::null() {
            unsafe { self.swapchain_fn.destroy_swapchain(old, None) };
        }
        *state = fresh;
        Ok(())
    }

    fn create_command_pool(&self, _level: CommandBufferLevel) -> Result<CommandPoolId, GpuError> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(self.queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = unsafe { self.device.create_command_pool(&create_info, None) }
            .map_err(map_vk_error)?;

        let mut objects = self.objects.lock();
        let id = objects.alloc_id();
        objects.pools.insert(id, pool);
        Ok(CommandPoolId(id))
    }

    fn allocate_command_buffers(
        &self,
        pool: CommandPoolId,
        level: CommandBufferLevel,
        count: u32,
    ) -> Result<Vec<CommandBufferId>, GpuError> {
        let raw_pool = {
            let objects = self.objects.lock();
            *objects
                .pools
                .get(&pool.0)
                .ok_or(GpuError::PrimitiveInvalid)?
        };

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(raw_pool)
            .level(convert_level(level))
            .command_buffer_count(count);

        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .map_err(map_vk_error)?;

        let mut objects = self.objects.lock();
        Ok(buffers
            .into_iter()
            .map(|raw| {
                let id = objects.alloc_id();
                objects.buffers.insert(id, (raw, pool.0));
                CommandBufferId(id)
            })
            .collect())
    }

    fn reset_command_pool(&self, pool: CommandPoolId) -> Result<(), GpuError> {
        let raw = {
            let objects = self.objects.lock();
            *objects
                .pools
                .get(&pool.0)
                .ok_or(GpuError::PrimitiveInvalid)?
        };
        unsafe {
            self.device
                .reset_command_pool(raw, vk::CommandPoolResetFlags::empty())
        }
        .map_err(map_vk_error)
    }

    fn destroy_command_pool(&self, pool: CommandPoolId) {
        let mut objects = self.objects.lock();
        match objects.pools.remove(&pool.0) {
            Some(raw) => {
                // Pool destruction frees its buffers; drop their registry
                // entries so stale ids surface as PrimitiveInvalid.
                objects.buffers.retain(|_, (_, owner)| *owner != pool.0);
                unsafe { self.device.destroy_command_pool(raw, None) };
            }
            None => log::warn!("destroy of unknown command pool {}", pool.0),
        }
    }

    fn wait_idle(&self) -> Result<(), GpuError> {
        unsafe { self.device.device_wait_idle() }.map_err(map_vk_error)
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            let mut objects = self.objects.lock();
            for (_, fence) in objects.fences.drain() {
                self.device.destroy_fence(fence, None);
            }
            for (_, semaphore) in objects.semaphores.drain() {
                self.device.destroy_semaphore(semaphore, None);
            }
            objects.buffers.clear();
            for (_, pool) in objects.pools.drain() {
                self.device.destroy_command_pool(pool, None);
            }
            drop(objects);

            self.device.destroy_semaphore(*self.timeline.lock(), None);

            swapchain::destroy_swapchain(&self.swapchain_fn, &mut self.swapchain.lock());

            // The allocator must go before the device.
            drop(self.allocator.lock().take());

            self.device.destroy_device(None);
            self.surface_fn.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
    }
}
