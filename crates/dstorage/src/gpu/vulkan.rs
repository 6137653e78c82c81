//! Vulkan transfer device.
//!
//! Staging buffers are host-visible, host-coherent `VkBuffer`s. Each copy is
//! recorded into a one-shot command buffer, submitted with a fence and
//! waited on by the calling worker. Queue submission and command-pool use
//! are serialized by one mutex.
//!
//! The device either borrows caller-owned Vulkan objects (never destroyed
//! here) or creates its own instance, logical device and command pool.
//! Owned objects are destroyed in reverse creation order after
//! `vkDeviceWaitIdle`.

#![allow(unsafe_code)]

use std::collections::HashMap;
use std::ffi::CStr;
use std::ptr::NonNull;
use std::sync::Mutex;
use std::time::Duration;

use ash::vk::{self, Handle};

use super::device::{BufferCopy, CopyDirection, DeviceError, StagingAllocation, TransferDevice};
use crate::report_error;

const SUBSYSTEM: &str = "vulkan";
const APP_NAME: &CStr = c"dstorage";

/// Caller-owned Vulkan objects to run transfers on.
pub struct BorrowedVulkan {
    pub instance: ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
    pub queue: vk::Queue,
    pub queue_family_index: u32,
    /// Created and owned by the [`VulkanDevice`] when absent.
    pub command_pool: Option<vk::CommandPool>,
}

/// Vulkan initialization failure.
#[derive(Debug, thiserror::Error)]
pub enum VulkanInitError {
    #[error("failed to load the Vulkan loader: {0}")]
    Loader(#[from] ash::LoadingError),

    #[error("{call} failed: {result}")]
    Call {
        call: &'static str,
        result: vk::Result,
    },

    #[error("no Vulkan physical device found")]
    NoPhysicalDevice,

    #[error("no transfer-capable queue family found")]
    NoTransferQueue,
}

impl VulkanInitError {
    pub fn errno(&self) -> i32 {
        match self {
            Self::NoPhysicalDevice | Self::NoTransferQueue => libc::ENODEV,
            Self::Loader(_) | Self::Call { .. } => libc::EIO,
        }
    }

    fn operation(&self) -> &'static str {
        match self {
            Self::Loader(_) => "vkGetInstanceProcAddr",
            Self::Call { call, .. } => *call,
            Self::NoPhysicalDevice => "vkEnumeratePhysicalDevices",
            Self::NoTransferQueue => "vkGetPhysicalDeviceQueueFamilyProperties",
        }
    }
}

fn create_command_pool(
    device: &ash::Device,
    queue_family_index: u32,
) -> Result<vk::CommandPool, VulkanInitError> {
    let pool_info = vk::CommandPoolCreateInfo::default()
        .queue_family_index(queue_family_index)
        .flags(
            vk::CommandPoolCreateFlags::TRANSIENT | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        );
    // SAFETY: `device` is live and was created with `queue_family_index`.
    unsafe { device.create_command_pool(&pool_info, None) }.map_err(call_failed("vkCreateCommandPool"))
}

fn call_failed(call: &'static str) -> impl FnOnce(vk::Result) -> VulkanInitError {
    move |result| VulkanInitError::Call { call, result }
}

struct StagingBuffer {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
}

/// [`TransferDevice`] backed by a Vulkan queue.
pub struct VulkanDevice {
    // Kept alive for owned instances; `None` when everything is borrowed.
    _entry: Option<ash::Entry>,
    instance: ash::Instance,
    device: ash::Device,
    queue: vk::Queue,
    command_pool: vk::CommandPool,
    memory_props: vk::PhysicalDeviceMemoryProperties,
    owns_instance: bool,
    owns_device: bool,
    owns_command_pool: bool,
    submit_lock: Mutex<()>,
    staging: Mutex<HashMap<u64, StagingBuffer>>,
}

impl VulkanDevice {
    /// Creates an instance, picks the first physical device and its first
    /// transfer-capable queue family, and creates a device and command pool.
    pub fn create() -> Result<Self, VulkanInitError> {
        Self::create_owned().inspect_err(|e| {
            report_error!(SUBSYSTEM, e.operation(), e.to_string(), e.errno());
        })
    }

    fn create_owned() -> Result<Self, VulkanInitError> {
        // SAFETY: loading the system Vulkan loader; the entry outlives every
        // object created from it because it is stored in `Self`.
        let entry = unsafe { ash::Entry::load()? };

        let app_info = vk::ApplicationInfo::default()
            .application_name(APP_NAME)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(APP_NAME)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_0);
        let instance_info = vk::InstanceCreateInfo::default().application_info(&app_info);
        // SAFETY: `instance_info` and everything it points to are live.
        let instance = unsafe { entry.create_instance(&instance_info, None) }
            .map_err(call_failed("vkCreateInstance"))?;

        let (physical_device, device, queue_family_index) = match Self::create_device(&instance) {
            Ok(created) => created,
            Err(e) => {
                // SAFETY: no child objects were created from the instance.
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };
        let command_pool = match create_command_pool(&device, queue_family_index) {
            Ok(pool) => pool,
            Err(e) => {
                // SAFETY: both objects were created above and are idle.
                unsafe {
                    device.destroy_device(None);
                    instance.destroy_instance(None);
                }
                return Err(e);
            }
        };
        // SAFETY: queue 0 of the family requested at device creation.
        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };

        let mut this = Self::from_borrowed(BorrowedVulkan {
            instance,
            physical_device,
            device,
            queue,
            queue_family_index,
            command_pool: Some(command_pool),
        })?;
        this._entry = Some(entry);
        this.owns_instance = true;
        this.owns_device = true;
        this.owns_command_pool = true;
        Ok(this)
    }

    fn create_device(
        instance: &ash::Instance,
    ) -> Result<(vk::PhysicalDevice, ash::Device, u32), VulkanInitError> {
        // SAFETY: `instance` is a live instance.
        let physical_device = unsafe { instance.enumerate_physical_devices() }
            .map_err(call_failed("vkEnumeratePhysicalDevices"))?
            .into_iter()
            .next()
            .ok_or(VulkanInitError::NoPhysicalDevice)?;

        // SAFETY: `physical_device` was enumerated from `instance`.
        let families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let queue_family_index = families
            .iter()
            .position(|family| {
                family.queue_count > 0
                    && family.queue_flags.intersects(
                        vk::QueueFlags::TRANSFER | vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
                    )
            })
            .and_then(|index| u32::try_from(index).ok())
            .ok_or(VulkanInitError::NoTransferQueue)?;

        let priorities = [1.0_f32];
        let queue_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family_index)
            .queue_priorities(&priorities);
        let device_info =
            vk::DeviceCreateInfo::default().queue_create_infos(std::slice::from_ref(&queue_info));
        // SAFETY: `device_info` and everything it points to are live.
        let device = unsafe { instance.create_device(physical_device, &device_info, None) }
            .map_err(call_failed("vkCreateDevice"))?;

        Ok((physical_device, device, queue_family_index))
    }

    /// Runs transfers on caller-owned objects. The instance, device and queue
    /// are never destroyed by this type; a command pool is created if none
    /// was supplied and destroyed on drop.
    ///
    /// On error, nothing supplied by the caller has been destroyed.
    pub fn from_borrowed(borrowed: BorrowedVulkan) -> Result<Self, VulkanInitError> {
        let BorrowedVulkan {
            instance,
            physical_device,
            device,
            queue,
            queue_family_index,
            command_pool,
        } = borrowed;

        let (command_pool, owns_command_pool) = match command_pool {
            Some(pool) => (pool, false),
            None => (create_command_pool(&device, queue_family_index)?, true),
        };

        // SAFETY: `physical_device` belongs to `instance`.
        let memory_props =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        Ok(Self {
            _entry: None,
            instance,
            device,
            queue,
            command_pool,
            memory_props,
            owns_instance: false,
            owns_device: false,
            owns_command_pool,
            submit_lock: Mutex::new(()),
            staging: Mutex::new(HashMap::new()),
        })
    }

    /// Keeps `entry` loaded for as long as this device lives. Needed when the
    /// borrowed handles' function tables were resolved through it.
    #[must_use]
    pub fn with_loader(mut self, entry: ash::Entry) -> Self {
        self._entry = Some(entry);
        self
    }

    fn find_memory_type(&self, type_bits: u32, flags: vk::MemoryPropertyFlags) -> Option<u32> {
        let count = self.memory_props.memory_type_count as usize;
        self.memory_props.memory_types[..count]
            .iter()
            .enumerate()
            .find(|(index, ty)| {
                type_bits & (1u32 << *index) != 0 && ty.property_flags.contains(flags)
            })
            .and_then(|(index, _)| u32::try_from(index).ok())
    }

    fn staging_memory(&self, id: u64) -> Option<vk::DeviceMemory> {
        self.staging
            .lock()
            .expect("staging table lock poisoned")
            .get(&id)
            .map(|staging| staging.memory)
    }

    fn record_and_submit(
        &self,
        copy: &BufferCopy,
        staging: vk::Buffer,
        fence_timeout: Duration,
    ) -> Result<(), DeviceError> {
        let device_buffer = vk::Buffer::from_raw(copy.device_buffer.as_raw());
        let (src, dst, src_offset, dst_offset) = match copy.direction {
            CopyDirection::StagingToDevice => (staging, device_buffer, 0, copy.device_offset),
            CopyDirection::DeviceToStaging => (device_buffer, staging, copy.device_offset, 0),
        };
        let region = vk::BufferCopy {
            src_offset,
            dst_offset,
            size: copy.size as u64,
        };

        let _submit = self.submit_lock.lock().expect("vulkan submit lock poisoned");

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        // SAFETY: the command pool is externally synchronized by
        // `submit_lock`.
        let cmd = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .map_err(|e| DeviceError::Copy(format!("vkAllocateCommandBuffers: {e}")))?[0];

        let result = self.submit_with_fence(cmd, src, dst, region, fence_timeout);

        // SAFETY: on success or failure the buffer is no longer pending:
        // either it never reached the queue, the fence signalled, or we
        // waited for the device to go idle.
        unsafe { self.device.free_command_buffers(self.command_pool, &[cmd]) };
        result
    }

    fn submit_with_fence(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
        fence_timeout: Duration,
    ) -> Result<(), DeviceError> {
        let begin_info =
            vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        // SAFETY: `cmd` was just allocated and is recorded by this thread
        // only, under `submit_lock`.
        unsafe {
            self.device
                .begin_command_buffer(cmd, &begin_info)
                .map_err(|e| DeviceError::Copy(format!("vkBeginCommandBuffer: {e}")))?;
            self.device.cmd_copy_buffer(cmd, src, dst, &[region]);
            self.device
                .end_command_buffer(cmd)
                .map_err(|e| DeviceError::Copy(format!("vkEndCommandBuffer: {e}")))?;
        }

        // SAFETY: plain fence creation on a live device.
        let fence = unsafe { self.device.create_fence(&vk::FenceCreateInfo::default(), None) }
            .map_err(|e| DeviceError::Device(format!("vkCreateFence: {e}")))?;

        let cmds = [cmd];
        let submit_info = vk::SubmitInfo::default().command_buffers(&cmds);
        // SAFETY: queue access is serialized by `submit_lock`; `cmd` is in
        // the executable state.
        let submitted = unsafe {
            self.device
                .queue_submit(self.queue, &[submit_info], fence)
                .map_err(|e| DeviceError::Copy(format!("vkQueueSubmit: {e}")))
        };

        let result = submitted.and_then(|()| {
            let timeout_ns = u64::try_from(fence_timeout.as_nanos()).unwrap_or(u64::MAX);
            // SAFETY: `fence` is live and was passed to the submission.
            match unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) } {
                Ok(()) => Ok(()),
                Err(vk::Result::TIMEOUT) => {
                    // The copy is still in flight; the fence and command buffer
                    // cannot be freed until it finishes.
                    // SAFETY: live device.
                    let _ = unsafe { self.device.device_wait_idle() };
                    Err(DeviceError::FenceTimeout(fence_timeout))
                }
                Err(e) => Err(DeviceError::Device(format!("vkWaitForFences: {e}"))),
            }
        });

        // SAFETY: the fence is unsignalled-and-unused or its work completed.
        unsafe { self.device.destroy_fence(fence, None) };
        result
    }
}

impl std::fmt::Debug for VulkanDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanDevice")
            .field("owns_instance", &self.owns_instance)
            .field("owns_device", &self.owns_device)
            .field("owns_command_pool", &self.owns_command_pool)
            .finish_non_exhaustive()
    }
}

// SAFETY: staging memory is allocated HOST_VISIBLE | HOST_COHERENT and
// mapped for its full size; the device only touches it during
// `copy_buffer`, which the staging backend never calls while mapped.
unsafe impl TransferDevice for VulkanDevice {
    fn name(&self) -> &'static str {
        SUBSYSTEM
    }

    fn allocate_staging(&self, size: usize) -> Result<StagingAllocation, DeviceError> {
        let alloc_failed = |reason: String| DeviceError::Allocation { size, reason };

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size as u64)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        // SAFETY: live device, valid create info.
        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }
            .map_err(|e| alloc_failed(format!("vkCreateBuffer: {e}")))?;

        // SAFETY: `buffer` was just created on this device.
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let destroy_buffer = || {
            // SAFETY: `buffer` has no bound memory and is unused.
            unsafe { self.device.destroy_buffer(buffer, None) };
        };

        let Some(memory_type_index) = self.find_memory_type(
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ) else {
            destroy_buffer();
            return Err(alloc_failed(
                "no host-visible, host-coherent memory type".to_owned(),
            ));
        };

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        // SAFETY: live device, valid allocate info.
        let memory = match unsafe { self.device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(e) => {
                destroy_buffer();
                return Err(alloc_failed(format!("vkAllocateMemory: {e}")));
            }
        };

        // SAFETY: `memory` satisfies `requirements` for `buffer`.
        if let Err(e) = unsafe { self.device.bind_buffer_memory(buffer, memory, 0) } {
            // SAFETY: neither object is in use.
            unsafe { self.device.free_memory(memory, None) };
            destroy_buffer();
            return Err(alloc_failed(format!("vkBindBufferMemory: {e}")));
        }

        let id = buffer.as_raw();
        self.staging
            .lock()
            .expect("staging table lock poisoned")
            .insert(id, StagingBuffer { buffer, memory });
        Ok(StagingAllocation::new(id, size))
    }

    fn map_staging(&self, staging: &StagingAllocation) -> Result<NonNull<u8>, DeviceError> {
        let memory = self
            .staging_memory(staging.id())
            .ok_or_else(|| DeviceError::Map(format!("unknown staging buffer {:#x}", staging.id())))?;
        // SAFETY: host-visible memory not currently mapped.
        let ptr = unsafe {
            self.device
                .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
        }
        .map_err(|e| DeviceError::Map(format!("vkMapMemory: {e}")))?;
        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| DeviceError::Map("vkMapMemory returned null".to_owned()))
    }

    fn unmap_staging(&self, staging: &StagingAllocation) {
        if let Some(memory) = self.staging_memory(staging.id()) {
            // SAFETY: `memory` is currently mapped by `map_staging`.
            unsafe { self.device.unmap_memory(memory) };
        }
    }

    fn copy_buffer(&self, copy: &BufferCopy, fence_timeout: Duration) -> Result<(), DeviceError> {
        let staging = self
            .staging
            .lock()
            .expect("staging table lock poisoned")
            .get(&copy.staging)
            .map(|staging| staging.buffer)
            .ok_or_else(|| DeviceError::Copy(format!("unknown staging buffer {:#x}", copy.staging)))?;
        self.record_and_submit(copy, staging, fence_timeout)
    }

    fn release_staging(&self, staging: &StagingAllocation) {
        let removed = self
            .staging
            .lock()
            .expect("staging table lock poisoned")
            .remove(&staging.id());
        if let Some(StagingBuffer { buffer, memory }) = removed {
            // SAFETY: no pending device work references the buffer (the
            // backend waits idle after a fence timeout).
            unsafe {
                self.device.destroy_buffer(buffer, None);
                self.device.free_memory(memory, None);
            }
        }
    }

    fn wait_idle(&self) -> Result<(), DeviceError> {
        // vkDeviceWaitIdle externally synchronizes every queue of the device.
        let _submit = self.submit_lock.lock().expect("vulkan submit lock poisoned");
        // SAFETY: live device; queue access is serialized by `submit_lock`.
        unsafe { self.device.device_wait_idle() }
            .map_err(|e| DeviceError::Device(format!("vkDeviceWaitIdle: {e}")))
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        // SAFETY: teardown of objects created from this device; waiting idle
        // first guarantees none are in use.
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                tracing::warn!(error = %e, "vkDeviceWaitIdle failed during teardown");
            }
            let leftovers: Vec<StagingBuffer> = self
                .staging
                .get_mut()
                .map(|table| table.drain().map(|(_, staging)| staging).collect())
                .unwrap_or_default();
            for StagingBuffer { buffer, memory } in leftovers {
                self.device.destroy_buffer(buffer, None);
                self.device.free_memory(memory, None);
            }
            if self.owns_command_pool {
                self.device.destroy_command_pool(self.command_pool, None);
            }
            if self.owns_device {
                self.device.destroy_device(None);
            }
            if self.owns_instance {
                self.instance.destroy_instance(None);
            }
        }
    }
}
