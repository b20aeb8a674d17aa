// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Physical device selection (first device with graphics + present families)
// - Logical device + queue creation
// - Device lifetime: destroyed only after the GPU is idle

use anyhow::{Context, Result};
use ash::prelude::VkResult;
use ash::vk;
use std::ffi::CStr;
use std::sync::Arc;

use super::InstanceContext;
use crate::error::{vk_check, EngineError};

/// Queue family indices for the two capabilities the engine needs.
/// Both may point at the same family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics_family: Option<u32>,
    pub present_family: Option<u32>,
}

impl QueueFamilyIndices {
    /// Scan queue families in order, keeping the first graphics-capable one
    /// and the first one that can present to the surface.
    pub fn find<F>(families: &[vk::QueueFamilyProperties], mut supports_present: F) -> VkResult<Self>
    where
        F: FnMut(u32) -> VkResult<bool>,
    {
        let mut indices = Self::default();

        for (i, family) in families.iter().enumerate() {
            let i = i as u32;

            if indices.graphics_family.is_none()
                && family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            {
                indices.graphics_family = Some(i);
            }

            if indices.present_family.is_none() && supports_present(i)? {
                indices.present_family = Some(i);
            }

            if indices.is_complete() {
                break;
            }
        }

        Ok(indices)
    }

    pub fn is_complete(&self) -> bool {
        self.graphics_family.is_some() && self.present_family.is_some()
    }

    /// Distinct family indices, graphics first
    pub fn unique(&self) -> Vec<u32> {
        let mut unique = Vec::with_capacity(2);
        for index in [self.graphics_family, self.present_family].into_iter().flatten() {
            if !unique.contains(&index) {
                unique.push(index);
            }
        }
        unique
    }
}

/// What device selection needs from the instance. Implemented by
/// `InstanceContext`; tests provide fabricated devices.
pub trait PhysicalDeviceSource {
    type Device: Copy;

    fn physical_devices(&self) -> VkResult<Vec<Self::Device>>;
    fn queue_families(&self, device: Self::Device) -> Vec<vk::QueueFamilyProperties>;
    fn supports_present(&self, device: Self::Device, family: u32) -> VkResult<bool>;
}

impl PhysicalDeviceSource for InstanceContext {
    type Device = vk::PhysicalDevice;

    fn physical_devices(&self) -> VkResult<Vec<vk::PhysicalDevice>> {
        unsafe { self.instance.enumerate_physical_devices() }
    }

    fn queue_families(&self, device: vk::PhysicalDevice) -> Vec<vk::QueueFamilyProperties> {
        unsafe { self.instance.get_physical_device_queue_family_properties(device) }
    }

    fn supports_present(&self, device: vk::PhysicalDevice, family: u32) -> VkResult<bool> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_support(device, family, self.surface)
        }
    }
}

/// A device that passed the queue family check. Discarded once the logical
/// device exists.
#[derive(Debug, Clone, Copy)]
pub struct PhysicalDeviceCandidate<D> {
    pub device: D,
    pub indices: QueueFamilyIndices,
}

/// First usable device wins; there is no scoring of discrete vs integrated.
pub fn select_candidate<S: PhysicalDeviceSource>(
    source: &S,
) -> Result<PhysicalDeviceCandidate<S::Device>, EngineError> {
    let devices = vk_check("vkEnumeratePhysicalDevices", source.physical_devices())?;

    if devices.is_empty() {
        log::error!("No Vulkan-capable GPU found");
        return Err(EngineError::NoSuitableDevice);
    }

    for device in devices {
        let families = source.queue_families(device);
        let indices = vk_check(
            "vkGetPhysicalDeviceSurfaceSupportKHR",
            QueueFamilyIndices::find(&families, |family| source.supports_present(device, family)),
        )?;

        if indices.is_complete() {
            return Ok(PhysicalDeviceCandidate { device, indices });
        }
    }

    Err(EngineError::NoSuitableDevice)
}

/// Logical device with its graphics and present queues.
///
/// The queues alias the same `VkQueue` when both families are equal.
pub struct VulkanDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,

    // Queue handles
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub queue_families: QueueFamilyIndices,

    pub properties: vk::PhysicalDeviceProperties,

    // Keeps the instance and surface alive until the device is gone
    instance: Arc<InstanceContext>,
}

impl VulkanDevice {
    pub fn new(instance: Arc<InstanceContext>) -> Result<Arc<Self>> {
        // Step 1: Pick physical device (GPU)
        let candidate = select_candidate(instance.as_ref())?;
        let physical_device = candidate.device;
        let queue_families = candidate.indices;

        let properties = unsafe {
            instance.instance.get_physical_device_properties(physical_device)
        };

        log::info!("Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
                .to_string_lossy());
        log::info!("API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version));
        log::info!("Queue families: graphics={:?} present={:?}",
            queue_families.graphics_family,
            queue_families.present_family);

        // Step 2: Create logical device
        let (device, graphics_queue, present_queue) =
            Self::create_logical_device(&instance.instance, physical_device, &queue_families)?;

        Ok(Arc::new(Self {
            device,
            physical_device,
            graphics_queue,
            present_queue,
            queue_families,
            properties,
            instance,
        }))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        indices: &QueueFamilyIndices,
    ) -> Result<(ash::Device, vk::Queue, vk::Queue)> {
        let graphics_family = indices.graphics_family.context("Missing graphics queue family")?;
        let present_family = indices.present_family.context("Missing present queue family")?;

        let queue_priorities = [1.0];
        let queue_create_infos: Vec<_> = indices
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let features = vk::PhysicalDeviceFeatures::builder()
            .sampler_anisotropy(true)
            .sample_rate_shading(true)
            .build();

        let extensions = [ash::extensions::khr::Swapchain::name().as_ptr()];

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = vk_check("vkCreateDevice", unsafe {
            instance.create_device(physical_device, &create_info, None)
        })?;

        let (graphics_queue, present_queue) = unsafe {
            (
                device.get_device_queue(graphics_family, 0),
                device.get_device_queue(present_family, 0),
            )
        };

        Ok((device, graphics_queue, present_queue))
    }

    pub fn instance(&self) -> &Arc<InstanceContext> {
        &self.instance
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        vk_check("vkDeviceWaitIdle", unsafe { self.device.device_wait_idle() })?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        if let Err(e) = self.wait_idle() {
            log::error!("Device did not go idle before destruction: {:#}", e);
        }

        unsafe {
            self.device.destroy_device(None);
        }
    }
}
