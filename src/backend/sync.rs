// Synchronization primitives
//
// One FrameSync per frame slot. Created once at startup, reused for the whole
// process, never tied to a swapchain image or generation.

use anyhow::Result;
use ash::vk;

use super::VulkanDevice;
use crate::error::vk_check;

/// Frame synchronization - one per frame in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &VulkanDevice) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        // Start signaled so the first wait on each slot returns immediately
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        let device = &device.device;
        let image_available = vk_check("vkCreateSemaphore", unsafe {
            device.create_semaphore(&semaphore_info, None)
        })?;

        let render_finished = match unsafe { device.create_semaphore(&semaphore_info, None) } {
            Ok(semaphore) => semaphore,
            Err(e) => {
                unsafe { device.destroy_semaphore(image_available, None) };
                return Err(crate::EngineError::vulkan("vkCreateSemaphore", e).into());
            }
        };

        let in_flight_fence = match unsafe { device.create_fence(&fence_info, None) } {
            Ok(fence) => fence,
            Err(e) => {
                unsafe {
                    device.destroy_semaphore(render_finished, None);
                    device.destroy_semaphore(image_available, None);
                }
                return Err(crate::EngineError::vulkan("vkCreateFence", e).into());
            }
        };

        Ok(Self {
            image_available,
            render_finished,
            in_flight_fence,
        })
    }

    /// Caller guarantees the fence is signaled (or the device idle)
    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_fence(self.in_flight_fence, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_semaphore(self.image_available, None);
        }
    }
}
