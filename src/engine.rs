// Engine - single owner of the GPU context
//
// Built once at startup, driven once per frame from the render thread.
// Field order is drop order: frame slots, swapchain, device, instance.

use anyhow::Result;
use std::sync::Arc;

use crate::backend::frame::VulkanFrameBackend;
use crate::backend::swapchain::SwapchainBackend;
use crate::backend::{
    CommandBufferProvider, FrameDataUpdater, FrameScheduler, FrameStatus, InstanceContext,
    Swapchain, SwapchainManager, VulkanDevice,
};
use crate::config::Config;
use crate::surface::{ResizeFlag, SurfaceProvider};

pub struct Engine {
    scheduler: FrameScheduler,
    swapchain: SwapchainManager,
    device: Arc<VulkanDevice>,
    instance: Arc<InstanceContext>,
    resize: ResizeFlag,
}

impl Engine {
    /// Instance and surface, device, first swapchain generation, frame slots
    pub fn new(config: &Config, surface: Arc<dyn SurfaceProvider>) -> Result<Self> {
        log::info!("Initializing Vulkan...");

        let instance = Arc::new(InstanceContext::new(config, surface.as_ref())?);
        let device = VulkanDevice::new(instance.clone())?;

        let extent_hint = surface.framebuffer_size();
        let swapchain = SwapchainManager::new(device.clone(), surface, extent_hint)?;
        let scheduler = FrameScheduler::new(device.clone())?;

        log::info!("Vulkan initialized successfully!");

        Ok(Self {
            scheduler,
            swapchain,
            device,
            instance,
            resize: ResizeFlag::new(),
        })
    }

    /// Handle for the window layer to report resizes through
    pub fn resize_flag(&self) -> ResizeFlag {
        self.resize.clone()
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }

    pub fn instance(&self) -> &Arc<InstanceContext> {
        &self.instance
    }

    /// Current swapchain generation, `None` while suspended
    pub fn swapchain(&self) -> Option<&Swapchain> {
        self.swapchain.current()
    }

    /// Render one frame. The command-buffer provider is told about every new
    /// swapchain generation before it is asked for command buffers again.
    pub fn draw_frame<C, U>(&mut self, commands: &mut C, updater: &mut U) -> Result<FrameStatus>
    where
        C: CommandBufferProvider + ?Sized,
        U: FrameDataUpdater + ?Sized,
    {
        if self.swapchain.is_suspended()
            && !resume_if_resized(&mut self.swapchain, &self.resize, |swapchain| {
                commands.swapchain_rebuilt(swapchain)
            })?
        {
            return Ok(FrameStatus::Suspended);
        }

        let status = {
            let mut backend = VulkanFrameBackend {
                device: self.device.as_ref(),
                swapchain: &mut self.swapchain,
            };
            self.scheduler
                .draw_frame(&mut backend, commands, updater, &self.resize)?
        };

        if status.swapchain_rebuilt() {
            if let Some(swapchain) = self.swapchain.current() {
                commands.swapchain_rebuilt(swapchain)?;
            }
        }

        Ok(status)
    }

    /// Wait for device to be idle (e.g., before the caller frees its own
    /// GPU objects)
    pub fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }
}

/// Only a resize can bring a zero-area surface back. Returns whether a
/// generation exists afterwards; `rebuilt` sees it before any frame does.
fn resume_if_resized<B, F>(
    swapchain: &mut SwapchainManager<B>,
    resize: &ResizeFlag,
    mut rebuilt: F,
) -> Result<bool>
where
    B: SwapchainBackend,
    F: FnMut(&B::Generation) -> Result<()>,
{
    if !resize.take() {
        return Ok(false);
    }

    swapchain.recreate()?;
    match swapchain.current() {
        Some(generation) => {
            rebuilt(generation)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");

        // Wait for GPU to finish before destroying anything
        if let Err(e) = self.device.wait_idle() {
            log::error!("Device did not go idle at shutdown: {:#}", e);
        }
    }
}
