// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen.
// A `Swapchain` is one generation: handle, images, views, render pass and
// framebuffers, all built against the same format and extent. The
// `SwapchainManager` tears a generation down and builds the next one whenever
// the surface goes stale.

use anyhow::{Context, Result};
use ash::prelude::VkResult;
use ash::vk;
use std::sync::Arc;

use super::device::QueueFamilyIndices;
use super::VulkanDevice;
use crate::error::vk_check;
use crate::surface::SurfaceProvider;

/// Everything the surface reports about what it can present
#[derive(Debug, Clone)]
pub struct SwapchainSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupport {
    pub fn query(device: &VulkanDevice) -> Result<Self> {
        let instance = device.instance();
        let loader = &instance.surface_loader;
        let surface = instance.surface;

        let capabilities = vk_check("vkGetPhysicalDeviceSurfaceCapabilitiesKHR", unsafe {
            loader.get_physical_device_surface_capabilities(device.physical_device, surface)
        })?;

        let formats = vk_check("vkGetPhysicalDeviceSurfaceFormatsKHR", unsafe {
            loader.get_physical_device_surface_formats(device.physical_device, surface)
        })?;

        let present_modes = vk_check("vkGetPhysicalDeviceSurfacePresentModesKHR", unsafe {
            loader.get_physical_device_surface_present_modes(device.physical_device, surface)
        })?;

        Ok(Self {
            capabilities,
            formats,
            present_modes,
        })
    }
}

/// Prefer 8-bit BGRA sRGB with the sRGB non-linear colour space, otherwise
/// take the first format the surface lists.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first().copied())
}

/// MAILBOX when offered, else FIFO (always supported)
pub fn choose_present_mode(present_modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    if present_modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Use the surface's current extent unless it is the `u32::MAX` sentinel, in
/// which case the framebuffer size is clamped into the supported range.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, framebuffer: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }

    vk::Extent2D {
        width: framebuffer
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: framebuffer
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One more than the minimum, capped by the maximum when there is one
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = caps.min_image_count + 1;
    if caps.max_image_count > 0 && count > caps.max_image_count {
        caps.max_image_count
    } else {
        count
    }
}

/// EXCLUSIVE when one family does both jobs, CONCURRENT across both families
/// otherwise.
pub fn image_sharing(indices: &QueueFamilyIndices) -> (vk::SharingMode, Vec<u32>) {
    match (indices.graphics_family, indices.present_family) {
        (Some(graphics), Some(present)) if graphics != present => {
            (vk::SharingMode::CONCURRENT, vec![graphics, present])
        }
        _ => (vk::SharingMode::EXCLUSIVE, Vec::new()),
    }
}

/// Result of negotiating with the surface. Pure function of the support
/// report and the framebuffer size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainConfig {
    pub format: vk::Format,
    pub color_space: vk::ColorSpaceKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
}

impl SwapchainConfig {
    pub fn negotiate(support: &SwapchainSupport, framebuffer: vk::Extent2D) -> Result<Self> {
        let surface_format =
            choose_surface_format(&support.formats).context("Surface reports no formats")?;

        Ok(Self {
            format: surface_format.format,
            color_space: surface_format.color_space,
            present_mode: choose_present_mode(&support.present_modes),
            extent: choose_extent(&support.capabilities, framebuffer),
            image_count: choose_image_count(&support.capabilities),
            pre_transform: support.capabilities.current_transform,
        })
    }

    /// A minimized window reports a zero-area extent; nothing can be built
    pub fn is_zero_area(&self) -> bool {
        self.extent.width == 0 || self.extent.height == 0
    }
}

/// One swapchain generation. Dropping it destroys framebuffers, image views,
/// render pass and the swapchain handle, in that order.
pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub render_pass: vk::RenderPass,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub format: vk::Format,
    pub color_space: vk::ColorSpaceKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub generation: u64,
    loader: ash::extensions::khr::Swapchain,
    device: Arc<VulkanDevice>,
}

impl Swapchain {
    fn build(
        device: Arc<VulkanDevice>,
        loader: ash::extensions::khr::Swapchain,
        config: &SwapchainConfig,
        generation: u64,
    ) -> Result<Self> {
        let (sharing_mode, family_indices) = image_sharing(&device.queue_families);

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(device.instance().surface)
            .min_image_count(config.image_count)
            .image_format(config.format)
            .image_color_space(config.color_space)
            .image_extent(config.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(&family_indices)
            .pre_transform(config.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(config.present_mode)
            .clipped(true)
            .old_swapchain(vk::SwapchainKHR::null());

        let handle = vk_check("vkCreateSwapchainKHR", unsafe {
            loader.create_swapchain(&create_info, None)
        })?;

        // From here on a failure drops `swapchain`, which releases whatever
        // was already created.
        let mut swapchain = Self {
            handle,
            images: Vec::new(),
            image_views: Vec::new(),
            render_pass: vk::RenderPass::null(),
            framebuffers: Vec::new(),
            format: config.format,
            color_space: config.color_space,
            present_mode: config.present_mode,
            extent: config.extent,
            generation,
            loader,
            device,
        };

        swapchain.images = vk_check("vkGetSwapchainImagesKHR", unsafe {
            swapchain.loader.get_swapchain_images(handle)
        })?;

        for &image in &swapchain.images {
            let view = create_image_view(&swapchain.device, image, config.format)?;
            swapchain.image_views.push(view);
        }

        swapchain.render_pass = create_render_pass(&swapchain.device, config.format)?;

        for &view in &swapchain.image_views {
            let attachments = [view];
            let framebuffer_info = vk::FramebufferCreateInfo::builder()
                .render_pass(swapchain.render_pass)
                .attachments(&attachments)
                .width(config.extent.width)
                .height(config.extent.height)
                .layers(1);

            let framebuffer = vk_check("vkCreateFramebuffer", unsafe {
                swapchain.device.device.create_framebuffer(&framebuffer_info, None)
            })?;
            swapchain.framebuffers.push(framebuffer);
        }

        Ok(swapchain)
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        log::debug!("Destroying swapchain generation {}", self.generation);

        unsafe {
            let device = &self.device.device;
            for &framebuffer in &self.framebuffers {
                device.destroy_framebuffer(framebuffer, None);
            }
            for &view in &self.image_views {
                device.destroy_image_view(view, None);
            }
            if self.render_pass != vk::RenderPass::null() {
                device.destroy_render_pass(self.render_pass, None);
            }
            self.loader.destroy_swapchain(self.handle, None);
        }
    }
}

fn create_image_view(device: &VulkanDevice, image: vk::Image, format: vk::Format) -> Result<vk::ImageView> {
    let create_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });

    let view = vk_check("vkCreateImageView", unsafe {
        device.device.create_image_view(&create_info, None)
    })?;
    Ok(view)
}

/// Single colour attachment that ends up ready for presentation
fn create_render_pass(device: &VulkanDevice, format: vk::Format) -> Result<vk::RenderPass> {
    let color_attachment = vk::AttachmentDescription::builder()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .build();

    let color_attachment_ref = vk::AttachmentReference::builder()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .build();

    let color_attachments = &[color_attachment_ref];
    let subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(color_attachments)
        .build();

    // The image is only available once the acquire semaphore has been waited
    // on at COLOR_ATTACHMENT_OUTPUT
    let dependency = vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
        .build();

    let attachments = &[color_attachment];
    let subpasses = &[subpass];
    let dependencies = &[dependency];

    let render_pass_info = vk::RenderPassCreateInfo::builder()
        .attachments(attachments)
        .subpasses(subpasses)
        .dependencies(dependencies);

    let render_pass = vk_check("vkCreateRenderPass", unsafe {
        device.device.create_render_pass(&render_pass_info, None)
    })?;
    Ok(render_pass)
}

/// What a `SwapchainManager` needs from the outside world to build
/// generations: the surface state and a way to turn a negotiated config into
/// live objects.
pub trait SwapchainBackend {
    type Generation;

    /// Block until nothing from the current generation is in use
    fn wait_idle(&self) -> Result<()>;
    fn framebuffer_size(&self) -> vk::Extent2D;
    fn query_support(&self) -> Result<SwapchainSupport>;
    fn build_generation(&self, config: &SwapchainConfig, generation: u64) -> Result<Self::Generation>;
}

/// Real backend: device, swapchain loader and the window behind the surface
pub struct VulkanSwapchainBackend {
    device: Arc<VulkanDevice>,
    loader: ash::extensions::khr::Swapchain,
    surface_provider: Arc<dyn SurfaceProvider>,
}

impl VulkanSwapchainBackend {
    pub fn new(device: Arc<VulkanDevice>, surface_provider: Arc<dyn SurfaceProvider>) -> Self {
        let loader = ash::extensions::khr::Swapchain::new(&device.instance().instance, &device.device);
        Self {
            device,
            loader,
            surface_provider,
        }
    }
}

impl SwapchainBackend for VulkanSwapchainBackend {
    type Generation = Swapchain;

    fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }

    fn framebuffer_size(&self) -> vk::Extent2D {
        self.surface_provider.framebuffer_size()
    }

    fn query_support(&self) -> Result<SwapchainSupport> {
        SwapchainSupport::query(&self.device)
    }

    fn build_generation(&self, config: &SwapchainConfig, generation: u64) -> Result<Swapchain> {
        let swapchain = Swapchain::build(self.device.clone(), self.loader.clone(), config, generation)?;
        log::debug!("Swapchain generation {} has {} images", generation, swapchain.image_count());
        Ok(swapchain)
    }
}

/// Owns the current swapchain generation and rebuilds it on demand.
///
/// While the window has zero area there is no generation at all; acquire
/// reports out-of-date so the frame scheduler keeps asking for a rebuild.
pub struct SwapchainManager<B: SwapchainBackend = VulkanSwapchainBackend> {
    current: Option<B::Generation>,
    last_config: Option<SwapchainConfig>,
    generation: u64,
    backend: B,
}

impl SwapchainManager<VulkanSwapchainBackend> {
    pub fn new(
        device: Arc<VulkanDevice>,
        surface_provider: Arc<dyn SurfaceProvider>,
        extent_hint: vk::Extent2D,
    ) -> Result<Self> {
        Self::with_backend(VulkanSwapchainBackend::new(device, surface_provider), extent_hint)
    }

    /// Acquire next image for rendering. Returns `(index, suboptimal)`.
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore, timeout: u64) -> VkResult<(u32, bool)> {
        let swapchain = self.current.as_ref().ok_or(vk::Result::ERROR_OUT_OF_DATE_KHR)?;
        unsafe {
            self.backend.loader.acquire_next_image(
                swapchain.handle,
                timeout,
                semaphore,
                vk::Fence::null(),
            )
        }
    }

    /// Present rendered image to screen. Returns whether it was suboptimal.
    pub fn present(&self, queue: vk::Queue, image_index: u32, wait_semaphore: vk::Semaphore) -> VkResult<bool> {
        let swapchain = self.current.as_ref().ok_or(vk::Result::ERROR_OUT_OF_DATE_KHR)?;

        let wait_semaphores = [wait_semaphore];
        let swapchains = [swapchain.handle];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        unsafe { self.backend.loader.queue_present(queue, &present_info) }
    }
}

impl<B: SwapchainBackend> SwapchainManager<B> {
    pub fn with_backend(backend: B, extent_hint: vk::Extent2D) -> Result<Self> {
        let mut manager = Self {
            current: None,
            last_config: None,
            generation: 0,
            backend,
        };
        manager.build(extent_hint)?;
        Ok(manager)
    }

    /// Tear down the current generation and build a new one from the latest
    /// surface state. Frame slots and the image-in-flight map live elsewhere
    /// and are untouched.
    pub fn recreate(&mut self) -> Result<()> {
        // Nothing from the old generation may still be in use on the GPU
        self.backend.wait_idle()?;
        self.current = None;

        let framebuffer = self.backend.framebuffer_size();
        self.build(framebuffer)
    }

    fn build(&mut self, framebuffer: vk::Extent2D) -> Result<()> {
        let support = self.backend.query_support()?;
        let config = SwapchainConfig::negotiate(&support, framebuffer)?;

        if config.is_zero_area() {
            log::info!("Surface has zero area, swapchain suspended");
            self.last_config = Some(config);
            return Ok(());
        }

        let generation = self.generation + 1;
        let swapchain = self
            .backend
            .build_generation(&config, generation)
            .with_context(|| format!("Failed to build swapchain generation {}", generation))?;

        log::info!(
            "Swapchain generation {}: {}x{} {:?}/{:?} {:?}, min {} images",
            generation,
            config.extent.width,
            config.extent.height,
            config.format,
            config.color_space,
            config.present_mode,
            config.image_count
        );

        self.generation = generation;
        self.last_config = Some(config);
        self.current = Some(swapchain);
        Ok(())
    }

    pub fn current(&self) -> Option<&B::Generation> {
        self.current.as_ref()
    }

    pub fn is_suspended(&self) -> bool {
        self.current.is_none()
    }

    /// Number of generations built so far
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Config from the most recent negotiation, including a zero-area one
    pub fn last_config(&self) -> Option<&SwapchainConfig> {
        self.last_config.as_ref()
    }
}

impl<B: SwapchainBackend> Drop for SwapchainManager<B> {
    fn drop(&mut self) {
        if self.current.is_some() {
            if let Err(e) = self.backend.wait_idle() {
                log::error!("Device not idle while dropping swapchain: {:#}", e);
            }
        }
        self.current = None;
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    /// Ordered record of builds, idles and drops
    pub(crate) type Events = Rc<RefCell<Vec<String>>>;

    pub(crate) struct FakeGeneration {
        pub(crate) generation: u64,
        pub(crate) config: SwapchainConfig,
        events: Events,
    }

    impl Drop for FakeGeneration {
        fn drop(&mut self) {
            self.events.borrow_mut().push(format!("drop {}", self.generation));
        }
    }

    /// Window surface whose size the test changes between rebuilds. The
    /// capability report is fixed, with an undefined current extent so the
    /// framebuffer size decides.
    pub(crate) struct FakeSurface {
        extent: Rc<Cell<vk::Extent2D>>,
        events: Events,
        support: SwapchainSupport,
    }

    impl FakeSurface {
        pub(crate) fn new(width: u32, height: u32) -> (Self, Rc<Cell<vk::Extent2D>>, Events) {
            let extent = Rc::new(Cell::new(vk::Extent2D { width, height }));
            let events = Events::default();
            let support = SwapchainSupport {
                capabilities: vk::SurfaceCapabilitiesKHR {
                    min_image_count: 2,
                    max_image_count: 0,
                    current_extent: vk::Extent2D { width: u32::MAX, height: u32::MAX },
                    min_image_extent: vk::Extent2D { width: 0, height: 0 },
                    max_image_extent: vk::Extent2D { width: 4096, height: 4096 },
                    current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
                    ..Default::default()
                },
                formats: vec![vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_SRGB,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                }],
                present_modes: vec![vk::PresentModeKHR::FIFO],
            };

            let surface = Self {
                extent: extent.clone(),
                events: events.clone(),
                support,
            };
            (surface, extent, events)
        }
    }

    impl SwapchainBackend for FakeSurface {
        type Generation = FakeGeneration;

        fn wait_idle(&self) -> Result<()> {
            self.events.borrow_mut().push("idle".to_string());
            Ok(())
        }

        fn framebuffer_size(&self) -> vk::Extent2D {
            self.extent.get()
        }

        fn query_support(&self) -> Result<SwapchainSupport> {
            Ok(self.support.clone())
        }

        fn build_generation(&self, config: &SwapchainConfig, generation: u64) -> Result<FakeGeneration> {
            self.events.borrow_mut().push(format!("build {}", generation));
            Ok(FakeGeneration {
                generation,
                config: *config,
                events: self.events.clone(),
            })
        }
    }
}
