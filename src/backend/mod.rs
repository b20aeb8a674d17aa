// Backend module - Vulkan engine core
//
// Design: Thin wrapper around ash with safety and ergonomics
// Ownership: instance <- device <- (swapchain, frame slots), all via Arc,
// so teardown always runs in reverse creation order.

pub mod device;
pub mod frame;
pub mod instance;
pub mod swapchain;
pub mod sync;

pub use device::{QueueFamilyIndices, VulkanDevice};
pub use frame::{
    CommandBufferProvider, FrameBackend, FrameDataUpdater, FrameScheduler, FrameStatus,
    FENCE_TIMEOUT, MAX_FRAMES_IN_FLIGHT,
};
pub use instance::InstanceContext;
pub use swapchain::{Swapchain, SwapchainBackend, SwapchainManager, VulkanSwapchainBackend};
