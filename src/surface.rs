// Surface provider boundary
//
// The windowing layer hands the core two things: raw handles to build a
// VkSurfaceKHR from, and the current framebuffer size for extent negotiation.
// Resize notifications travel through a shared ResizeFlag that the frame
// scheduler consumes right before presenting.

use ash::vk;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle, RawDisplayHandle, RawWindowHandle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub trait SurfaceProvider: Send + Sync {
    /// Handles used once, when the instance context creates the surface
    fn raw_handles(&self) -> (RawDisplayHandle, RawWindowHandle);

    /// Size of the drawable area in physical pixels
    fn framebuffer_size(&self) -> vk::Extent2D;
}

impl SurfaceProvider for winit::window::Window {
    fn raw_handles(&self) -> (RawDisplayHandle, RawWindowHandle) {
        (self.raw_display_handle(), self.raw_window_handle())
    }

    fn framebuffer_size(&self) -> vk::Extent2D {
        let size = self.inner_size();
        vk::Extent2D {
            width: size.width,
            height: size.height,
        }
    }
}

/// Set by the window layer on resize, cleared by the frame scheduler
#[derive(Debug, Clone, Default)]
pub struct ResizeFlag(Arc<AtomicBool>);

impl ResizeFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Clear the flag, returning whether it was set
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}
