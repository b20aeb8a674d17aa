// Engine error taxonomy
//
// Everything in here is fatal: the GPU context is broken or was never usable.
// Stale-swapchain results (out of date / suboptimal) never become errors,
// the frame scheduler handles them by rebuilding.

use ash::vk;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// No physical device exposes both a graphics and a present queue family
    #[error("No suitable GPU found: need graphics and presentation queue families")]
    NoSuitableDevice,

    /// Validation was requested but the layer is not installed
    #[error("Validation layer {0} was requested but is not available")]
    ValidationUnavailable(String),

    /// A Vulkan call returned a non-success code
    #[error("{call} failed: {result:?} ({code})")]
    Vulkan {
        call: &'static str,
        result: vk::Result,
        code: i32,
    },

    /// The window surface went away underneath a swapchain call
    #[error("{call} failed: presentation surface lost")]
    SurfaceLost { call: &'static str },

    /// A fence wait ran into the frame timeout; treated as device loss
    #[error("Timed out waiting for the fence of frame slot {slot}")]
    FenceTimeout { slot: usize },
}

impl EngineError {
    pub fn vulkan(call: &'static str, result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_SURFACE_LOST_KHR => Self::SurfaceLost { call },
            _ => Self::Vulkan {
                call,
                result,
                code: result.as_raw(),
            },
        }
    }

    /// Raw `VkResult` code carried by this error, if any
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Vulkan { code, .. } => Some(*code),
            Self::SurfaceLost { .. } => Some(vk::Result::ERROR_SURFACE_LOST_KHR.as_raw()),
            _ => None,
        }
    }
}

/// Convert an ash result into an engine result, tagging the failing call
pub fn vk_check<T>(call: &'static str, result: ash::prelude::VkResult<T>) -> Result<T, EngineError> {
    result.map_err(|e| EngineError::vulkan(call, e))
}
