// Vulkan engine core
//
// Owns the GPU rendering context: instance and surface, device selection,
// swapchain negotiation and rebuilds, and the frames-in-flight protocol.
// Pipelines, meshes, windows and input belong to the caller and plug in
// through the traits in `backend::frame` and `surface`.

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod surface;

pub use config::Config;
pub use engine::Engine;
pub use error::EngineError;
pub use surface::{ResizeFlag, SurfaceProvider};

// Re-export ash types that users might need
pub use ash::vk;
