#![allow(clippy::missing_safety_doc, clippy::too_many_arguments)]
// Hardware ray traced renderer for static scenes (Vulkan KHR ray tracing)

pub mod config;
pub mod error;
pub mod frame;
pub mod mesh;
pub mod renderer;
pub mod scene;
pub mod uniforms;

// Vulkan backend
pub mod vulkan;

pub use config::RendererConfig;
pub use error::{RenderError, RenderResult};
pub use frame::{FrameOutcome, MAX_FRAMES_IN_FLIGHT};
pub use mesh::{MeshData, MeshSource, ObjLoader, Vertex};
pub use renderer::Renderer;
pub use scene::{Light, ObjectInstance, Scene, MAX_LIGHTS};
pub use uniforms::CameraPose;
