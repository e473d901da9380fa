//! Renderer options chosen by the application.

use std::path::PathBuf;

/// Directory the build script compiles the bundled shaders into.
pub const BUILT_SHADER_DIR: &str = env!("RTSCENE_SHADER_DIR");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendererConfig {
    /// Load `VK_LAYER_KHRONOS_validation` and forward its messages to `log`.
    pub enable_validation: bool,
    /// Force FIFO presentation.
    pub vsync: bool,
    /// Directory holding the four `.spv` ray tracing stages.
    pub shader_dir: PathBuf,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            enable_validation: false,
            vsync: false,
            shader_dir: PathBuf::from(BUILT_SHADER_DIR),
        }
    }
}
