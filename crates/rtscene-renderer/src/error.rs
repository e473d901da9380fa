//! Error type shared by every renderer component.

use ash::vk;
use std::path::PathBuf;

/// Failures raised while building or driving the ray traced scene.
///
/// Everything except [`RenderError::SurfaceStale`] is fatal: the caller is
/// expected to log it and shut down.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// The device rejected creation of a buffer, image, structure or pipeline.
    #[error("failed to create {what}: {reason}")]
    ResourceCreation { what: String, reason: String },

    /// No memory type satisfies the requested property set.
    #[error("no memory type in mask {type_bits:#b} supports {properties:?}")]
    UnsupportedMemoryType {
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    },

    /// A CPU write into a mapped buffer could not be performed.
    #[error("host write rejected: {reason}")]
    HostWrite { reason: String },

    /// The presentable surface is out of date or suboptimal.
    #[error("presentation surface is stale")]
    SurfaceStale,

    /// Submission, presentation or a synchronization wait failed.
    #[error("device lost during {operation}: {result:?}")]
    DeviceLost {
        operation: &'static str,
        result: vk::Result,
    },

    /// No physical device offers what the renderer needs.
    #[error("unsupported device: {0}")]
    Unsupported(String),

    #[error("failed to import mesh {path}: {reason}")]
    MeshImport { path: PathBuf, reason: String },

    #[error("failed to load shader {path}: {reason}")]
    ShaderLoad { path: PathBuf, reason: String },
}

impl RenderError {
    /// Build a [`RenderError::ResourceCreation`] from anything printable.
    pub fn creation(what: impl Into<String>, reason: impl std::fmt::Debug) -> Self {
        Self::ResourceCreation {
            what: what.into(),
            reason: format!("{:?}", reason),
        }
    }

    pub fn device_lost(operation: &'static str, result: vk::Result) -> Self {
        Self::DeviceLost { operation, result }
    }

    /// Classify a failed acquire or present. An out-of-date or suboptimal
    /// surface is stale; any other result means the device is gone.
    pub fn presentation(operation: &'static str, result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::SUBOPTIMAL_KHR => Self::SurfaceStale,
            other => Self::device_lost(operation, other),
        }
    }

    /// Only a stale surface can be recovered from (by recreating it).
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::SurfaceStale)
    }
}

pub type RenderResult<T> = Result<T, RenderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_stale_surface_is_recoverable() {
        assert!(RenderError::SurfaceStale.is_recoverable());
        assert!(!RenderError::creation("buffer", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY).is_recoverable());
        assert!(!RenderError::device_lost("submit", vk::Result::ERROR_DEVICE_LOST).is_recoverable());
        assert!(!RenderError::Unsupported("no rt".into()).is_recoverable());
    }

    #[test]
    fn test_out_of_date_presentation_is_stale() {
        let err = RenderError::presentation("presentation", vk::Result::ERROR_OUT_OF_DATE_KHR);
        assert!(matches!(err, RenderError::SurfaceStale));
        assert!(err.is_recoverable());

        let err = RenderError::presentation("presentation", vk::Result::SUBOPTIMAL_KHR);
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_other_presentation_failures_are_fatal() {
        for result in [vk::Result::ERROR_DEVICE_LOST, vk::Result::ERROR_SURFACE_LOST_KHR] {
            let err = RenderError::presentation("swapchain image acquisition", result);
            assert!(matches!(
                err,
                RenderError::DeviceLost { operation: "swapchain image acquisition", result: r } if r == result
            ));
            assert!(!err.is_recoverable());
        }
    }

    #[test]
    fn test_creation_message_names_resource() {
        let err = RenderError::creation("blas storage", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        let msg = err.to_string();
        assert!(msg.contains("blas storage"));
        assert!(msg.contains("ERROR_OUT_OF_DEVICE_MEMORY"));
    }

    #[test]
    fn test_unsupported_memory_type_message() {
        let err = RenderError::UnsupportedMemoryType {
            type_bits: 0b101,
            properties: vk::MemoryPropertyFlags::HOST_VISIBLE,
        };
        assert!(err.to_string().contains("0b101"));
    }
}
