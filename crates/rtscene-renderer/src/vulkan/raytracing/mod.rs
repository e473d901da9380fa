//! Ray tracing support via Vulkan KHR extensions.
//!
//! Acceleration structure builders (one BLAS per object, one TLAS over all
//! instances) and the shader binding table.

pub mod acceleration;
pub mod sbt;

pub use acceleration::{AccelerationStructure, AccelerationStructureBuilder, InstanceRecord};
pub use sbt::ShaderBindingTable;

use crate::error::{RenderError, RenderResult};

/// Round `value` up to the next multiple of `alignment`.
///
/// An alignment of zero leaves the value unchanged. Fails when the rounded
/// value does not fit in 64 bits.
pub fn align_up(value: u64, alignment: u64) -> RenderResult<u64> {
    if alignment == 0 {
        return Ok(value);
    }
    value.checked_next_multiple_of(alignment).ok_or_else(|| {
        RenderError::creation("aligned offset", format!("{} overflows when aligned to {}", value, alignment))
    })
}
