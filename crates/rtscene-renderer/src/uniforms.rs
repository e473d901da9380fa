//! Per-frame uniform block (std140 layout, binding 2).

use glam::{Mat4, Vec3};

use crate::scene::{Light, MAX_LIGHTS};

/// Default vertical field of view, in degrees.
pub const FOV_Y_DEGREES: f32 = 45.0;
pub const NEAR_PLANE: f32 = 0.1;
pub const FAR_PLANE: f32 = 100.0;

/// Camera placement supplied by the input layer every frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraPose {
    pub position: Vec3,
    pub front: Vec3,
    pub up: Vec3,
    /// Vertical field of view in degrees.
    pub fov_y: f32,
}

impl Default for CameraPose {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 7.0, 15.0),
            front: Vec3::NEG_Z,
            up: Vec3::Y,
            fov_y: FOV_Y_DEGREES,
        }
    }
}

impl CameraPose {
    pub fn view(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.position + self.front, self.up)
    }

    pub fn projection(&self, aspect: f32) -> Mat4 {
        projection(self.fov_y, aspect)
    }
}

/// Projection with the Y axis flipped for Vulkan clip space.
pub fn projection(fov_y_degrees: f32, aspect: f32) -> Mat4 {
    let mut proj = Mat4::perspective_rh(fov_y_degrees.to_radians(), aspect, NEAR_PLANE, FAR_PLANE);
    proj.y_axis.y *= -1.0;
    proj
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct LightUniform {
    pub position: [f32; 3],
    pub intensity: f32,
    pub color: [f32; 3],
    pub enabled: i32,
}

/// Uniform block read by the ray generation and closest-hit shaders.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct FrameUniforms {
    pub view_inverse: [[f32; 4]; 4],
    pub proj_inverse: [[f32; 4]; 4],
    pub camera_position: [f32; 3],
    pub _pad0: f32,
    pub lights: [LightUniform; MAX_LIGHTS],
    pub light_count: i32,
    pub _pad1: [f32; 3],
}

impl FrameUniforms {
    /// Build the block for one frame.
    ///
    /// With `lighting_enabled` false every light is uploaded disabled; with it
    /// true each light keeps its authored enabled state. Lights past
    /// [`MAX_LIGHTS`] are dropped.
    pub fn new(camera: &CameraPose, aspect: f32, lights: &[Light], lighting_enabled: bool) -> Self {
        let mut packed = [LightUniform::default(); MAX_LIGHTS];
        for (slot, light) in packed.iter_mut().zip(lights) {
            *slot = LightUniform {
                position: light.position.to_array(),
                intensity: light.intensity,
                color: light.color.to_array(),
                enabled: i32::from(lighting_enabled && light.enabled),
            };
        }

        Self {
            view_inverse: camera.view().inverse().to_cols_array_2d(),
            proj_inverse: camera.projection(aspect).inverse().to_cols_array_2d(),
            camera_position: camera.position.to_array(),
            _pad0: 0.0,
            lights: packed,
            light_count: lights.len().min(MAX_LIGHTS) as i32,
            _pad1: [0.0; 3],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn light(x: f32, enabled: bool) -> Light {
        Light {
            position: Vec3::new(x, 9.0, 2.0),
            intensity: 1.2,
            color: Vec3::ONE,
            enabled,
        }
    }

    // ============================================================
    // Layout
    // ============================================================

    #[test]
    fn test_std140_sizes() {
        assert_eq!(std::mem::size_of::<LightUniform>(), 32);
        assert_eq!(std::mem::size_of::<FrameUniforms>(), 256);
    }

    #[test]
    fn test_std140_offsets() {
        let u = FrameUniforms::new(&CameraPose::default(), 1.0, &[], true);
        let base = &u as *const _ as usize;
        assert_eq!(&u.camera_position as *const _ as usize - base, 128);
        assert_eq!(&u.lights as *const _ as usize - base, 144);
        assert_eq!(&u.light_count as *const _ as usize - base, 240);
    }

    // ============================================================
    // Lighting toggle
    // ============================================================

    #[test]
    fn test_toggle_off_disables_every_light() {
        let lights = [light(0.0, true), light(1.0, false), light(2.0, true)];
        let u = FrameUniforms::new(&CameraPose::default(), 1.0, &lights, false);
        assert!(u.lights.iter().all(|l| l.enabled == 0));
        assert_eq!(u.light_count, 3);
    }

    #[test]
    fn test_toggle_on_restores_authored_state() {
        let lights = [light(0.0, true), light(1.0, false)];
        let off = FrameUniforms::new(&CameraPose::default(), 1.0, &lights, false);
        let on = FrameUniforms::new(&CameraPose::default(), 1.0, &lights, true);
        assert_eq!(off.lights[0].enabled, 0);
        assert_eq!(on.lights[0].enabled, 1);
        assert_eq!(on.lights[1].enabled, 0);
    }

    #[test]
    fn test_extra_lights_dropped() {
        let lights = [light(0.0, true), light(1.0, true), light(2.0, true), light(3.0, true)];
        let u = FrameUniforms::new(&CameraPose::default(), 1.0, &lights, true);
        assert_eq!(u.light_count, 3);
        assert_eq!(u.lights[2].position[0], 2.0);
    }

    #[test]
    fn test_unused_light_slots_are_zeroed() {
        let u = FrameUniforms::new(&CameraPose::default(), 1.0, &[light(0.0, true)], true);
        assert_eq!(u.light_count, 1);
        assert_eq!(u.lights[1], LightUniform::default());
    }

    // ============================================================
    // Camera matrices
    // ============================================================

    #[test]
    fn test_view_inverse_recovers_camera_position() {
        let camera = CameraPose::default();
        let u = FrameUniforms::new(&camera, 16.0 / 9.0, &[], true);
        let view_inverse = Mat4::from_cols_array_2d(&u.view_inverse);
        let origin = view_inverse.transform_point3(Vec3::ZERO);
        assert!(origin.abs_diff_eq(camera.position, 1e-4));
        assert_eq!(u.camera_position, camera.position.to_array());
    }

    #[test]
    fn test_projection_flips_y() {
        let flipped = projection(FOV_Y_DEGREES, 1.0);
        let plain = Mat4::perspective_rh(FOV_Y_DEGREES.to_radians(), 1.0, NEAR_PLANE, FAR_PLANE);
        assert_eq!(flipped.y_axis.y, -plain.y_axis.y);
        assert_eq!(flipped.x_axis, plain.x_axis);
    }
}
