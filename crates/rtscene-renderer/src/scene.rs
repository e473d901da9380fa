//! Declarative scene description consumed by the renderer.

use glam::{Mat4, Vec3};
use std::path::PathBuf;

/// Most lights the frame uniforms can carry.
pub const MAX_LIGHTS: usize = 3;

/// One object placed in the scene. List order defines its instance index.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectInstance {
    pub mesh: PathBuf,
    pub position: Vec3,
    /// Euler angles in degrees, applied X then Y then Z (in local space).
    pub rotation: Vec3,
    pub scale: Vec3,
    pub color: Vec3,
}

impl ObjectInstance {
    /// World transform: translate · rotateX · rotateY · rotateZ · scale.
    pub fn transform(&self) -> Mat4 {
        compose_transform(self.position, self.rotation, self.scale)
    }
}

/// Point light as authored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Light {
    pub position: Vec3,
    pub intensity: f32,
    pub color: Vec3,
    pub enabled: bool,
}

/// Ordered objects and lights.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scene {
    pub objects: Vec<ObjectInstance>,
    pub lights: Vec<Light>,
}

pub fn compose_transform(position: Vec3, rotation_degrees: Vec3, scale: Vec3) -> Mat4 {
    Mat4::from_translation(position)
        * Mat4::from_rotation_x(rotation_degrees.x.to_radians())
        * Mat4::from_rotation_y(rotation_degrees.y.to_radians())
        * Mat4::from_rotation_z(rotation_degrees.z.to_radians())
        * Mat4::from_scale(scale)
}

/// Same transform built from a quaternion, used to cross-check the matrix chain.
#[cfg(test)]
fn compose_via_quat(position: Vec3, rotation_degrees: Vec3, scale: Vec3) -> Mat4 {
    use glam::Quat;

    let rotation = Quat::from_rotation_x(rotation_degrees.x.to_radians())
        * Quat::from_rotation_y(rotation_degrees.y.to_radians())
        * Quat::from_rotation_z(rotation_degrees.z.to_radians());
    Mat4::from_scale_rotation_translation(scale, rotation, position)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_transform() {
        assert_eq!(compose_transform(Vec3::ZERO, Vec3::ZERO, Vec3::ONE), Mat4::IDENTITY);
    }

    #[test]
    fn test_scale_then_translate() {
        let m = compose_transform(Vec3::new(1.0, 2.0, 3.0), Vec3::ZERO, Vec3::new(2.0, 3.0, 4.0));
        let p = m.transform_point3(Vec3::ONE);
        assert!(p.abs_diff_eq(Vec3::new(3.0, 5.0, 7.0), 1e-6));
    }

    #[test]
    fn test_rotation_about_y() {
        let m = compose_transform(Vec3::ZERO, Vec3::new(0.0, 90.0, 0.0), Vec3::ONE);
        let p = m.transform_point3(Vec3::X);
        assert!(p.abs_diff_eq(Vec3::NEG_Z, 1e-6));
    }

    #[test]
    fn test_rotation_order_is_x_then_y_then_z() {
        let position = Vec3::new(-3.5, -0.9, 0.0);
        let rotation = Vec3::new(20.0, -70.0, 35.0);
        let scale = Vec3::new(0.6, 0.7, 0.8);
        let a = compose_transform(position, rotation, scale);
        let b = compose_via_quat(position, rotation, scale);
        assert!(a.abs_diff_eq(b, 1e-5));
    }

    #[test]
    fn test_object_transform_uses_fields() {
        let object = ObjectInstance {
            mesh: PathBuf::from("models/cube.obj"),
            position: Vec3::new(0.0, -1.0, 0.0),
            rotation: Vec3::ZERO,
            scale: Vec3::new(20.0, 0.1, 20.0),
            color: Vec3::splat(0.8),
        };
        let p = object.transform().transform_point3(Vec3::new(0.5, 0.5, 0.5));
        assert!(p.abs_diff_eq(Vec3::new(10.0, -0.95, 10.0), 1e-5));
    }
}
