//! Free-fly camera driven by held keys and relative mouse motion.

use glam::Vec3;
use rtscene_renderer::CameraPose;

pub const DEFAULT_SPEED: f32 = 15.0;
pub const DEFAULT_SENSITIVITY: f32 = 0.1;
pub const DEFAULT_YAW: f32 = -90.0;
const PITCH_LIMIT: f32 = 89.0;

/// Movement keys currently held down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MoveKeys {
    pub forward: bool,
    pub back: bool,
    pub left: bool,
    pub right: bool,
    pub up: bool,
    pub down: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlyCamera {
    pub position: Vec3,
    pub up: Vec3,
    /// Degrees; -90 looks down -Z.
    pub yaw: f32,
    /// Degrees, clamped to +/-89.
    pub pitch: f32,
    /// World units per second.
    pub speed: f32,
    /// Degrees per pixel of mouse motion.
    pub sensitivity: f32,
    pub fov_y: f32,
}

impl Default for FlyCamera {
    fn default() -> Self {
        let pose = CameraPose::default();
        Self {
            position: pose.position,
            up: pose.up,
            yaw: DEFAULT_YAW,
            pitch: 0.0,
            speed: DEFAULT_SPEED,
            sensitivity: DEFAULT_SENSITIVITY,
            fov_y: pose.fov_y,
        }
    }
}

impl FlyCamera {
    pub fn front(&self) -> Vec3 {
        let (yaw, pitch) = (self.yaw.to_radians(), self.pitch.to_radians());
        Vec3::new(yaw.cos() * pitch.cos(), pitch.sin(), yaw.sin() * pitch.cos()).normalize()
    }

    /// Turn by a mouse delta in pixels. Screen Y grows downward.
    pub fn look(&mut self, dx: f64, dy: f64) {
        self.yaw += dx as f32 * self.sensitivity;
        self.pitch = (self.pitch - dy as f32 * self.sensitivity).clamp(-PITCH_LIMIT, PITCH_LIMIT);
    }

    /// Move for `dt` seconds with the given keys held.
    pub fn advance(&mut self, keys: MoveKeys, dt: f32) {
        let step = self.speed * dt;
        let front = self.front();
        let right = front.cross(self.up).normalize();

        let mut delta = Vec3::ZERO;
        if keys.forward {
            delta += front;
        }
        if keys.back {
            delta -= front;
        }
        if keys.left {
            delta -= right;
        }
        if keys.right {
            delta += right;
        }
        if keys.up {
            delta += self.up;
        }
        if keys.down {
            delta -= self.up;
        }

        self.position += delta * step;
    }

    pub fn to_pose(&self) -> CameraPose {
        CameraPose {
            position: self.position,
            front: self.front(),
            up: self.up,
            fov_y: self.fov_y,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ============================================================
    // Orientation
    // ============================================================

    #[test]
    fn test_default_looks_down_negative_z() {
        let camera = FlyCamera::default();
        assert!(camera.front().abs_diff_eq(Vec3::NEG_Z, 1e-6));
        assert_eq!(camera.position, Vec3::new(0.0, 7.0, 15.0));
    }

    #[test]
    fn test_mouse_up_pitches_up() {
        let mut camera = FlyCamera::default();
        camera.look(0.0, -100.0);
        assert!((camera.pitch - 10.0).abs() < 1e-5);
        assert!(camera.front().y > 0.0);
    }

    #[test]
    fn test_pitch_is_clamped() {
        let mut camera = FlyCamera::default();
        camera.look(0.0, -10_000.0);
        assert_eq!(camera.pitch, 89.0);
        camera.look(0.0, 10_000.0);
        assert_eq!(camera.pitch, -89.0);
    }

    #[test]
    fn test_yaw_turns_right() {
        let mut camera = FlyCamera::default();
        camera.look(900.0, 0.0);
        assert!(camera.front().abs_diff_eq(Vec3::X, 1e-5));
    }

    // ============================================================
    // Movement
    // ============================================================

    #[test]
    fn test_forward_moves_speed_times_dt() {
        let mut camera = FlyCamera::default();
        let keys = MoveKeys { forward: true, ..Default::default() };
        camera.advance(keys, 0.5);
        assert!(camera.position.abs_diff_eq(Vec3::new(0.0, 7.0, 7.5), 1e-4));
    }

    #[test]
    fn test_strafe_and_vertical() {
        let mut camera = FlyCamera::default();
        camera.advance(MoveKeys { right: true, ..Default::default() }, 1.0);
        assert!(camera.position.abs_diff_eq(Vec3::new(15.0, 7.0, 15.0), 1e-4));

        camera.advance(MoveKeys { left: true, down: true, ..Default::default() }, 1.0);
        assert!(camera.position.abs_diff_eq(Vec3::new(0.0, -8.0, 15.0), 1e-4));
    }

    #[test]
    fn test_opposite_keys_cancel() {
        let mut camera = FlyCamera::default();
        let keys = MoveKeys { forward: true, back: true, up: true, down: true, ..Default::default() };
        camera.advance(keys, 1.0);
        assert!(camera.position.abs_diff_eq(Vec3::new(0.0, 7.0, 15.0), 1e-5));
    }

    #[test]
    fn test_pose_carries_orientation() {
        let mut camera = FlyCamera::default();
        camera.fov_y = 60.0;
        let pose = camera.to_pose();
        assert_eq!(pose.position, camera.position);
        assert_eq!(pose.fov_y, 60.0);
        assert!(pose.front.abs_diff_eq(camera.front(), 1e-6));
    }
}
