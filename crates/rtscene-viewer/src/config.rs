//! Scene file: window, camera, objects and lights loaded from TOML.
//!
//! Every section is optional except `[[objects]]`. Mesh paths are resolved
//! against the directory holding the scene file; the built-in room scene
//! resolves them against the bundled asset directory.

use glam::Vec3;
use rtscene_renderer::{Light, ObjectInstance, Scene, MAX_LIGHTS};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::camera::{FlyCamera, DEFAULT_SENSITIVITY, DEFAULT_SPEED, DEFAULT_YAW};

/// Meshes and scenes shipped with the viewer.
pub const ASSET_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/assets");

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse scene file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid scene: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub width: u32,
    pub height: u32,
    pub title: String,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            title: "Ray Traced Scene".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub position: [f32; 3],
    pub yaw: f32,
    pub pitch: f32,
    pub speed: f32,
    pub sensitivity: f32,
    /// Vertical field of view in degrees.
    pub fov: f32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            position: [0.0, 7.0, 15.0],
            yaw: DEFAULT_YAW,
            pitch: 0.0,
            speed: DEFAULT_SPEED,
            sensitivity: DEFAULT_SENSITIVITY,
            fov: 45.0,
        }
    }
}

/// Either one factor for all axes or one per axis.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Scale {
    Uniform(f32),
    PerAxis([f32; 3]),
}

impl Default for Scale {
    fn default() -> Self {
        Self::Uniform(1.0)
    }
}

impl Scale {
    pub fn to_vec3(self) -> Vec3 {
        match self {
            Self::Uniform(s) => Vec3::splat(s),
            Self::PerAxis(axes) => Vec3::from(axes),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ObjectConfig {
    pub mesh: PathBuf,
    #[serde(default)]
    pub position: [f32; 3],
    /// Euler angles in degrees.
    #[serde(default)]
    pub rotation: [f32; 3],
    #[serde(default)]
    pub scale: Scale,
    #[serde(default = "white")]
    pub color: [f32; 3],
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LightConfig {
    pub position: [f32; 3],
    #[serde(default = "unit")]
    pub intensity: f32,
    #[serde(default = "white")]
    pub color: [f32; 3],
    #[serde(default = "enabled")]
    pub enabled: bool,
}

fn white() -> [f32; 3] {
    [1.0; 3]
}

fn unit() -> f32 {
    1.0
}

fn enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SceneFile {
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub objects: Vec<ObjectConfig>,
    #[serde(default)]
    pub lights: Vec<LightConfig>,
}

impl Default for SceneFile {
    /// The furnished room: five walls, a table with two chairs, a piggy bank
    /// and a small cube on the table, lit by a white ceiling light and a dim
    /// orange fill.
    fn default() -> Self {
        let models = Path::new(ASSET_DIR).join("models");
        let object = |mesh: &str, position: [f32; 3], rotation: [f32; 3], scale: Scale, color: [f32; 3]| {
            ObjectConfig {
                mesh: models.join(mesh),
                position,
                rotation,
                scale,
                color,
            }
        };
        let slab = |x, y, z| Scale::PerAxis([x, y, z]);
        let flat = [0.0; 3];

        Self {
            window: WindowConfig::default(),
            camera: CameraConfig::default(),
            objects: vec![
                object("cube.obj", [0.0, -1.0, 0.0], flat, slab(20.0, 0.1, 20.0), [0.8, 0.8, 0.8]),
                object("cube.obj", [0.0, 12.0, 0.0], flat, slab(20.0, 0.1, 20.0), [1.0, 1.0, 1.0]),
                object("cube.obj", [0.0, 6.0, -10.0], flat, slab(20.0, 10.0, 0.1), [0.9, 0.9, 0.9]),
                object("cube.obj", [-10.0, 6.0, 0.0], flat, slab(0.1, 10.0, 20.0), [0.8, 0.1, 0.1]),
                object("cube.obj", [10.0, 6.0, 0.0], flat, slab(0.1, 10.0, 20.0), [0.1, 0.8, 0.1]),
                object("table.obj", [0.0, -0.9, 0.0], flat, Scale::Uniform(0.5), [0.55, 0.27, 0.07]),
                object("chair.obj", [0.0, -0.9, 2.5], [0.0, 180.0, 0.0], Scale::Uniform(0.6), [0.2, 0.2, 0.6]),
                object("chair.obj", [-3.5, -0.9, 0.0], [0.0, -70.0, 0.0], Scale::Uniform(0.6), [0.2, 0.2, 0.6]),
                object("piggy_bank.obj", [0.0, 1.95, 0.0], [0.0, -30.0, 0.0], Scale::Uniform(0.6), [1.0, 0.4, 0.2]),
                object("cube.obj", [1.5, 2.1, 0.5], [0.0, 45.0, 0.0], Scale::Uniform(0.2), [1.0, 0.8, 0.0]),
            ],
            lights: vec![
                LightConfig {
                    position: [0.0, 9.0, 2.0],
                    intensity: 1.2,
                    color: [1.0, 1.0, 1.0],
                    enabled: true,
                },
                LightConfig {
                    position: [-8.0, 5.0, -5.0],
                    intensity: 0.5,
                    color: [1.0, 0.5, 0.2],
                    enabled: true,
                },
            ],
        }
    }
}

impl SceneFile {
    /// Read, parse and validate `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse(&text, base)
    }

    /// Parse TOML text, resolving relative mesh paths against `base_dir`.
    pub fn parse(text: &str, base_dir: &Path) -> Result<Self, ConfigError> {
        let mut file: SceneFile = toml::from_str(text)?;
        file.validate()?;

        for object in &mut file.objects {
            if object.mesh.is_relative() {
                object.mesh = base_dir.join(&object.mesh);
            }
        }

        Ok(file)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window.width == 0 || self.window.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "window size {}x{} must be nonzero",
                self.window.width, self.window.height
            )));
        }

        if self.objects.is_empty() {
            return Err(ConfigError::Invalid("scene has no objects".to_string()));
        }

        if self.lights.len() > MAX_LIGHTS {
            return Err(ConfigError::Invalid(format!(
                "{} lights given, at most {} supported",
                self.lights.len(),
                MAX_LIGHTS
            )));
        }

        for (i, object) in self.objects.iter().enumerate() {
            let scale = object.scale.to_vec3();
            if !scale.cmpgt(Vec3::ZERO).all() {
                return Err(ConfigError::Invalid(format!(
                    "object {} ({}) has non-positive scale {:?}",
                    i,
                    object.mesh.display(),
                    scale.to_array()
                )));
            }
        }

        Ok(())
    }

    pub fn to_scene(&self) -> Scene {
        let objects = self.objects.iter()
            .map(|object| ObjectInstance {
                mesh: object.mesh.clone(),
                position: Vec3::from(object.position),
                rotation: Vec3::from(object.rotation),
                scale: object.scale.to_vec3(),
                color: Vec3::from(object.color),
            })
            .collect();

        let lights = self.lights.iter()
            .map(|light| Light {
                position: Vec3::from(light.position),
                intensity: light.intensity,
                color: Vec3::from(light.color),
                enabled: light.enabled,
            })
            .collect();

        Scene { objects, lights }
    }

    pub fn fly_camera(&self) -> FlyCamera {
        let camera = &self.camera;
        FlyCamera {
            position: Vec3::from(camera.position),
            yaw: camera.yaw,
            pitch: camera.pitch.clamp(-89.0, 89.0),
            speed: camera.speed,
            sensitivity: camera.sensitivity,
            fov_y: camera.fov,
            ..FlyCamera::default()
        }
    }
}
