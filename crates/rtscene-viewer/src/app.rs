//! winit event loop glue: window, input and the per-frame draw call.

use std::time::Instant;

use rtscene_renderer::{FrameOutcome, MeshSource, RenderError, Renderer, RendererConfig, Scene};
use winit::application::ApplicationHandler;
use winit::dpi::LogicalSize;
use winit::event::{DeviceEvent, DeviceId, ElementState, KeyEvent, MouseButton, WindowEvent};
use winit::event_loop::ActiveEventLoop;
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::{CursorGrabMode, Window, WindowId};

use crate::camera::{FlyCamera, MoveKeys};
use crate::config::{ConfigError, WindowConfig};

/// Anything that ends the viewer.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("failed to create window: {0}")]
    Window(#[from] winit::error::OsError),

    #[error("event loop failed: {0}")]
    EventLoop(#[from] winit::error::EventLoopError),
}

/// Record a movement key. Returns false for keys that don't move the camera.
pub fn update_move_keys(keys: &mut MoveKeys, code: KeyCode, pressed: bool) -> bool {
    let slot = match code {
        KeyCode::KeyW => &mut keys.forward,
        KeyCode::KeyS => &mut keys.back,
        KeyCode::KeyA => &mut keys.left,
        KeyCode::KeyD => &mut keys.right,
        KeyCode::KeyE => &mut keys.up,
        KeyCode::KeyQ => &mut keys.down,
        _ => return false,
    };
    *slot = pressed;
    true
}

pub struct ViewerApp<'a> {
    // Dropped before the window it renders into.
    renderer: Option<Renderer>,
    window: Option<Window>,
    window_config: WindowConfig,
    renderer_config: RendererConfig,
    scene: Scene,
    meshes: &'a dyn MeshSource,
    camera: FlyCamera,
    keys: MoveKeys,
    looking: bool,
    last_frame: Instant,
    error: Option<AppError>,
}

impl<'a> ViewerApp<'a> {
    pub fn new(
        window_config: WindowConfig,
        renderer_config: RendererConfig,
        scene: Scene,
        camera: FlyCamera,
        meshes: &'a dyn MeshSource,
    ) -> Self {
        Self {
            renderer: None,
            window: None,
            window_config,
            renderer_config,
            scene,
            meshes,
            camera,
            keys: MoveKeys::default(),
            looking: false,
            last_frame: Instant::now(),
            error: None,
        }
    }

    /// The error that stopped the event loop, if any.
    pub fn take_error(&mut self) -> Option<AppError> {
        self.error.take()
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: AppError) {
        self.error = Some(error);
        event_loop.exit();
    }

    fn start(&mut self, event_loop: &ActiveEventLoop) -> Result<(), AppError> {
        let attributes = Window::default_attributes()
            .with_title(self.window_config.title.clone())
            .with_inner_size(LogicalSize::new(self.window_config.width, self.window_config.height));
        let window = event_loop.create_window(attributes)?;

        let mut renderer = Renderer::new(&window, &self.scene, &self.renderer_config, self.meshes)?;
        renderer.update_camera(self.camera.to_pose());

        self.renderer = Some(renderer);
        self.window = Some(window);
        self.last_frame = Instant::now();
        Ok(())
    }

    fn handle_key(&mut self, event_loop: &ActiveEventLoop, event: &KeyEvent) {
        let PhysicalKey::Code(code) = event.physical_key else {
            return;
        };
        let pressed = event.state == ElementState::Pressed;

        if update_move_keys(&mut self.keys, code, pressed) || !pressed || event.repeat {
            return;
        }

        match code {
            KeyCode::KeyL => {
                if let Some(renderer) = &mut self.renderer {
                    let enabled = !renderer.lighting_enabled();
                    renderer.toggle_lighting(enabled);
                    log::info!("Lighting {}", if enabled { "on" } else { "off" });
                }
            }
            KeyCode::Escape => event_loop.exit(),
            _ => {}
        }
    }

    fn set_looking(&mut self, looking: bool) {
        self.looking = looking;
        let Some(window) = &self.window else {
            return;
        };

        if looking {
            if window.set_cursor_grab(CursorGrabMode::Confined).is_err() {
                let _ = window.set_cursor_grab(CursorGrabMode::Locked);
            }
        } else {
            let _ = window.set_cursor_grab(CursorGrabMode::None);
        }
        window.set_cursor_visible(!looking);
    }

    fn redraw(&mut self, event_loop: &ActiveEventLoop) {
        let now = Instant::now();
        let dt = now.duration_since(self.last_frame).as_secs_f32();
        self.last_frame = now;

        self.camera.advance(self.keys, dt);

        let Some(renderer) = &mut self.renderer else {
            return;
        };
        renderer.update_camera(self.camera.to_pose());

        match renderer.draw() {
            Ok(FrameOutcome::Presented) => {}
            Ok(FrameOutcome::Recreated) => log::debug!("Frame skipped for surface recreation"),
            Ok(FrameOutcome::Skipped) => log::trace!("Window has no area, frame skipped"),
            Err(e) => self.fail(event_loop, e.into()),
        }
    }
}

impl ApplicationHandler for ViewerApp<'_> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        if let Err(e) = self.start(event_loop) {
            self.fail(event_loop, e);
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                if let Some(renderer) = &mut self.renderer {
                    renderer.set_extent(size.width, size.height);
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                self.handle_key(event_loop, &event);
            }

            WindowEvent::MouseInput { button: MouseButton::Right, state, .. } => {
                self.set_looking(state == ElementState::Pressed);
            }

            WindowEvent::Focused(false) => {
                self.keys = MoveKeys::default();
                self.set_looking(false);
            }

            WindowEvent::RedrawRequested => {
                self.redraw(event_loop);
            }

            _ => {}
        }
    }

    fn device_event(
        &mut self,
        _event_loop: &ActiveEventLoop,
        _device_id: DeviceId,
        event: DeviceEvent,
    ) {
        if let DeviceEvent::MouseMotion { delta } = event {
            if self.looking {
                self.camera.look(delta.0, delta.1);
            }
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        // Waits for the device to go idle before the window disappears.
        self.renderer = None;
    }
}
