// Entry point: parse arguments, load the scene, run the winit event loop.

use std::path::PathBuf;

use clap::Parser;
use rtscene_renderer::{ObjLoader, RendererConfig};
use winit::event_loop::{ControlFlow, EventLoop};

mod app;
mod camera;
mod config;

use app::{AppError, ViewerApp};
use config::SceneFile;

#[derive(Parser, Debug)]
#[command(name = "rtscene", about = "Hardware ray traced static scene viewer")]
struct Args {
    /// TOML scene file; the built-in room is shown when omitted
    #[arg(long)]
    scene: Option<PathBuf>,

    /// Directory of compiled SPIR-V ray tracing stages
    #[arg(long)]
    shaders: Option<PathBuf>,

    /// Enable the Khronos validation layer
    #[arg(long)]
    validation: bool,

    /// Wait for vertical blank when presenting
    #[arg(long)]
    vsync: bool,

    /// Window width, overriding the scene file
    #[arg(long)]
    width: Option<u32>,

    /// Window height, overriding the scene file
    #[arg(long)]
    height: Option<u32>,
}

fn run(args: Args) -> Result<(), AppError> {
    let mut scene_file = match &args.scene {
        Some(path) => {
            log::info!("Loading scene {}", path.display());
            SceneFile::load(path)?
        }
        None => SceneFile::default(),
    };

    if let Some(width) = args.width {
        scene_file.window.width = width;
    }
    if let Some(height) = args.height {
        scene_file.window.height = height;
    }
    scene_file.validate()?;

    let mut renderer_config = RendererConfig {
        enable_validation: args.validation,
        vsync: args.vsync,
        ..RendererConfig::default()
    };
    if let Some(dir) = args.shaders {
        renderer_config.shader_dir = dir;
    }

    let meshes = ObjLoader;
    let mut app = ViewerApp::new(
        scene_file.window.clone(),
        renderer_config,
        scene_file.to_scene(),
        scene_file.fly_camera(),
        &meshes,
    );

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);
    event_loop.run_app(&mut app)?;

    match app.take_error() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
